mod common;

use composable_frontends::{
    FileFetcher, FileManifestSource, LifecycleState, ModuleRegistry, ModuleSource, RegistryConfig,
    load_manifests,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn paths(files: &[&Path]) -> Vec<PathBuf> {
    files.iter().map(|p| p.to_path_buf()).collect()
}

#[test]
fn test_toml_root_manifest() {
    let file = common::create_toml_test_file(
        r#"
        id = "cart"
        version = "1.0.0"
        entry = "https://cdn.example.com/cart.js"
        capabilities = ["auth"]

        [framework]
        kind = "react"
        version = "18.2.0"

        [[dependencies]]
        name = "libx"
        versionRange = "^2.0"
        strategy = "shared"
        "#,
    );
    let manifests = load_manifests(&paths(&[&*file])).unwrap();
    assert_eq!(manifests.len(), 1);
    let cart = &manifests[0];
    assert_eq!(cart.id, "cart");
    assert_eq!(cart.entry, "https://cdn.example.com/cart.js");
    assert_eq!(cart.framework.kind, "react");
    assert_eq!(cart.dependencies[0].version_range, "^2.0");
    assert_eq!(cart.dependencies[0].strategy.as_deref(), Some("shared"));
}

#[test]
fn test_toml_tables_keyed_by_id() {
    let file = common::create_toml_test_file(
        r#"
        [cart]
        version = "1.0.0"
        entry = "https://cdn.example.com/cart.js"

        [profile]
        id = "profile"
        version = "2.1.0"
        entry = "https://cdn.example.com/profile.js"
        "#,
    );
    let mut manifests = load_manifests(&paths(&[&*file])).unwrap();
    manifests.sort_by(|a, b| a.id.cmp(&b.id));
    let ids: Vec<_> = manifests.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, ["cart", "profile"]);
}

#[test]
#[should_panic(expected = "declares a different id")]
fn test_toml_table_with_mismatched_id() {
    let file = common::create_toml_test_file(
        r#"
        [cart]
        id = "basket"
        version = "1.0.0"
        entry = "https://cdn.example.com/cart.js"
        "#,
    );
    load_manifests(&paths(&[&*file])).unwrap();
}

#[test]
fn test_json_object_and_array() {
    let single = common::create_json_test_file(
        r#"{ "id": "cart", "version": "1.0.0", "entry": "https://cdn.example.com/cart.js" }"#,
    );
    let several = common::create_json_test_file(
        r#"[
            { "id": "profile", "version": "1.0.0", "entry": "https://cdn.example.com/profile.js" },
            { "id": "search", "version": "0.3.0", "entry": "https://cdn.example.com/search.js",
              "dependencies": [{ "name": "libx", "versionRange": "^1.0" }] }
        ]"#,
    );
    let manifests = load_manifests(&paths(&[&*single, &*several])).unwrap();
    let ids: Vec<_> = manifests.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, ["cart", "profile", "search"]);
    assert_eq!(manifests[2].dependencies[0].strategy, None);
}

#[test]
#[should_panic(expected = "Duplicate manifest id: 'cart'")]
fn test_duplicate_ids_across_files() {
    let first = common::create_json_test_file(
        r#"{ "id": "cart", "version": "1.0.0", "entry": "https://cdn.example.com/cart.js" }"#,
    );
    let second = common::create_toml_test_file(
        r#"
        [cart]
        version = "1.1.0"
        entry = "https://cdn.example.com/cart.js"
        "#,
    );
    load_manifests(&paths(&[&*first, &*second])).unwrap();
}

#[test]
fn test_unsupported_files() {
    let entry = common::create_entry_test_file("export default {}");
    let error = load_manifests(&paths(&[&*entry])).unwrap_err();
    assert!(error.to_string().contains("Unsupported file type"));

    let error = load_manifests(&[PathBuf::from("manifests")]).unwrap_err();
    assert!(error.to_string().contains("File without extension"));

    let scalar = common::create_json_test_file("42");
    assert!(load_manifests(&paths(&[&*scalar])).is_err());
}

#[test]
fn test_relative_entries_are_rebased() {
    let file = common::create_toml_test_file(
        r#"
        [local]
        version = "1.0.0"
        entry = "dist/local.js"

        [remote]
        version = "1.0.0"
        entry = "https://cdn.example.com/remote.js"
        "#,
    );
    let dir = file.parent().unwrap().to_path_buf();
    let manifests = load_manifests(&paths(&[&*file])).unwrap();
    let entry = |id: &str| {
        manifests
            .iter()
            .find(|m| m.id == id)
            .map(|m| m.entry.clone())
            .unwrap()
    };
    assert_eq!(entry("local"), dir.join("dist/local.js").to_string_lossy());
    assert_eq!(entry("remote"), "https://cdn.example.com/remote.js");
}

#[tokio::test]
async fn test_file_manifests_load_through_file_fetcher() {
    let bundle = common::create_entry_test_file("export function mount() {}");
    let name = bundle.file_name().unwrap().to_string_lossy().to_string();
    let manifest = common::create_json_test_file(&format!(
        r#"{{ "id": "cart", "version": "1.0.0", "entry": "{name}" }}"#
    ));

    let registry = ModuleRegistry::builder()
        .with_fetcher(Arc::new(FileFetcher::new()))
        .build()
        .unwrap();
    let ids = registry
        .register_from(&FileManifestSource::new(paths(&[&*manifest])))
        .await
        .unwrap();
    assert_eq!(ids, ["cart"]);

    let handle = registry.load("cart").await.unwrap();
    let source = handle.exports::<ModuleSource>().unwrap();
    assert_eq!(source.bytes, b"export function mount() {}");
    assert_eq!(
        registry.get_status("cart").unwrap().state,
        LifecycleState::Ready
    );
}

#[tokio::test]
async fn test_file_fetcher_rejects_other_schemes() {
    let registry = ModuleRegistry::builder()
        .with_fetcher(Arc::new(FileFetcher::new()))
        .with_diagnostics(Arc::new(common::RecordingDiagnostics::default()))
        .build()
        .unwrap();
    registry.register(common::manifest("cart")).unwrap();

    let error = registry.load("cart").await.unwrap_err();
    assert!(error.to_string().contains("Unsupported locator scheme 'mem'"));
}

#[tokio::test]
async fn test_file_fetcher_base_dir() {
    let bundle = common::create_entry_test_file("42");
    let dir = bundle.parent().unwrap().to_path_buf();
    let name = bundle.file_name().unwrap().to_string_lossy().to_string();

    let registry = ModuleRegistry::builder()
        .with_fetcher(Arc::new(FileFetcher::with_base_dir(dir)))
        .build()
        .unwrap();
    let mut raw = common::manifest("answer");
    raw.entry = format!("file://{name}");
    registry.register(raw).unwrap();

    let handle = registry.load("answer").await.unwrap();
    assert_eq!(handle.exports::<ModuleSource>().unwrap().bytes, b"42");
}

#[test]
fn test_config_under_registry_table() {
    let config = RegistryConfig::from_toml_str(
        r#"
        [registry]
        teardown_timeout_ms = 250
        event_history = 8
        singleton_dependencies = ["router"]
        "#,
    )
    .unwrap();
    assert_eq!(config.teardown_timeout().as_millis(), 250);
    assert_eq!(config.event_history, 8);
    assert_eq!(config.singleton_dependencies, ["router"]);
    assert!(config.process_singletons.is_empty());
}

#[test]
fn test_config_root_keys_and_defaults() {
    let config = RegistryConfig::from_toml_str("process_singletons = [\"theme\"]").unwrap();
    assert_eq!(config.teardown_timeout_ms, 5000);
    assert_eq!(config.process_singletons, ["theme"]);

    assert_eq!(RegistryConfig::from_toml_str("").unwrap(), RegistryConfig::default());
}

#[test]
fn test_config_rejects_bad_shapes() {
    assert!(RegistryConfig::from_toml_str("registry = 3").is_err());
    assert!(RegistryConfig::from_toml_str("teardown_timeout_ms = \"soon\"").is_err());
}

#[test]
fn test_config_policy_covers_singletons() {
    let config = RegistryConfig {
        singleton_dependencies: vec!["router".to_string()],
        ..Default::default()
    };
    let raw = common::with_dependency(common::manifest("cart"), "router", "^1", Some("isolated"));
    assert!(composable_frontends::validate_with(&raw, &config.validation_policy()).is_err());
}

#[test]
fn test_config_from_file() {
    let file = common::create_toml_test_file("[registry]\nevent_history = 4\n");
    assert_eq!(RegistryConfig::from_file(&*file).unwrap().event_history, 4);
    assert!(RegistryConfig::from_file("/nonexistent/registry.toml").is_err());
}
