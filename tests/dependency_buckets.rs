mod common;

use composable_frontends::{
    DependencyInstance, DependencyResolver, DependencySpec, ModuleRegistry, Placement,
    RegistryError, SharingStrategy, UnprovidedDependency, VersionRange,
};
use semver::VersionReq;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

fn libx(range: &str, strategy: SharingStrategy) -> DependencySpec {
    DependencySpec {
        name: "libx".to_string(),
        requirement: VersionReq::parse(range).unwrap(),
        strategy,
    }
}

fn bind(resolver: &DependencyResolver, module: &str, spec: DependencySpec) -> (Uuid, u64) {
    let scope = Uuid::new_v4();
    let bindings = resolver.bind_all(scope, module, &[spec]).unwrap();
    (scope, bindings[0].bucket)
}

fn counting_registry(instances: Arc<AtomicUsize>) -> ModuleRegistry {
    ModuleRegistry::builder()
        .with_fetcher(Arc::new(common::CountingFetcher::new()))
        .with_diagnostics(Arc::new(common::RecordingDiagnostics::default()))
        .with_dependency_provider(
            "libx",
            Arc::new(move |name: &str, range: &VersionRange| -> anyhow::Result<DependencyInstance> {
                instances.fetch_add(1, Ordering::SeqCst);
                let instance: DependencyInstance = Arc::new(format!("{name} {range}"));
                Ok(instance)
            }),
        )
        .build()
        .unwrap()
}

fn bucket_of(registry: &ModuleRegistry, module: &str) -> u64 {
    let status = registry.get_status(module).unwrap();
    status
        .bindings
        .iter()
        .find(|(name, _)| name == "libx")
        .map(|(_, bucket)| *bucket)
        .unwrap()
}

#[tokio::test]
async fn test_divergent_majors_get_separate_instances_and_compatible_module_joins() {
    let instances = Arc::new(AtomicUsize::new(0));
    let registry = counting_registry(instances.clone());

    for (id, range) in [("a", "^2.0"), ("b", "^1.0"), ("c", "^2.1")] {
        let raw = common::with_dependency(common::manifest(id), "libx", range, Some("shared"));
        registry.register(raw).unwrap();
    }

    registry.load("a").await.unwrap();
    registry.load("b").await.unwrap();
    assert_ne!(bucket_of(&registry, "a"), bucket_of(&registry, "b"));
    assert_eq!(registry.dependency_buckets().len(), 2);
    assert_eq!(instances.load(Ordering::SeqCst), 2);

    registry.load("c").await.unwrap();
    assert_eq!(bucket_of(&registry, "c"), bucket_of(&registry, "a"));
    assert_eq!(registry.dependency_buckets().len(), 2);
    assert_eq!(instances.load(Ordering::SeqCst), 2);

    let scope_a = registry.container().scope_of("a").unwrap();
    let scope_c = registry.container().scope_of("c").unwrap();
    let binding_a = scope_a.binding("libx").unwrap();
    assert!(binding_a.same_instance(scope_c.binding("libx").unwrap()));
    assert_eq!(scope_c.binding("libx").unwrap().range.to_string(), ">=2.1.0, <3.0.0");

    registry.unload("a").await.unwrap();
    assert_eq!(registry.dependency_buckets().len(), 2);
    registry.unload("c").await.unwrap();
    let buckets = registry.dependency_buckets();
    assert_eq!(buckets.len(), 1);
    assert_eq!(buckets[0].members, vec!["b".to_string()]);
}

#[test]
fn test_isolated_requirements_never_share() {
    let resolver = DependencyResolver::default();
    let (_, first) = bind(&resolver, "a", libx("^1.0", SharingStrategy::Isolated));
    let (_, second) = bind(&resolver, "b", libx("^1.0", SharingStrategy::Isolated));
    let (_, shared) = bind(&resolver, "c", libx("^1.0", SharingStrategy::Shared));

    assert_ne!(first, second);
    assert_ne!(shared, first);
    assert_ne!(shared, second);
    let snapshot = resolver.snapshot();
    assert_eq!(snapshot.iter().filter(|b| b.private).count(), 2);
}

#[test]
fn test_shared_bucket_range_narrows() {
    let resolver = DependencyResolver::default();
    let (_, a) = bind(&resolver, "a", libx("^1.2", SharingStrategy::Shared));
    let (_, b) = bind(&resolver, "b", libx("^1.0", SharingStrategy::Shared));
    assert_eq!(a, b);

    // 1.1 overlaps ^1.0 but not the narrowed >=1.2.0.
    let (_, d) = bind(&resolver, "d", libx("=1.1.0", SharingStrategy::Shared));
    assert_ne!(d, a);
}

#[test]
fn test_shared_prefers_bucket_with_most_members() {
    let resolver = DependencyResolver::default();
    let (_, small) = bind(&resolver, "a", libx("^1.0", SharingStrategy::Isolated));
    let (_, big) = bind(&resolver, "b", libx("^1.0", SharingStrategy::Shared));
    bind(&resolver, "c", libx("^1.0", SharingStrategy::Shared));

    let placement = resolver
        .resolve("d", &libx("^1.0", SharingStrategy::Shared))
        .unwrap();
    assert_eq!(placement, Placement::Existing(big));
    assert_ne!(placement.bucket(), small);
}

#[test]
fn test_auto_degrades_to_isolated_without_migrating() {
    let resolver = DependencyResolver::default();
    let (scope_a, a) = bind(&resolver, "a", libx("^2.0", SharingStrategy::Auto));
    let (scope_b, b) = bind(&resolver, "b", libx("^2.3", SharingStrategy::Auto));
    assert_eq!(a, b);

    let (scope_c, c) = bind(&resolver, "c", libx("^1.0", SharingStrategy::Auto));
    assert_ne!(c, a);

    // Once degraded, even compatible requirements stay private.
    let (scope_d, d) = bind(&resolver, "d", libx("^2.0", SharingStrategy::Auto));
    assert_ne!(d, a);
    assert_ne!(d, c);

    // Already bound modules keep their bucket.
    let snapshot = resolver.snapshot();
    let shared = snapshot.iter().find(|s| s.id == a).unwrap();
    assert_eq!(shared.members, vec!["a".to_string(), "b".to_string()]);
    assert!(!shared.private);

    for scope in [scope_a, scope_b, scope_c, scope_d] {
        resolver.release(scope);
    }
    assert!(resolver.snapshot().is_empty());

    // The degraded flag resets once nothing depends on libx.
    let (_, e) = bind(&resolver, "e", libx("^2.0", SharingStrategy::Auto));
    let (_, f) = bind(&resolver, "f", libx("^2.0", SharingStrategy::Auto));
    assert_eq!(e, f);
}

#[test]
fn test_release_drops_bucket_with_last_member() {
    let resolver = DependencyResolver::default();
    let (scope_a, bucket) = bind(&resolver, "a", libx("^1.0", SharingStrategy::Shared));
    let (scope_b, _) = bind(&resolver, "b", libx("^1.0", SharingStrategy::Shared));

    assert!(resolver.release(scope_a).is_empty());
    assert_eq!(resolver.snapshot()[0].members, vec!["b".to_string()]);
    assert_eq!(resolver.release(scope_b), vec![bucket]);
    assert!(resolver.snapshot().is_empty());
}

#[test]
fn test_default_instance_without_provider() {
    let resolver = DependencyResolver::default();
    let bindings = resolver
        .bind_all(Uuid::new_v4(), "a", &[libx("^1.0", SharingStrategy::Shared)])
        .unwrap();
    let marker = bindings[0].downcast::<UnprovidedDependency>().unwrap();
    assert_eq!(marker.name, "libx");
    assert_eq!(marker.bucket, bindings[0].bucket);
}

#[test]
fn test_singleton_dependency() {
    let resolver =
        DependencyResolver::new(HashMap::new(), BTreeSet::from(["libx".to_string()]));
    let (_, a) = bind(&resolver, "a", libx("^1.0", SharingStrategy::Auto));
    let (_, b) = bind(&resolver, "b", libx("^1.4", SharingStrategy::Shared));
    assert_eq!(a, b);

    let conflict = resolver.bind_all(Uuid::new_v4(), "c", &[libx("^2.0", SharingStrategy::Shared)]);
    assert!(matches!(
        conflict,
        Err(RegistryError::ResolutionConflict { module, dependency, .. })
            if module == "c" && dependency == "libx"
    ));

    let isolated =
        resolver.bind_all(Uuid::new_v4(), "d", &[libx("^1.0", SharingStrategy::Isolated)]);
    assert!(matches!(
        isolated,
        Err(RegistryError::ResolutionConflict { .. })
    ));
    assert_eq!(resolver.snapshot().len(), 1);
}

#[test]
fn test_failed_bind_rolls_back() {
    let mut providers: HashMap<String, Arc<dyn composable_frontends::DependencyProvider>> =
        HashMap::new();
    providers.insert(
        "broken".to_string(),
        Arc::new(|_: &str, _: &VersionRange| -> anyhow::Result<DependencyInstance> {
            Err(anyhow::anyhow!("no build available"))
        }),
    );
    let resolver = DependencyResolver::new(providers, BTreeSet::new());

    let broken = DependencySpec {
        name: "broken".to_string(),
        requirement: VersionReq::STAR,
        strategy: SharingStrategy::Shared,
    };
    let result = resolver.bind_all(
        Uuid::new_v4(),
        "a",
        &[libx("^1.0", SharingStrategy::Shared), broken],
    );
    assert!(matches!(result, Err(RegistryError::LoadFailure { .. })));
    assert!(resolver.snapshot().is_empty());
}

#[tokio::test]
async fn test_resolution_conflict_fails_load() {
    let registry = ModuleRegistry::builder()
        .with_config(composable_frontends::RegistryConfig {
            singleton_dependencies: vec!["libx".to_string()],
            ..Default::default()
        })
        .with_fetcher(Arc::new(common::CountingFetcher::new()))
        .with_diagnostics(Arc::new(common::RecordingDiagnostics::default()))
        .build()
        .unwrap();
    registry
        .register(common::with_dependency(common::manifest("a"), "libx", "^1.0", None))
        .unwrap();
    registry
        .register(common::with_dependency(common::manifest("b"), "libx", "^2.0", None))
        .unwrap();

    registry.load("a").await.unwrap();
    let error = registry.load("b").await.unwrap_err();
    assert!(matches!(error, RegistryError::ResolutionConflict { .. }));
    let status = registry.get_status("b").unwrap();
    assert_eq!(status.state, composable_frontends::LifecycleState::Failed);
    assert_eq!(status.error, Some(error));
}
