mod common;

use composable_frontends::{
    Capability, DependencyResolver, EventBus, Manifest, ModuleBus, RegistryError, Scope,
    ScopeInitializer, ServiceContainer, UnprovidedDependency, validate,
};
use std::sync::Arc;

fn container(initializers: Vec<ScopeInitializer>) -> ServiceContainer {
    let diagnostics = Arc::new(common::RecordingDiagnostics::default());
    ServiceContainer::new(
        EventBus::new(diagnostics, 0),
        DependencyResolver::default(),
        initializers,
    )
}

fn service(value: &str) -> Capability {
    Arc::new(value.to_string())
}

#[tokio::test]
async fn test_event_bus_is_always_provided() {
    let container = container(Vec::new());
    let manifest = validate(&common::with_capability(common::manifest("cart"), "event-bus")).unwrap();
    let scope = container.create_scope(&manifest).unwrap();

    let events = scope.resolve_as::<ModuleBus>("event-bus").unwrap();
    assert_eq!(events.module_id(), "cart");
    let envelope = events.publish("cart:updated", 2u32);
    assert_eq!(envelope.source, "cart");
}

#[tokio::test]
async fn test_scope_provision_shadows_host_service() {
    let container = container(Vec::new());
    container.provide_service("auth", service("host"));
    let manifest = validate(&common::manifest("cart")).unwrap();
    let cart = container.create_scope(&manifest).unwrap();
    let profile = container
        .create_scope(&validate(&common::manifest("profile")).unwrap())
        .unwrap();

    container.provide(&cart, "auth", service("cart-local"));
    assert_eq!(*cart.resolve_as::<String>("auth").unwrap(), "cart-local");
    assert_eq!(
        *container
            .resolve_capability(&profile, "auth")
            .unwrap()
            .downcast::<String>()
            .unwrap(),
        "host"
    );
}

#[tokio::test]
async fn test_missing_capability_releases_everything() {
    let container = container(Vec::new());
    let raw = common::with_dependency(common::manifest("cart"), "libx", "^1.0", None);
    let manifest = validate(&common::with_capability(raw, "payments")).unwrap();

    let error = container.create_scope(&manifest).unwrap_err();
    assert_eq!(
        error,
        RegistryError::CapabilityMissing {
            module: "cart".to_string(),
            capability: "payments".to_string(),
        }
    );
    assert!(container.resolver().snapshot().is_empty());
    assert!(container.scope_of("cart").is_none());
}

#[tokio::test]
async fn test_initializer_satisfies_capability() {
    let initializer: ScopeInitializer = Arc::new(|scope: &Scope, manifest: &Manifest| {
        if manifest.capabilities.contains("payments") {
            scope.provide("payments", Arc::new(format!("payments for {}", manifest.id)));
        }
    });
    let container = container(vec![initializer]);
    let manifest = validate(&common::with_capability(common::manifest("cart"), "payments")).unwrap();

    let scope = container.create_scope(&manifest).unwrap();
    assert_eq!(
        *scope.resolve_as::<String>("payments").unwrap(),
        "payments for cart"
    );
}

#[tokio::test]
async fn test_dependency_binding_is_a_capability() {
    let container = container(Vec::new());
    let raw = common::with_dependency(common::manifest("cart"), "libx", "^1.0", None);
    let manifest = validate(&common::with_capability(raw, "libx")).unwrap();

    let scope = container.create_scope(&manifest).unwrap();
    let instance = scope.resolve_as::<UnprovidedDependency>("libx").unwrap();
    assert_eq!(instance.bucket, scope.binding("libx").unwrap().bucket);
    assert!(!scope.has_capability("liby"));
    assert!(matches!(
        scope.resolve_as::<String>("libx"),
        Err(RegistryError::CapabilityMissing { .. })
    ));
}

#[tokio::test]
async fn test_destroy_scope_releases_bindings_and_subscriptions() {
    let container = container(Vec::new());
    let manifest = validate(&common::with_dependency(
        common::manifest("cart"),
        "libx",
        "^1.0",
        Some("shared"),
    ))
    .unwrap();
    let scope = container.create_scope(&manifest).unwrap();
    scope.events().subscribe("user:login", |_| Ok(()));
    container
        .event_bus()
        .subscribe("user:logout", "cart", |_| Ok(()));
    assert_eq!(container.resolver().snapshot().len(), 1);

    container.destroy_scope(&scope);
    assert!(container.resolver().snapshot().is_empty());
    assert_eq!(container.event_bus().subscriber_count("user:login"), 0);
    assert_eq!(container.event_bus().subscriber_count("user:logout"), 0);
    assert!(container.scope_of("cart").is_none());
}

#[tokio::test]
async fn test_stale_scope_leaves_current_scope_alone() {
    let container = container(Vec::new());
    let manifest = validate(&common::manifest("cart")).unwrap();
    let stale = container.create_scope(&manifest).unwrap();
    let current = container.create_scope(&manifest).unwrap();
    current.events().subscribe("user:login", |_| Ok(()));

    container.destroy_scope(&stale);
    assert_eq!(
        container.scope_of("cart").map(|s| s.instance_id()),
        Some(current.instance_id())
    );
    assert_eq!(container.event_bus().subscriber_count("user:login"), 1);
}
