//! Composable Frontends
//!
//! A manifest-driven composition runtime for independently built UI
//! modules: manifest validation, dependency version isolation, dynamic
//! loading, an event bus and capability injection.

pub use config::RegistryConfig;
pub use container::{Capability, Scope, ScopeInitializer, ServiceContainer};
pub use diagnostics::{Diagnostic, DiagnosticsSink, TracingDiagnostics};
pub use error::{RegistryError, ValidationError};
pub use events::{EventBus, EventEnvelope, ModuleBus, Payload, Subscription, SubscriptionId};
pub use graph::CompositionGraph;
pub use loader::{FileManifestSource, ManifestSource, StaticManifestSource, load_manifests};
pub use manifest::{
    EVENT_BUS_CAPABILITY, HOST_OWNER, ValidationPolicy, manifest_schema, validate, validate_with,
};
pub use registry::{ModuleRegistry, RegistryBuilder, UnloadOutcome};
pub use resolver::{
    BucketId, BucketSnapshot, DependencyInstance, DependencyProvider, DependencyResolver,
    Placement, ResolvedBinding, UnprovidedDependency,
};
pub use runtime::{FileFetcher, ModuleFetcher, ModuleHandle, ModuleLifecycle, ModuleSource};
pub use types::{
    DependencySpec, FrameworkDescriptor, LifecycleState, Manifest, ModuleId, ModuleStatus,
    RawDependency, RawManifest, SharingStrategy,
};
pub use version::VersionRange;

pub mod config;
pub mod container;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod graph;
pub mod loader;
pub mod manifest;
pub mod registry;
pub mod resolver;
pub mod runtime;
pub mod types;
pub mod version;
