//! Service container: per-module scopes that carry dependency bindings, the
//! event bus and injected capabilities.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::error::RegistryError;
use crate::events::{EventBus, ModuleBus};
use crate::manifest::EVENT_BUS_CAPABILITY;
use crate::resolver::{DependencyResolver, ResolvedBinding};
use crate::types::{Manifest, ModuleId};

/// Opaque capability instance. Its interface is a contract between the host
/// and the modules that declare it.
pub type Capability = Arc<dyn Any + Send + Sync>;

/// Runs against every new scope before its required capabilities are
/// checked. Hosts use it to provide per-module services.
pub type ScopeInitializer = Arc<dyn Fn(&Scope, &Manifest) + Send + Sync>;

type Services = Arc<RwLock<HashMap<String, Capability>>>;

/// Everything a loaded module may reach.
pub struct Scope {
    module: ModuleId,
    instance_id: Uuid,
    events: Arc<ModuleBus>,
    bindings: Vec<ResolvedBinding>,
    provided: RwLock<HashMap<String, Capability>>,
    services: Services,
}

impl Scope {
    pub fn module_id(&self) -> &str {
        &self.module
    }

    /// Identity of this scope. A module that is unloaded and loaded again
    /// gets a new one.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn events(&self) -> &Arc<ModuleBus> {
        &self.events
    }

    pub fn bindings(&self) -> &[ResolvedBinding] {
        &self.bindings
    }

    pub fn binding(&self, dependency: &str) -> Option<&ResolvedBinding> {
        self.bindings.iter().find(|b| b.dependency == dependency)
    }

    /// Provide a capability to this scope only. Shadows a host service of the
    /// same name.
    pub fn provide(&self, name: &str, instance: Capability) {
        self.provided
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), instance);
    }

    /// Look a capability up: scope-local provisions first, then the event
    /// bus, then host services, then dependency bindings.
    pub fn resolve_capability(&self, name: &str) -> Result<Capability, RegistryError> {
        self.lookup(name)
            .ok_or_else(|| RegistryError::CapabilityMissing {
                module: self.module.clone(),
                capability: name.to_string(),
            })
    }

    /// Resolve a capability and downcast it.
    pub fn resolve_as<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, RegistryError> {
        self.resolve_capability(name)?
            .downcast::<T>()
            .map_err(|_| RegistryError::CapabilityMissing {
                module: self.module.clone(),
                capability: format!("{name} (as {})", std::any::type_name::<T>()),
            })
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    fn lookup(&self, name: &str) -> Option<Capability> {
        if let Some(capability) = self
            .provided
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
        {
            return Some(capability.clone());
        }
        if name == EVENT_BUS_CAPABILITY {
            let bus: Capability = self.events.clone();
            return Some(bus);
        }
        if let Some(service) = self
            .services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
        {
            return Some(service.clone());
        }
        self.binding(name).map(|b| b.instance().clone())
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("module", &self.module)
            .field("instance_id", &self.instance_id)
            .field("bindings", &self.bindings)
            .finish_non_exhaustive()
    }
}

struct ContainerInner {
    bus: EventBus,
    resolver: DependencyResolver,
    services: Services,
    initializers: Vec<ScopeInitializer>,
    scopes: Mutex<HashMap<ModuleId, Arc<Scope>>>,
}

/// Creates and destroys module scopes. Cloning yields another handle to the
/// same container.
#[derive(Clone)]
pub struct ServiceContainer {
    inner: Arc<ContainerInner>,
}

impl ServiceContainer {
    pub fn new(
        bus: EventBus,
        resolver: DependencyResolver,
        initializers: Vec<ScopeInitializer>,
    ) -> Self {
        Self {
            inner: Arc::new(ContainerInner {
                bus,
                resolver,
                services: Arc::default(),
                initializers,
                scopes: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register a host service visible to every scope.
    pub fn provide_service(&self, name: &str, instance: Capability) {
        self.inner
            .services
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), instance);
    }

    /// Create a scope for a module: bind its dependencies, run the scope
    /// initializers and check its required capabilities. Nothing is left
    /// behind when this fails.
    pub fn create_scope(&self, manifest: &Manifest) -> Result<Arc<Scope>, RegistryError> {
        let instance_id = Uuid::new_v4();
        let bindings =
            self.inner
                .resolver
                .bind_all(instance_id, &manifest.id, &manifest.dependencies)?;

        let scope = Arc::new(Scope {
            module: manifest.id.clone(),
            instance_id,
            events: Arc::new(ModuleBus::new(self.inner.bus.clone(), manifest.id.clone())),
            bindings,
            provided: RwLock::new(HashMap::new()),
            services: self.inner.services.clone(),
        });

        for initializer in &self.inner.initializers {
            initializer(&scope, manifest);
        }

        if let Some(missing) = manifest
            .capabilities
            .iter()
            .find(|c| !scope.has_capability(c))
        {
            let error = RegistryError::CapabilityMissing {
                module: manifest.id.clone(),
                capability: missing.clone(),
            };
            self.release(&scope);
            return Err(error);
        }

        self.lock_scopes()
            .insert(manifest.id.clone(), scope.clone());
        debug!(module = %manifest.id, scope = %instance_id, "created scope");
        Ok(scope)
    }

    pub fn provide(&self, scope: &Scope, name: &str, instance: Capability) {
        scope.provide(name, instance);
    }

    pub fn resolve_capability(&self, scope: &Scope, name: &str) -> Result<Capability, RegistryError> {
        scope.resolve_capability(name)
    }

    /// Remove the scope's subscriptions and release its dependency bindings.
    pub fn destroy_scope(&self, scope: &Scope) {
        let current = {
            let mut scopes = self.lock_scopes();
            let current = scopes
                .get(&scope.module)
                .is_some_and(|s| s.instance_id == scope.instance_id);
            if current {
                scopes.remove(&scope.module);
            }
            current
        };
        self.release(scope);
        if current {
            // Catch subscriptions made on the shared bus under the module id.
            self.inner.bus.unsubscribe_owner(&scope.module);
        }
        debug!(module = %scope.module, scope = %scope.instance_id, "destroyed scope");
    }

    /// The live scope of a module, if it has one.
    pub fn scope_of(&self, module: &str) -> Option<Arc<Scope>> {
        self.lock_scopes().get(module).cloned()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn resolver(&self) -> &DependencyResolver {
        &self.inner.resolver
    }

    fn release(&self, scope: &Scope) {
        scope.events.unsubscribe_all();
        scope
            .provided
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        let dropped = self.inner.resolver.release(scope.instance_id);
        if !dropped.is_empty() {
            debug!(module = %scope.module, buckets = ?dropped, "dropped dependency buckets");
        }
    }

    fn lock_scopes(&self) -> std::sync::MutexGuard<'_, HashMap<ModuleId, Arc<Scope>>> {
        self.inner.scopes.lock().unwrap_or_else(|e| e.into_inner())
    }
}
