use anyhow::Result;
use std::collections::HashMap;
use std::collections::hash_map::Entry as MapEntry;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;
use crate::container::{Capability, Scope, ScopeInitializer, ServiceContainer};
use crate::diagnostics::{Diagnostic, DiagnosticsSink, TracingDiagnostics, panic_message};
use crate::error::RegistryError;
use crate::events::EventBus;
use crate::loader::ManifestSource;
use crate::manifest::{EVENT_BUS_CAPABILITY, ValidationPolicy, validate_with};
use crate::resolver::{BucketSnapshot, DependencyProvider, DependencyResolver};
use crate::runtime::{FileFetcher, ModuleFetcher, ModuleHandle};
use crate::types::{LifecycleState, Manifest, ModuleId, ModuleStatus, RawManifest};

type LoadOutcome = Result<ModuleHandle, RegistryError>;

/// How an unload finished. Every variant leaves the module unloaded, or
/// cancelled when it was still loading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnloadOutcome {
    Clean,
    TeardownFailed(String),
    TeardownTimedOut,
    /// The module was still loading; the attempt was cancelled and the entry
    /// left `Failed`.
    Cancelled,
}

struct LoadAttempt {
    generation: u64,
    sender: watch::Sender<Option<LoadOutcome>>,
    receiver: watch::Receiver<Option<LoadOutcome>>,
    cancel: CancellationToken,
}

struct EntryState {
    lifecycle: LifecycleState,
    handle: Option<ModuleHandle>,
    scope: Option<Arc<Scope>>,
    error: Option<RegistryError>,
    attempt: Option<LoadAttempt>,
    generation: u64,
}

impl EntryState {
    /// Settle the in-flight attempt, waking everyone who awaits it.
    fn settle(&mut self, outcome: LoadOutcome) {
        if let Some(attempt) = self.attempt.take() {
            attempt.sender.send_replace(Some(outcome));
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lifecycle == LifecycleState::Loading && self.generation == generation
    }
}

struct Entry {
    manifest: Arc<Manifest>,
    state: Mutex<EntryState>,
}

impl Entry {
    fn lock(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct RegistryInner {
    entries: Mutex<HashMap<ModuleId, Arc<Entry>>>,
    container: ServiceContainer,
    fetcher: Arc<dyn ModuleFetcher>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    policy: ValidationPolicy,
    teardown_timeout: Duration,
}

/// Registry of module manifests and their lifecycle.
///
/// Entries of different modules progress independently. Transitions of one
/// module are serialized by that entry's lock, which is never held across an
/// await point.
#[derive(Clone)]
pub struct ModuleRegistry {
    inner: Arc<RegistryInner>,
}

impl ModuleRegistry {
    /// Create a RegistryBuilder
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Validate a manifest and register it as `Pending`.
    ///
    /// Registering an identical manifest again is a no-op. A different
    /// manifest under a registered id is rejected, and so is any manifest
    /// while that id is still unloading.
    pub fn register(&self, raw: RawManifest) -> Result<ModuleId, RegistryError> {
        let manifest = validate_with(&raw, &self.inner.policy)?;
        let mut entries = self.lock_entries();
        match entries.entry(manifest.id.clone()) {
            MapEntry::Occupied(existing) => {
                // An entry on its way out is purged when the unload finishes.
                let state = existing.get().lock().lifecycle;
                if matches!(state, LifecycleState::Unloading | LifecycleState::Unloaded) {
                    return Err(RegistryError::InvalidTransition {
                        id: manifest.id,
                        operation: "register",
                        state,
                    });
                }
                if *existing.get().manifest == manifest {
                    debug!(module = %manifest.id, "manifest already registered");
                    Ok(manifest.id)
                } else {
                    Err(RegistryError::AlreadyRegistered(manifest.id))
                }
            }
            MapEntry::Vacant(slot) => {
                let id = manifest.id.clone();
                info!(module = %id, version = %manifest.version, "registered module");
                slot.insert(Arc::new(Entry {
                    manifest: Arc::new(manifest),
                    state: Mutex::new(EntryState {
                        lifecycle: LifecycleState::Pending,
                        handle: None,
                        scope: None,
                        error: None,
                        attempt: None,
                        generation: 0,
                    }),
                }));
                Ok(id)
            }
        }
    }

    /// Register every manifest a source yields. Stops at the first manifest
    /// that is rejected.
    pub async fn register_from(&self, source: &dyn ManifestSource) -> Result<Vec<ModuleId>> {
        let manifests = source.manifests().await?;
        let mut ids = Vec::with_capacity(manifests.len());
        for raw in manifests {
            ids.push(self.register(raw)?);
        }
        Ok(ids)
    }

    /// Load a module, fetching its entry at most once.
    ///
    /// A ready module returns its handle at once. Callers that arrive while
    /// an attempt is in flight share its outcome. A pending or failed module
    /// starts a new attempt.
    pub async fn load(&self, id: &str) -> Result<ModuleHandle, RegistryError> {
        let entry = self.entry(id)?;
        let mut receiver = {
            let mut state = entry.lock();
            match state.lifecycle {
                LifecycleState::Ready => {
                    return state
                        .handle
                        .clone()
                        .ok_or_else(|| load_failure(id, "ready module has no handle"));
                }
                LifecycleState::Loading => match &state.attempt {
                    Some(attempt) => attempt.receiver.clone(),
                    None => return Err(load_failure(id, "load attempt vanished")),
                },
                LifecycleState::Pending | LifecycleState::Failed => {
                    self.start_attempt(&entry, &mut state)
                }
                other => {
                    return Err(RegistryError::InvalidTransition {
                        id: id.to_string(),
                        operation: "load",
                        state: other,
                    });
                }
            }
        };

        let outcome = receiver
            .wait_for(Option::is_some)
            .await
            .map_err(|_| load_failure(id, "load attempt was dropped"))?
            .clone();
        outcome.unwrap_or_else(|| Err(load_failure(id, "load attempt produced no outcome")))
    }

    /// Load every registered module concurrently.
    pub async fn load_all(&self) -> Vec<(ModuleId, Result<ModuleHandle, RegistryError>)> {
        let ids: Vec<_> = self.lock_entries().keys().cloned().collect();
        let mut set = JoinSet::new();
        for id in ids {
            let registry = self.clone();
            set.spawn(async move {
                let result = registry.load(&id).await;
                (id, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!("load task failed: {e}"),
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    /// Cancel an in-flight load. The entry becomes `Failed` with
    /// [`RegistryError::Cancelled`] and nobody will see it become ready from
    /// that attempt. Returns false when no load was in flight.
    pub fn cancel(&self, id: &str) -> Result<bool, RegistryError> {
        let entry = self.entry(id)?;
        let mut state = entry.lock();
        if state.lifecycle != LifecycleState::Loading {
            return Ok(false);
        }
        self.cancel_locked(id, &mut state);
        Ok(true)
    }

    /// Unload a module: run its teardown hook within the configured timeout,
    /// destroy its scope and purge the entry.
    ///
    /// Unloading a module that is still loading cancels the load instead.
    pub async fn unload(&self, id: &str) -> Result<UnloadOutcome, RegistryError> {
        let entry = self.entry(id)?;
        let (handle, scope) = {
            let mut state = entry.lock();
            match state.lifecycle {
                LifecycleState::Loading => {
                    self.cancel_locked(id, &mut state);
                    return Ok(UnloadOutcome::Cancelled);
                }
                LifecycleState::Ready | LifecycleState::Failed => {
                    state.lifecycle = LifecycleState::Unloading;
                    (state.handle.take(), state.scope.take())
                }
                other => {
                    return Err(RegistryError::InvalidTransition {
                        id: id.to_string(),
                        operation: "unload",
                        state: other,
                    });
                }
            }
        };
        debug!(module = %id, "unloading");

        let outcome = match handle {
            Some(handle) => self.teardown(id, &handle).await,
            None => UnloadOutcome::Clean,
        };
        if let Some(scope) = scope {
            self.inner.container.destroy_scope(&scope);
        }

        entry.lock().lifecycle = LifecycleState::Unloaded;
        {
            let mut entries = self.lock_entries();
            if entries.get(id).is_some_and(|e| Arc::ptr_eq(e, &entry)) {
                entries.remove(id);
            }
        }
        info!(module = %id, ?outcome, "unloaded module");
        Ok(outcome)
    }

    /// Unload every module. Pending entries are simply dropped and in-flight
    /// loads are cancelled.
    pub async fn shutdown(&self) -> Vec<(ModuleId, UnloadOutcome)> {
        let entries: Vec<_> = self
            .lock_entries()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();

        let mut outcomes = Vec::new();
        for (id, entry) in entries {
            {
                let mut entries = self.lock_entries();
                if entry.lock().lifecycle == LifecycleState::Pending {
                    entries.remove(&id);
                    continue;
                }
            }
            let mut result = self.unload(&id).await;
            if matches!(result, Ok(UnloadOutcome::Cancelled)) {
                result = self.unload(&id).await.map(|_| UnloadOutcome::Cancelled);
            }
            match result {
                Ok(outcome) => outcomes.push((id, outcome)),
                Err(e) => warn!(module = %id, "shutdown skipped module: {e}"),
            }
        }
        outcomes.sort_by(|a, b| a.0.cmp(&b.0));
        info!(modules = outcomes.len(), "registry shut down");
        outcomes
    }

    pub fn get_status(&self, id: &str) -> Result<ModuleStatus, RegistryError> {
        let entry = self.entry(id)?;
        Ok(status_of(&entry))
    }

    /// Status of every registered module, ordered by id.
    pub fn list(&self) -> Vec<ModuleStatus> {
        let entries: Vec<_> = self.lock_entries().values().cloned().collect();
        let mut statuses: Vec<_> = entries.iter().map(|e| status_of(e)).collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    pub fn manifest(&self, id: &str) -> Result<Arc<Manifest>, RegistryError> {
        Ok(self.entry(id)?.manifest.clone())
    }

    /// Every registered manifest, ordered by id.
    pub fn manifests(&self) -> Vec<Arc<Manifest>> {
        let mut manifests: Vec<_> = self
            .lock_entries()
            .values()
            .map(|e| e.manifest.clone())
            .collect();
        manifests.sort_by(|a, b| a.id.cmp(&b.id));
        manifests
    }

    pub fn event_bus(&self) -> &EventBus {
        self.inner.container.event_bus()
    }

    pub fn container(&self) -> &ServiceContainer {
        &self.inner.container
    }

    pub fn dependency_buckets(&self) -> Vec<BucketSnapshot> {
        self.inner.container.resolver().snapshot()
    }

    fn entry(&self, id: &str) -> Result<Arc<Entry>, RegistryError> {
        self.lock_entries()
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotRegistered(id.to_string()))
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<ModuleId, Arc<Entry>>> {
        self.inner.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn start_attempt(
        &self,
        entry: &Arc<Entry>,
        state: &mut EntryState,
    ) -> watch::Receiver<Option<LoadOutcome>> {
        state.generation += 1;
        state.lifecycle = LifecycleState::Loading;
        state.error = None;

        let (sender, receiver) = watch::channel(None);
        let cancel = CancellationToken::new();
        state.attempt = Some(LoadAttempt {
            generation: state.generation,
            sender,
            receiver: receiver.clone(),
            cancel: cancel.clone(),
        });
        debug!(module = %entry.manifest.id, attempt = state.generation, "loading");

        tokio::spawn(self.clone().run_attempt(entry.clone(), state.generation, cancel));
        receiver
    }

    fn cancel_locked(&self, id: &str, state: &mut EntryState) {
        let error = RegistryError::Cancelled(id.to_string());
        if let Some(attempt) = &state.attempt {
            debug!(module = %id, attempt = attempt.generation, "cancelling load");
            attempt.cancel.cancel();
        }
        state.lifecycle = LifecycleState::Failed;
        state.error = Some(error.clone());
        state.settle(Err(error.clone()));
        self.inner.diagnostics.emit(Diagnostic::LoadFailed {
            module: id.to_string(),
            error,
        });
    }

    async fn run_attempt(self, entry: Arc<Entry>, generation: u64, cancel: CancellationToken) {
        let manifest = entry.manifest.clone();
        let id = manifest.id.as_str();

        let scope = match self.inner.container.create_scope(&manifest) {
            Ok(scope) => scope,
            Err(e) => {
                self.fail(&entry, generation, e);
                return;
            }
        };

        let handle = match self.fetch(id, &manifest.entry, &cancel).await {
            Some(Ok(handle)) => handle,
            Some(Err(e)) => {
                self.inner.container.destroy_scope(&scope);
                self.fail(&entry, generation, e);
                return;
            }
            None => {
                self.inner.container.destroy_scope(&scope);
                return;
            }
        };

        if let Some(lifecycle) = handle.lifecycle().cloned() {
            let mount_scope = scope.clone();
            let mut task = tokio::spawn(async move { lifecycle.mount(mount_scope).await });
            let mounted = tokio::select! {
                _ = cancel.cancelled() => None,
                joined = &mut task => Some(joined),
            };
            let failure = match mounted {
                Some(Ok(Ok(()))) => None,
                Some(Ok(Err(e))) => Some(format!("mount failed: {e:#}")),
                Some(Err(e)) if e.is_panic() => Some(format!(
                    "mount panicked: {}",
                    panic_message(e.into_panic().as_ref())
                )),
                Some(Err(e)) => Some(format!("mount task failed: {e}")),
                None => {
                    task.abort();
                    self.inner.container.destroy_scope(&scope);
                    return;
                }
            };
            if let Some(reason) = failure {
                self.inner.container.destroy_scope(&scope);
                self.fail(&entry, generation, load_failure(id, reason));
                return;
            }
        }

        let committed = {
            let mut state = entry.lock();
            if state.is_current(generation) {
                state.lifecycle = LifecycleState::Ready;
                state.handle = Some(handle.clone());
                state.scope = Some(scope.clone());
                state.settle(Ok(handle.clone()));
                true
            } else {
                false
            }
        };

        if committed {
            info!(module = %id, bindings = scope.bindings().len(), "module ready");
        } else {
            // Cancelled between mount and commit.
            self.teardown(id, &handle).await;
            self.inner.container.destroy_scope(&scope);
            self.inner
                .diagnostics
                .emit(Diagnostic::StaleLoadDiscarded { module: id.to_string() });
        }
    }

    /// Fetch in a separate task. Returns `None` when the attempt is
    /// cancelled first.
    async fn fetch(
        &self,
        id: &str,
        locator: &str,
        cancel: &CancellationToken,
    ) -> Option<Result<ModuleHandle, RegistryError>> {
        let fetcher = self.inner.fetcher.clone();
        let owned_locator = locator.to_string();
        let mut task = tokio::spawn(async move { fetcher.fetch(&owned_locator).await });

        let joined = tokio::select! {
            _ = cancel.cancelled() => None,
            joined = &mut task => Some(joined),
        };

        let Some(joined) = joined else {
            if self.inner.fetcher.supports_cancellation() {
                task.abort();
                debug!(module = %id, "aborted fetch");
            } else {
                let diagnostics = self.inner.diagnostics.clone();
                let module = id.to_string();
                tokio::spawn(async move {
                    let _ = task.await;
                    diagnostics.emit(Diagnostic::StaleLoadDiscarded { module });
                });
            }
            return None;
        };
        Some(match joined {
            Ok(Ok(handle)) => Ok(handle),
            Ok(Err(e)) => Err(load_failure(id, format!("{e:#}"))),
            Err(e) => Err(load_failure(id, format!("fetch task failed: {e}"))),
        })
    }

    fn fail(&self, entry: &Entry, generation: u64, error: RegistryError) {
        let module = entry.manifest.id.clone();
        {
            let mut state = entry.lock();
            if !state.is_current(generation) {
                return;
            }
            state.lifecycle = LifecycleState::Failed;
            state.error = Some(error.clone());
            state.settle(Err(error.clone()));
        }
        self.inner
            .diagnostics
            .emit(Diagnostic::LoadFailed { module, error });
    }

    /// Run the teardown hook in its own task, bounded by the timeout.
    async fn teardown(&self, id: &str, handle: &ModuleHandle) -> UnloadOutcome {
        let Some(lifecycle) = handle.lifecycle().cloned() else {
            return UnloadOutcome::Clean;
        };
        let timeout = self.inner.teardown_timeout;
        let mut task = tokio::spawn(async move { lifecycle.teardown().await });

        let message = match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(Ok(()))) => return UnloadOutcome::Clean,
            Ok(Ok(Err(e))) => format!("{e:#}"),
            Ok(Err(e)) => format!("teardown task failed: {e}"),
            Err(_) => {
                task.abort();
                self.inner.diagnostics.emit(Diagnostic::TeardownTimeout {
                    module: id.to_string(),
                    timeout,
                });
                return UnloadOutcome::TeardownTimedOut;
            }
        };
        self.inner.diagnostics.emit(Diagnostic::TeardownFailed {
            module: id.to_string(),
            message: message.clone(),
        });
        UnloadOutcome::TeardownFailed(message)
    }
}

fn status_of(entry: &Entry) -> ModuleStatus {
    let state = entry.lock();
    ModuleStatus {
        id: entry.manifest.id.clone(),
        version: entry.manifest.version.clone(),
        entry: entry.manifest.entry.clone(),
        state: state.lifecycle,
        error: state.error.clone(),
        bindings: state
            .scope
            .as_ref()
            .map(|scope| {
                scope
                    .bindings()
                    .iter()
                    .map(|b| (b.dependency.clone(), b.bucket))
                    .collect()
            })
            .unwrap_or_default(),
    }
}

fn load_failure(id: &str, reason: impl Into<String>) -> RegistryError {
    RegistryError::LoadFailure {
        module: id.to_string(),
        reason: reason.into(),
    }
}

/// Builder for configuring and creating a ModuleRegistry
pub struct RegistryBuilder {
    config: RegistryConfig,
    fetcher: Option<Arc<dyn ModuleFetcher>>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    services: Vec<(String, Capability)>,
    providers: HashMap<String, Arc<dyn DependencyProvider>>,
    initializers: Vec<ScopeInitializer>,
}

impl RegistryBuilder {
    fn new() -> Self {
        Self {
            config: RegistryConfig::default(),
            fetcher: None,
            diagnostics: Arc::new(TracingDiagnostics),
            services: Vec::new(),
            providers: HashMap::new(),
            initializers: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: RegistryConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the fetcher used to load module entries. Defaults to
    /// [`FileFetcher`].
    pub fn with_fetcher(mut self, fetcher: Arc<dyn ModuleFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Set the diagnostics sink. Defaults to [`TracingDiagnostics`].
    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Register a host service visible to every module scope.
    pub fn with_service(mut self, name: &str, instance: Capability) -> Self {
        self.services.push((name.to_string(), instance));
        self
    }

    /// Register the factory for instances of an external dependency.
    pub fn with_dependency_provider(
        mut self,
        name: &str,
        provider: Arc<dyn DependencyProvider>,
    ) -> Self {
        self.providers.insert(name.to_string(), provider);
        self
    }

    pub fn with_scope_initializer(mut self, initializer: ScopeInitializer) -> Self {
        self.initializers.push(initializer);
        self
    }

    /// Build the ModuleRegistry
    pub fn build(self) -> Result<ModuleRegistry> {
        for (name, _) in &self.services {
            if name.trim().is_empty() {
                return Err(anyhow::anyhow!("Service names must not be empty"));
            }
            if name == EVENT_BUS_CAPABILITY {
                return Err(anyhow::anyhow!(
                    "Service name '{EVENT_BUS_CAPABILITY}' is reserved for the event bus"
                ));
            }
        }
        for name in self.providers.keys() {
            if name.trim().is_empty() {
                return Err(anyhow::anyhow!("Dependency provider names must not be empty"));
            }
        }

        let bus = EventBus::new(self.diagnostics.clone(), self.config.event_history);
        let resolver = DependencyResolver::new(
            self.providers,
            self.config.singleton_dependencies.iter().cloned().collect(),
        );
        let container = ServiceContainer::new(bus, resolver, self.initializers);
        for (name, instance) in self.services {
            container.provide_service(&name, instance);
        }

        Ok(ModuleRegistry {
            inner: Arc::new(RegistryInner {
                entries: Mutex::new(HashMap::new()),
                container,
                fetcher: self.fetcher.unwrap_or_else(|| Arc::new(FileFetcher::new())),
                diagnostics: self.diagnostics,
                policy: self.config.validation_policy(),
                teardown_timeout: self.config.teardown_timeout(),
            }),
        })
    }
}
