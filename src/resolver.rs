//! Dependency version resolution.
//!
//! Requirements for the same external dependency are grouped into
//! compatibility buckets. Every bucket owns exactly one instance of the
//! dependency, created on the first binding and dropped when its last member
//! is released.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use crate::diagnostics::panic_message;
use crate::error::RegistryError;
use crate::types::{DependencySpec, ModuleId, SharingStrategy};
use crate::version::VersionRange;

pub type BucketId = u64;

/// Opaque dependency instance lent to every member of a bucket.
pub type DependencyInstance = Arc<dyn Any + Send + Sync>;

/// Creates the instance a bucket hands to its members.
pub trait DependencyProvider: Send + Sync {
    fn instantiate(&self, name: &str, range: &VersionRange) -> anyhow::Result<DependencyInstance>;
}

impl<F> DependencyProvider for F
where
    F: Fn(&str, &VersionRange) -> anyhow::Result<DependencyInstance> + Send + Sync,
{
    fn instantiate(&self, name: &str, range: &VersionRange) -> anyhow::Result<DependencyInstance> {
        self(name, range)
    }
}

/// Instance used when the host registered no provider for a dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnprovidedDependency {
    pub name: String,
    pub bucket: BucketId,
}

/// A dependency binding lent to one module scope.
#[derive(Clone)]
pub struct ResolvedBinding {
    pub dependency: String,
    pub bucket: BucketId,
    pub range: VersionRange,
    instance: DependencyInstance,
}

impl ResolvedBinding {
    pub fn instance(&self) -> &DependencyInstance {
        &self.instance
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.instance.clone().downcast::<T>().ok()
    }

    /// Whether both bindings point at the same live instance.
    pub fn same_instance(&self, other: &ResolvedBinding) -> bool {
        Arc::ptr_eq(&self.instance, &other.instance)
    }
}

impl fmt::Debug for ResolvedBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedBinding")
            .field("dependency", &self.dependency)
            .field("bucket", &self.bucket)
            .field("range", &self.range.to_string())
            .finish()
    }
}

/// Where a requirement would land if it were bound now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Existing(BucketId),
    New { id: BucketId, private: bool },
}

impl Placement {
    pub fn bucket(&self) -> BucketId {
        match self {
            Self::Existing(id) => *id,
            Self::New { id, .. } => *id,
        }
    }
}

/// Read-only copy of a bucket.
#[derive(Debug, Clone)]
pub struct BucketSnapshot {
    pub id: BucketId,
    pub dependency: String,
    pub range: VersionRange,
    pub private: bool,
    pub members: Vec<ModuleId>,
    pub instantiated: bool,
}

struct Member {
    scope: Uuid,
    module: ModuleId,
    range: VersionRange,
}

struct Bucket {
    id: BucketId,
    dependency: String,
    range: VersionRange,
    private: bool,
    members: Vec<Member>,
    instance: Option<DependencyInstance>,
}

impl Bucket {
    fn recompute_range(&mut self) {
        let mut range = VersionRange::any();
        for member in &self.members {
            if let Some(next) = range.intersect(&member.range) {
                range = next;
            }
        }
        self.range = range;
    }
}

#[derive(Default)]
struct ResolverState {
    buckets: BTreeMap<BucketId, Bucket>,
    degraded: BTreeSet<String>,
    next_id: BucketId,
}

impl ResolverState {
    fn buckets_for<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Bucket> + 'a {
        self.buckets.values().filter(move |b| b.dependency == name)
    }

    /// Compatible shared bucket with most members, lowest id on ties.
    fn best_shared(&self, name: &str, range: &VersionRange) -> Option<BucketId> {
        self.buckets_for(name)
            .filter(|b| !b.private && b.range.intersects(range))
            .max_by(|a, b| {
                a.members
                    .len()
                    .cmp(&b.members.len())
                    .then_with(|| b.id.cmp(&a.id))
            })
            .map(|b| b.id)
    }

    /// Whether `range` and every requirement already bound to a shared bucket
    /// of `name` have a common version.
    fn all_compatible(&self, name: &str, range: &VersionRange) -> bool {
        let mut common = range.clone();
        for bucket in self.buckets_for(name).filter(|b| !b.private) {
            for member in &bucket.members {
                match common.intersect(&member.range) {
                    Some(next) => common = next,
                    None => return false,
                }
            }
        }
        true
    }

    fn new_placement(&self, private: bool) -> Placement {
        Placement::New {
            id: self.next_id + 1,
            private,
        }
    }
}

/// Process-wide dependency resolver.
///
/// All bucket bookkeeping happens under one mutex, so membership changes are
/// atomic with respect to concurrent loads and unloads.
#[derive(Clone, Default)]
pub struct DependencyResolver {
    state: Arc<Mutex<ResolverState>>,
    providers: Arc<HashMap<String, Arc<dyn DependencyProvider>>>,
    singletons: Arc<BTreeSet<String>>,
}

impl DependencyResolver {
    pub fn new(
        providers: HashMap<String, Arc<dyn DependencyProvider>>,
        singletons: BTreeSet<String>,
    ) -> Self {
        Self {
            state: Arc::default(),
            providers: Arc::new(providers),
            singletons: Arc::new(singletons),
        }
    }

    pub fn is_singleton(&self, name: &str) -> bool {
        self.singletons.contains(name)
    }

    /// Decide where a requirement would be placed, without binding it.
    pub fn resolve(
        &self,
        module: &str,
        dependency: &DependencySpec,
    ) -> Result<Placement, RegistryError> {
        let range = requirement_range(module, dependency)?;
        let state = self.lock();
        self.place(&state, module, dependency, &range)
    }

    /// Bind every dependency of a module scope. Either all bindings are taken
    /// or none are.
    pub fn bind_all(
        &self,
        scope: Uuid,
        module: &str,
        dependencies: &[DependencySpec],
    ) -> Result<Vec<ResolvedBinding>, RegistryError> {
        let mut state = self.lock();
        let mut bindings = Vec::with_capacity(dependencies.len());
        for dependency in dependencies {
            match self.bind_locked(&mut state, scope, module, dependency) {
                Ok(binding) => bindings.push(binding),
                Err(e) => {
                    release_locked(&mut state, scope);
                    return Err(e);
                }
            }
        }
        Ok(bindings)
    }

    /// Release every bucket membership held by a scope. Returns the buckets
    /// that were dropped because they lost their last member.
    pub fn release(&self, scope: Uuid) -> Vec<BucketId> {
        let mut state = self.lock();
        release_locked(&mut state, scope)
    }

    pub fn snapshot(&self) -> Vec<BucketSnapshot> {
        let state = self.lock();
        state
            .buckets
            .values()
            .map(|b| BucketSnapshot {
                id: b.id,
                dependency: b.dependency.clone(),
                range: b.range.clone(),
                private: b.private,
                members: b.members.iter().map(|m| m.module.clone()).collect(),
                instantiated: b.instance.is_some(),
            })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, ResolverState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn place(
        &self,
        state: &ResolverState,
        module: &str,
        dependency: &DependencySpec,
        range: &VersionRange,
    ) -> Result<Placement, RegistryError> {
        let name = dependency.name.as_str();

        if self.is_singleton(name) {
            if dependency.strategy == SharingStrategy::Isolated {
                return Err(conflict(
                    module,
                    name,
                    "dependency is a singleton and cannot be isolated".to_string(),
                ));
            }
            return match state.buckets_for(name).next() {
                None => Ok(state.new_placement(false)),
                Some(bucket) if bucket.range.intersects(range) => {
                    Ok(Placement::Existing(bucket.id))
                }
                Some(bucket) => Err(conflict(
                    module,
                    name,
                    format!(
                        "requirement {range} does not overlap the singleton instance range {}",
                        bucket.range
                    ),
                )),
            };
        }

        let placement = match dependency.strategy {
            SharingStrategy::Isolated => state.new_placement(true),
            SharingStrategy::Shared => match state.best_shared(name, range) {
                Some(id) => Placement::Existing(id),
                None => state.new_placement(false),
            },
            SharingStrategy::Auto => {
                if state.degraded.contains(name) || !state.all_compatible(name, range) {
                    state.new_placement(true)
                } else {
                    match state.best_shared(name, range) {
                        Some(id) => Placement::Existing(id),
                        None => state.new_placement(false),
                    }
                }
            }
        };
        Ok(placement)
    }

    fn bind_locked(
        &self,
        state: &mut ResolverState,
        scope: Uuid,
        module: &str,
        dependency: &DependencySpec,
    ) -> Result<ResolvedBinding, RegistryError> {
        let name = dependency.name.as_str();
        let range = requirement_range(module, dependency)?;
        let placement = self.place(state, module, dependency, &range)?;

        if dependency.strategy == SharingStrategy::Auto
            && !self.is_singleton(name)
            && matches!(placement, Placement::New { private: true, .. })
            && state.degraded.insert(name.to_string())
        {
            info!(
                dependency = name,
                module, "incompatible requirement {range}, auto sharing degraded to isolated"
            );
        }

        let id = match placement {
            Placement::Existing(id) => id,
            Placement::New { id, private } => {
                state.next_id = id;
                state.buckets.insert(
                    id,
                    Bucket {
                        id,
                        dependency: name.to_string(),
                        range: range.clone(),
                        private,
                        members: Vec::new(),
                        instance: None,
                    },
                );
                debug!(dependency = name, bucket = id, private, "created bucket");
                id
            }
        };

        let bucket = state
            .buckets
            .get_mut(&id)
            .ok_or_else(|| conflict(module, name, format!("bucket {id} vanished")))?;

        if bucket.instance.is_none() {
            let instance: DependencyInstance = match self.providers.get(name) {
                Some(provider) => {
                    match catch_unwind(AssertUnwindSafe(|| provider.instantiate(name, &range))) {
                        Ok(Ok(instance)) => instance,
                        Ok(Err(e)) => {
                            return Err(instantiate_failure(module, name, format!("{e:#}")));
                        }
                        Err(panic) => {
                            let message = panic_message(panic.as_ref());
                            return Err(instantiate_failure(
                                module,
                                name,
                                format!("provider panicked: {message}"),
                            ));
                        }
                    }
                }
                None => Arc::new(UnprovidedDependency {
                    name: name.to_string(),
                    bucket: id,
                }),
            };
            bucket.instance = Some(instance);
        }

        bucket.members.push(Member {
            scope,
            module: module.to_string(),
            range,
        });
        bucket.recompute_range();

        let instance = match &bucket.instance {
            Some(instance) => instance.clone(),
            None => return Err(conflict(module, name, "bucket has no instance".to_string())),
        };
        debug!(
            dependency = name,
            bucket = id,
            members = bucket.members.len(),
            strategy = %dependency.strategy,
            "bound {module}"
        );

        Ok(ResolvedBinding {
            dependency: name.to_string(),
            bucket: id,
            range: bucket.range.clone(),
            instance,
        })
    }
}

fn instantiate_failure(module: &str, name: &str, reason: String) -> RegistryError {
    RegistryError::LoadFailure {
        module: module.to_string(),
        reason: format!("failed to instantiate dependency '{name}': {reason}"),
    }
}

fn release_locked(state: &mut ResolverState, scope: Uuid) -> Vec<BucketId> {
    let mut emptied = Vec::new();
    for bucket in state.buckets.values_mut() {
        let before = bucket.members.len();
        bucket.members.retain(|m| m.scope != scope);
        // A failed bind can leave a freshly created bucket without members.
        if bucket.members.is_empty() {
            emptied.push(bucket.id);
        } else if bucket.members.len() != before {
            bucket.recompute_range();
        }
    }

    for id in &emptied {
        if let Some(bucket) = state.buckets.remove(id) {
            debug!(
                dependency = %bucket.dependency,
                bucket = id,
                "released bucket and its instance"
            );
            if !state.buckets.values().any(|b| b.dependency == bucket.dependency) {
                state.degraded.remove(&bucket.dependency);
            }
        }
    }
    emptied
}

fn requirement_range(module: &str, dependency: &DependencySpec) -> Result<VersionRange, RegistryError> {
    VersionRange::from_req(&dependency.requirement)
        .map_err(|reason| conflict(module, &dependency.name, reason))
}

fn conflict(module: &str, dependency: &str, reason: String) -> RegistryError {
    RegistryError::ResolutionConflict {
        module: module.to_string(),
        dependency: dependency.to_string(),
        reason,
    }
}
