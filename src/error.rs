//! Error taxonomy for the registry boundary.

use thiserror::Error;

/// Why a raw manifest was rejected. A manifest that fails validation is never
/// registered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("manifest is missing required field '{0}'")]
    MissingField(&'static str),

    #[error("module id '{0}' is reserved for the host")]
    ReservedId(String),

    #[error("invalid module version '{version}': {reason}")]
    InvalidVersion { version: String, reason: String },

    #[error("dependency at position {0} has an empty name")]
    EmptyDependencyName(usize),

    #[error("dependency '{0}' is declared more than once")]
    DuplicateDependency(String),

    #[error("dependency '{name}' has malformed version range '{range}': {reason}")]
    InvalidVersionRange {
        name: String,
        range: String,
        reason: String,
    },

    #[error("dependency '{name}' has unknown sharing strategy '{strategy}'")]
    UnknownStrategy { name: String, strategy: String },

    #[error("dependency '{0}' is process-singleton and cannot be isolated")]
    IsolatedSingleton(String),

    #[error("capability at position {0} has an empty name")]
    EmptyCapability(usize),
}

/// Errors returned by the registry, resolver and service container.
///
/// Errors are `Clone` so that every caller awaiting the same in-flight load
/// receives the same outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("invalid manifest: {0}")]
    Validation(#[from] ValidationError),

    #[error("module '{0}' is already registered with a different manifest")]
    AlreadyRegistered(String),

    #[error("module '{0}' is not registered")]
    NotRegistered(String),

    #[error("module '{id}' cannot {operation} while {state}")]
    InvalidTransition {
        id: String,
        operation: &'static str,
        state: crate::types::LifecycleState,
    },

    #[error("dependency '{dependency}' cannot be resolved for module '{module}': {reason}")]
    ResolutionConflict {
        module: String,
        dependency: String,
        reason: String,
    },

    #[error("module '{module}' requires capability '{capability}', which is not provided")]
    CapabilityMissing { module: String, capability: String },

    #[error("failed to load module '{module}': {reason}")]
    LoadFailure { module: String, reason: String },

    #[error("loading module '{0}' was cancelled")]
    Cancelled(String),
}

impl RegistryError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}
