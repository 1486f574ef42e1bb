//! Core type definitions shared across the crate.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::RegistryError;

/// Unique identity of a module, as declared in its manifest.
pub type ModuleId = String;

/// Framework descriptor carried by a manifest.
///
/// Opaque to the runtime; it is only used to group modules in diagnostics and
/// graph exports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FrameworkDescriptor {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub version: String,
}

/// How instances of an external dependency are shared between modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharingStrategy {
    Shared,
    Isolated,
    Auto,
}

impl SharingStrategy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "shared" => Some(Self::Shared),
            "isolated" => Some(Self::Isolated),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::Isolated => "isolated",
            Self::Auto => "auto",
        }
    }
}

impl fmt::Display for SharingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dependency entry as it appears on the wire, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RawDependency {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "versionRange", alias = "version_range")]
    pub version_range: String,
    /// Missing strategy means `auto`.
    #[serde(default)]
    pub strategy: Option<String>,
}

/// Manifest as it appears on the wire, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RawManifest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub entry: String,
    #[serde(default)]
    pub framework: FrameworkDescriptor,
    #[serde(default)]
    pub dependencies: Vec<RawDependency>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// A validated dependency declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencySpec {
    pub name: String,
    pub requirement: semver::VersionReq,
    pub strategy: SharingStrategy,
}

/// A validated module manifest. Immutable once produced by the validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub id: ModuleId,
    pub version: semver::Version,
    pub entry: String,
    pub framework: FrameworkDescriptor,
    pub dependencies: Vec<DependencySpec>,
    pub capabilities: BTreeSet<String>,
}

impl Manifest {
    pub fn dependency(&self, name: &str) -> Option<&DependencySpec> {
        self.dependencies.iter().find(|dep| dep.name == name)
    }
}

/// Lifecycle of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    Pending,
    Loading,
    Ready,
    Failed,
    Unloading,
    Unloaded,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Unloading => "unloading",
            Self::Unloaded => "unloaded",
        };
        f.write_str(name)
    }
}

/// Read-only view of a registry entry returned by `get_status` and `list`.
#[derive(Debug, Clone)]
pub struct ModuleStatus {
    pub id: ModuleId,
    pub version: semver::Version,
    pub entry: String,
    pub state: LifecycleState,
    pub error: Option<RegistryError>,
    /// `(dependency name, bucket id)` for every binding held while loaded.
    pub bindings: Vec<(String, crate::resolver::BucketId)>,
}
