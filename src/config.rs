//! Registry configuration.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::manifest::ValidationPolicy;

/// Host settings for a [`crate::registry::ModuleRegistry`].
///
/// Read from TOML, either as root keys or under a `[registry]` table:
///
/// ```toml
/// [registry]
/// teardown_timeout_ms = 2000
/// event_history = 16
/// singleton_dependencies = ["router"]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Upper bound on a module's teardown hook.
    pub teardown_timeout_ms: u64,
    /// Envelopes kept per topic for replay. Zero disables replay.
    pub event_history: usize,
    /// Dependencies that resolve to exactly one process-wide instance.
    pub singleton_dependencies: Vec<String>,
    /// Extra names, besides the event bus, that manifests may not isolate.
    pub process_singletons: Vec<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            teardown_timeout_ms: 5000,
            event_history: 0,
            singleton_dependencies: Vec::new(),
            process_singletons: Vec::new(),
        }
    }
}

impl RegistryConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config '{}': {e}", path.display()))?;
        Self::from_toml_str(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config '{}': {e}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut table: toml::Table = toml::from_str(content)?;
        let config = match table.remove("registry") {
            Some(toml::Value::Table(registry)) => toml::Value::Table(registry).try_into()?,
            Some(_) => return Err(anyhow::anyhow!("'registry' must be a table")),
            None => toml::Value::Table(table).try_into()?,
        };
        Ok(config)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }

    /// Validation policy implied by this config. Singleton dependencies may
    /// not be isolated either.
    pub fn validation_policy(&self) -> ValidationPolicy {
        ValidationPolicy::new(
            self.process_singletons
                .iter()
                .chain(&self.singleton_dependencies)
                .cloned(),
        )
    }
}

