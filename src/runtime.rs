use anyhow::Result;
use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::container::Scope;

/// Fetches module code by its entry locator.
///
/// The registry calls `fetch` at most once per load attempt. Transport,
/// caching and integrity checks are the implementation's business.
#[async_trait]
pub trait ModuleFetcher: Send + Sync {
    async fn fetch(&self, entry: &str) -> Result<ModuleHandle>;

    /// Whether an in-flight fetch may be aborted. When false, a cancelled
    /// fetch runs to completion and its result is discarded.
    fn supports_cancellation(&self) -> bool {
        false
    }
}

/// Hooks a module may expose. Both default to doing nothing.
#[async_trait]
pub trait ModuleLifecycle: Send + Sync {
    /// Called once the module's scope is ready, before it is marked ready.
    async fn mount(&self, _scope: Arc<Scope>) -> Result<()> {
        Ok(())
    }

    /// Called on unload. Bounded by the registry's teardown timeout.
    async fn teardown(&self) -> Result<()> {
        Ok(())
    }
}

/// A fetched module
#[derive(Clone)]
pub struct ModuleHandle {
    exports: Arc<dyn Any + Send + Sync>,
    lifecycle: Option<Arc<dyn ModuleLifecycle>>,
}

impl ModuleHandle {
    pub fn new<T: Any + Send + Sync>(exports: T) -> Self {
        Self {
            exports: Arc::new(exports),
            lifecycle: None,
        }
    }

    pub fn with_lifecycle(mut self, lifecycle: Arc<dyn ModuleLifecycle>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    /// The module's exports, if they have type `T`.
    pub fn exports<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.exports.downcast_ref::<T>()
    }

    pub fn lifecycle(&self) -> Option<&Arc<dyn ModuleLifecycle>> {
        self.lifecycle.as_ref()
    }

    /// Whether both handles come from the same fetch.
    pub fn same_module(&self, other: &ModuleHandle) -> bool {
        Arc::ptr_eq(&self.exports, &other.exports)
    }
}

impl fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("lifecycle", &self.lifecycle.is_some())
            .finish_non_exhaustive()
    }
}

/// Exports produced by [`FileFetcher`]: the raw bytes behind an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSource {
    pub entry: String,
    pub bytes: Vec<u8>,
}

/// Fetcher that reads entries from the local filesystem.
///
/// Accepts `file://` locators and plain paths. Relative paths are resolved
/// against the base directory when one is set.
#[derive(Debug, Clone, Default)]
pub struct FileFetcher {
    base_dir: Option<PathBuf>,
}

impl FileFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
        }
    }

    fn resolve(&self, entry: &str) -> PathBuf {
        // Handle both file:// and plain paths
        let path = if let Some(path_str) = entry.strip_prefix("file://") {
            PathBuf::from(path_str)
        } else {
            PathBuf::from(entry)
        };
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path,
        }
    }
}

#[async_trait]
impl ModuleFetcher for FileFetcher {
    async fn fetch(&self, entry: &str) -> Result<ModuleHandle> {
        if let Some((scheme, _)) = entry.split_once("://")
            && scheme != "file"
        {
            return Err(anyhow::anyhow!(
                "Unsupported locator scheme '{scheme}' in entry '{entry}'"
            ));
        }
        let path = self.resolve(entry);
        let bytes = std::fs::read(&path)
            .map_err(|e| anyhow::anyhow!("Failed to read '{}': {e}", path.display()))?;
        Ok(ModuleHandle::new(ModuleSource {
            entry: entry.to_string(),
            bytes,
        }))
    }

    // Reads leave nothing behind when aborted.
    fn supports_cancellation(&self) -> bool {
        true
    }
}
