#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use composable_frontends::{
    Diagnostic, DiagnosticsSink, ModuleFetcher, ModuleHandle, ModuleLifecycle, ModuleRegistry,
    RawDependency, RawManifest, RegistryConfig, Scope,
};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::ops::Deref;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::{Builder, NamedTempFile};

pub struct TestFile(NamedTempFile);

impl Deref for TestFile {
    type Target = Path;

    fn deref(&self) -> &Self::Target {
        self.0.path()
    }
}

fn create_test_file(suffix: &str, content: &str) -> TestFile {
    let mut temp_file = Builder::new().suffix(suffix).tempfile().unwrap();
    write!(temp_file, "{}", content).unwrap();
    TestFile(temp_file)
}

pub fn create_toml_test_file(content: &str) -> TestFile {
    create_test_file(".toml", content)
}

pub fn create_json_test_file(content: &str) -> TestFile {
    create_test_file(".json", content)
}

pub fn create_entry_test_file(content: &str) -> TestFile {
    create_test_file(".js", content)
}

/// A minimal valid manifest whose entry is `mem://<id>`.
pub fn manifest(id: &str) -> RawManifest {
    RawManifest {
        id: id.to_string(),
        version: "1.0.0".to_string(),
        entry: format!("mem://{id}"),
        ..Default::default()
    }
}

pub fn with_dependency(
    mut raw: RawManifest,
    name: &str,
    range: &str,
    strategy: Option<&str>,
) -> RawManifest {
    raw.dependencies.push(RawDependency {
        name: name.to_string(),
        version_range: range.to_string(),
        strategy: strategy.map(|s| s.to_string()),
    });
    raw
}

pub fn with_capability(mut raw: RawManifest, capability: &str) -> RawManifest {
    raw.capabilities.push(capability.to_string());
    raw
}

/// Collects every diagnostic for later assertions.
#[derive(Default)]
pub struct RecordingDiagnostics {
    diagnostics: Mutex<Vec<Diagnostic>>,
}

impl RecordingDiagnostics {
    pub fn all(&self) -> Vec<Diagnostic> {
        self.diagnostics.lock().unwrap().clone()
    }

    pub fn handler_faults(&self) -> Vec<Diagnostic> {
        self.all()
            .into_iter()
            .filter(|d| matches!(d, Diagnostic::HandlerFault { .. }))
            .collect()
    }
}

impl DiagnosticsSink for RecordingDiagnostics {
    fn emit(&self, diagnostic: Diagnostic) {
        self.diagnostics.lock().unwrap().push(diagnostic);
    }
}

/// Hooks recorded by [`TestLifecycle`].
#[derive(Default)]
pub struct LifecycleLog {
    pub mounted: AtomicUsize,
    pub torn_down: AtomicUsize,
}

/// Lifecycle hooks with configurable teardown behaviour.
pub struct TestLifecycle {
    pub log: Arc<LifecycleLog>,
    pub subscribe_to: Option<String>,
    pub teardown_delay: Option<Duration>,
    pub teardown_error: Option<String>,
    pub mount_error: Option<String>,
    pub mount_panic: Option<String>,
}

impl TestLifecycle {
    pub fn new(log: Arc<LifecycleLog>) -> Self {
        Self {
            log,
            subscribe_to: None,
            teardown_delay: None,
            teardown_error: None,
            mount_error: None,
            mount_panic: None,
        }
    }
}

#[async_trait]
impl ModuleLifecycle for TestLifecycle {
    async fn mount(&self, scope: Arc<Scope>) -> Result<()> {
        if let Some(message) = &self.mount_panic {
            panic!("{message}");
        }
        if let Some(error) = &self.mount_error {
            return Err(anyhow::anyhow!("{error}"));
        }
        if let Some(topic) = &self.subscribe_to {
            scope.events().subscribe(topic, |_| Ok(()));
        }
        self.log.mounted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        if let Some(delay) = self.teardown_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = &self.teardown_error {
            return Err(anyhow::anyhow!("{error}"));
        }
        self.log.torn_down.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

type LifecycleFactory = Box<dyn Fn(&str) -> Option<Arc<dyn ModuleLifecycle>> + Send + Sync>;

/// In-memory fetcher that counts fetches per entry.
pub struct CountingFetcher {
    calls: Mutex<HashMap<String, usize>>,
    delay: Duration,
    failing: HashSet<String>,
    cancellable: bool,
    lifecycle: Option<LifecycleFactory>,
}

impl CountingFetcher {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
            delay: Duration::ZERO,
            failing: HashSet::new(),
            cancellable: false,
            lifecycle: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self, entry: &str) -> Self {
        self.failing.insert(entry.to_string());
        self
    }

    pub fn cancellable(mut self) -> Self {
        self.cancellable = true;
        self
    }

    pub fn with_lifecycle<F>(mut self, factory: F) -> Self
    where
        F: Fn(&str) -> Option<Arc<dyn ModuleLifecycle>> + Send + Sync + 'static,
    {
        self.lifecycle = Some(Box::new(factory));
        self
    }

    pub fn calls(&self, entry: &str) -> usize {
        self.calls.lock().unwrap().get(entry).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ModuleFetcher for CountingFetcher {
    async fn fetch(&self, entry: &str) -> Result<ModuleHandle> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(entry.to_string())
            .or_default() += 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.contains(entry) {
            return Err(anyhow::anyhow!("network unreachable for {entry}"));
        }
        let mut handle = ModuleHandle::new(entry.to_string());
        if let Some(lifecycle) = self.lifecycle.as_ref().and_then(|f| f(entry)) {
            handle = handle.with_lifecycle(lifecycle);
        }
        Ok(handle)
    }

    fn supports_cancellation(&self) -> bool {
        self.cancellable
    }
}

pub fn build_registry(
    fetcher: Arc<CountingFetcher>,
    diagnostics: Arc<RecordingDiagnostics>,
    config: RegistryConfig,
) -> ModuleRegistry {
    let registry = ModuleRegistry::builder()
        .with_config(config)
        .with_fetcher(fetcher)
        .with_diagnostics(diagnostics)
        .build();
    assert!(
        registry.is_ok(),
        "RegistryBuilder::build failed with: {:?}",
        registry.err()
    );
    registry.unwrap()
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within two seconds"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
