//! Test harness for isolated control-plane tests.
//!
//! The `TestHarness` wires a `ControlPlane` to an in-memory source, an
//! in-memory runtime and a registry, with retry and loop timings shortened
//! so tests run quickly under a paused clock.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use converge::config::RetrySettings;
use converge::sync::SyncRequestOutcome;
use converge::{
    Application, ApplicationSpec, ControlPlane, InMemoryRuntime, InMemorySource, Registry,
    SettingsSpec, SyncEngine, SyncOperation, SyncTrigger,
};
use tokio_util::sync::CancellationToken;

use super::builders::REPO;

pub struct TestHarness {
    pub source: Arc<InMemorySource>,
    pub runtime: Arc<InMemoryRuntime>,
    pub control: ControlPlane,
}

impl TestHarness {
    /// Create a harness backed by an in-memory registry.
    pub fn new() -> Self {
        Self::with_registry(Registry::open_in_memory().expect("Failed to open registry"))
    }

    pub fn with_registry(registry: Registry) -> Self {
        Self::build(Self::settings(), registry)
    }

    pub fn with_settings(settings: SettingsSpec) -> Self {
        Self::build(settings, Registry::open_in_memory().expect("Failed to open registry"))
    }

    pub fn build(settings: SettingsSpec, registry: Registry) -> Self {
        let source = Arc::new(InMemorySource::new());
        let runtime = Arc::new(InMemoryRuntime::new());
        let control = ControlPlane::assemble(
            &settings,
            source.clone(),
            runtime.clone(),
            Arc::new(registry),
        );
        Self {
            source,
            runtime,
            control,
        }
    }

    /// Settings used by every harness: two quick attempts, five second polls.
    pub fn settings() -> SettingsSpec {
        SettingsSpec {
            default_poll_interval: 5,
            max_self_heal_attempts: 2,
            retry: RetrySettings {
                max_attempts: 2,
                base_delay_ms: 1,
                max_delay_ms: 1,
            },
            ..SettingsSpec::default()
        }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        self.control.controller().engine()
    }

    /// Commits `files` to `main` of the shared test repository.
    pub fn commit(&self, files: &[(&str, String)]) -> String {
        self.source
            .commit(REPO, "main", files.iter().map(|(p, c)| (*p, c.as_str())))
    }

    /// Stores an application without starting its reconciliation loop.
    pub fn store(&self, name: &str, spec: ApplicationSpec) -> Application {
        self.engine()
            .registry()
            .register(name, spec)
            .expect("Failed to register application")
    }

    pub fn app(&self, name: &str) -> Application {
        self.control.status(name).expect("Application not found")
    }

    /// Runs a manual sync and expects it to complete.
    pub async fn sync(&self, name: &str) -> SyncOperation {
        self.sync_with(name, SyncTrigger::Manual).await
    }

    pub async fn sync_with(&self, name: &str, trigger: SyncTrigger) -> SyncOperation {
        let outcome = self
            .engine()
            .request_sync(name, trigger, &CancellationToken::new())
            .await
            .expect("Sync request failed");
        match outcome {
            SyncRequestOutcome::Completed(op) => op,
            other => panic!("Expected a completed sync, got {:?}", other),
        }
    }

    /// Polls the application until `check` holds, advancing time between polls.
    pub async fn eventually(&self, name: &str, check: impl Fn(&Application) -> bool) -> Application {
        for _ in 0..300 {
            let current = self.app(name);
            if check(&current) {
                return current;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("Condition not reached, status: {:?}", self.app(name).status);
    }

    pub async fn shutdown(&self) {
        self.control.shutdown(Duration::from_secs(1)).await;
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
