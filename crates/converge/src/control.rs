//! The command surface of the controller.
//!
//! Everything the HTTP API and CLI can do goes through `ControlPlane`.

use std::sync::Arc;
use std::time::Duration;

use crate::application::{validate_application, Application, ApplicationSpec, PolicyOverride};
use crate::config::{RuntimeType, SettingsSpec};
use crate::controller::{Controller, LoopSettings, LoopTrigger};
use crate::error::{ConvergeError, Result};
use crate::events::{EventBroadcaster, EventKind};
use crate::health::HealthEvaluator;
use crate::manifest::ManifestRenderer;
use crate::observer::LiveStateObserver;
use crate::registry::{Registry, RegistryError};
use crate::runtime::{FilesystemRuntime, InMemoryRuntime, TargetRuntime};
use crate::secrets::expand_home;
use crate::source::{GitSource, SourceRepository};
use crate::sync::{SyncEngine, SyncOperation, SyncRequestOutcome, SyncTrigger};
use crate::tracker::RevisionTracker;

pub struct ControlPlane {
    controller: Arc<Controller>,
}

impl ControlPlane {
    pub fn new(controller: Arc<Controller>) -> Self {
        Self { controller }
    }

    /// Wires the git source, the configured runtime and the on-disk registry.
    pub fn from_settings(settings: &SettingsSpec) -> Result<Self> {
        let source: Arc<dyn SourceRepository> = Arc::new(GitSource::from_settings(
            &settings.git,
            settings.operation_timeout(),
        ));
        let runtime: Arc<dyn TargetRuntime> = match settings.runtime.runtime_type {
            RuntimeType::Filesystem => {
                Arc::new(FilesystemRuntime::new(expand_home(&settings.runtime.root)))
            }
            RuntimeType::Memory => Arc::new(InMemoryRuntime::new()),
        };
        let registry = Arc::new(Registry::open(&settings.database_path())?);
        Ok(Self::assemble(settings, source, runtime, registry))
    }

    /// Builds the component graph around the given adapters.
    pub fn assemble(
        settings: &SettingsSpec,
        source: Arc<dyn SourceRepository>,
        runtime: Arc<dyn TargetRuntime>,
        registry: Arc<Registry>,
    ) -> Self {
        let retry = settings.retry_policy();
        let timeout = settings.operation_timeout();
        let engine = SyncEngine::new(
            registry,
            Arc::new(RevisionTracker::new(source.clone(), retry, timeout)),
            Arc::new(ManifestRenderer::new(source)),
            Arc::new(LiveStateObserver::new(
                runtime.clone(),
                settings.cache_max_age(),
                timeout,
            )),
            runtime,
            EventBroadcaster::default(),
        )
        .with_retry(retry)
        .with_timeout(timeout)
        .with_health(HealthEvaluator::new(settings.health_grace_period()));
        Self::new(Controller::new(
            Arc::new(engine),
            LoopSettings::from_settings(settings),
        ))
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    fn engine(&self) -> &Arc<SyncEngine> {
        self.controller.engine()
    }

    pub fn events(&self) -> &EventBroadcaster {
        self.engine().events()
    }

    /// Validates and stores a new application, then starts its loop.
    pub fn register(&self, name: &str, spec: ApplicationSpec) -> Result<Application> {
        validate_application(name, &spec)?;
        let app = self.engine().registry().register(name, spec)?;
        self.controller.spawn_loop(&app);
        self.events().emit(name, EventKind::Registered);
        Ok(app)
    }

    /// Registers `name` or replaces its spec, keeping status. Used when loading config.
    pub async fn apply(&self, name: &str, spec: ApplicationSpec) -> Result<Application> {
        validate_application(name, &spec)?;
        match self.engine().registry().get(name) {
            Ok(existing) if existing.spec == spec => {
                if !self.controller.is_running(name) {
                    self.controller.spawn_loop(&existing);
                }
                Ok(existing)
            }
            Ok(_) => {
                let app = self.engine().registry().update_spec(name, spec).await?;
                log::info!("Updated spec of application {}", name);
                self.controller.spawn_loop(&app);
                Ok(app)
            }
            Err(RegistryError::NotFound(_)) => self.register(name, spec),
            Err(e) => Err(e.into()),
        }
    }

    /// Stops the loop and removes the application.
    ///
    /// Managed resources are deleted only when `prune` is set; otherwise they
    /// are left running, unowned by any loop.
    pub async fn deregister(&self, name: &str, prune: bool) -> Result<Option<SyncOperation>> {
        self.engine().load(name)?;
        self.controller.stop_loop(name).await;

        let pruned = if prune {
            let cancel = self.controller.shutdown_token().child_token();
            Some(self.engine().prune_all(name, &cancel).await?)
        } else {
            None
        };

        self.engine().registry().deregister(name).await.map_err(not_found)?;
        self.engine().forget(name);
        self.events().emit(name, EventKind::Deregistered { pruned: prune });
        Ok(pruned)
    }

    pub fn status(&self, name: &str) -> Result<Application> {
        self.engine().load(name)
    }

    pub fn list(&self) -> Result<Vec<Application>> {
        Ok(self.engine().registry().list()?)
    }

    /// Runs a manual sync to the current head of the application's ref.
    pub async fn trigger_sync(&self, name: &str) -> Result<SyncRequestOutcome> {
        let cancel = self.controller.shutdown_token().child_token();
        self.engine()
            .request_sync(name, SyncTrigger::Manual, &cancel)
            .await
    }

    /// Updates the sync policy and lets the loop act on it right away.
    pub async fn override_policy(&self, name: &str, policy: &PolicyOverride) -> Result<Application> {
        let app = self
            .engine()
            .registry()
            .set_policy(name, policy)
            .await
            .map_err(not_found)?;
        log::info!(
            "Policy of {} set to automated={} prune={} selfHeal={}",
            name,
            app.spec.sync_policy.automated,
            app.spec.sync_policy.prune,
            app.spec.sync_policy.self_heal
        );
        self.controller.trigger(name, LoopTrigger::PolicyChanged);
        Ok(app)
    }

    /// Recent sync operations, newest first. Kept after deregistration.
    pub fn history(&self, name: &str, limit: usize) -> Result<Vec<SyncOperation>> {
        Ok(self.engine().registry().history(name, limit)?)
    }

    /// Wakes every application tracking `repo_url`@`reference`. Returns their names.
    pub fn notify_webhook(&self, repo_url: &str, reference: &str) -> Result<Vec<String>> {
        let applications = self.list()?;
        let matched = self.engine().tracker().notify(
            repo_url,
            reference,
            applications
                .iter()
                .map(|app| (app.name.as_str(), &app.spec.source)),
        );
        for name in &matched {
            self.controller.trigger(name, LoopTrigger::Webhook);
        }
        log::info!(
            "Push to {}@{} woke {} applications",
            repo_url,
            reference,
            matched.len()
        );
        Ok(matched)
    }

    pub async fn shutdown(&self, grace: Duration) {
        self.controller.shutdown(grace).await;
    }
}

fn not_found(e: RegistryError) -> ConvergeError {
    match e {
        RegistryError::NotFound(name) => ConvergeError::ApplicationNotFound(name),
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::{Destination, SourceRef, SyncPolicy};
    use crate::config::RetrySettings;
    use crate::manifest::ResourceKey;
    use crate::source::InMemorySource;

    const REPO: &str = "mem://shop";

    const MANIFEST: &str = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
data:
  mode: live
"#;

    fn setup() -> (Arc<InMemoryRuntime>, ControlPlane) {
        let source = Arc::new(InMemorySource::new());
        source.commit(REPO, "main", [("deploy/app.yaml", MANIFEST)]);
        let runtime = Arc::new(InMemoryRuntime::new());
        let settings = SettingsSpec {
            retry: RetrySettings {
                max_attempts: 1,
                base_delay_ms: 1,
                max_delay_ms: 1,
            },
            ..SettingsSpec::default()
        };
        let control = ControlPlane::assemble(
            &settings,
            source,
            runtime.clone(),
            Arc::new(Registry::open_in_memory().unwrap()),
        );
        (runtime, control)
    }

    fn spec(repo: &str) -> ApplicationSpec {
        ApplicationSpec {
            source: SourceRef::new(repo, "main", "deploy"),
            destination: Destination {
                endpoint: "local".into(),
                namespace: "prod".into(),
            },
            sync_policy: SyncPolicy::default(),
            poll_interval: None,
        }
    }

    #[tokio::test]
    async fn test_register_validates_and_rejects_duplicates() {
        let (_, control) = setup();
        assert!(matches!(
            control.register("Not_Valid", spec(REPO)),
            Err(ConvergeError::InvalidApplication(_))
        ));
        control.register("shop", spec(REPO)).unwrap();
        assert!(matches!(
            control.register("shop", spec(REPO)),
            Err(ConvergeError::Registry(RegistryError::AlreadyExists(_)))
        ));
        assert!(control.controller().is_running("shop"));
        assert_eq!(control.list().unwrap().len(), 1);
        control.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_manual_sync_and_deregister_with_prune() {
        let (runtime, control) = setup();
        control.register("shop", spec(REPO)).unwrap();

        let outcome = control.trigger_sync("shop").await.unwrap();
        assert!(matches!(outcome, SyncRequestOutcome::Completed(_)));
        let key = ResourceKey::new("ConfigMap", Some("prod"), "settings");
        assert!(runtime.get(&key).is_some());

        let pruned = control.deregister("shop", true).await.unwrap().unwrap();
        assert_eq!(pruned.trigger, SyncTrigger::Prune);
        assert!(runtime.get(&key).is_none());
        assert!(!control.controller().is_running("shop"));
        assert!(matches!(control.status("shop"), Err(ConvergeError::ApplicationNotFound(_))));
        assert_eq!(control.history("shop", 10).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_deregister_without_prune_leaves_resources() {
        let (runtime, control) = setup();
        control.register("shop", spec(REPO)).unwrap();
        control.trigger_sync("shop").await.unwrap();
        assert!(control.deregister("shop", false).await.unwrap().is_none());
        assert_eq!(runtime.keys().len(), 1);
        assert!(matches!(
            control.deregister("shop", false).await,
            Err(ConvergeError::ApplicationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_override_policy_and_webhook_matching() {
        let (_, control) = setup();
        control.register("shop", spec(REPO)).unwrap();
        control.register("billing", spec("mem://billing")).unwrap();

        let app = control
            .override_policy(
                "shop",
                &PolicyOverride {
                    automated: Some(true),
                    self_heal: Some(true),
                    prune: None,
                },
            )
            .await
            .unwrap();
        assert!(app.spec.sync_policy.automated);
        assert!(app.spec.sync_policy.self_heal);
        assert!(matches!(
            control.override_policy("ghost", &PolicyOverride::default()).await,
            Err(ConvergeError::ApplicationNotFound(_))
        ));

        assert_eq!(control.notify_webhook(REPO, "main").unwrap(), vec!["shop"]);
        assert!(control.notify_webhook(REPO, "develop").unwrap().is_empty());
        control.shutdown(Duration::from_secs(1)).await;
    }
}
