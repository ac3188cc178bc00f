//! The per-application sync state machine.
//!
//! `Idle → Syncing → {Succeeded, Failed, PartiallyApplied} → Idle`. One run
//! renders the revision, observes live state, diffs and applies the records
//! in order. Failed records never roll back the ones that succeeded.

use chrono::Utc;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::gate::{Admission, SyncGate, SyncRequestOutcome};
use super::operation::{RecordResult, RecordStatus, SyncOperation, SyncOutcome, SyncTrigger};
use super::policy::{retry, RetryError, RetryPolicy};
use crate::application::{Application, SyncPhase};
use crate::diff::{diff, DiffOp, DiffRecord};
use crate::error::{ConvergeError, PolicyViolation, Result, Retryable, RuntimeError};
use crate::events::{EventBroadcaster, EventKind};
use crate::health::{HealthEvaluator, HealthInput, HealthReport};
use crate::manifest::{ManifestRenderer, RenderContext, ResourceDeclaration, ResourceKey};
use crate::observer::{detect_drift, stamp_ownership, LiveSnapshot, LiveStateObserver, ObserveRequest};
use crate::registry::{Registry, RegistryError};
use crate::runtime::{Scope, TargetRuntime};
use crate::source::Revision;
use crate::tracker::{RevisionTracker, TrackedRevision};

/// How often a prune waits for a running sync to release the gate.
const GATE_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct SyncEngine {
    registry: Arc<Registry>,
    tracker: Arc<RevisionTracker>,
    renderer: Arc<ManifestRenderer>,
    observer: Arc<LiveStateObserver>,
    runtime: Arc<dyn TargetRuntime>,
    events: EventBroadcaster,
    health: HealthEvaluator,
    retry: RetryPolicy,
    timeout: Duration,
    gates: DashMap<String, Arc<SyncGate>>,
}

/// What a run produced besides the operation record.
struct RunState {
    desired: Option<Arc<Vec<ResourceDeclaration>>>,
    render_error: Option<String>,
    /// The failure was transient; the revision stays eligible for automatic retry.
    retry_later: bool,
    last_applied: BTreeMap<ResourceKey, String>,
    cancelled: bool,
}

impl SyncEngine {
    pub fn new(
        registry: Arc<Registry>,
        tracker: Arc<RevisionTracker>,
        renderer: Arc<ManifestRenderer>,
        observer: Arc<LiveStateObserver>,
        runtime: Arc<dyn TargetRuntime>,
        events: EventBroadcaster,
    ) -> Self {
        Self {
            registry,
            tracker,
            renderer,
            observer,
            runtime,
            events,
            health: HealthEvaluator::new(Duration::from_secs(120)),
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(30),
            gates: DashMap::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Timeout for each runtime call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_health(mut self, health: HealthEvaluator) -> Self {
        self.health = health;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn tracker(&self) -> &Arc<RevisionTracker> {
        &self.tracker
    }

    pub fn observer(&self) -> &Arc<LiveStateObserver> {
        &self.observer
    }

    pub fn events(&self) -> &EventBroadcaster {
        &self.events
    }

    /// Revision of the sync currently running for `name`, if any.
    pub fn in_flight(&self, name: &str) -> Option<Revision> {
        self.gates.get(name).and_then(|g| g.in_flight())
    }

    /// Drops per-application state after deregistration.
    pub fn forget(&self, name: &str) {
        self.gates.remove(name);
        self.observer.forget(name);
        self.tracker.forget(name);
    }

    /// Resolves the application's ref and syncs to the resulting revision.
    pub async fn request_sync(
        &self,
        name: &str,
        trigger: SyncTrigger,
        cancel: &CancellationToken,
    ) -> Result<SyncRequestOutcome> {
        let app = self.load(name)?;
        check_trigger(&app, trigger)?;
        let tracked = self.resolve(&app, cancel).await?;
        self.sync_revision(name, tracked.revision, trigger, cancel).await
    }

    /// Resolves the application's ref, recording a failure in its status.
    pub async fn resolve(&self, app: &Application, cancel: &CancellationToken) -> Result<TrackedRevision> {
        match self.tracker.resolve(&app.name, &app.spec.source, cancel).await {
            Ok(tracked) => Ok(tracked),
            Err(e) => {
                log::warn!("Cannot resolve source for {}: {}", app.name, e);
                let message = e.to_string();
                self.registry
                    .update_status(&app.name, |s| s.last_error = Some(message))
                    .await?;
                Err(e.into())
            }
        }
    }

    /// Syncs `name` to an already resolved revision.
    pub async fn sync_revision(
        &self,
        name: &str,
        revision: Revision,
        trigger: SyncTrigger,
        cancel: &CancellationToken,
    ) -> Result<SyncRequestOutcome> {
        let gate = self.gate(name);
        let mut permit = match gate.try_enter(&revision, trigger) {
            Admission::Entered(permit) => permit,
            Admission::Coalesced => {
                log::info!(
                    "Sync of {} to {} already in flight, coalescing",
                    name,
                    revision.short_id()
                );
                return Ok(SyncRequestOutcome::Coalesced {
                    revision: revision.id,
                });
            }
            Admission::Queued => {
                log::info!(
                    "Sync of {} busy, queued {} as follow-up",
                    name,
                    revision.short_id()
                );
                return Ok(SyncRequestOutcome::Queued {
                    revision: revision.id,
                });
            }
        };

        let first = self.run(name, &revision, trigger, cancel).await;
        if let Err(e) = &first {
            log::error!("Sync of {} to {} failed: {}", name, revision.short_id(), e);
        }

        // Queued callers were promised a run, even when this one failed.
        while let Some((next, next_trigger)) = permit.next_follow_up() {
            if cancel.is_cancelled() {
                log::warn!(
                    "Dropping queued sync of {} to {}: cancelled",
                    name,
                    next.short_id()
                );
                break;
            }
            if let Err(e) = self.run(name, &next, next_trigger, cancel).await {
                log::error!("Follow-up sync of {} to {} failed: {}", name, next.short_id(), e);
            }
        }
        first.map(SyncRequestOutcome::Completed)
    }

    async fn run(
        &self,
        name: &str,
        revision: &Revision,
        trigger: SyncTrigger,
        cancel: &CancellationToken,
    ) -> Result<SyncOperation> {
        let span = tracing::info_span!(
            "sync",
            app = %name,
            revision = %revision.short_id(),
            trigger = %trigger
        );
        self.run_inner(name, revision, trigger, cancel)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        name: &str,
        revision: &Revision,
        trigger: SyncTrigger,
        cancel: &CancellationToken,
    ) -> Result<SyncOperation> {
        let app = self.load(name)?;
        let scope = app.scope();
        let mut operation = SyncOperation::start(name, &revision.id, trigger);
        log::info!(
            "Starting {} sync of {} to {}",
            trigger,
            name,
            revision.short_id()
        );

        self.registry
            .update_status(name, |s| s.phase = SyncPhase::Syncing)
            .await?;
        self.events.emit(
            name,
            EventKind::SyncStarted {
                operation_id: operation.id.clone(),
                revision: revision.id.clone(),
                trigger,
            },
        );

        let mut state = RunState {
            desired: None,
            render_error: None,
            retry_later: false,
            last_applied: app.status.last_applied.clone(),
            cancelled: false,
        };

        let context = RenderContext::new(name, &scope.namespace);
        match self.renderer.render(&app.spec.source, revision, &context).await {
            Ok(desired) => state.desired = Some(desired),
            Err(e) => {
                log::error!("Render of {} at {} failed: {}", name, revision.short_id(), e);
                state.retry_later = matches!(&e, crate::error::RenderError::Source(s) if s.is_retryable());
                state.render_error = Some(e.to_string());
                operation.error = Some(format!("render failed: {}", e));
            }
        }

        if let Some(desired) = state.desired.clone() {
            let request = observe_request(&app, desired.iter().map(ResourceDeclaration::key));
            match self.observer.observe(&request, true).await {
                Ok(snapshot) => {
                    self.apply_diff(&app, &scope, &desired, &snapshot, &mut operation, &mut state, cancel)
                        .await;
                }
                Err(e) => {
                    log::error!("Observing live state of {} failed: {}", name, e);
                    state.retry_later = true;
                    operation.error = Some(format!("observe failed: {}", e));
                }
            }
        }

        self.finish(app, revision, operation, state).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_diff(
        &self,
        app: &Application,
        scope: &Scope,
        desired: &[ResourceDeclaration],
        snapshot: &LiveSnapshot,
        operation: &mut SyncOperation,
        state: &mut RunState,
        cancel: &CancellationToken,
    ) {
        let name = app.name.as_str();
        let report = diff(desired, &snapshot.observations, name);
        for key in &report.out_of_scope {
            operation
                .warnings
                .push(format!("{} is in scope but not managed by {}", key, name));
        }
        log::info!(
            "Diff for {}: {} create, {} update, {} delete, {} unchanged",
            name,
            report.count(DiffOp::Create),
            report.count(DiffOp::Update),
            report.count(DiffOp::Delete),
            report.count(DiffOp::NoOp)
        );

        for record in &report.records {
            if record.op == DiffOp::NoOp {
                if let Some(fingerprint) = &record.fingerprint {
                    state.last_applied.insert(record.key.clone(), fingerprint.clone());
                }
                operation.records.push(result(record, RecordStatus::NoOp, 0, None));
                continue;
            }
            if state.cancelled || cancel.is_cancelled() {
                state.cancelled = true;
                operation
                    .records
                    .push(result(record, RecordStatus::Skipped, 0, Some("cancelled".into())));
                continue;
            }
            if record.op == DiffOp::Delete && !app.policy().prune {
                let violation = PolicyViolation::PruneNotAllowed {
                    key: record.key.clone(),
                };
                log::warn!("{}", violation);
                operation.warnings.push(violation.to_string());
                operation.records.push(result(
                    record,
                    RecordStatus::Skipped,
                    0,
                    Some("prune disabled".into()),
                ));
                continue;
            }

            let (outcome, attempts) = self.execute(name, scope, record, cancel).await;
            let recorded = match outcome {
                Ok(()) => {
                    match (&record.op, &record.fingerprint) {
                        (DiffOp::Delete, _) => {
                            state.last_applied.remove(&record.key);
                        }
                        (_, Some(fingerprint)) => {
                            state.last_applied.insert(record.key.clone(), fingerprint.clone());
                        }
                        _ => {}
                    }
                    result(record, RecordStatus::Succeeded, attempts, None)
                }
                Err(RetryError::Cancelled) => {
                    state.cancelled = true;
                    result(record, RecordStatus::Skipped, attempts, Some("cancelled".into()))
                }
                Err(RetryError::Exhausted { error, attempts }) => {
                    log::error!("{} {} failed after {} attempts: {}", record.op, record.key, attempts, error);
                    result(record, RecordStatus::Failed, attempts, Some(error.to_string()))
                }
            };
            operation.records.push(recorded);
        }
    }

    /// Applies or deletes one record with timeout and retry.
    async fn execute(
        &self,
        name: &str,
        scope: &Scope,
        record: &DiffRecord,
        cancel: &CancellationToken,
    ) -> (std::result::Result<(), RetryError<RuntimeError>>, u32) {
        let label = format!("{} {}", record.op, record.key);
        let timeout = self.timeout;
        let mut attempts = 0;

        let outcome = match (&record.op, &record.desired) {
            (DiffOp::Delete, _) => {
                let result = retry(&self.retry, cancel, &label, |n| {
                    attempts = n;
                    let runtime = self.runtime.clone();
                    let scope = scope.clone();
                    let key = record.key.clone();
                    async move { with_timeout(timeout, async { runtime.delete(&scope, &key).await }).await }
                })
                .await;
                match result {
                    Err(RetryError::Exhausted {
                        error: RuntimeError::NotFound { .. },
                        ..
                    }) => Ok(()),
                    other => other,
                }
            }
            (_, Some(declaration)) => {
                let stamped = stamp_ownership(declaration, name);
                retry(&self.retry, cancel, &label, |n| {
                    attempts = n;
                    let runtime = self.runtime.clone();
                    let scope = scope.clone();
                    let stamped = stamped.clone();
                    async move { with_timeout(timeout, async { runtime.apply(&scope, &stamped).await }).await }
                })
                .await
            }
            (_, None) => Err(RetryError::Exhausted {
                error: RuntimeError::Io(format!("no declaration for {}", record.key)),
                attempts: 0,
            }),
        };
        (outcome, attempts)
    }

    async fn finish(
        &self,
        app: Application,
        revision: &Revision,
        mut operation: SyncOperation,
        state: RunState,
    ) -> Result<SyncOperation> {
        let name = app.name.clone();
        let outcome = operation.finish(state.cancelled);
        let advances = operation.advances_revision();

        let desired_keys: Vec<ResourceKey> = match &state.desired {
            Some(desired) => desired.iter().map(ResourceDeclaration::key).collect(),
            None => app.status.desired.clone(),
        };
        let error = operation.error.clone().or_else(|| {
            operation
                .records
                .iter()
                .find(|r| r.status == RecordStatus::Failed)
                .map(|r| format!("{}: {}", r.key, r.message.as_deref().unwrap_or("failed")))
        });

        let now = Utc::now();
        let snapshot = match &state.desired {
            Some(_) => {
                let request = observe_request(&app, desired_keys.iter().cloned());
                self.observer.observe(&request, true).await.ok()
            }
            None => None,
        };
        let report = self.health.evaluate(&HealthInput {
            desired: &desired_keys,
            snapshot: snapshot.as_deref(),
            last_outcome: Some(outcome),
            render_error: state.render_error.as_deref(),
            last_error: error.as_deref(),
            sync_in_flight: false,
            last_sync_time: Some(now),
            now,
        });

        let previous_health = app.status.health;
        let revision_id = revision.id.clone();
        let updated = self
            .registry
            .update_status(&name, |s| {
                s.phase = SyncPhase::Idle;
                s.last_outcome = Some(outcome);
                if !state.retry_later {
                    s.last_attempted_revision = Some(revision_id.clone());
                }
                if advances {
                    s.last_synced_revision = Some(revision_id.clone());
                }
                s.last_sync_time = Some(now);
                s.last_error = error.clone();
                s.last_applied = state.last_applied;
                s.desired = desired_keys.clone();
                s.health = report.status;
                s.health_message = report.message.clone();
                if matches!(operation.trigger, SyncTrigger::Manual | SyncTrigger::NewRevision) {
                    s.self_heal_attempts = 0;
                    s.alert = None;
                }
            })
            .await;

        if let Err(e) = self.registry.append_history(&operation) {
            log::error!("Failed to record sync history for {}: {}", name, e);
        }
        updated?;

        self.events.emit(
            &name,
            EventKind::SyncFinished {
                operation_id: operation.id.clone(),
                revision: revision.id.clone(),
                outcome,
            },
        );
        if previous_health != report.status {
            self.events.emit(
                &name,
                EventKind::HealthChanged {
                    from: previous_health,
                    to: report.status,
                },
            );
        }

        match outcome {
            SyncOutcome::Succeeded => log::info!(
                "Sync of {} to {} succeeded ({} records)",
                name,
                revision.short_id(),
                operation.records.len()
            ),
            _ => log::warn!(
                "Sync of {} to {} ended {}: {}",
                name,
                revision.short_id(),
                outcome,
                error.as_deref().unwrap_or("no error recorded")
            ),
        }
        Ok(operation)
    }

    /// Deletes every live resource owned by `name`, regardless of policy.
    ///
    /// Waits for a running sync to finish first.
    pub async fn prune_all(&self, name: &str, cancel: &CancellationToken) -> Result<SyncOperation> {
        let app = self.load(name)?;
        let revision = Revision::new(
            app.status
                .last_synced_revision
                .clone()
                .unwrap_or_else(|| "none".to_string()),
            app.spec.source.path.clone(),
        );

        let gate = self.gate(name);
        let _permit = loop {
            if let Some(permit) = gate.try_acquire(&revision) {
                break permit;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(RuntimeError::Cancelled.into()),
                _ = tokio::time::sleep(GATE_POLL_INTERVAL) => {}
            }
        };

        let scope = app.scope();
        let mut operation = SyncOperation::start(name, &revision.id, SyncTrigger::Prune);
        let request = observe_request(&app, app.status.desired.iter().cloned());
        let snapshot = self.observer.observe(&request, true).await?;
        let report = diff(&[], &snapshot.observations, name);

        let mut cancelled = false;
        for record in report.records.iter().filter(|r| r.op == DiffOp::Delete) {
            if cancelled || cancel.is_cancelled() {
                cancelled = true;
                operation
                    .records
                    .push(result(record, RecordStatus::Skipped, 0, Some("cancelled".into())));
                continue;
            }
            let (outcome, attempts) = self.execute(name, &scope, record, cancel).await;
            operation.records.push(match outcome {
                Ok(()) => result(record, RecordStatus::Succeeded, attempts, None),
                Err(RetryError::Cancelled) => {
                    cancelled = true;
                    result(record, RecordStatus::Skipped, attempts, Some("cancelled".into()))
                }
                Err(RetryError::Exhausted { error, attempts }) => {
                    result(record, RecordStatus::Failed, attempts, Some(error.to_string()))
                }
            });
        }

        let outcome = operation.finish(cancelled);
        log::info!(
            "Pruned {} resources of {} ({})",
            operation.count(RecordStatus::Succeeded),
            name,
            outcome
        );
        if let Err(e) = self.registry.append_history(&operation) {
            log::error!("Failed to record prune history for {}: {}", name, e);
        }
        Ok(operation)
    }

    /// Re-evaluates health from live state and records it if it changed.
    pub async fn refresh_health(&self, name: &str, force: bool) -> Result<HealthReport> {
        let app = self.load(name)?;
        let request = observe_request(&app, app.status.desired.iter().cloned());
        let snapshot = match self.observer.observe(&request, force).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                log::warn!("Observing {} for health failed: {}", name, e);
                None
            }
        };
        let report = self.health.evaluate(&HealthInput {
            desired: &app.status.desired,
            snapshot: snapshot.as_deref(),
            last_outcome: app.status.last_outcome,
            render_error: None,
            last_error: app.status.last_error.as_deref(),
            sync_in_flight: self.in_flight(name).is_some(),
            last_sync_time: app.status.last_sync_time,
            now: Utc::now(),
        });

        let previous = app.status.health;
        if previous != report.status || app.status.health_message != report.message {
            let (status, message) = (report.status, report.message.clone());
            self.registry
                .update_status(name, |s| {
                    s.health = status;
                    s.health_message = message;
                })
                .await?;
            if previous != report.status {
                log::info!("Health of {} changed: {} -> {}", name, previous, report.status);
                self.events.emit(
                    name,
                    EventKind::HealthChanged {
                        from: previous,
                        to: report.status,
                    },
                );
            }
        }
        Ok(report)
    }

    /// Keys whose live state drifted from what was last applied.
    pub async fn check_drift(&self, name: &str, force: bool) -> Result<Vec<ResourceKey>> {
        let app = self.load(name)?;
        if app.status.last_applied.is_empty() {
            return Ok(Vec::new());
        }
        let request = observe_request(&app, app.status.desired.iter().cloned());
        let snapshot = self.observer.observe(&request, force).await?;
        let drifted = detect_drift(&snapshot, &app.status.last_applied);
        if !drifted.is_empty() {
            log::info!("Drift detected for {}: {} resources", name, drifted.len());
            self.events.emit(
                name,
                EventKind::DriftDetected {
                    resources: drifted.clone(),
                },
            );
        }
        Ok(drifted)
    }

    fn gate(&self, name: &str) -> Arc<SyncGate> {
        self.gates
            .entry(name.to_string())
            .or_insert_with(SyncGate::new)
            .clone()
    }

    /// The registered application, or `ApplicationNotFound`.
    pub fn load(&self, name: &str) -> Result<Application> {
        self.registry.get(name).map_err(|e| match e {
            RegistryError::NotFound(name) => ConvergeError::ApplicationNotFound(name),
            other => other.into(),
        })
    }
}

/// Automatic triggers need the policy to allow them.
fn check_trigger(app: &Application, trigger: SyncTrigger) -> Result<()> {
    let policy = app.policy();
    let allowed = match trigger {
        SyncTrigger::Manual | SyncTrigger::Prune => true,
        SyncTrigger::NewRevision => policy.automated,
        SyncTrigger::SelfHeal => policy.automated && policy.self_heal,
    };
    if allowed {
        Ok(())
    } else {
        Err(PolicyViolation::AutomationDisabled {
            application: app.name.clone(),
        }
        .into())
    }
}

fn observe_request(app: &Application, desired: impl Iterator<Item = ResourceKey>) -> ObserveRequest {
    let mut interest: BTreeSet<ResourceKey> = desired.collect();
    interest.extend(app.status.last_applied.keys().cloned());
    ObserveRequest {
        application: app.name.clone(),
        scope: app.scope(),
        kinds: interest.iter().map(|k| k.kind.clone()).collect(),
        interest,
    }
}

fn result(record: &DiffRecord, status: RecordStatus, attempts: u32, message: Option<String>) -> RecordResult {
    RecordResult {
        key: record.key.clone(),
        op: record.op,
        status,
        attempts,
        message,
    }
}

async fn with_timeout<F>(timeout: Duration, call: F) -> std::result::Result<(), RuntimeError>
where
    F: Future<Output = std::result::Result<(), RuntimeError>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| RuntimeError::Timeout(timeout.as_millis() as u64))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::{ApplicationSpec, Destination, PolicyOverride, SourceRef, SyncPolicy};
    use crate::events::ControllerEvent;
    use crate::health::HealthStatus;
    use crate::runtime::memory::{FailureMode, InMemoryRuntime};
    use crate::source::InMemorySource;
    use serde_json::json;

    const REPO: &str = "mem://shop";

    const MANIFESTS: &str = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
data:
  mode: live
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  replicas: 2
"#;

    const CONFIG_ONLY: &str = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
data:
  mode: live
"#;

    struct Harness {
        source: Arc<InMemorySource>,
        runtime: Arc<InMemoryRuntime>,
        engine: SyncEngine,
    }

    fn harness(policy: SyncPolicy) -> Harness {
        let source = Arc::new(InMemorySource::new());
        source.commit(REPO, "main", [("deploy/app.yaml", MANIFESTS)]);
        let runtime = Arc::new(InMemoryRuntime::new());
        let registry = Arc::new(Registry::open_in_memory().unwrap());
        registry
            .register(
                "shop",
                ApplicationSpec {
                    source: SourceRef::new(REPO, "main", "deploy"),
                    destination: Destination {
                        endpoint: "local".into(),
                        namespace: "prod".into(),
                    },
                    sync_policy: policy,
                    poll_interval: None,
                },
            )
            .unwrap();

        let retry = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };
        let tracker = Arc::new(RevisionTracker::new(source.clone(), retry, Duration::from_secs(5)));
        let renderer = Arc::new(ManifestRenderer::new(source.clone()));
        let observer = Arc::new(LiveStateObserver::new(
            runtime.clone(),
            Duration::from_secs(30),
            Duration::from_secs(5),
        ));
        let engine = SyncEngine::new(
            registry,
            tracker,
            renderer,
            observer,
            runtime.clone(),
            EventBroadcaster::default(),
        )
        .with_retry(retry);
        Harness {
            source,
            runtime,
            engine,
        }
    }

    async fn sync(h: &Harness, trigger: SyncTrigger) -> SyncOperation {
        match h
            .engine
            .request_sync("shop", trigger, &CancellationToken::new())
            .await
            .unwrap()
        {
            SyncRequestOutcome::Completed(op) => op,
            other => panic!("expected a completed sync, got {:?}", other),
        }
    }

    fn deployment() -> ResourceKey {
        ResourceKey::new("Deployment", Some("prod"), "web")
    }

    fn config_map() -> ResourceKey {
        ResourceKey::new("ConfigMap", Some("prod"), "settings")
    }

    #[tokio::test]
    async fn test_sync_applies_then_is_idempotent() {
        let h = harness(SyncPolicy::default());
        let op = sync(&h, SyncTrigger::Manual).await;
        assert_eq!(op.outcome, Some(SyncOutcome::Succeeded));
        assert_eq!(op.count(RecordStatus::Succeeded), 2);
        assert_eq!(h.runtime.apply_log(), vec![config_map(), deployment()]);

        let live = h.runtime.get(&deployment()).unwrap();
        assert_eq!(live.owner(), Some("shop"));

        let app = h.engine.registry().get("shop").unwrap();
        assert_eq!(app.status.last_synced_revision.as_deref(), Some(op.revision.as_str()));
        assert_eq!(app.status.health, HealthStatus::Healthy);
        assert_eq!(app.status.phase, SyncPhase::Idle);
        assert_eq!(app.status.last_applied.len(), 2);

        let again = sync(&h, SyncTrigger::Manual).await;
        assert_eq!(again.outcome, Some(SyncOutcome::Succeeded));
        assert_eq!(again.count(RecordStatus::NoOp), 2);
        assert_eq!(h.runtime.apply_calls(), 2);
        assert_eq!(h.engine.registry().history("shop", 10).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_automatic_trigger_requires_automation() {
        let h = harness(SyncPolicy::default());
        let err = h
            .engine
            .request_sync("shop", SyncTrigger::NewRevision, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConvergeError::Policy(PolicyViolation::AutomationDisabled { .. })
        ));
        assert_eq!(h.runtime.apply_calls(), 0);

        let missing = h
            .engine
            .request_sync("ghost", SyncTrigger::Manual, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(missing, ConvergeError::ApplicationNotFound(_)));
    }

    #[tokio::test]
    async fn test_prune_gated_by_policy() {
        let h = harness(SyncPolicy::default());
        sync(&h, SyncTrigger::Manual).await;
        h.source.commit(REPO, "main", [("deploy/app.yaml", CONFIG_ONLY)]);

        let op = sync(&h, SyncTrigger::Manual).await;
        assert_eq!(op.outcome, Some(SyncOutcome::Succeeded));
        assert_eq!(op.count(RecordStatus::Skipped), 1);
        assert!(op.warnings.iter().any(|w| w.contains("Deployment/prod/web")));
        assert!(h.runtime.get(&deployment()).is_some());
        assert_eq!(h.runtime.delete_calls(), 0);

        h.engine
            .registry()
            .set_policy(
                "shop",
                &PolicyOverride {
                    prune: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let op = sync(&h, SyncTrigger::Manual).await;
        assert_eq!(op.outcome, Some(SyncOutcome::Succeeded));
        assert!(h.runtime.get(&deployment()).is_none());
        let app = h.engine.registry().get("shop").unwrap();
        assert!(!app.status.last_applied.contains_key(&deployment()));
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_successes() {
        let h = harness(SyncPolicy::default());
        h.runtime.fail(
            deployment(),
            FailureMode::Always(RuntimeError::Forbidden {
                key: deployment(),
                message: "quota exceeded".into(),
            }),
        );

        let op = sync(&h, SyncTrigger::Manual).await;
        assert_eq!(op.outcome, Some(SyncOutcome::PartiallyApplied));
        assert_eq!(op.count(RecordStatus::Failed), 1);
        assert!(h.runtime.get(&config_map()).is_some());

        let app = h.engine.registry().get("shop").unwrap();
        assert_eq!(app.status.health, HealthStatus::Degraded);
        assert!(app.status.last_synced_revision.is_none());
        assert_eq!(app.status.last_attempted_revision.as_deref(), Some(op.revision.as_str()));
        assert!(app.status.last_error.unwrap().contains("quota exceeded"));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_running_apply() {
        let h = harness(SyncPolicy::default());
        h.runtime.set_apply_delay(Duration::from_secs(20));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let op = match h
            .engine
            .request_sync("shop", SyncTrigger::Manual, &cancel)
            .await
            .unwrap()
        {
            SyncRequestOutcome::Completed(op) => op,
            other => panic!("expected a completed sync, got {:?}", other),
        };
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(op.outcome, Some(SyncOutcome::Failed));
        assert_eq!(op.count(RecordStatus::Skipped), 2);
        assert_eq!(h.runtime.apply_calls(), 1);
        assert!(h.runtime.get(&config_map()).is_none());

        let app = h.engine.registry().get("shop").unwrap();
        assert!(app.status.last_synced_revision.is_none());
        assert_eq!(app.status.phase, SyncPhase::Idle);
    }

    #[tokio::test]
    async fn test_failed_sync_still_releases_queued_follow_up() {
        use crate::source::SourceRepository;

        let h = harness(SyncPolicy::default());
        let source = SourceRef::new(REPO, "main", "deploy");
        let first = h.source.resolve_ref(&source).await.unwrap();
        h.source.commit(REPO, "main", [("deploy/app.yaml", CONFIG_ONLY)]);
        let second = h.source.resolve_ref(&source).await.unwrap();
        let spec = h.engine.registry().get("shop").unwrap().spec;
        h.runtime.set_apply_delay(Duration::from_millis(200));

        let cancel = CancellationToken::new();
        let (result, _) = tokio::join!(
            h.engine
                .sync_revision("shop", first, SyncTrigger::Manual, &cancel),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let queued = h
                    .engine
                    .sync_revision("shop", second.clone(), SyncTrigger::Manual, &cancel)
                    .await
                    .unwrap();
                assert!(matches!(queued, SyncRequestOutcome::Queued { .. }));
                h.engine.registry().deregister("shop").await.unwrap();
            }
        );

        // The record vanished mid-run, so the final status write fails.
        assert!(matches!(
            result,
            Err(ConvergeError::Registry(RegistryError::NotFound(_)))
        ));
        assert!(h.engine.in_flight("shop").is_none());
        assert_eq!(h.engine.registry().history("shop", 10).unwrap().len(), 1);

        h.runtime.set_apply_delay(Duration::ZERO);
        h.engine.registry().register("shop", spec).unwrap();
        let op = sync(&h, SyncTrigger::Manual).await;
        assert_eq!(op.revision, second.id);
    }

    #[tokio::test]
    async fn test_transient_apply_failure_is_retried() {
        let h = harness(SyncPolicy::default());
        h.runtime.fail(
            deployment(),
            FailureMode::Times(1, RuntimeError::Unavailable("blip".into())),
        );
        let op = sync(&h, SyncTrigger::Manual).await;
        assert_eq!(op.outcome, Some(SyncOutcome::Succeeded));
        let record = op.records.iter().find(|r| r.key == deployment()).unwrap();
        assert_eq!(record.attempts, 2);
    }

    #[tokio::test]
    async fn test_render_error_degrades_without_applying() {
        let h = harness(SyncPolicy::default());
        h.source.commit(REPO, "main", [("deploy/app.yaml", "not: [valid")]);
        let op = sync(&h, SyncTrigger::Manual).await;
        assert_eq!(op.outcome, Some(SyncOutcome::Failed));
        assert!(op.records.is_empty());
        assert_eq!(h.runtime.apply_calls(), 0);

        let app = h.engine.registry().get("shop").unwrap();
        assert_eq!(app.status.health, HealthStatus::Degraded);
        assert!(app.status.health_message.unwrap().starts_with("render failed"));
    }

    #[tokio::test]
    async fn test_drift_detection_and_prune_all() {
        let h = harness(SyncPolicy::default());
        let mut events = h.engine.events().subscribe();
        sync(&h, SyncTrigger::Manual).await;
        let first: ControllerEvent = events.try_recv().unwrap();
        assert!(matches!(first.kind, EventKind::SyncStarted { .. }));

        assert!(h.engine.check_drift("shop", true).await.unwrap().is_empty());
        h.runtime.edit(&config_map(), |object| {
            object.content.insert("data".into(), json!({ "mode": "hacked" }));
        });
        assert_eq!(h.engine.check_drift("shop", true).await.unwrap(), vec![config_map()]);

        let op = h.engine.prune_all("shop", &CancellationToken::new()).await.unwrap();
        assert_eq!(op.trigger, SyncTrigger::Prune);
        assert_eq!(op.count(RecordStatus::Succeeded), 2);
        assert!(h.runtime.keys().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_health_follows_rollout() {
        let h = harness(SyncPolicy::default());
        h.runtime.set_ready_on_apply(false);
        sync(&h, SyncTrigger::Manual).await;
        let app = h.engine.registry().get("shop").unwrap();
        assert_eq!(app.status.health, HealthStatus::Progressing);

        h.runtime.advance_rollouts();
        let report = h.engine.refresh_health("shop", true).await.unwrap();
        assert_eq!(report.status, HealthStatus::Healthy);
        let app = h.engine.registry().get("shop").unwrap();
        assert_eq!(app.status.health, HealthStatus::Healthy);
    }
}
