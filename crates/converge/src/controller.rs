//! Per-application reconcile loops.
//!
//! Every registered application gets one task that wakes on its poll
//! interval, on push notifications, on policy changes and on watch events,
//! and decides whether a sync, a health refresh or a self-heal is due.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::application::Application;
use crate::config::SettingsSpec;
use crate::error::Result;
use crate::events::EventKind;
use crate::health::HealthStatus;
use crate::runtime::{WatchEvent, WatchSubscription};
use crate::source::Revision;
use crate::sync::{SyncEngine, SyncTrigger};

const TRIGGER_CHANNEL_CAPACITY: usize = 16;

/// Why a reconcile loop woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopTrigger {
    Poll,
    Webhook,
    Drift,
    PolicyChanged,
}

impl std::fmt::Display for LoopTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LoopTrigger::Poll => "poll",
            LoopTrigger::Webhook => "webhook",
            LoopTrigger::Drift => "drift",
            LoopTrigger::PolicyChanged => "policy change",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSettings {
    /// Poll interval for applications without their own.
    pub default_poll_interval: Duration,
    /// Automatic re-syncs allowed before an alert is raised instead.
    pub max_self_heal_attempts: u32,
    /// Quiet period after a watch event before drift is checked.
    pub drift_debounce: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            default_poll_interval: Duration::from_secs(180),
            max_self_heal_attempts: 3,
            drift_debounce: Duration::from_millis(500),
        }
    }
}

impl LoopSettings {
    pub fn from_settings(settings: &SettingsSpec) -> Self {
        Self {
            default_poll_interval: settings.poll_interval(),
            max_self_heal_attempts: settings.max_self_heal_attempts,
            ..Self::default()
        }
    }
}

struct LoopHandle {
    triggers: mpsc::Sender<LoopTrigger>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct Controller {
    engine: Arc<SyncEngine>,
    settings: LoopSettings,
    loops: Mutex<HashMap<String, LoopHandle>>,
    shutdown: CancellationToken,
}

impl Controller {
    pub fn new(engine: Arc<SyncEngine>, settings: LoopSettings) -> Arc<Self> {
        Arc::new(Self {
            engine,
            settings,
            loops: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Token cancelled when the controller shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Starts a loop for every registered application. Returns how many were started.
    pub fn start(&self) -> Result<usize> {
        let applications = self.engine.registry().list()?;
        for app in &applications {
            self.spawn_loop(app);
        }
        log::info!("Started {} reconcile loops", applications.len());
        Ok(applications.len())
    }

    /// Starts the loop for `app`, replacing a running one.
    pub fn spawn_loop(&self, app: &Application) {
        if let Some(synced) = &app.status.last_synced_revision {
            self.engine.tracker().remember(
                &app.name,
                Revision::new(synced.clone(), app.spec.source.path.clone()),
            );
        }

        let (tx, rx) = mpsc::channel(TRIGGER_CHANNEL_CAPACITY);
        let cancel = self.shutdown.child_token();
        let poll_interval = app
            .spec
            .poll_interval
            .map(Duration::from_secs)
            .unwrap_or(self.settings.default_poll_interval);

        let reconcile_loop = ReconcileLoop {
            name: app.name.clone(),
            engine: self.engine.clone(),
            settings: self.settings,
            poll_interval,
            triggers: rx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(reconcile_loop.run());

        let previous = self.loops().insert(
            app.name.clone(),
            LoopHandle {
                triggers: tx,
                cancel,
                task,
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        log::debug!("Reconcile loop for {} started ({:?} poll)", app.name, poll_interval);
    }

    /// Stops the loop for `name` and waits for it to exit.
    pub async fn stop_loop(&self, name: &str) -> bool {
        let handle = self.loops().remove(name);
        match handle {
            Some(handle) => {
                handle.cancel.cancel();
                if let Err(e) = handle.task.await {
                    log::error!("Reconcile loop for {} panicked: {}", name, e);
                }
                true
            }
            None => false,
        }
    }

    /// Wakes the loop for `name`. Returns false if no loop is running.
    ///
    /// A full trigger queue drops the request; the queued wake-ups cover it.
    pub fn trigger(&self, name: &str, trigger: LoopTrigger) -> bool {
        match self.loops().get(name) {
            Some(handle) => {
                if handle.triggers.try_send(trigger).is_err() {
                    log::debug!("Trigger queue for {} full, dropping {}", name, trigger);
                }
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.loops().contains_key(name)
    }

    /// Cancels every loop and waits up to `grace` for them to finish.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();
        let handles: Vec<(String, LoopHandle)> = self.loops().drain().collect();
        log::info!("Stopping {} reconcile loops", handles.len());
        for (name, handle) in handles {
            match tokio::time::timeout(grace, handle.task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::error!("Reconcile loop for {} panicked: {}", name, e),
                Err(_) => log::warn!("Reconcile loop for {} did not stop within {:?}", name, grace),
            }
        }
    }

    fn loops(&self) -> MutexGuard<'_, HashMap<String, LoopHandle>> {
        self.loops.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct ReconcileLoop {
    name: String,
    engine: Arc<SyncEngine>,
    settings: LoopSettings,
    poll_interval: Duration,
    triggers: mpsc::Receiver<LoopTrigger>,
    cancel: CancellationToken,
}

impl ReconcileLoop {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut watch = match self.engine.load(&self.name) {
            Ok(app) => self.engine.observer().subscribe(&app.scope()).await,
            Err(e) => {
                log::error!("Reconcile loop for {} cannot start: {}", self.name, e);
                return;
            }
        };
        let mut drift_due: Option<Instant> = None;

        loop {
            let trigger = tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => Some(LoopTrigger::Poll),
                received = self.triggers.recv() => match received {
                    Some(trigger) => Some(trigger),
                    None => break,
                },
                event = next_event(&mut watch) => {
                    match event {
                        Some(event) => {
                            if self.engine.observer().handle_event(&self.name, &event) && drift_due.is_none() {
                                drift_due = Some(Instant::now() + self.settings.drift_debounce);
                            }
                        }
                        None => watch = None,
                    }
                    None
                }
                _ = wait_until(drift_due) => {
                    drift_due = None;
                    Some(LoopTrigger::Drift)
                }
            };

            if let Some(trigger) = trigger {
                if let Err(e) = self.reconcile(trigger).await {
                    log::error!("Reconcile of {} on {} failed: {}", self.name, trigger, e);
                }
            }
        }
        log::debug!("Reconcile loop for {} stopped", self.name);
    }

    async fn reconcile(&self, trigger: LoopTrigger) -> Result<()> {
        let app = self.engine.load(&self.name)?;
        let policy = app.policy();
        log::debug!("Reconciling {} on {}", self.name, trigger);

        if trigger == LoopTrigger::Drift {
            let drifted = self.engine.check_drift(&self.name, false).await?;
            if !drifted.is_empty() && policy.automated && policy.self_heal {
                self.self_heal("drift").await?;
            }
            return Ok(());
        }

        if policy.automated {
            let tracked = self.engine.resolve(&app, &self.cancel).await?;
            let attempted = app.status.last_attempted_revision.as_deref();
            if attempted != Some(tracked.revision.id.as_str()) {
                log::info!(
                    "New revision {} for {} ({})",
                    tracked.revision.short_id(),
                    self.name,
                    trigger
                );
                self.engine
                    .sync_revision(&self.name, tracked.revision, SyncTrigger::NewRevision, &self.cancel)
                    .await?;
                return Ok(());
            }
        }

        let report = self.engine.refresh_health(&self.name, false).await?;
        let app = self.engine.load(&self.name)?;
        match report.status {
            HealthStatus::Healthy if app.status.self_heal_attempts > 0 => {
                self.engine
                    .registry()
                    .update_status(&self.name, |s| s.self_heal_attempts = 0)
                    .await?;
            }
            HealthStatus::Degraded if policy.automated && policy.self_heal => {
                self.self_heal("degraded health").await?;
            }
            _ => {}
        }

        if trigger == LoopTrigger::Poll {
            let drifted = self.engine.check_drift(&self.name, false).await?;
            if !drifted.is_empty() && policy.automated && policy.self_heal {
                self.self_heal("drift").await?;
            }
        }
        Ok(())
    }

    /// Re-syncs the last attempted revision within the self-heal budget.
    async fn self_heal(&self, reason: &str) -> Result<()> {
        let app = self.engine.load(&self.name)?;
        if app.status.self_heal_attempts >= self.settings.max_self_heal_attempts {
            if app.status.alert.is_none() {
                let message = format!(
                    "self-heal gave up after {} attempts ({})",
                    app.status.self_heal_attempts, reason
                );
                log::error!("Application {}: {}", app.name, message);
                let alert = message.clone();
                self.engine
                    .registry()
                    .update_status(&app.name, |s| s.alert = Some(alert))
                    .await?;
                self.engine
                    .events()
                    .emit(&app.name, EventKind::AlertRaised { message });
            }
            return Ok(());
        }

        let revision = match app
            .status
            .last_attempted_revision
            .as_ref()
            .or(app.status.last_synced_revision.as_ref())
        {
            Some(id) => Revision::new(id.clone(), app.spec.source.path.clone()),
            None => self.engine.resolve(&app, &self.cancel).await?.revision,
        };

        self.engine
            .registry()
            .update_status(&app.name, |s| s.self_heal_attempts += 1)
            .await?;
        log::info!(
            "Self-healing {} on {} (attempt {}/{})",
            app.name,
            reason,
            app.status.self_heal_attempts + 1,
            self.settings.max_self_heal_attempts
        );
        self.engine
            .sync_revision(&app.name, revision, SyncTrigger::SelfHeal, &self.cancel)
            .await?;
        Ok(())
    }
}

async fn next_event(watch: &mut Option<WatchSubscription>) -> Option<WatchEvent> {
    match watch {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
