//! Live-state observation with per-application copy-on-write snapshots.
//!
//! Each application has one `ArcSwap<LiveSnapshot>`. A refresh lists the
//! runtime kind by kind and swaps in a whole new snapshot; readers load the
//! current `Arc` without locking and never see a half-built one.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::RuntimeError;
use crate::manifest::{ResourceDeclaration, ResourceKey, APPLICATION_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use crate::runtime::{ResourceObservation, Scope, TargetRuntime, WatchEvent, WatchSubscription};

/// Live objects relevant to one application at one point in time.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveSnapshot {
    pub application: String,
    /// Sorted by key.
    pub observations: Vec<ResourceObservation>,
    pub observed_at: DateTime<Utc>,
    /// Kinds whose listing failed; their previous observations are carried as Unknown.
    pub unreachable_kinds: Vec<String>,
    #[serde(skip)]
    taken_at: Instant,
}

impl LiveSnapshot {
    pub fn empty(application: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            observations: Vec::new(),
            observed_at: Utc::now(),
            unreachable_kinds: Vec::new(),
            taken_at: Instant::now(),
        }
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&ResourceObservation> {
        self.observations
            .binary_search_by(|o| o.key.cmp(key))
            .ok()
            .map(|i| &self.observations[i])
    }

    pub fn kinds(&self) -> BTreeSet<String> {
        self.observations.iter().map(|o| o.key.kind.clone()).collect()
    }

    pub fn has_unknown(&self) -> bool {
        self.observations.iter().any(ResourceObservation::is_unknown)
    }

    pub fn age(&self) -> Duration {
        self.taken_at.elapsed()
    }
}

/// What to observe for an application.
#[derive(Debug, Clone)]
pub struct ObserveRequest {
    pub application: String,
    pub scope: Scope,
    /// Kinds to list, in addition to kinds already seen for this application.
    pub kinds: BTreeSet<String>,
    /// Keys to keep even if they are neither owned nor in the scope's namespace.
    pub interest: BTreeSet<ResourceKey>,
}

struct Entry {
    snapshot: ArcSwap<LiveSnapshot>,
    invalidated: AtomicBool,
}

pub struct LiveStateObserver {
    runtime: Arc<dyn TargetRuntime>,
    max_age: Duration,
    call_timeout: Duration,
    entries: DashMap<String, Arc<Entry>>,
}

impl LiveStateObserver {
    pub fn new(runtime: Arc<dyn TargetRuntime>, max_age: Duration, call_timeout: Duration) -> Self {
        Self {
            runtime,
            max_age,
            call_timeout,
            entries: DashMap::new(),
        }
    }

    /// The current snapshot, if one was ever taken. Never blocks.
    pub fn snapshot(&self, application: &str) -> Option<Arc<LiveSnapshot>> {
        self.entries
            .get(application)
            .map(|entry| entry.snapshot.load_full())
    }

    /// Returns a snapshot no older than the cache age, refreshing when needed or forced.
    pub async fn observe(
        &self,
        request: &ObserveRequest,
        force: bool,
    ) -> Result<Arc<LiveSnapshot>, RuntimeError> {
        let entry = self.entry(&request.application);
        if !force && !entry.invalidated.load(Ordering::SeqCst) {
            let current = entry.snapshot.load_full();
            if current.age() < self.max_age {
                return Ok(current);
            }
        }

        let previous = entry.snapshot.load_full();
        let mut kinds = request.kinds.clone();
        kinds.extend(previous.kinds());

        let mut observations: BTreeMap<ResourceKey, ResourceObservation> = BTreeMap::new();
        let mut unreachable = Vec::new();
        let mut last_error = None;

        for kind in &kinds {
            match self.list_kind(&request.scope, kind).await {
                Ok(listed) => {
                    for obs in listed {
                        if is_relevant(request, &obs) {
                            observations.insert(obs.key.clone(), obs);
                        }
                    }
                }
                Err(e) => {
                    log::warn!(
                        "Listing {} for {} failed, marking previous observations Unknown: {}",
                        kind,
                        request.application,
                        e
                    );
                    for obs in previous.observations.iter().filter(|o| &o.key.kind == kind) {
                        observations.insert(obs.key.clone(), obs.clone().into_unknown());
                    }
                    unreachable.push(kind.clone());
                    last_error = Some(e);
                }
            }
        }

        if !kinds.is_empty() && unreachable.len() == kinds.len() {
            if let Some(e) = last_error {
                return Err(e);
            }
        }

        let snapshot = Arc::new(LiveSnapshot {
            application: request.application.clone(),
            observations: observations.into_values().collect(),
            observed_at: Utc::now(),
            unreachable_kinds: unreachable,
            taken_at: Instant::now(),
        });
        entry.snapshot.store(snapshot.clone());
        entry.invalidated.store(false, Ordering::SeqCst);
        Ok(snapshot)
    }

    /// Forces the next `observe` to re-list.
    pub fn invalidate(&self, application: &str) {
        if let Some(entry) = self.entries.get(application) {
            entry.invalidated.store(true, Ordering::SeqCst);
        }
    }

    /// Drops all cached state for an application.
    pub fn forget(&self, application: &str) {
        self.entries.remove(application);
    }

    /// Opens a runtime watch for an application's scope. `None` means poll only.
    pub async fn subscribe(&self, scope: &Scope) -> Option<WatchSubscription> {
        self.runtime.watch(scope).await
    }

    /// Invalidates the application's snapshot if `event` concerns it. Returns true if it did.
    pub fn handle_event(&self, application: &str, event: &WatchEvent) -> bool {
        let owned = event.owner.as_deref() == Some(application);
        let known = self
            .snapshot(application)
            .map(|s| s.get(&event.key).is_some())
            .unwrap_or(false);
        if owned || known {
            self.invalidate(application);
            true
        } else {
            false
        }
    }

    fn entry(&self, application: &str) -> Arc<Entry> {
        self.entries
            .entry(application.to_string())
            .or_insert_with(|| {
                Arc::new(Entry {
                    snapshot: ArcSwap::from_pointee(LiveSnapshot::empty(application)),
                    invalidated: AtomicBool::new(true),
                })
            })
            .clone()
    }

    async fn list_kind(&self, scope: &Scope, kind: &str) -> Result<Vec<ResourceObservation>, RuntimeError> {
        tokio::time::timeout(self.call_timeout, self.runtime.list_resources(scope, kind))
            .await
            .map_err(|_| RuntimeError::Timeout(self.call_timeout.as_millis() as u64))?
    }
}

fn is_relevant(request: &ObserveRequest, obs: &ResourceObservation) -> bool {
    obs.managed_by.is_owned_by(&request.application)
        || request.interest.contains(&obs.key)
        || obs.key.namespace.as_deref() == Some(request.scope.namespace.as_str())
}

/// Returns a copy of `declaration` carrying this controller's ownership labels.
pub fn stamp_ownership(declaration: &ResourceDeclaration, application: &str) -> ResourceDeclaration {
    let mut stamped = declaration.clone();
    stamped
        .metadata
        .labels
        .insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
    stamped
        .metadata
        .labels
        .insert(APPLICATION_LABEL.to_string(), application.to_string());
    stamped
}

/// Keys whose live fingerprint differs from the last-applied one, or that vanished.
///
/// Unknown observations are not evidence of drift.
pub fn detect_drift(snapshot: &LiveSnapshot, last_applied: &BTreeMap<ResourceKey, String>) -> Vec<ResourceKey> {
    last_applied
        .iter()
        .filter(|(key, fingerprint)| match snapshot.get(key) {
            None => true,
            Some(obs) if obs.is_unknown() => false,
            Some(obs) => &obs.fingerprint != *fingerprint,
        })
        .map(|(key, _)| key.clone())
        .collect()
}
