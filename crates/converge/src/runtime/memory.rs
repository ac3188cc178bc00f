//! Simulated in-process runtime.
//!
//! Objects live in a map. Workloads with `spec.replicas` get a
//! `status.readyReplicas` that trails the desired count until rollouts are
//! advanced, which lets tests watch health move from Progressing to Healthy.
//! Failures can be injected per resource, per kind, or for the whole runtime.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;

use super::{ChangeType, ResourceObservation, Scope, TargetRuntime, WatchEvent, WatchSubscription};
use crate::error::RuntimeError;
use crate::manifest::{ResourceDeclaration, ResourceKey};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How an injected failure behaves.
#[derive(Debug, Clone)]
pub enum FailureMode {
    /// Fail the next `n` calls, then succeed.
    Times(u32, RuntimeError),
    Always(RuntimeError),
}

pub struct InMemoryRuntime {
    objects: Mutex<BTreeMap<ResourceKey, ResourceDeclaration>>,
    failures: Mutex<HashMap<ResourceKey, FailureMode>>,
    unreachable_kinds: Mutex<HashSet<String>>,
    unavailable: AtomicBool,
    ready_on_apply: AtomicBool,
    apply_delay: Mutex<Duration>,
    apply_log: Mutex<Vec<ResourceKey>>,
    apply_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for InMemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            objects: Mutex::new(BTreeMap::new()),
            failures: Mutex::new(HashMap::new()),
            unreachable_kinds: Mutex::new(HashSet::new()),
            unavailable: AtomicBool::new(false),
            ready_on_apply: AtomicBool::new(true),
            apply_delay: Mutex::new(Duration::ZERO),
            apply_log: Mutex::new(Vec::new()),
            apply_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            events,
        }
    }

    /// When false, applied workloads start with zero ready replicas.
    pub fn set_ready_on_apply(&self, ready: bool) {
        self.ready_on_apply.store(ready, Ordering::SeqCst);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_kind_unreachable(&self, kind: &str, unreachable: bool) {
        let mut kinds = lock(&self.unreachable_kinds);
        if unreachable {
            kinds.insert(kind.to_string());
        } else {
            kinds.remove(kind);
        }
    }

    pub fn set_apply_delay(&self, delay: Duration) {
        *lock(&self.apply_delay) = delay;
    }

    /// Injects a failure for apply and delete calls on `key`.
    pub fn fail(&self, key: ResourceKey, mode: FailureMode) {
        lock(&self.failures).insert(key, mode);
    }

    pub fn clear_failures(&self) {
        lock(&self.failures).clear();
    }

    /// Creates or replaces an object out of band, as another actor would.
    pub fn insert(&self, object: ResourceDeclaration) {
        let key = object.key();
        let owner = object.owner().map(str::to_string);
        lock(&self.objects).insert(key.clone(), object);
        self.emit(key, ChangeType::Applied, owner);
    }

    /// Modifies an object out of band. Returns false if it does not exist.
    pub fn edit(&self, key: &ResourceKey, f: impl FnOnce(&mut ResourceDeclaration)) -> bool {
        let owner = {
            let mut objects = lock(&self.objects);
            let Some(object) = objects.get_mut(key) else {
                return false;
            };
            f(object);
            object.owner().map(str::to_string)
        };
        self.emit(key.clone(), ChangeType::Applied, owner);
        true
    }

    /// Removes an object out of band.
    pub fn remove(&self, key: &ResourceKey) -> bool {
        let removed = lock(&self.objects).remove(key);
        match removed {
            Some(object) => {
                self.emit(key.clone(), ChangeType::Deleted, object.owner().map(str::to_string));
                true
            }
            None => false,
        }
    }

    /// The stored object, including its `status`.
    pub fn get(&self, key: &ResourceKey) -> Option<ResourceDeclaration> {
        lock(&self.objects).get(key).cloned()
    }

    pub fn keys(&self) -> Vec<ResourceKey> {
        lock(&self.objects).keys().cloned().collect()
    }

    /// Brings every workload's ready replica count up to its desired count.
    pub fn advance_rollouts(&self) {
        let mut objects = lock(&self.objects);
        for object in objects.values_mut() {
            if let Some(replicas) = desired_replicas(object) {
                set_ready_replicas(object, replicas);
            }
        }
    }

    /// Sets `status` of an object verbatim.
    pub fn set_status(&self, key: &ResourceKey, status: Value) -> bool {
        let mut objects = lock(&self.objects);
        match objects.get_mut(key) {
            Some(object) => {
                object.content.insert("status".to_string(), status);
                true
            }
            None => false,
        }
    }

    pub fn apply_calls(&self) -> usize {
        self.apply_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    /// Keys of successful applies, in order.
    pub fn apply_log(&self) -> Vec<ResourceKey> {
        lock(&self.apply_log).clone()
    }

    /// Highest number of applies that were ever running at once.
    pub fn max_concurrent_applies(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn emit(&self, key: ResourceKey, change: ChangeType, owner: Option<String>) {
        let _ = self.events.send(WatchEvent { key, change, owner });
    }

    fn check_reachable(&self, kind: &str) -> Result<(), RuntimeError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RuntimeError::Unavailable("runtime is offline".to_string()));
        }
        if lock(&self.unreachable_kinds).contains(kind) {
            return Err(RuntimeError::Unavailable(format!("kind {} is unreachable", kind)));
        }
        Ok(())
    }

    fn take_injected_failure(&self, key: &ResourceKey) -> Option<RuntimeError> {
        let mut failures = lock(&self.failures);
        match failures.get_mut(key)? {
            FailureMode::Always(err) => Some(err.clone()),
            FailureMode::Times(remaining, err) => {
                let err = err.clone();
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 {
                    failures.remove(key);
                }
                Some(err)
            }
        }
    }
}

#[async_trait]
impl TargetRuntime for InMemoryRuntime {
    async fn list_resources(
        &self,
        _scope: &Scope,
        kind: &str,
    ) -> Result<Vec<ResourceObservation>, RuntimeError> {
        self.check_reachable(kind)?;
        let objects = lock(&self.objects);
        Ok(objects
            .values()
            .filter(|o| o.kind == kind)
            .cloned()
            .map(ResourceObservation::from_object)
            .collect())
    }

    async fn apply(&self, _scope: &Scope, declaration: &ResourceDeclaration) -> Result<(), RuntimeError> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        let key = declaration.key();

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        let delay = *lock(&self.apply_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.check_reachable(&declaration.kind)?;
        if let Some(err) = self.take_injected_failure(&key) {
            return Err(err);
        }

        let mut object = declaration.clone();
        object.content.remove("status");
        {
            let mut objects = lock(&self.objects);
            let previous_status = objects
                .get(&key)
                .and_then(|o| o.content.get("status").cloned());

            match desired_replicas(&object) {
                Some(replicas) => {
                    let previously_ready = previous_status
                        .as_ref()
                        .and_then(|s| s.get("readyReplicas"))
                        .and_then(Value::as_u64)
                        .unwrap_or(0);
                    let ready = if self.ready_on_apply.load(Ordering::SeqCst) {
                        replicas
                    } else {
                        previously_ready.min(replicas)
                    };
                    set_ready_replicas(&mut object, ready);
                }
                None => {
                    if let Some(status) = previous_status {
                        object.content.insert("status".to_string(), status);
                    }
                }
            }
            objects.insert(key.clone(), object);
        }

        lock(&self.apply_log).push(key.clone());
        self.emit(key, ChangeType::Applied, declaration.owner().map(str::to_string));
        Ok(())
    }

    async fn delete(&self, _scope: &Scope, key: &ResourceKey) -> Result<(), RuntimeError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable(&key.kind)?;
        if let Some(err) = self.take_injected_failure(key) {
            return Err(err);
        }

        let removed = lock(&self.objects).remove(key);
        match removed {
            Some(object) => {
                self.emit(key.clone(), ChangeType::Deleted, object.owner().map(str::to_string));
                Ok(())
            }
            None => Err(RuntimeError::NotFound { key: key.clone() }),
        }
    }

    async fn watch(&self, _scope: &Scope) -> Option<WatchSubscription> {
        Some(WatchSubscription::new(self.events.subscribe()))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn desired_replicas(object: &ResourceDeclaration) -> Option<u64> {
    object.spec()?.get("replicas")?.as_u64()
}

fn set_ready_replicas(object: &mut ResourceDeclaration, ready: u64) {
    let status = object
        .content
        .entry("status".to_string())
        .or_insert_with(|| json!({}));
    if !status.is_object() {
        *status = json!({});
    }
    if let Some(map) = status.as_object_mut() {
        map.insert("readyReplicas".to_string(), json!(ready));
    }
}
