//! Runtime that materializes resources as YAML files.
//!
//! Layout: `<root>/<endpoint>/<namespace>/<Kind>/<name>.yaml`, with
//! cluster-scoped resources under the `_cluster` namespace directory. Anything
//! that edits those files (an operator, another tool) is live-state change;
//! the directory is watched with a debounced `notify` watcher.

use async_trait::async_trait;
use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebouncedEvent, Debouncer};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::{ChangeType, ResourceObservation, Scope, TargetRuntime, WatchEvent, WatchSubscription};
use crate::error::RuntimeError;
use crate::manifest::{ResourceDeclaration, ResourceKey};

const CLUSTER_DIR: &str = "_cluster";
const DEBOUNCE: Duration = Duration::from_millis(500);
const EVENT_CHANNEL_CAPACITY: usize = 256;

struct EndpointWatch {
    sender: broadcast::Sender<WatchEvent>,
    stop: CancellationToken,
}

pub struct FilesystemRuntime {
    root: PathBuf,
    watches: Mutex<HashMap<String, EndpointWatch>>,
}

impl FilesystemRuntime {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            watches: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn endpoint_dir(&self, scope: &Scope) -> Result<PathBuf, RuntimeError> {
        if !is_safe_segment(&scope.endpoint) {
            return Err(RuntimeError::Unavailable(format!(
                "invalid endpoint '{}'",
                scope.endpoint
            )));
        }
        Ok(self.root.join(&scope.endpoint))
    }

    /// File path of an object, refusing names that would leave the endpoint directory.
    pub fn object_path(&self, scope: &Scope, key: &ResourceKey) -> Result<PathBuf, RuntimeError> {
        let namespace = key.namespace.as_deref().unwrap_or(CLUSTER_DIR);
        let safe = is_safe_segment(&key.kind)
            && is_safe_segment(&key.name)
            && (key.namespace.is_none() || is_safe_segment(namespace));
        if !safe {
            return Err(RuntimeError::Forbidden {
                key: key.clone(),
                message: "resource identity is not a safe path".to_string(),
            });
        }
        Ok(self
            .endpoint_dir(scope)?
            .join(namespace)
            .join(&key.kind)
            .join(format!("{}.yaml", key.name)))
    }
}

impl Drop for FilesystemRuntime {
    fn drop(&mut self) {
        let watches = self.watches.lock().unwrap_or_else(|e| e.into_inner());
        for watch in watches.values() {
            watch.stop.cancel();
        }
    }
}

#[async_trait]
impl TargetRuntime for FilesystemRuntime {
    async fn list_resources(
        &self,
        scope: &Scope,
        kind: &str,
    ) -> Result<Vec<ResourceObservation>, RuntimeError> {
        let dir = self.endpoint_dir(scope)?;
        let kind = kind.to_string();
        tokio::task::spawn_blocking(move || list_kind(&dir, &kind))
            .await
            .map_err(|e| RuntimeError::Io(e.to_string()))?
    }

    async fn apply(&self, scope: &Scope, declaration: &ResourceDeclaration) -> Result<(), RuntimeError> {
        let key = declaration.key();
        let path = self.object_path(scope, &key)?;
        let declaration = declaration.clone();
        tokio::task::spawn_blocking(move || write_object(&path, &key, declaration))
            .await
            .map_err(|e| RuntimeError::Io(e.to_string()))?
    }

    async fn delete(&self, scope: &Scope, key: &ResourceKey) -> Result<(), RuntimeError> {
        let path = self.object_path(scope, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RuntimeError::NotFound { key: key.clone() })
            }
            Err(e) => Err(RuntimeError::Io(format!("{}: {}", path.display(), e))),
        }
    }

    async fn watch(&self, scope: &Scope) -> Option<WatchSubscription> {
        let dir = self.endpoint_dir(scope).ok()?;
        let mut watches = self.watches.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = watches.get(&scope.endpoint) {
            if !existing.stop.is_cancelled() {
                return Some(WatchSubscription::new(existing.sender.subscribe()));
            }
        }

        if let Err(e) = std::fs::create_dir_all(&dir) {
            log::warn!("Cannot watch {}: {}", dir.display(), e);
            return None;
        }

        let (sender, receiver) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let stop = CancellationToken::new();
        let thread_sender = sender.clone();
        let thread_stop = stop.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("converge-watch-{}", scope.endpoint))
            .spawn(move || {
                if let Err(e) = watch_directory(&dir, &thread_sender, &thread_stop) {
                    log::error!("Watch on {} failed: {}", dir.display(), e);
                }
                thread_stop.cancel();
            });
        if let Err(e) = spawned {
            log::warn!("Failed to start watcher thread: {}", e);
            return None;
        }

        watches.insert(scope.endpoint.clone(), EndpointWatch { sender, stop });
        Some(WatchSubscription::new(receiver))
    }
}

fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.starts_with('.')
        && !segment.contains(|c| c == '/' || c == '\\')
}

fn read_object(path: &Path) -> Result<ResourceDeclaration, String> {
    let content = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_yaml::from_str(&content).map_err(|e| e.to_string())
}

fn list_kind(endpoint_dir: &Path, kind: &str) -> Result<Vec<ResourceObservation>, RuntimeError> {
    if !endpoint_dir.exists() {
        return Ok(Vec::new());
    }

    let mut observations = Vec::new();
    for entry in WalkDir::new(endpoint_dir)
        .min_depth(3)
        .max_depth(3)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| RuntimeError::Io(e.to_string()))?;
        let path = entry.path();
        let in_kind_dir = path
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n == kind)
            .unwrap_or(false);
        let is_yaml = path.extension().map(|e| e == "yaml").unwrap_or(false);
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if !entry.file_type().is_file() || !in_kind_dir || !is_yaml || hidden {
            continue;
        }

        match read_object(path) {
            Ok(object) => observations.push(ResourceObservation::from_object(object)),
            Err(e) => log::warn!("Skipping unreadable object {}: {}", path.display(), e),
        }
    }
    Ok(observations)
}

fn write_object(path: &Path, key: &ResourceKey, mut object: ResourceDeclaration) -> Result<(), RuntimeError> {
    let io_err = |e: std::io::Error| RuntimeError::Io(format!("{}: {}", path.display(), e));

    let previous = path.exists().then(|| read_object(path).ok()).flatten();
    if let Some(previous) = &previous {
        if let (Some(current_owner), Some(new_owner)) = (previous.owner(), object.owner()) {
            if current_owner != new_owner {
                return Err(RuntimeError::Conflict {
                    key: key.clone(),
                    message: format!("owned by application '{}'", current_owner),
                });
            }
        }
    }

    object.content.remove("status");
    let replicas = object
        .spec()
        .and_then(|s| s.get("replicas"))
        .and_then(Value::as_u64);
    match replicas {
        Some(replicas) => {
            object
                .content
                .insert("status".to_string(), json!({ "readyReplicas": replicas }));
        }
        None => {
            if let Some(status) = previous.and_then(|mut p| p.content.remove("status")) {
                object.content.insert("status".to_string(), status);
            }
        }
    }

    let yaml = serde_yaml::to_string(&object).map_err(|e| RuntimeError::Io(e.to_string()))?;
    let dir = path
        .parent()
        .ok_or_else(|| RuntimeError::Io(format!("{} has no parent", path.display())))?;
    std::fs::create_dir_all(dir).map_err(io_err)?;

    let tmp = dir.join(format!(".{}.tmp", key.name));
    std::fs::write(&tmp, yaml).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)
}

/// Blocks until `stop` is cancelled, forwarding file changes as watch events.
fn watch_directory(
    dir: &Path,
    sender: &broadcast::Sender<WatchEvent>,
    stop: &CancellationToken,
) -> Result<(), notify::Error> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut debouncer: Debouncer<RecommendedWatcher> = new_debouncer(DEBOUNCE, tx)?;
    debouncer.watcher().watch(dir, RecursiveMode::Recursive)?;
    log::info!("Watching runtime directory {}", dir.display());

    while !stop.is_cancelled() {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(Ok(events)) => {
                for event in events {
                    if let Some(watch_event) = to_watch_event(dir, &event) {
                        let _ = sender.send(watch_event);
                    }
                }
            }
            Ok(Err(e)) => log::error!("Watch error: {}", e),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    log::info!("Stopped watching {}", dir.display());
    Ok(())
}

fn to_watch_event(endpoint_dir: &Path, event: &DebouncedEvent) -> Option<WatchEvent> {
    let key = key_from_path(endpoint_dir, &event.path)?;
    if event.path.exists() {
        let owner = read_object(&event.path)
            .ok()
            .and_then(|o| o.owner().map(str::to_string));
        Some(WatchEvent {
            key,
            change: ChangeType::Applied,
            owner,
        })
    } else {
        Some(WatchEvent {
            key,
            change: ChangeType::Deleted,
            owner: None,
        })
    }
}

/// Recovers an object key from `<namespace>/<Kind>/<name>.yaml` below the endpoint directory.
fn key_from_path(endpoint_dir: &Path, path: &Path) -> Option<ResourceKey> {
    let relative = path.strip_prefix(endpoint_dir).ok()?;
    let parts: Vec<&str> = relative.iter().filter_map(|c| c.to_str()).collect();
    let [namespace, kind, file] = parts.as_slice() else {
        return None;
    };
    if file.starts_with('.') {
        return None;
    }
    let name = file.strip_suffix(".yaml")?;
    let namespace = (*namespace != CLUSTER_DIR).then_some(*namespace);
    Some(ResourceKey::new(*kind, namespace, name))
}
