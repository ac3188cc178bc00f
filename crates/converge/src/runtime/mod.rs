//! Target runtime adapters.
//!
//! The runtime is the environment resources are applied to. The controller
//! only ever lists, applies and deletes through `TargetRuntime`.

pub mod filesystem;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::RuntimeError;
use crate::manifest::{ResourceDeclaration, ResourceKey};

pub use filesystem::FilesystemRuntime;
pub use memory::InMemoryRuntime;

/// Where an application's resources live: a runtime endpoint plus its default namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub endpoint: String,
    pub namespace: String,
}

impl Scope {
    pub fn new(endpoint: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            namespace: namespace.into(),
        }
    }
}

/// Who owns a live object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ManagedBy {
    Controller { application: String },
    Foreign,
}

impl ManagedBy {
    pub fn is_owned_by(&self, application: &str) -> bool {
        matches!(self, ManagedBy::Controller { application: a } if a == application)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObservationState {
    Observed,
    /// The object's kind could not be listed; its last known shape is kept.
    Unknown,
}

/// One live object as seen by the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceObservation {
    pub key: ResourceKey,
    /// The object without its `status`.
    pub object: ResourceDeclaration,
    pub status: Value,
    pub fingerprint: String,
    pub managed_by: ManagedBy,
    pub state: ObservationState,
}

impl ResourceObservation {
    /// Builds an observation from a stored object, splitting off its `status`.
    pub fn from_object(mut object: ResourceDeclaration) -> Self {
        let status = object.content.remove("status").unwrap_or(Value::Null);
        let managed_by = match object.owner() {
            Some(app) => ManagedBy::Controller {
                application: app.to_string(),
            },
            None => ManagedBy::Foreign,
        };
        Self {
            key: object.key(),
            fingerprint: object.fingerprint(),
            object,
            status,
            managed_by,
            state: ObservationState::Observed,
        }
    }

    /// The same observation, demoted to Unknown.
    pub fn into_unknown(mut self) -> Self {
        self.state = ObservationState::Unknown;
        self
    }

    pub fn is_unknown(&self) -> bool {
        self.state == ObservationState::Unknown
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Applied,
    Deleted,
}

/// A change to a live object reported by a runtime watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub key: ResourceKey,
    pub change: ChangeType,
    /// Owning application, if the object carried the ownership marker.
    pub owner: Option<String>,
}

/// A cancellable stream of watch events.
///
/// Dropping the subscription unsubscribes.
pub struct WatchSubscription {
    receiver: broadcast::Receiver<WatchEvent>,
    cancel: CancellationToken,
}

impl WatchSubscription {
    pub fn new(receiver: broadcast::Receiver<WatchEvent>) -> Self {
        Self {
            receiver,
            cancel: CancellationToken::new(),
        }
    }

    /// Next event, or `None` once unsubscribed or the runtime closed the stream.
    ///
    /// Lagging receivers skip ahead; callers re-list on any event anyway.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                result = self.receiver.recv() => match result {
                    Ok(event) => return Some(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::debug!("Watch subscriber lagged, skipped {} events", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            }
        }
    }

    /// A token that ends this subscription when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn unsubscribe(&self) {
        self.cancel.cancel();
    }
}

impl Drop for WatchSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
pub trait TargetRuntime: Send + Sync {
    /// Lists live objects of `kind` visible at the scope's endpoint, across namespaces.
    async fn list_resources(
        &self,
        scope: &Scope,
        kind: &str,
    ) -> Result<Vec<ResourceObservation>, RuntimeError>;

    /// Creates or replaces an object.
    async fn apply(&self, scope: &Scope, declaration: &ResourceDeclaration) -> Result<(), RuntimeError>;

    async fn delete(&self, scope: &Scope, key: &ResourceKey) -> Result<(), RuntimeError>;

    /// Subscribes to changes. `None` when the runtime cannot watch; callers poll instead.
    async fn watch(&self, _scope: &Scope) -> Option<WatchSubscription> {
        None
    }
}
