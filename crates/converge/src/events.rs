//! Controller event broadcasting.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::health::HealthStatus;
use crate::manifest::ResourceKey;
use crate::sync::{SyncOutcome, SyncTrigger};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EventKind {
    Registered,
    Deregistered { pruned: bool },
    #[serde(rename_all = "camelCase")]
    SyncStarted {
        operation_id: String,
        revision: String,
        trigger: SyncTrigger,
    },
    #[serde(rename_all = "camelCase")]
    SyncFinished {
        operation_id: String,
        revision: String,
        outcome: SyncOutcome,
    },
    HealthChanged {
        from: HealthStatus,
        to: HealthStatus,
    },
    DriftDetected { resources: Vec<ResourceKey> },
    AlertRaised { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerEvent {
    pub timestamp: DateTime<Utc>,
    pub application: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl ControllerEvent {
    pub fn new(application: &str, kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            application: application.to_string(),
            kind,
        }
    }
}

#[derive(Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<ControllerEvent>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn send(&self, event: ControllerEvent) {
        // No active receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn emit(&self, application: &str, kind: EventKind) {
        self.send(ControllerEvent::new(application, kind));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_receive() {
        let events = EventBroadcaster::new(8);
        let mut rx = events.subscribe();
        events.emit(
            "shop",
            EventKind::HealthChanged {
                from: HealthStatus::Progressing,
                to: HealthStatus::Healthy,
            },
        );
        let received = rx.try_recv().unwrap();
        assert_eq!(received.application, "shop");
        assert!(matches!(received.kind, EventKind::HealthChanged { to: HealthStatus::Healthy, .. }));
    }

    #[test]
    fn test_send_without_receivers() {
        EventBroadcaster::default().emit("shop", EventKind::Registered);
    }

    #[test]
    fn test_serialized_shape() {
        let event = ControllerEvent::new(
            "shop",
            EventKind::AlertRaised {
                message: "self-heal exhausted".into(),
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "alertRaised");
        assert_eq!(json["application"], "shop");
        assert_eq!(json["message"], "self-heal exhausted");
    }
}
