//! Application health classification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::manifest::ResourceKey;
use crate::observer::LiveSnapshot;
use crate::runtime::ResourceObservation;
use crate::sync::SyncOutcome;

/// Restart count at which a workload is considered crash-looping.
pub const CRASH_RESTART_THRESHOLD: u64 = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Progressing,
    Degraded,
    #[default]
    Missing,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Progressing => write!(f, "Progressing"),
            HealthStatus::Degraded => write!(f, "Degraded"),
            HealthStatus::Missing => write!(f, "Missing"),
        }
    }
}

impl std::str::FromStr for HealthStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Healthy" => Ok(HealthStatus::Healthy),
            "Progressing" => Ok(HealthStatus::Progressing),
            "Degraded" => Ok(HealthStatus::Degraded),
            "Missing" => Ok(HealthStatus::Missing),
            _ => Err(format!("Unknown health status: {}", s)),
        }
    }
}

/// Outcome of a readiness check on one live object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady(String),
    /// The object will not become ready without intervention.
    Failed(String),
}

/// Readiness predicate for the kinds it applies to.
pub trait ReadinessRule: Send + Sync {
    fn applies_to(&self, observation: &ResourceObservation) -> bool;
    fn check(&self, observation: &ResourceObservation) -> Readiness;
}

/// Objects with `spec.replicas` are ready once `status.readyReplicas`
/// reaches `spec.minAvailable`, which defaults to `spec.replicas`.
pub struct ReplicaRule;

impl ReadinessRule for ReplicaRule {
    fn applies_to(&self, observation: &ResourceObservation) -> bool {
        spec_u64(observation, "replicas").is_some()
    }

    fn check(&self, observation: &ResourceObservation) -> Readiness {
        let replicas = spec_u64(observation, "replicas").unwrap_or(0);
        let required = spec_u64(observation, "minAvailable").unwrap_or(replicas);
        let ready = observation
            .status
            .get("readyReplicas")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if ready >= required {
            Readiness::Ready
        } else {
            Readiness::NotReady(format!("{}/{} replicas ready", ready, required))
        }
    }
}

fn spec_u64(observation: &ResourceObservation, field: &str) -> Option<u64> {
    observation.object.spec()?.get(field)?.as_u64()
}

/// Checks `status` for signs of a failure that will not resolve by waiting.
pub fn terminal_failure(status: &Value) -> Option<String> {
    if let Some(conditions) = status.get("conditions").and_then(Value::as_array) {
        for condition in conditions {
            let kind = condition.get("type").and_then(Value::as_str);
            let reason = condition.get("reason").and_then(Value::as_str);
            if kind == Some("Failed") {
                let message = condition
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("condition Failed");
                return Some(message.to_string());
            }
            if reason == Some("CrashLoopBackOff") {
                return Some("CrashLoopBackOff".to_string());
            }
        }
    }
    match status.get("restartCount").and_then(Value::as_u64) {
        Some(restarts) if restarts >= CRASH_RESTART_THRESHOLD => {
            Some(format!("restarted {} times", restarts))
        }
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceHealth {
    pub key: ResourceKey,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub message: Option<String>,
    pub resources: Vec<ResourceHealth>,
}

/// Everything the evaluator looks at for one application.
#[derive(Debug, Clone, Copy)]
pub struct HealthInput<'a> {
    pub desired: &'a [ResourceKey],
    pub snapshot: Option<&'a LiveSnapshot>,
    pub last_outcome: Option<SyncOutcome>,
    pub render_error: Option<&'a str>,
    /// Error text of the last sync, quoted when it degrades health.
    pub last_error: Option<&'a str>,
    pub sync_in_flight: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

pub struct HealthEvaluator {
    grace: Duration,
    rules: Vec<Box<dyn ReadinessRule>>,
}

impl HealthEvaluator {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            rules: vec![Box::new(ReplicaRule)],
        }
    }

    pub fn with_rule(mut self, rule: Box<dyn ReadinessRule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn evaluate(&self, input: &HealthInput<'_>) -> HealthReport {
        if let Some(error) = input.render_error {
            return HealthReport {
                status: HealthStatus::Degraded,
                message: Some(format!("render failed: {}", error)),
                resources: Vec::new(),
            };
        }

        let within_grace = match input.last_sync_time {
            Some(at) => (input.now - at)
                .to_std()
                .map(|elapsed| elapsed < self.grace)
                .unwrap_or(true),
            None => true,
        };

        let resources: Vec<ResourceHealth> = input
            .desired
            .iter()
            .map(|key| self.resource_health(key, input.snapshot, within_grace))
            .collect();

        let first = |status: HealthStatus| {
            resources
                .iter()
                .find(|r| r.status == status)
                .map(|r| format!("{}: {}", r.key, r.message.as_deref().unwrap_or("")))
        };

        let (status, message) = match input.last_outcome {
            Some(outcome @ (SyncOutcome::Failed | SyncOutcome::PartiallyApplied)) => {
                let message = match input.last_error {
                    Some(error) => format!("last sync {}: {}", outcome, error),
                    None => format!("last sync {}", outcome),
                };
                (HealthStatus::Degraded, Some(message))
            }
            _ => {
                if let Some(message) = first(HealthStatus::Degraded) {
                    (HealthStatus::Degraded, Some(message))
                } else if let Some(message) = first(HealthStatus::Missing) {
                    if input.sync_in_flight {
                        (HealthStatus::Progressing, Some(message))
                    } else {
                        (HealthStatus::Missing, Some(message))
                    }
                } else if let Some(message) = first(HealthStatus::Progressing) {
                    (HealthStatus::Progressing, Some(message))
                } else {
                    (HealthStatus::Healthy, None)
                }
            }
        };

        HealthReport {
            status,
            message,
            resources,
        }
    }

    fn resource_health(
        &self,
        key: &ResourceKey,
        snapshot: Option<&LiveSnapshot>,
        within_grace: bool,
    ) -> ResourceHealth {
        let health = |status, message: Option<String>| ResourceHealth {
            key: key.clone(),
            status,
            message,
        };

        let Some(observation) = snapshot.and_then(|s| s.get(key)) else {
            return health(HealthStatus::Missing, Some("not found in runtime".to_string()));
        };
        if observation.is_unknown() {
            return health(HealthStatus::Progressing, Some("state unknown".to_string()));
        }
        if let Some(failure) = terminal_failure(&observation.status) {
            return health(HealthStatus::Degraded, Some(failure));
        }

        for rule in self.rules.iter().filter(|r| r.applies_to(observation)) {
            match rule.check(observation) {
                Readiness::Ready => {}
                Readiness::Failed(message) => return health(HealthStatus::Degraded, Some(message)),
                Readiness::NotReady(message) if within_grace => {
                    return health(HealthStatus::Progressing, Some(message))
                }
                Readiness::NotReady(message) => {
                    return health(
                        HealthStatus::Degraded,
                        Some(format!("{} after grace period", message)),
                    )
                }
            }
        }
        health(HealthStatus::Healthy, None)
    }
}
