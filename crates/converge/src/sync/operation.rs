//! Sync operation records kept for audit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::diff::DiffOp;
use crate::manifest::ResourceKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncOutcome {
    Succeeded,
    Failed,
    PartiallyApplied,
}

impl std::fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncOutcome::Succeeded => write!(f, "Succeeded"),
            SyncOutcome::Failed => write!(f, "Failed"),
            SyncOutcome::PartiallyApplied => write!(f, "PartiallyApplied"),
        }
    }
}

impl std::str::FromStr for SyncOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Succeeded" => Ok(SyncOutcome::Succeeded),
            "Failed" => Ok(SyncOutcome::Failed),
            "PartiallyApplied" => Ok(SyncOutcome::PartiallyApplied),
            _ => Err(format!("Unknown sync outcome: {}", s)),
        }
    }
}

/// Why a sync was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncTrigger {
    Manual,
    NewRevision,
    SelfHeal,
    Prune,
}

impl std::fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncTrigger::Manual => write!(f, "manual"),
            SyncTrigger::NewRevision => write!(f, "newRevision"),
            SyncTrigger::SelfHeal => write!(f, "selfHeal"),
            SyncTrigger::Prune => write!(f, "prune"),
        }
    }
}

impl std::str::FromStr for SyncTrigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(SyncTrigger::Manual),
            "newRevision" => Ok(SyncTrigger::NewRevision),
            "selfHeal" => Ok(SyncTrigger::SelfHeal),
            "prune" => Ok(SyncTrigger::Prune),
            _ => Err(format!("Unknown sync trigger: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordStatus {
    Succeeded,
    Failed,
    /// Not executed: prune disabled or the operation was cancelled.
    Skipped,
    NoOp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordResult {
    pub key: ResourceKey,
    pub op: DiffOp,
    pub status: RecordStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    pub id: String,
    pub application: String,
    pub revision: String,
    pub trigger: SyncTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<SyncOutcome>,
    #[serde(default)]
    pub records: Vec<RecordResult>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

impl SyncOperation {
    pub fn start(application: &str, revision: &str, trigger: SyncTrigger) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            application: application.to_string(),
            revision: revision.to_string(),
            trigger,
            started_at: Utc::now(),
            finished_at: None,
            outcome: None,
            records: Vec::new(),
            warnings: Vec::new(),
            error: None,
        }
    }

    pub fn count(&self, status: RecordStatus) -> usize {
        self.records.iter().filter(|r| r.status == status).count()
    }

    fn failed_apply(&self) -> bool {
        self.records
            .iter()
            .any(|r| r.status == RecordStatus::Failed && r.op != DiffOp::Delete)
    }

    /// Settles the outcome from the record results.
    ///
    /// All actionable records succeeded → Succeeded; none did → Failed; otherwise
    /// PartiallyApplied. Skipped records from cancellation count as not done.
    /// Failed Deletes alone never make a sync Failed, so they cannot hold back
    /// the revision.
    pub fn finish(&mut self, cancelled: bool) -> SyncOutcome {
        let succeeded = self.count(RecordStatus::Succeeded);
        let failed = self.count(RecordStatus::Failed);
        let skipped = if cancelled {
            self.count(RecordStatus::Skipped)
        } else {
            0
        };

        let outcome = if self.error.is_some() {
            SyncOutcome::Failed
        } else if failed + skipped == 0 {
            SyncOutcome::Succeeded
        } else if succeeded == 0 && (skipped > 0 || self.failed_apply()) {
            SyncOutcome::Failed
        } else {
            SyncOutcome::PartiallyApplied
        };
        self.outcome = Some(outcome);
        self.finished_at = Some(Utc::now());
        outcome
    }

    /// Whether this operation lets `lastSyncedRevision` advance to its revision.
    ///
    /// Succeeded always does. PartiallyApplied does only when every failure is
    /// a Delete, which policy does not require to complete.
    pub fn advances_revision(&self) -> bool {
        match self.outcome {
            Some(SyncOutcome::Succeeded) => true,
            Some(SyncOutcome::PartiallyApplied) => {
                !self.failed_apply() && self.count(RecordStatus::Skipped) == 0
            }
            _ => false,
        }
    }
}
