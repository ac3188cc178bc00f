//! The Application resource: what to deploy, where, and under which policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ConvergeError;
use crate::health::HealthStatus;
use crate::manifest::validation::is_dns_label;
use crate::manifest::{Resource, ResourceKey, ResourceKind};
use crate::runtime::Scope;
use crate::sync::SyncOutcome;

/// Where the desired state lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    /// Repository URL or local path.
    pub repo_url: String,

    /// Branch, tag or commit.
    #[serde(rename = "ref", default = "default_ref")]
    pub reference: String,

    /// Directory inside the repository holding the manifests.
    #[serde(default = "default_path")]
    pub path: String,
}

impl SourceRef {
    pub fn new(repo_url: impl Into<String>, reference: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            repo_url: repo_url.into(),
            reference: reference.into(),
            path: path.into(),
        }
    }

    /// Returns true if a push notification for (`repo_url`, `reference`) concerns this source.
    ///
    /// URLs are compared without a trailing `/` or `.git`. A `refs/heads/` or
    /// `refs/tags/` prefix on the notified ref is ignored.
    pub fn matches(&self, repo_url: &str, reference: &str) -> bool {
        fn normalize_url(url: &str) -> &str {
            let url = url.trim_end_matches('/');
            url.strip_suffix(".git").unwrap_or(url)
        }
        fn normalize_ref(r: &str) -> &str {
            r.strip_prefix("refs/heads/")
                .or_else(|| r.strip_prefix("refs/tags/"))
                .unwrap_or(r)
        }
        normalize_url(&self.repo_url) == normalize_url(repo_url)
            && normalize_ref(&self.reference) == normalize_ref(reference)
    }
}

fn default_ref() -> String {
    "main".to_string()
}

fn default_path() -> String {
    ".".to_string()
}

/// Where the rendered resources are applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl Default for Destination {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            namespace: default_namespace(),
        }
    }
}

fn default_endpoint() -> String {
    "local".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

/// Which actions the controller may take on its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPolicy {
    /// Sync automatically when a new revision appears.
    #[serde(default)]
    pub automated: bool,

    /// Delete owned resources that are no longer declared.
    #[serde(default)]
    pub prune: bool,

    /// Re-sync automatically when live state drifts or health degrades.
    #[serde(default)]
    pub self_heal: bool,
}

/// A partial policy update. `None` fields keep their current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prune: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_heal: Option<bool>,
}

impl PolicyOverride {
    pub fn apply_to(&self, policy: &SyncPolicy) -> SyncPolicy {
        SyncPolicy {
            automated: self.automated.unwrap_or(policy.automated),
            prune: self.prune.unwrap_or(policy.prune),
            self_heal: self.self_heal.unwrap_or(policy.self_heal),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    pub source: SourceRef,

    #[serde(default)]
    pub destination: Destination,

    #[serde(default)]
    pub sync_policy: SyncPolicy,

    /// Seconds between revision checks. Falls back to the controller default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<u64>,
}

/// Application resource as declared in YAML.
pub type ApplicationResource = Resource<ApplicationSpec>;

impl ApplicationResource {
    pub fn application(name: impl Into<String>, spec: ApplicationSpec) -> Self {
        Resource::new(ResourceKind::Application, name, spec)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPhase {
    #[default]
    Idle,
    Syncing,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncPhase::Idle => write!(f, "Idle"),
            SyncPhase::Syncing => write!(f, "Syncing"),
        }
    }
}

impl std::str::FromStr for SyncPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Idle" => Ok(SyncPhase::Idle),
            "Syncing" => Ok(SyncPhase::Syncing),
            _ => Err(format!("Unknown sync phase: {}", s)),
        }
    }
}

/// Observed and derived state of an application. Written only by the controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStatus {
    pub last_synced_revision: Option<String>,
    /// Last revision a sync was attempted for, successful or not.
    pub last_attempted_revision: Option<String>,
    pub last_outcome: Option<SyncOutcome>,
    pub health: HealthStatus,
    pub health_message: Option<String>,
    pub phase: SyncPhase,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub self_heal_attempts: u32,
    pub alert: Option<String>,
    /// Desired fingerprint of each resource as of its last successful apply.
    #[serde(default)]
    pub last_applied: BTreeMap<ResourceKey, String>,
    /// Keys of the desired set from the last render.
    #[serde(default)]
    pub desired: Vec<ResourceKey>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub name: String,
    pub spec: ApplicationSpec,
    pub status: ApplicationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Application {
    pub fn new(name: impl Into<String>, spec: ApplicationSpec) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            spec,
            status: ApplicationStatus::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn scope(&self) -> Scope {
        Scope::new(
            &self.spec.destination.endpoint,
            &self.spec.destination.namespace,
        )
    }

    pub fn policy(&self) -> SyncPolicy {
        self.spec.sync_policy
    }
}

/// Checks an application name and spec before registration.
pub fn validate_application(name: &str, spec: &ApplicationSpec) -> Result<(), ConvergeError> {
    let mut errors = Vec::new();

    if !is_dns_label(name) {
        errors.push(format!("name '{}' must be a DNS label", name));
    }
    if spec.source.repo_url.trim().is_empty() {
        errors.push("source.repoUrl is required".to_string());
    }
    if spec.source.reference.trim().is_empty() {
        errors.push("source.ref is required".to_string());
    }
    if spec.source.path.split('/').any(|c| c == "..") {
        errors.push(format!(
            "source.path '{}' must not leave the repository",
            spec.source.path
        ));
    }
    if spec.destination.endpoint.trim().is_empty() {
        errors.push("destination.endpoint is required".to_string());
    }
    if !is_dns_label(&spec.destination.namespace) {
        errors.push(format!(
            "destination.namespace '{}' must be a DNS label",
            spec.destination.namespace
        ));
    }
    if spec.poll_interval == Some(0) {
        errors.push("pollInterval must be greater than 0".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConvergeError::InvalidApplication(errors.join("; ")))
    }
}
