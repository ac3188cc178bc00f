//! Builders for creating test data programmatically.

#![allow(dead_code)]

use converge::manifest::{ObjectMeta, APPLICATION_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use converge::{ApplicationSpec, Destination, ResourceDeclaration, SourceRef, SyncPolicy};
use serde_json::json;

pub const REPO: &str = "mem://platform";
pub const NAMESPACE: &str = "prod";

/// Builder for `ApplicationSpec` instances.
pub struct ApplicationBuilder {
    repo_url: String,
    reference: String,
    path: String,
    namespace: String,
    policy: SyncPolicy,
    poll_interval: Option<u64>,
}

impl ApplicationBuilder {
    /// Manual policy, tracking `main` of the shared test repository at `deploy`.
    pub fn new() -> Self {
        Self {
            repo_url: REPO.to_string(),
            reference: "main".to_string(),
            path: "deploy".to_string(),
            namespace: NAMESPACE.to_string(),
            policy: SyncPolicy::default(),
            poll_interval: None,
        }
    }

    pub fn repo(mut self, repo_url: &str) -> Self {
        self.repo_url = repo_url.to_string();
        self
    }

    pub fn reference(mut self, reference: &str) -> Self {
        self.reference = reference.to_string();
        self
    }

    pub fn path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    pub fn namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    pub fn automated(mut self) -> Self {
        self.policy.automated = true;
        self
    }

    pub fn prune(mut self) -> Self {
        self.policy.prune = true;
        self
    }

    pub fn self_heal(mut self) -> Self {
        self.policy.self_heal = true;
        self
    }

    pub fn policy(mut self, policy: SyncPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn poll_interval(mut self, seconds: u64) -> Self {
        self.poll_interval = Some(seconds);
        self
    }

    pub fn build(self) -> ApplicationSpec {
        ApplicationSpec {
            source: SourceRef::new(self.repo_url, self.reference, self.path),
            destination: Destination {
                endpoint: "local".to_string(),
                namespace: self.namespace,
            },
            sync_policy: self.policy,
            poll_interval: self.poll_interval,
        }
    }
}

impl Default for ApplicationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub fn deployment(name: &str, replicas: u64) -> String {
    format!(
        r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: {}
spec:
  replicas: {}
"#,
        name, replicas
    )
}

pub fn config_map(name: &str, mode: &str) -> String {
    format!(
        r#"apiVersion: v1
kind: ConfigMap
metadata:
  name: {}
data:
  mode: {}
"#,
        name, mode
    )
}

pub fn service(name: &str) -> String {
    format!(
        r#"apiVersion: v1
kind: Service
metadata:
  name: {}
spec:
  port: 80
"#,
        name
    )
}

/// Joins manifests into one multi-document file.
pub fn documents(parts: &[String]) -> String {
    parts.join("---\n")
}

/// A live object created by someone other than the controller.
pub fn foreign(kind: &str, name: &str) -> ResourceDeclaration {
    ResourceDeclaration::new("v1", kind, ObjectMeta::new(name).with_namespace(NAMESPACE))
        .with_spec(json!({ "owner": "ops" }))
}

/// A live object carrying another application's ownership marker.
pub fn owned_by(application: &str, kind: &str, name: &str) -> ResourceDeclaration {
    let meta = ObjectMeta::new(name)
        .with_namespace(NAMESPACE)
        .with_label(MANAGED_BY_LABEL, MANAGED_BY_VALUE)
        .with_label(APPLICATION_LABEL, application);
    ResourceDeclaration::new("v1", kind, meta).with_spec(json!({ "owner": application }))
}
