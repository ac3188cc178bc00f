//! K8s-style resource types: controller resources and managed declarations.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// The API version for the controller's own resources.
pub const API_VERSION: &str = "converge.io/v1";

/// Prefix reserved for labels and annotations written by the controller.
pub const CONTROLLER_PREFIX: &str = "converge.io/";

/// Ownership label marking a resource as managed by this controller.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "converge";

/// Ownership label naming the application that owns a resource.
pub const APPLICATION_LABEL: &str = "converge.io/application";

/// Kinds that are never placed in a namespace.
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
];

/// The kind of controller resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    ControllerSettings,
    Application,
    Overlay,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::ControllerSettings => write!(f, "ControllerSettings"),
            ResourceKind::Application => write!(f, "Application"),
            ResourceKind::Overlay => write!(f, "Overlay"),
        }
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "controllersettings" => Ok(ResourceKind::ControllerSettings),
            "application" => Ok(ResourceKind::Application),
            "overlay" => Ok(ResourceKind::Overlay),
            _ => Err(format!("Unknown resource kind: {}", s)),
        }
    }
}

/// Metadata for a resource, following K8s conventions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// A generic K8s-style wrapper for the controller's own resources.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource<T> {
    /// API version, should always be `converge.io/v1`.
    pub api_version: String,
    pub kind: ResourceKind,
    pub metadata: ObjectMeta,
    pub spec: T,
}

impl<T> Resource<T> {
    pub fn new(kind: ResourceKind, name: impl Into<String>, spec: T) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind,
            metadata: ObjectMeta::new(name),
            spec,
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

// ============================================================================
// Identity
// ============================================================================

/// Identity of a managed resource: (kind, namespace, name).
///
/// Rendered as `Kind/name` for cluster-scoped resources and
/// `Kind/namespace/name` otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceKey {
    pub fn new(kind: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.map(str::to_string),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

impl FromStr for ResourceKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [kind, name] if !kind.is_empty() && !name.is_empty() => {
                Ok(ResourceKey::new(*kind, None, *name))
            }
            [kind, ns, name] if !kind.is_empty() && !ns.is_empty() && !name.is_empty() => {
                Ok(ResourceKey::new(*kind, Some(ns), *name))
            }
            _ => Err(format!("Invalid resource key: {}", s)),
        }
    }
}

impl Serialize for ResourceKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourceKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Declarations
// ============================================================================

/// A desired (or observed) managed resource.
///
/// Everything besides `apiVersion`, `kind` and `metadata` is kept verbatim in
/// `content` (usually `spec`, but `data` for config-like kinds).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDeclaration {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(flatten)]
    pub content: Map<String, Value>,
}

impl ResourceDeclaration {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>, metadata: ObjectMeta) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            metadata,
            content: Map::new(),
        }
    }

    pub fn with_spec(mut self, spec: Value) -> Self {
        self.content.insert("spec".to_string(), spec);
        self
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey {
            kind: self.kind.clone(),
            namespace: self.metadata.namespace.clone(),
            name: self.metadata.name.clone(),
        }
    }

    pub fn spec(&self) -> Option<&Value> {
        self.content.get("spec")
    }

    /// The declared state with controller-owned metadata and `status` removed.
    ///
    /// This is the value fingerprints and field diffs are computed over.
    pub fn normalized(&self) -> Value {
        let user_only = |map: &BTreeMap<String, String>| -> Map<String, Value> {
            map.iter()
                .filter(|(k, _)| !is_controller_key(k))
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect()
        };

        let mut metadata = Map::new();
        metadata.insert("name".into(), Value::String(self.metadata.name.clone()));
        if let Some(ns) = &self.metadata.namespace {
            metadata.insert("namespace".into(), Value::String(ns.clone()));
        }
        let labels = user_only(&self.metadata.labels);
        if !labels.is_empty() {
            metadata.insert("labels".into(), Value::Object(labels));
        }
        let annotations = user_only(&self.metadata.annotations);
        if !annotations.is_empty() {
            metadata.insert("annotations".into(), Value::Object(annotations));
        }

        let mut root = Map::new();
        root.insert("apiVersion".into(), Value::String(self.api_version.clone()));
        root.insert("kind".into(), Value::String(self.kind.clone()));
        root.insert("metadata".into(), Value::Object(metadata));
        for (k, v) in &self.content {
            if k != "status" {
                root.insert(k.clone(), v.clone());
            }
        }
        Value::Object(root)
    }

    /// SHA-256 of the canonical JSON of the normalized declaration.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(canonical_json(&self.normalized()).as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Ordering weight used to apply dependencies before dependents.
    pub fn weight(&self) -> u8 {
        dependency_weight(&self.kind)
    }

    /// The application that owns this object, if it carries the ownership marker.
    pub fn owner(&self) -> Option<&str> {
        let labels = &self.metadata.labels;
        if labels.get(MANAGED_BY_LABEL).map(String::as_str) != Some(MANAGED_BY_VALUE) {
            return None;
        }
        labels.get(APPLICATION_LABEL).map(String::as_str)
    }
}

/// Returns true for labels and annotations written by the controller.
pub fn is_controller_key(key: &str) -> bool {
    key.starts_with(CONTROLLER_PREFIX) || key == MANAGED_BY_LABEL
}

/// Returns true for kinds that never live in a namespace.
pub fn is_cluster_scoped(kind: &str) -> bool {
    CLUSTER_SCOPED_KINDS.contains(&kind)
}

/// Dependency weight of a kind. Lower weights are applied first.
pub fn dependency_weight(kind: &str) -> u8 {
    match kind {
        "Namespace" => 0,
        "CustomResourceDefinition" => 1,
        "ConfigMap" | "Secret" | "ServiceAccount" | "Role" | "RoleBinding" | "ClusterRole"
        | "ClusterRoleBinding" | "PersistentVolumeClaim" => 2,
        "Service" | "Ingress" => 3,
        "Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet" | "Job" | "CronJob" | "Pod" => 4,
        _ => 5,
    }
}

/// Serializes a JSON value with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment(replicas: u64) -> ResourceDeclaration {
        ResourceDeclaration::new(
            "apps/v1",
            "Deployment",
            ObjectMeta::new("web").with_namespace("prod"),
        )
        .with_spec(json!({ "replicas": replicas, "image": "web:1" }))
    }

    #[test]
    fn test_resource_kind_from_str() {
        assert_eq!(
            "application".parse::<ResourceKind>().unwrap(),
            ResourceKind::Application
        );
        assert_eq!(
            "ControllerSettings".parse::<ResourceKind>().unwrap(),
            ResourceKind::ControllerSettings
        );
        assert!("Rule".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn test_key_display_and_parse() {
        let key = ResourceKey::new("Deployment", Some("prod"), "web");
        assert_eq!(key.to_string(), "Deployment/prod/web");
        assert_eq!("Deployment/prod/web".parse::<ResourceKey>().unwrap(), key);

        let cluster = ResourceKey::new("Namespace", None, "prod");
        assert_eq!(cluster.to_string(), "Namespace/prod");
        assert_eq!("Namespace/prod".parse::<ResourceKey>().unwrap(), cluster);

        assert!("Deployment".parse::<ResourceKey>().is_err());
        assert!("a/b/c/d".parse::<ResourceKey>().is_err());
    }

    #[test]
    fn test_fingerprint_ignores_ownership_labels() {
        let plain = deployment(3);
        let mut stamped = plain.clone();
        stamped
            .metadata
            .labels
            .insert(MANAGED_BY_LABEL.into(), MANAGED_BY_VALUE.into());
        stamped
            .metadata
            .labels
            .insert(APPLICATION_LABEL.into(), "shop".into());
        assert_eq!(plain.fingerprint(), stamped.fingerprint());
        assert_eq!(stamped.owner(), Some("shop"));
        assert_eq!(plain.owner(), None);
    }

    #[test]
    fn test_fingerprint_ignores_status_and_tracks_spec() {
        let a = deployment(3);
        let mut with_status = a.clone();
        with_status
            .content
            .insert("status".into(), json!({ "readyReplicas": 3 }));
        assert_eq!(a.fingerprint(), with_status.fingerprint());
        assert_ne!(a.fingerprint(), deployment(1).fingerprint());
    }

    #[test]
    fn test_fingerprint_is_key_order_independent() {
        let a = ResourceDeclaration::new("v1", "ConfigMap", ObjectMeta::new("cfg"))
            .with_spec(json!({ "a": 1, "b": { "x": 1, "y": 2 } }));
        let b = ResourceDeclaration::new("v1", "ConfigMap", ObjectMeta::new("cfg"))
            .with_spec(json!({ "b": { "y": 2, "x": 1 }, "a": 1 }));
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_dependency_weights() {
        assert!(dependency_weight("Namespace") < dependency_weight("CustomResourceDefinition"));
        assert!(dependency_weight("ConfigMap") < dependency_weight("Service"));
        assert!(dependency_weight("Service") < dependency_weight("Deployment"));
        assert!(dependency_weight("Deployment") < dependency_weight("Widget"));
    }

    #[test]
    fn test_declaration_yaml_round_trip_keeps_content() {
        let yaml = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
  namespace: prod
data:
  LOG_LEVEL: debug
"#;
        let decl: ResourceDeclaration = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(decl.key(), ResourceKey::new("ConfigMap", Some("prod"), "settings"));
        assert_eq!(decl.content["data"]["LOG_LEVEL"], json!("debug"));
        assert!(decl.spec().is_none());
    }

    #[test]
    fn test_is_cluster_scoped() {
        assert!(is_cluster_scoped("Namespace"));
        assert!(is_cluster_scoped("ClusterRole"));
        assert!(!is_cluster_scoped("Deployment"));
    }
}
