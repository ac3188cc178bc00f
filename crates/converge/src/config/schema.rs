//! Controller settings resource.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::manifest::{Resource, ResourceKind};
use crate::secrets::CredentialRef;
use crate::sync::RetryPolicy;

/// Settings resource as declared in `settings.yaml`.
pub type SettingsResource = Resource<SettingsSpec>;

impl Default for SettingsResource {
    fn default() -> Self {
        Resource::new(ResourceKind::ControllerSettings, "default", SettingsSpec::default())
    }
}

/// Global controller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsSpec {
    /// SQLite database holding the application registry.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Address the control API listens on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Seconds between revision checks for applications without their own interval.
    #[serde(default = "default_poll_interval")]
    pub default_poll_interval: u64,

    /// Seconds a live-state snapshot may be reused before it is re-listed.
    #[serde(default = "default_cache_max_age")]
    pub cache_max_age: u64,

    /// Seconds allowed for a single source or runtime call.
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout: u64,

    #[serde(default)]
    pub retry: RetrySettings,

    /// Seconds after a sync during which unready resources count as Progressing.
    #[serde(default = "default_health_grace_period")]
    pub health_grace_period: u64,

    /// Automatic re-syncs allowed while Degraded before raising an alert.
    #[serde(default = "default_max_self_heal_attempts")]
    pub max_self_heal_attempts: u32,

    #[serde(default)]
    pub runtime: RuntimeSettings,

    #[serde(default)]
    pub git: GitSourceSettings,
}

impl Default for SettingsSpec {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            listen_addr: default_listen_addr(),
            default_poll_interval: default_poll_interval(),
            cache_max_age: default_cache_max_age(),
            operation_timeout: default_operation_timeout(),
            retry: RetrySettings::default(),
            health_grace_period: default_health_grace_period(),
            max_self_heal_attempts: default_max_self_heal_attempts(),
            runtime: RuntimeSettings::default(),
            git: GitSourceSettings::default(),
        }
    }
}

impl SettingsSpec {
    pub fn database_path(&self) -> PathBuf {
        crate::secrets::expand_home(&self.database_path)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.default_poll_interval)
    }

    pub fn cache_max_age(&self) -> Duration {
        Duration::from_secs(self.cache_max_age)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout)
    }

    pub fn health_grace_period(&self) -> Duration {
        Duration::from_secs(self.health_grace_period)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }
}

fn default_database_path() -> String {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .map(|d| d.join("converge").join("registry.db"))
        .unwrap_or_else(|| PathBuf::from("converge-registry.db"))
        .display()
        .to_string()
}

fn default_listen_addr() -> String {
    "127.0.0.1:7420".to_string()
}

fn default_poll_interval() -> u64 {
    180
}

fn default_cache_max_age() -> u64 {
    30
}

fn default_operation_timeout() -> u64 {
    30
}

fn default_health_grace_period() -> u64 {
    120
}

fn default_max_self_heal_attempts() -> u32 {
    3
}

/// Retry budget for transient source and runtime failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySettings {
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    4
}

fn default_base_delay_ms() -> u64 {
    2000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Resources written as YAML files below `root`.
    #[default]
    Filesystem,
    /// Simulated in-process runtime, lost on restart.
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSettings {
    #[serde(default, rename = "type")]
    pub runtime_type: RuntimeType,

    #[serde(default = "default_runtime_root")]
    pub root: String,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            runtime_type: RuntimeType::default(),
            root: default_runtime_root(),
        }
    }
}

fn default_runtime_root() -> String {
    "./live".to_string()
}

/// Git source configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitSourceSettings {
    /// Directory holding bare mirrors of tracked repositories.
    #[serde(default = "default_git_cache_dir")]
    pub cache_dir: String,

    #[serde(default)]
    pub auth: GitAuthSettings,
}

impl Default for GitSourceSettings {
    fn default() -> Self {
        Self {
            cache_dir: default_git_cache_dir(),
            auth: GitAuthSettings::default(),
        }
    }
}

fn default_git_cache_dir() -> String {
    dirs::cache_dir()
        .map(|d| d.join("converge").join("repos"))
        .unwrap_or_else(|| PathBuf::from(".converge-repos"))
        .display()
        .to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitAuthSettings {
    /// Authentication type: none, token, or ssh-key.
    #[serde(default, rename = "type")]
    pub auth_type: GitAuthType,

    /// Token for HTTPS remotes.
    #[serde(default)]
    pub token: CredentialRef,

    /// Path to an SSH private key. Defaults to `~/.ssh/id_ed25519`.
    #[serde(default)]
    pub ssh_key_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GitAuthType {
    #[default]
    None,
    Token,
    SshKey,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults_from_minimal_yaml() {
        let yaml = r#"
apiVersion: converge.io/v1
kind: ControllerSettings
metadata:
  name: default
spec: {}
"#;
        let settings: SettingsResource = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(settings.kind, ResourceKind::ControllerSettings);
        assert_eq!(settings.spec.default_poll_interval, 180);
        assert_eq!(settings.spec.retry.max_attempts, 4);
        assert_eq!(settings.spec.runtime.runtime_type, RuntimeType::Filesystem);
        assert_eq!(settings.spec.git.auth.auth_type, GitAuthType::None);
        assert!(settings.spec.database_path.ends_with("registry.db"));
    }

    #[test]
    fn test_settings_overrides() {
        let yaml = r#"
apiVersion: converge.io/v1
kind: ControllerSettings
metadata:
  name: default
spec:
  listenAddr: 0.0.0.0:9000
  retry:
    maxAttempts: 2
    baseDelayMs: 10
  runtime:
    type: memory
  git:
    auth:
      type: token
      token:
        envVar: GIT_TOKEN
"#;
        let settings: SettingsResource = serde_yaml::from_str(yaml).unwrap();
        let spec = settings.spec;
        assert_eq!(spec.listen_addr, "0.0.0.0:9000");
        assert_eq!(spec.runtime.runtime_type, RuntimeType::Memory);
        assert_eq!(spec.git.auth.auth_type, GitAuthType::Token);
        assert_eq!(spec.git.auth.token.env_var.as_deref(), Some("GIT_TOKEN"));

        let policy = spec.retry_policy();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.base_delay, Duration::from_millis(10));
        assert_eq!(policy.max_delay, Duration::from_millis(30_000));
    }
}
