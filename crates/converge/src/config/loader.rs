//! Loads controller configuration from a directory of YAML resources.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::schema::SettingsResource;
use crate::application::{validate_application, ApplicationResource};
use crate::error::ConfigError;
use crate::manifest::{ResourceKind, API_VERSION};

const SETTINGS_SCHEMA: &str = include_str!("../../schema/settings-v1.json");
const APPLICATION_SCHEMA: &str = include_str!("../../schema/application-v1.json");

type Result<T> = std::result::Result<T, ConfigError>;

/// A resource together with the file it was loaded from, relative to the config directory.
#[derive(Debug, Clone)]
pub struct ResourceWithPath<T> {
    pub resource: T,
    pub path: PathBuf,
}

impl<T> ResourceWithPath<T> {
    pub fn new(resource: T, path: PathBuf) -> Self {
        Self { resource, path }
    }
}

/// Any resource that may appear in the config directory.
#[derive(Debug, Clone)]
pub enum AnyResource {
    Settings(SettingsResource),
    Application(ApplicationResource),
}

/// Everything found in the config directory.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// The settings resource. Defaults apply when the directory has none.
    pub settings: SettingsResource,
    pub settings_path: Option<PathBuf>,
    /// Application resources, sorted by name.
    pub applications: Vec<ResourceWithPath<ApplicationResource>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceHeader {
    api_version: String,
    kind: String,
}

pub struct ConfigLoader {
    config_dir: PathBuf,
}

/// `~/.config/converge` on Linux, the platform equivalent elsewhere.
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("converge"))
}

impl ConfigLoader {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Loads every YAML resource below the config directory.
    ///
    /// Hidden files and directories are skipped. A second settings resource
    /// or two applications with the same name are errors.
    pub fn load(&self) -> Result<LoadedConfig> {
        if !self.config_dir.is_dir() {
            return Err(ConfigError::ReadDirectory {
                path: self.config_dir.clone(),
                message: "not a directory".to_string(),
            });
        }

        let mut settings: Option<ResourceWithPath<SettingsResource>> = None;
        let mut applications: Vec<ResourceWithPath<ApplicationResource>> = Vec::new();

        let walker = WalkDir::new(&self.config_dir)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()));

        for entry in walker {
            let entry = entry.map_err(|e| ConfigError::ReadDirectory {
                path: self.config_dir.clone(),
                message: e.to_string(),
            })?;
            let path = entry.path();
            if !entry.file_type().is_file() || !is_yaml(path) {
                continue;
            }
            let relative = path
                .strip_prefix(&self.config_dir)
                .unwrap_or(path)
                .to_path_buf();

            match self.load_file(path)? {
                AnyResource::Settings(resource) => {
                    if settings.is_some() {
                        return Err(ConfigError::DuplicateName {
                            kind: ResourceKind::ControllerSettings.to_string(),
                            name: resource.metadata.name,
                        });
                    }
                    settings = Some(ResourceWithPath::new(resource, relative));
                }
                AnyResource::Application(resource) => {
                    if applications
                        .iter()
                        .any(|a| a.resource.metadata.name == resource.metadata.name)
                    {
                        return Err(ConfigError::DuplicateName {
                            kind: ResourceKind::Application.to_string(),
                            name: resource.metadata.name,
                        });
                    }
                    applications.push(ResourceWithPath::new(resource, relative));
                }
            }
        }

        applications.sort_by(|a, b| a.resource.metadata.name.cmp(&b.resource.metadata.name));
        log::info!(
            "Loaded config from {}: {} applications{}",
            self.config_dir.display(),
            applications.len(),
            if settings.is_some() { "" } else { ", default settings" }
        );

        let (settings, settings_path) = match settings {
            Some(s) => (s.resource, Some(s.path)),
            None => (SettingsResource::default(), None),
        };
        Ok(LoadedConfig {
            settings,
            settings_path,
            applications,
        })
    }

    pub fn load_file(&self, path: &Path) -> Result<AnyResource> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        parse_resource(&content, path)
    }
}

/// Parses, schema-checks and validates one resource.
pub fn parse_resource(content: &str, path: &Path) -> Result<AnyResource> {
    let value: Value = serde_yaml::from_str(content).map_err(|e| ConfigError::ParseYaml {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let header: ResourceHeader =
        serde_json::from_value(value.clone()).map_err(|e| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    if header.api_version != API_VERSION {
        return Err(ConfigError::Validation {
            message: format!(
                "{}: unsupported apiVersion '{}', expected '{}'",
                path.display(),
                header.api_version,
                API_VERSION
            ),
        });
    }

    match header.kind.parse::<ResourceKind>() {
        Ok(ResourceKind::ControllerSettings) => {
            validate_schema(SETTINGS_SCHEMA, &value, path)?;
            Ok(AnyResource::Settings(deserialize(value, path)?))
        }
        Ok(ResourceKind::Application) => {
            validate_schema(APPLICATION_SCHEMA, &value, path)?;
            let resource: ApplicationResource = deserialize(value, path)?;
            validate_application(&resource.metadata.name, &resource.spec).map_err(|e| {
                ConfigError::Validation {
                    message: format!("{}: {}", path.display(), e),
                }
            })?;
            Ok(AnyResource::Application(resource))
        }
        _ => Err(ConfigError::Validation {
            message: format!(
                "{}: kind '{}' does not belong in the config directory",
                path.display(),
                header.kind
            ),
        }),
    }
}

fn deserialize<T: DeserializeOwned>(value: Value, path: &Path) -> Result<T> {
    serde_json::from_value(value).map_err(|e| ConfigError::ParseYaml {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn validate_schema(schema: &str, value: &Value, path: &Path) -> Result<()> {
    let schema: Value = serde_json::from_str(schema).map_err(|e| ConfigError::Validation {
        message: format!("Invalid embedded schema JSON: {}", e),
    })?;
    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let errors: Vec<String> = validator.iter_errors(value).map(|e| e.to_string()).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::SchemaValidation {
            path: path.to_path_buf(),
            errors: errors.join("; "),
        })
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().map(|s| s.starts_with('.')).unwrap_or(false)
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SETTINGS: &str = r#"
apiVersion: converge.io/v1
kind: ControllerSettings
metadata:
  name: default
spec:
  defaultPollInterval: 60
  runtime:
    type: memory
"#;

    fn application(name: &str) -> String {
        format!(
            r#"
apiVersion: converge.io/v1
kind: Application
metadata:
  name: {}
spec:
  source:
    repoUrl: https://git.example.com/shop.git
    ref: main
    path: deploy/prod
  destination:
    namespace: prod
  syncPolicy:
    automated: true
    prune: true
"#,
            name
        )
    }

    fn setup() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("settings.yaml"), SETTINGS).unwrap();
        fs::create_dir_all(dir.path().join("applications/team-a")).unwrap();
        fs::write(dir.path().join("applications/shop.yaml"), application("shop")).unwrap();
        fs::write(
            dir.path().join("applications/team-a/billing.yml"),
            application("billing"),
        )
        .unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git/config.yaml"), "not: [yaml").unwrap();
        fs::write(dir.path().join("README.md"), "# config").unwrap();
        dir
    }

    #[test]
    fn test_load_config_dir() {
        let dir = setup();
        let config = ConfigLoader::new(dir.path()).load().unwrap();
        assert_eq!(config.settings.spec.default_poll_interval, 60);
        assert_eq!(config.settings_path, Some(PathBuf::from("settings.yaml")));
        let names: Vec<&str> = config
            .applications
            .iter()
            .map(|a| a.resource.metadata.name.as_str())
            .collect();
        assert_eq!(names, vec!["billing", "shop"]);
        let shop = &config.applications[1].resource.spec;
        assert!(shop.sync_policy.prune);
        assert!(!shop.sync_policy.self_heal);
        assert_eq!(shop.destination.endpoint, "local");
    }

    #[test]
    fn test_missing_settings_uses_defaults() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("shop.yaml"), application("shop")).unwrap();
        let config = ConfigLoader::new(dir.path()).load().unwrap();
        assert!(config.settings_path.is_none());
        assert_eq!(config.settings.spec.default_poll_interval, 180);
        assert_eq!(config.applications.len(), 1);
    }

    #[test]
    fn test_duplicate_application() {
        let dir = setup();
        fs::write(dir.path().join("applications/again.yaml"), application("shop")).unwrap();
        let result = ConfigLoader::new(dir.path()).load();
        assert!(matches!(result, Err(ConfigError::DuplicateName { name, .. }) if name == "shop"));
    }

    #[test]
    fn test_schema_violation() {
        let content = application("shop").replace("automated: true", "automated: sometimes");
        let result = parse_resource(&content, Path::new("shop.yaml"));
        assert!(matches!(result, Err(ConfigError::SchemaValidation { .. })));
    }

    #[test]
    fn test_typed_validation_and_api_version() {
        let content = application("shop").replace("path: deploy/prod", "path: ../escape");
        assert!(matches!(
            parse_resource(&content, Path::new("shop.yaml")),
            Err(ConfigError::Validation { .. })
        ));

        let content = application("shop").replace("converge.io/v1", "converge.io/v2");
        assert!(matches!(
            parse_resource(&content, Path::new("shop.yaml")),
            Err(ConfigError::Validation { .. })
        ));
    }

    #[test]
    fn test_missing_directory() {
        let result = ConfigLoader::new("/nonexistent/converge").load();
        assert!(matches!(result, Err(ConfigError::ReadDirectory { .. })));
    }
}
