//! Controller configuration: `settings.yaml` plus application resources.

pub mod loader;
pub mod schema;

pub use loader::{
    default_config_dir, parse_resource, AnyResource, ConfigLoader, LoadedConfig, ResourceWithPath};
pub use schema::{
    GitAuthSettings, GitAuthType, GitSourceSettings, RetrySettings, RuntimeSettings, RuntimeType,
    SettingsResource, SettingsSpec,
};
