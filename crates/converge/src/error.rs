//! Error taxonomy for the controller.
//!
//! Each concern has its own enum so callers can decide on retries without
//! string matching. `ConvergeError` aggregates them for the public API.

use std::path::PathBuf;
use thiserror::Error;

use crate::manifest::ResourceKey;
use crate::registry::RegistryError;

/// Errors that are worth retrying with backoff report `true` here.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Failures while resolving refs or reading files from the source of truth.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("Ref '{reference}' not found in '{repo}'")]
    RefNotFound { repo: String, reference: String },

    #[error("File '{path}' not found at revision {revision}")]
    NotFound { revision: String, path: String },

    #[error("Source unavailable: {0}")]
    Unavailable(String),

    #[error("Source operation timed out after {0}s")]
    Timeout(u64),

    #[error("Source authentication failed: {0}")]
    AuthFailed(String),

    #[error("Git operation failed: {0}")]
    Operation(String),
}

impl Retryable for SourceError {
    fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Unavailable(_) | SourceError::Timeout(_))
    }
}

/// Failures while expanding a revision into resource declarations.
///
/// Never retried automatically: the same revision renders the same way.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("Failed to parse '{path}': {message}")]
    Parse { path: String, message: String },

    #[error("Overlay base '{path}' does not exist")]
    MissingBase { path: String },

    #[error("Overlay base cycle detected at '{path}'")]
    BaseCycle { path: String },

    #[error("Template error in '{path}': {message}")]
    Template { path: String, message: String },

    #[error("Duplicate resource declaration: {key}")]
    DuplicateResource { key: ResourceKey },

    #[error("Invalid resource '{resource}': {message}")]
    Invalid { resource: String, message: String },

    #[error("Source error while rendering: {0}")]
    Source(#[from] SourceError),
}

/// Failures talking to the target runtime.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("Runtime unavailable: {0}")]
    Unavailable(String),

    #[error("Conflict applying {key}: {message}")]
    Conflict { key: ResourceKey, message: String },

    #[error("Forbidden: {key}: {message}")]
    Forbidden { key: ResourceKey, message: String },

    #[error("Resource not found: {key}")]
    NotFound { key: ResourceKey },

    #[error("Runtime call timed out after {0}ms")]
    Timeout(u64),

    #[error("Runtime I/O error: {0}")]
    Io(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Retryable for RuntimeError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            RuntimeError::Unavailable(_)
                | RuntimeError::Conflict { .. }
                | RuntimeError::Timeout(_)
                | RuntimeError::Io(_)
        )
    }
}

/// Actions the sync policy does not authorize. Reported, never auto-resolved.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyViolation {
    #[error("Prune disabled: {key} is not declared but was left in place")]
    PruneNotAllowed { key: ResourceKey },

    #[error("Automated sync is disabled for application '{application}'")]
    AutomationDisabled { application: String },
}

/// Errors loading controller configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read config directory '{path}': {message}")]
    ReadDirectory { path: PathBuf, message: String },

    #[error("Failed to parse YAML in '{path}': {message}")]
    ParseYaml { path: PathBuf, message: String },

    #[error("Schema validation failed for '{path}': {errors}")]
    SchemaValidation { path: PathBuf, errors: String },

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Duplicate {kind} named '{name}'")]
    DuplicateName { kind: String, name: String },
}

/// Top-level error for controller operations.
#[derive(Error, Debug)]
pub enum ConvergeError {
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Policy violation: {0}")]
    Policy(#[from] PolicyViolation),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Application not found: {0}")]
    ApplicationNotFound(String),

    #[error("Invalid application: {0}")]
    InvalidApplication(String),
}

pub type Result<T> = std::result::Result<T, ConvergeError>;
