pub mod application;
pub mod config;
pub mod control;
pub mod controller;
pub mod diff;
pub mod error;
pub mod events;
pub mod health;
pub mod manifest;
pub mod observer;
pub mod registry;
pub mod runtime;
pub mod secrets;
pub mod source;
pub mod sync;
pub mod tracker;

pub use application::{
    validate_application, Application, ApplicationResource, ApplicationSpec, ApplicationStatus,
    Destination, PolicyOverride, SourceRef, SyncPhase, SyncPolicy,
};
pub use config::{ConfigLoader, LoadedConfig, SettingsResource, SettingsSpec};
pub use control::ControlPlane;
pub use controller::{Controller, LoopSettings, LoopTrigger};
pub use diff::{diff, DiffOp, DiffRecord, DiffReport};
pub use error::{
    ConfigError, ConvergeError, PolicyViolation, RenderError, Result, Retryable, RuntimeError,
    SourceError,
};
pub use events::{ControllerEvent, EventBroadcaster, EventKind};
pub use health::{HealthEvaluator, HealthReport, HealthStatus};
pub use manifest::{ManifestRenderer, Resource, ResourceDeclaration, ResourceKey, ResourceKind};
pub use observer::{LiveSnapshot, LiveStateObserver, ObserveRequest};
pub use registry::{Registry, RegistryError};
pub use runtime::{FilesystemRuntime, InMemoryRuntime, Scope, TargetRuntime};
pub use source::{GitSource, InMemorySource, Revision, SourceRepository};
pub use sync::{RetryPolicy, SyncEngine, SyncOperation, SyncOutcome, SyncRequestOutcome, SyncTrigger};
pub use tracker::{RevisionTracker, TrackedRevision};
