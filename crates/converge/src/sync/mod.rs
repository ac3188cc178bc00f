//! Sync operations: admission, retry and the engine that drives live state
//! toward a rendered revision.

pub mod engine;
pub mod gate;
pub mod operation;
pub mod policy;

pub use engine::SyncEngine;
pub use gate::{Admission, SyncGate, SyncPermit, SyncRequestOutcome};
pub use operation::{RecordResult, RecordStatus, SyncOperation, SyncOutcome, SyncTrigger};
pub use policy::{retry, RetryError, RetryPolicy};
