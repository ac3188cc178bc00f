//! Shared test utilities for converge integration tests.
//!
//! This module provides:
//! - `TestHarness`, a control plane wired to an in-memory source, runtime and registry
//! - Builders for application specs and manifests

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::TestHarness;
