//! Source-of-truth adapters.
//!
//! A `SourceRepository` turns a logical ref into an immutable revision and
//! serves file contents at that revision.

pub mod auth;
pub mod git;
pub mod memory;
pub mod parse;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::application::SourceRef;
use crate::error::SourceError;

pub use git::GitSource;
pub use memory::InMemorySource;

/// An immutable snapshot of the source: a commit or content hash plus the path rendered from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Revision {
    pub id: String,
    pub path: String,
}

impl Revision {
    pub fn new(id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
        }
    }

    /// First 12 characters of the id, for logs.
    pub fn short_id(&self) -> &str {
        let end = self.id.len().min(12);
        &self.id[..end]
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.short_id(), self.path)
    }
}

#[async_trait]
pub trait SourceRepository: Send + Sync {
    /// Resolves the source's ref to the revision it currently points at.
    async fn resolve_ref(&self, source: &SourceRef) -> Result<Revision, SourceError>;

    /// Reads a file at a revision. `path` is relative to the repository root.
    async fn get_file(
        &self,
        source: &SourceRef,
        revision: &Revision,
        path: &str,
    ) -> Result<Vec<u8>, SourceError>;

    /// Lists all files below `dir` (recursively) at a revision, relative to the repository root.
    async fn list_files(
        &self,
        source: &SourceRef,
        revision: &Revision,
        dir: &str,
    ) -> Result<Vec<String>, SourceError>;
}

/// Normalizes a repository-relative path: no leading `./` or `/`, no `.` segments,
/// `..` resolved. Returns `None` if the path escapes the root.
pub fn normalize_path(path: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            s => parts.push(s),
        }
    }
    Some(parts.join("/"))
}

/// Joins a repository-relative directory and a relative path, then normalizes.
pub fn join_path(dir: &str, path: &str) -> Option<String> {
    normalize_path(&format!("{}/{}", dir, path))
}
