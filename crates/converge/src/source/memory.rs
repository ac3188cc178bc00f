//! In-memory source repository for tests and local experiments.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::path::Path;
use std::sync::Mutex;
use walkdir::WalkDir;

use super::{normalize_path, Revision, SourceRepository};
use crate::application::SourceRef;
use crate::error::SourceError;

type Tree = BTreeMap<String, Vec<u8>>;

#[derive(Default)]
struct RepoState {
    refs: HashMap<String, String>,
    commits: HashMap<String, Tree>,
}

/// Repositories keyed by URL, each with named refs pointing at content-hashed trees.
#[derive(Default)]
pub struct InMemorySource {
    repos: Mutex<HashMap<String, RepoState>>,
    unavailable: AtomicBool,
    fail_next: AtomicUsize,
    resolve_calls: AtomicUsize,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `files` as a new tree and points `reference` at it. Returns the revision id.
    ///
    /// The id is a hash of the tree, so committing identical content twice
    /// yields the same revision.
    pub fn commit<P, C>(&self, repo_url: &str, reference: &str, files: impl IntoIterator<Item = (P, C)>) -> String
    where
        P: AsRef<str>,
        C: AsRef<[u8]>,
    {
        let tree: Tree = files
            .into_iter()
            .filter_map(|(p, c)| normalize_path(p.as_ref()).map(|p| (p, c.as_ref().to_vec())))
            .collect();

        let mut hasher = Sha256::new();
        for (path, content) in &tree {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            hasher.update(content);
            hasher.update([0u8]);
        }
        let id = hex::encode(hasher.finalize());

        let mut repos = self.repos.lock().unwrap_or_else(|e| e.into_inner());
        let repo = repos.entry(repo_url.to_string()).or_default();
        repo.commits.insert(id.clone(), tree);
        repo.refs.insert(reference.to_string(), id.clone());
        id
    }

    /// Commits every file below `dir` on disk, skipping hidden entries.
    ///
    /// Lets a working copy be rendered without a git remote.
    pub fn commit_directory(&self, repo_url: &str, reference: &str, dir: &Path) -> Result<String, SourceError> {
        let mut files = Vec::new();
        let walker = WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));
        for entry in walker {
            let entry = entry.map_err(|e| SourceError::Unavailable(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(dir).unwrap_or(entry.path());
            let content = std::fs::read(entry.path()).map_err(|e| {
                SourceError::Unavailable(format!("{}: {}", entry.path().display(), e))
            })?;
            files.push((relative.to_string_lossy().replace('\\', "/"), content));
        }
        Ok(self.commit(repo_url, reference, files))
    }

    /// While set, every call fails with `SourceError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes the next `count` calls fail with `SourceError::Unavailable`.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Number of `resolve_ref` calls made so far.
    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), SourceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable("source is offline".to_string()));
        }
        let consumed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if consumed.is_ok() {
            return Err(SourceError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }

    fn with_tree<T>(
        &self,
        source: &SourceRef,
        revision: &Revision,
        f: impl FnOnce(&Tree) -> Result<T, SourceError>,
    ) -> Result<T, SourceError> {
        let repos = self.repos.lock().unwrap_or_else(|e| e.into_inner());
        let tree = repos
            .get(&source.repo_url)
            .and_then(|repo| repo.commits.get(&revision.id))
            .ok_or_else(|| SourceError::RefNotFound {
                repo: source.repo_url.clone(),
                reference: revision.id.clone(),
            })?;
        f(tree)
    }
}

#[async_trait]
impl SourceRepository for InMemorySource {
    async fn resolve_ref(&self, source: &SourceRef) -> Result<Revision, SourceError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let repos = self.repos.lock().unwrap_or_else(|e| e.into_inner());
        let repo = repos
            .get(&source.repo_url)
            .ok_or_else(|| SourceError::Unavailable(format!("unknown repository '{}'", source.repo_url)))?;

        let id = repo
            .refs
            .get(&source.reference)
            .cloned()
            .or_else(|| {
                repo.commits
                    .contains_key(&source.reference)
                    .then(|| source.reference.clone())
            })
            .ok_or_else(|| SourceError::RefNotFound {
                repo: source.repo_url.clone(),
                reference: source.reference.clone(),
            })?;

        let path = normalize_path(&source.path).unwrap_or_default();
        Ok(Revision::new(id, path))
    }

    async fn get_file(
        &self,
        source: &SourceRef,
        revision: &Revision,
        path: &str,
    ) -> Result<Vec<u8>, SourceError> {
        self.check_available()?;
        let normalized = normalize_path(path).unwrap_or_default();
        self.with_tree(source, revision, |tree| {
            tree.get(&normalized)
                .cloned()
                .ok_or_else(|| SourceError::NotFound {
                    revision: revision.id.clone(),
                    path: path.to_string(),
                })
        })
    }

    async fn list_files(
        &self,
        source: &SourceRef,
        revision: &Revision,
        dir: &str,
    ) -> Result<Vec<String>, SourceError> {
        self.check_available()?;
        let dir = normalize_path(dir).unwrap_or_default();
        let prefix = if dir.is_empty() { String::new() } else { format!("{}/", dir) };
        self.with_tree(source, revision, |tree| {
            Ok(tree
                .keys()
                .filter(|p| p.starts_with(&prefix))
                .cloned()
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPO: &str = "mem://shop";

    fn source(path: &str) -> SourceRef {
        SourceRef::new(REPO, "main", path)
    }

    #[tokio::test]
    async fn test_commit_and_resolve() {
        let src = InMemorySource::new();
        let id = src.commit(REPO, "main", [("deploy/app.yaml", "a: 1")]);
        let rev = src.resolve_ref(&source("./deploy")).await.unwrap();
        assert_eq!(rev.id, id);
        assert_eq!(rev.path, "deploy");

        let same = src.commit(REPO, "main", [("deploy/app.yaml", "a: 1")]);
        assert_eq!(same, id);
        let changed = src.commit(REPO, "main", [("deploy/app.yaml", "a: 2")]);
        assert_ne!(changed, id);
    }

    #[tokio::test]
    async fn test_commit_directory_skips_hidden() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("deploy")).unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join("deploy/app.yaml"), "a: 1").unwrap();
        std::fs::write(dir.path().join(".git/HEAD"), "ref").unwrap();

        let src = InMemorySource::new();
        src.commit_directory(REPO, "main", dir.path()).unwrap();
        let rev = src.resolve_ref(&source("deploy")).await.unwrap();
        let files = src.list_files(&source("deploy"), &rev, "").await.unwrap();
        assert_eq!(files, vec!["deploy/app.yaml"]);
    }

    #[tokio::test]
    async fn test_missing_ref() {
        let src = InMemorySource::new();
        src.commit(REPO, "main", [("x.yaml", "")]);
        let mut s = source(".");
        s.reference = "release".into();
        assert!(matches!(
            src.resolve_ref(&s).await,
            Err(SourceError::RefNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_get_and_list_files() {
        let src = InMemorySource::new();
        src.commit(
            REPO,
            "main",
            [
                ("deploy/a.yaml", "a"),
                ("deploy/nested/b.yaml", "b"),
                ("docs/readme.md", "c"),
            ],
        );
        let rev = src.resolve_ref(&source("deploy")).await.unwrap();
        let files = src.list_files(&source("deploy"), &rev, "deploy").await.unwrap();
        assert_eq!(files, vec!["deploy/a.yaml", "deploy/nested/b.yaml"]);

        let content = src.get_file(&source("deploy"), &rev, "./deploy/a.yaml").await.unwrap();
        assert_eq!(content, b"a");
        assert!(matches!(
            src.get_file(&source("deploy"), &rev, "deploy/zzz.yaml").await,
            Err(SourceError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let src = InMemorySource::new();
        src.commit(REPO, "main", [("a.yaml", "")]);
        src.fail_next(2);
        assert!(src.resolve_ref(&source(".")).await.is_err());
        assert!(src.resolve_ref(&source(".")).await.is_err());
        assert!(src.resolve_ref(&source(".")).await.is_ok());
        assert_eq!(src.resolve_calls(), 3);

        src.set_unavailable(true);
        assert!(matches!(
            src.resolve_ref(&source(".")).await,
            Err(SourceError::Unavailable(_))
        ));
    }
}
