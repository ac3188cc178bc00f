//! Git-backed source repository.
//!
//! Each tracked repository is kept as a bare mirror under the cache
//! directory. Resolving a ref fetches the mirror; file reads go straight to
//! the object database with `git show` and `git ls-tree`.

use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command as TokioCommand;
use tokio::sync::Mutex;

use super::auth::build_auth_env;
use super::parse::{classify_git_error, format_git_error, is_commit_id, parse_ls_tree};
use super::{normalize_path, Revision, SourceRepository};
use crate::application::SourceRef;
use crate::config::schema::{GitAuthSettings, GitSourceSettings};
use crate::error::SourceError;

pub struct GitSource {
    cache_dir: PathBuf,
    auth: GitAuthSettings,
    timeout: Duration,
    /// Serializes git operations per mirror; concurrent fetches into one repo collide.
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl GitSource {
    pub fn new(cache_dir: impl Into<PathBuf>, auth: GitAuthSettings, timeout: Duration) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            auth,
            timeout,
            locks: DashMap::new(),
        }
    }

    pub fn from_settings(settings: &GitSourceSettings, timeout: Duration) -> Self {
        Self::new(
            crate::secrets::expand_home(&settings.cache_dir),
            settings.auth.clone(),
            timeout,
        )
    }

    /// Directory of the bare mirror for `repo_url`.
    pub fn mirror_dir(&self, repo_url: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(repo_url.as_bytes()));
        self.cache_dir.join(&digest[..16])
    }

    fn lock_for(&self, repo_url: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(repo_url.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn run_git(&self, dir: Option<&Path>, args: &[&str]) -> Result<Output, SourceError> {
        let auth_env = build_auth_env(&self.auth)?;

        let mut cmd = TokioCommand::new("git");
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &auth_env.env_vars {
            cmd.env(key, value);
        }

        log::debug!("git {}", args.join(" "));
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| SourceError::Timeout(self.timeout.as_secs()))?
            .map_err(|e| SourceError::Operation(format!("Failed to run git: {}", e)))?;

        drop(auth_env);
        Ok(output)
    }

    async fn ensure_mirror(&self, repo_url: &str) -> Result<PathBuf, SourceError> {
        let dir = self.mirror_dir(repo_url);

        if dir.join("HEAD").exists() {
            let output = self
                .run_git(
                    Some(&dir),
                    &[
                        "fetch",
                        "--prune",
                        "--quiet",
                        repo_url,
                        "+refs/heads/*:refs/heads/*",
                        "+refs/tags/*:refs/tags/*",
                    ],
                )
                .await?;
            if !output.status.success() {
                return Err(classify_git_error(&format_git_error(&output)));
            }
            return Ok(dir);
        }

        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|e| SourceError::Operation(format!("Failed to create git cache dir: {}", e)))?;

        let dir_str = dir.to_string_lossy().to_string();
        log::info!("Cloning {} into {}", repo_url, dir_str);
        let output = self
            .run_git(None, &["clone", "--bare", "--quiet", repo_url, &dir_str])
            .await?;
        if !output.status.success() {
            let _ = tokio::fs::remove_dir_all(&dir).await;
            return Err(classify_git_error(&format_git_error(&output)));
        }
        Ok(dir)
    }

    async fn has_commit(&self, dir: &Path, id: &str) -> bool {
        let spec = format!("{}^{{commit}}", id);
        self.run_git(Some(dir), &["cat-file", "-e", &spec])
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}

#[async_trait]
impl SourceRepository for GitSource {
    async fn resolve_ref(&self, source: &SourceRef) -> Result<Revision, SourceError> {
        let lock = self.lock_for(&source.repo_url);
        let _guard = lock.lock().await;

        let path = normalize_path(&source.path).unwrap_or_default();
        let dir = self.mirror_dir(&source.repo_url);

        // Commits are immutable, so a pinned ref that is already mirrored needs no fetch.
        if is_commit_id(&source.reference) && self.has_commit(&dir, &source.reference).await {
            return Ok(Revision::new(source.reference.to_lowercase(), path));
        }

        let dir = self.ensure_mirror(&source.repo_url).await?;
        let spec = format!("{}^{{commit}}", source.reference);
        let output = self
            .run_git(Some(&dir), &["rev-parse", "--verify", "--quiet", &spec])
            .await?;

        if !output.status.success() {
            return Err(SourceError::RefNotFound {
                repo: source.repo_url.clone(),
                reference: source.reference.clone(),
            });
        }

        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        log::debug!("Resolved {}@{} to {}", source.repo_url, source.reference, id);
        Ok(Revision::new(id, path))
    }

    async fn get_file(
        &self,
        source: &SourceRef,
        revision: &Revision,
        path: &str,
    ) -> Result<Vec<u8>, SourceError> {
        let normalized = normalize_path(path).ok_or_else(|| SourceError::NotFound {
            revision: revision.id.clone(),
            path: path.to_string(),
        })?;
        let dir = self.mirror_dir(&source.repo_url);
        let object = format!("{}:{}", revision.id, normalized);

        let output = self.run_git(Some(&dir), &["show", &object]).await?;
        if output.status.success() {
            return Ok(output.stdout);
        }

        let message = format_git_error(&output);
        let lower = message.to_lowercase();
        if lower.contains("does not exist") || lower.contains("exists on disk, but not in") {
            Err(SourceError::NotFound {
                revision: revision.id.clone(),
                path: normalized,
            })
        } else {
            Err(classify_git_error(&message))
        }
    }

    async fn list_files(
        &self,
        source: &SourceRef,
        revision: &Revision,
        dir: &str,
    ) -> Result<Vec<String>, SourceError> {
        let mirror = self.mirror_dir(&source.repo_url);
        let dir = normalize_path(dir).unwrap_or_default();

        let mut args = vec!["ls-tree", "-r", "--name-only", revision.id.as_str()];
        if !dir.is_empty() {
            args.push("--");
            args.push(dir.as_str());
        }

        let output = self.run_git(Some(&mirror), &args).await?;
        if !output.status.success() {
            return Err(classify_git_error(&format_git_error(&output)));
        }
        Ok(parse_ls_tree(&String::from_utf8_lossy(&output.stdout)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn git(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .current_dir(dir)
            .args(["-c", "user.email=test@converge.local", "-c", "user.name=test"])
            .args(args)
            .output()
            .unwrap();
        assert!(status.status.success(), "git {:?} failed", args);
    }

    fn make_upstream() -> TempDir {
        let dir = TempDir::new().unwrap();
        git(dir.path(), &["init", "--quiet", "--initial-branch=main"]);
        std::fs::create_dir_all(dir.path().join("deploy")).unwrap();
        std::fs::write(dir.path().join("deploy/app.yaml"), "kind: ConfigMap\n").unwrap();
        git(dir.path(), &["add", "."]);
        git(dir.path(), &["commit", "--quiet", "-m", "initial"]);
        dir
    }

    #[tokio::test]
    async fn test_resolve_and_read_local_repo() {
        let upstream = make_upstream();
        let cache = TempDir::new().unwrap();
        let src = GitSource::new(cache.path(), GitAuthSettings::default(), Duration::from_secs(30));

        let source = SourceRef::new(upstream.path().to_string_lossy(), "main", "./deploy");
        let rev = src.resolve_ref(&source).await.unwrap();
        assert_eq!(rev.id.len(), 40);
        assert_eq!(rev.path, "deploy");

        let files = src.list_files(&source, &rev, "deploy").await.unwrap();
        assert_eq!(files, vec!["deploy/app.yaml"]);

        let content = src.get_file(&source, &rev, "deploy/app.yaml").await.unwrap();
        assert_eq!(content, b"kind: ConfigMap\n");

        assert!(matches!(
            src.get_file(&source, &rev, "deploy/missing.yaml").await,
            Err(SourceError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_resolve_picks_up_new_commits() {
        let upstream = make_upstream();
        let cache = TempDir::new().unwrap();
        let src = GitSource::new(cache.path(), GitAuthSettings::default(), Duration::from_secs(30));
        let source = SourceRef::new(upstream.path().to_string_lossy(), "main", "deploy");

        let first = src.resolve_ref(&source).await.unwrap();
        std::fs::write(upstream.path().join("deploy/app.yaml"), "kind: Secret\n").unwrap();
        git(upstream.path(), &["commit", "--quiet", "-am", "second"]);
        let second = src.resolve_ref(&source).await.unwrap();
        assert_ne!(first.id, second.id);

        let pinned = SourceRef::new(upstream.path().to_string_lossy(), first.id.clone(), "deploy");
        assert_eq!(src.resolve_ref(&pinned).await.unwrap().id, first.id);
    }

    #[tokio::test]
    async fn test_unknown_ref() {
        let upstream = make_upstream();
        let cache = TempDir::new().unwrap();
        let src = GitSource::new(cache.path(), GitAuthSettings::default(), Duration::from_secs(30));
        let source = SourceRef::new(upstream.path().to_string_lossy(), "does-not-exist", ".");
        assert!(matches!(
            src.resolve_ref(&source).await,
            Err(SourceError::RefNotFound { .. })
        ));
    }
}
