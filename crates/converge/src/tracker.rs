//! Resolves logical refs to immutable revisions and remembers the last one seen.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::application::SourceRef;
use crate::error::SourceError;
use crate::source::{Revision, SourceRepository};
use crate::sync::{retry, RetryError, RetryPolicy};

/// A resolved revision and whether it differs from the last one seen for the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedRevision {
    pub revision: Revision,
    pub changed: bool,
}

pub struct RevisionTracker {
    source: Arc<dyn SourceRepository>,
    known: Mutex<HashMap<String, Revision>>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl RevisionTracker {
    pub fn new(source: Arc<dyn SourceRepository>, retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            source,
            known: Mutex::new(HashMap::new()),
            retry,
            timeout,
        }
    }

    pub fn source(&self) -> Arc<dyn SourceRepository> {
        self.source.clone()
    }

    /// Resolves `source` for `application`, retrying transient failures.
    pub async fn resolve(
        &self,
        application: &str,
        source: &SourceRef,
        cancel: &CancellationToken,
    ) -> Result<TrackedRevision, SourceError> {
        let label = format!("Resolving {}@{} for {}", source.repo_url, source.reference, application);
        let revision = retry(&self.retry, cancel, &label, |_| {
            let repository = self.source.clone();
            let source = source.clone();
            let timeout = self.timeout;
            async move {
                tokio::time::timeout(timeout, repository.resolve_ref(&source))
                    .await
                    .map_err(|_| SourceError::Timeout(timeout.as_secs()))?
            }
        })
        .await
        .map_err(|e| match e {
            RetryError::Exhausted { error, .. } => error,
            RetryError::Cancelled => SourceError::Operation("ref resolution cancelled".to_string()),
        })?;

        let mut known = self.known.lock().unwrap_or_else(|e| e.into_inner());
        let changed = known.get(application) != Some(&revision);
        if changed {
            log::info!(
                "Application {} tracks {} at revision {}",
                application,
                source.reference,
                revision.short_id()
            );
            known.insert(application.to_string(), revision.clone());
        }
        Ok(TrackedRevision { revision, changed })
    }

    pub fn last_known(&self, application: &str) -> Option<Revision> {
        self.known
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(application)
            .cloned()
    }

    /// Seeds the last known revision, e.g. from the registry after a restart.
    pub fn remember(&self, application: &str, revision: Revision) {
        self.known
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(application.to_string(), revision);
    }

    pub fn forget(&self, application: &str) {
        self.known
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(application);
    }

    /// Names of the applications whose source matches a push notification.
    ///
    /// Resolution happens later in each application's loop, so repeated
    /// notifications for an unchanged revision lead to no sync.
    pub fn notify<'a>(
        &self,
        repo_url: &str,
        reference: &str,
        applications: impl IntoIterator<Item = (&'a str, &'a SourceRef)>,
    ) -> Vec<String> {
        let mut matched: Vec<String> = applications
            .into_iter()
            .filter(|(_, source)| source.matches(repo_url, reference))
            .map(|(name, _)| name.to_string())
            .collect();
        matched.sort();
        log::debug!(
            "Push notification for {}@{} matched {} applications",
            repo_url,
            reference,
            matched.len()
        );
        matched
    }
}
