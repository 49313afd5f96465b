//! History compaction.
//!
//! Continuous updates grow the backing history without bound. A
//! [`HistoryCompactor`] takes one consistent snapshot of the tracked paths
//! and replaces the whole history with a single commit holding exactly
//! those files. Document content is untouched; writers that read before the
//! swap see one extra version conflict and retry against the new head.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{Result, StoreError};
use crate::remote::RemoteFileStore;

/// Which paths survive compaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrackedPaths {
    /// Every data file directly under a directory.
    Prefix(String),
    /// A fixed list.
    Explicit(Vec<String>),
}

impl Default for TrackedPaths {
    fn default() -> Self {
        TrackedPaths::Prefix("db".to_string())
    }
}

/// What a compaction run did.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionReport {
    /// Paths carried into the compacted history.
    pub paths: Vec<String>,
    pub previous_head: String,
    pub new_head: String,
    /// History length before the run, when the backend knows it.
    pub commits_before: Option<u64>,
}

/// Squashes a remote's history down to its current tracked state.
///
/// On GitHub the final ref update is a forced `PATCH` that cannot be made
/// conditional. The head is re-read just before it, but a write that lands
/// between that check and the `PATCH` is orphaned even though its writer
/// was told it succeeded. Schedule compaction for a time when writes are
/// quiet, or pause writers around it.
pub struct HistoryCompactor<R: RemoteFileStore + ?Sized> {
    remote: Arc<R>,
    tracked: TrackedPaths,
    message: String,
    max_attempts: u32,
}

impl<R: RemoteFileStore + ?Sized> HistoryCompactor<R> {
    pub fn new(remote: Arc<R>) -> Self {
        Self {
            remote,
            tracked: TrackedPaths::default(),
            message: "Compact database history".to_string(),
            max_attempts: 3,
        }
    }

    #[must_use]
    pub fn with_tracked(mut self, tracked: TrackedPaths) -> Self {
        self.tracked = tracked;
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// How many snapshots to take when writers keep moving the head.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    async fn tracked_paths(&self) -> Result<Vec<String>> {
        match &self.tracked {
            TrackedPaths::Prefix(prefix) => self.remote.list(prefix).await,
            TrackedPaths::Explicit(paths) => Ok(paths.clone()),
        }
    }

    /// Replace the history with one commit of the current tracked files.
    ///
    /// A head that moves between snapshot and swap leaves the history
    /// untouched; the run then starts over from a fresh snapshot.
    #[tracing::instrument(skip(self), fields(message = %self.message))]
    pub async fn run(&self) -> Result<CompactionReport> {
        if !self.remote.write_allowed() {
            return Err(StoreError::WriteDisabled("history".into()));
        }

        let mut attempt = 0;
        loop {
            attempt += 1;

            let paths = self.tracked_paths().await?;
            let commits_before = self.remote.commit_count().await?;
            let snapshot = self.remote.snapshot(&paths).await?;

            match self.remote.replace_history(&snapshot, &self.message).await {
                Ok(commit) => {
                    let report = CompactionReport {
                        paths: snapshot.files.keys().cloned().collect(),
                        previous_head: snapshot.head,
                        new_head: commit.id,
                        commits_before,
                    };
                    info!(
                        paths = report.paths.len(),
                        commits_before = ?report.commits_before,
                        new_head = %report.new_head,
                        "Compacted history"
                    );
                    return Ok(report);
                }
                Err(e @ StoreError::CompactionRaced { .. }) if attempt < self.max_attempts => {
                    warn!(attempt, error = %e, "Head moved during compaction; retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }
}
