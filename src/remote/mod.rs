//! Remote file API abstraction.
//!
//! A [`RemoteFileStore`] is a flat namespace of byte files addressed by
//! hierarchical paths, with compare-and-swap writes and a shared request
//! quota. Two implementations ship with the crate:
//!
//! - [`GitHubRemote`]: the GitHub contents and Git Data APIs over `reqwest`.
//! - [`InMemoryRemote`]: an in-process substrate with commit history and
//!   fault injection, used by tests and for dry runs.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{CommitInfo, Quota, RemoteFile, Snapshot, Version};

pub mod github;
pub mod memory;

pub use github::GitHubRemote;
pub use memory::{Fault, InMemoryRemote};

/// Conditional file access over a remote, non-transactional store.
///
/// Every method is one logical round trip. Implementations never cache
/// version tokens across calls.
#[async_trait]
pub trait RemoteFileStore: Send + Sync {
    /// Read a file and its current version, or `None` if it does not exist.
    async fn read(&self, path: &str) -> Result<Option<RemoteFile>>;

    /// Write `bytes` to `path` if its version still equals `expected`.
    ///
    /// `expected = None` means the file must not exist yet. A stale
    /// expectation fails with `VersionConflict`; the new version is
    /// returned on success and a commit carrying `message` is recorded.
    async fn write(
        &self,
        path: &str,
        bytes: &[u8],
        expected: Option<&Version>,
        message: &str,
    ) -> Result<Version>;

    /// Current rate-limit budget.
    async fn quota(&self) -> Result<Quota>;

    /// Every data file (`*.json`, `*.json.enc`) under `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Versions of `paths` as of a single history head.
    ///
    /// Paths that do not exist at that head are omitted.
    async fn snapshot(&self, paths: &[String]) -> Result<Snapshot>;

    /// Replace the whole history with one commit holding exactly `snapshot`.
    ///
    /// Fails with `CompactionRaced` if the head moved since the snapshot was
    /// taken; nothing is changed in that case.
    async fn replace_history(&self, snapshot: &Snapshot, message: &str) -> Result<CommitInfo>;

    /// Number of commits reachable from the head, when cheaply known.
    async fn commit_count(&self) -> Result<Option<u64>> {
        Ok(None)
    }

    /// Quota learned passively from the most recent response, if any.
    fn observed_quota(&self) -> Option<Quota> {
        None
    }

    /// Whether this remote accepts writes.
    fn write_allowed(&self) -> bool;
}

/// Whether `path` names a data file tracked by the store.
pub fn is_data_file(path: &str) -> bool {
    path.ends_with(".json") || path.ends_with(".json.enc")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_file_filter() {
        assert!(is_data_file("db/users.json"));
        assert!(is_data_file("db/accounts.json.enc"));
        assert!(!is_data_file("db/README.md"));
        assert!(!is_data_file("db/users.json.bak"));
    }
}
