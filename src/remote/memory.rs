//! In-process remote with commit history, quota accounting and fault
//! injection.
//!
//! Versions are content-derived (SHA-256 of the blob), so writing identical
//! bytes twice yields the same version, as with git blob ids. Every
//! successful write appends a commit; [`replace_history`] collapses them.
//!
//! [`replace_history`]: RemoteFileStore::replace_history

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;

use super::{is_data_file, RemoteFileStore};
use crate::error::{Result, StoreError};
use crate::types::{CommitInfo, Hash, Quota, RemoteFile, Snapshot, Timestamp, Version};

/// A failure to apply to an upcoming write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Refuse the write as if the quota were exhausted.
    RateLimited { retry_after: Option<Duration> },
    /// Fail the write before it reaches the store.
    Network,
    /// Commit the write, then report a transport failure.
    LostAck,
    /// Hold the write for the given time, then apply it normally.
    Stall(Duration),
}

#[derive(Clone, Debug)]
struct MemoryCommit {
    id: String,
    message: String,
    tree: BTreeMap<String, Version>,
}

#[derive(Debug)]
struct MemoryState {
    blobs: HashMap<Version, Vec<u8>>,
    /// Oldest first; the last entry is the head.
    commits: Vec<MemoryCommit>,
    quota: Quota,
    faults: VecDeque<Fault>,
    barrier: Option<(Arc<Barrier>, usize)>,
    write_attempts: u64,
    requests: u64,
}

impl MemoryState {
    fn head(&self) -> &MemoryCommit {
        // `commits` is never empty: it starts with a root commit and
        // `replace_history` always leaves exactly one.
        &self.commits[self.commits.len() - 1]
    }

    /// Charge one request against the quota.
    fn spend(&mut self) -> Result<()> {
        let now = Timestamp::now().as_secs();
        if self.quota.remaining == 0 {
            if now < self.quota.reset_at {
                return Err(StoreError::RateLimited {
                    retry_after: Some(self.quota.reset_in(now)),
                });
            }
            self.quota.remaining = self.quota.limit;
            self.quota.reset_at = now + 3600;
        }
        self.quota.remaining -= 1;
        self.requests += 1;
        Ok(())
    }

    fn push_commit(&mut self, tree: BTreeMap<String, Version>, message: &str, parent: Option<&str>) -> String {
        let mut parts: Vec<&[u8]> = vec![parent.unwrap_or("").as_bytes(), message.as_bytes()];
        for (path, version) in &tree {
            parts.push(path.as_bytes());
            parts.push(version.as_str().as_bytes());
        }
        let id = Hash::from_parts(&parts).to_hex();
        self.commits.push(MemoryCommit {
            id: id.clone(),
            message: message.to_string(),
            tree,
        });
        id
    }

    fn commit_file(&mut self, path: &str, bytes: &[u8], message: &str) -> Version {
        let version = blob_version(bytes);
        self.blobs.insert(version.clone(), bytes.to_vec());

        let head = self.head();
        let parent = head.id.clone();
        let mut tree = head.tree.clone();
        tree.insert(path.to_string(), version.clone());
        self.push_commit(tree, message, Some(&parent));
        version
    }
}

fn blob_version(bytes: &[u8]) -> Version {
    Version::from(Hash::from_parts(&[b"blob", bytes]))
}

/// In-memory [`RemoteFileStore`].
#[derive(Debug)]
pub struct InMemoryRemote {
    state: Mutex<MemoryState>,
    write_allowed: bool,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemote {
    /// An empty, writable remote with a generous quota.
    pub fn new() -> Self {
        let mut state = MemoryState {
            blobs: HashMap::new(),
            commits: Vec::new(),
            quota: Quota {
                limit: 5000,
                remaining: 5000,
                reset_at: Timestamp::now().as_secs() + 3600,
            },
            faults: VecDeque::new(),
            barrier: None,
            write_attempts: 0,
            requests: 0,
        };
        state.push_commit(BTreeMap::new(), "Initialize database", None);

        Self {
            state: Mutex::new(state),
            write_allowed: true,
        }
    }

    /// A remote that rejects every write with `WriteDisabled`.
    pub fn read_only() -> Self {
        Self {
            write_allowed: false,
            ..Self::new()
        }
    }

    #[must_use]
    pub fn with_quota(self, quota: Quota) -> Self {
        self.state.lock().quota = quota;
        self
    }

    /// Queue a fault for the next write that has none yet.
    pub fn inject_write_fault(&self, fault: Fault) {
        self.state.lock().faults.push_back(fault);
    }

    /// Make the next `parties` writes wait for each other before applying.
    ///
    /// Lets tests force concurrent updates to read before any of them writes.
    pub fn hold_writes(&self, parties: usize) {
        self.state.lock().barrier = Some((Arc::new(Barrier::new(parties)), parties));
    }

    /// Write unconditionally, as an unrelated writer would.
    pub fn put(&self, path: &str, bytes: &[u8], message: &str) -> Version {
        self.state.lock().commit_file(path, bytes, message)
    }

    /// Commit history, oldest first.
    pub fn history(&self) -> Vec<CommitInfo> {
        self.state
            .lock()
            .commits
            .iter()
            .map(|c| CommitInfo {
                id: c.id.clone(),
                message: c.message.clone(),
            })
            .collect()
    }

    pub fn head(&self) -> String {
        self.state.lock().head().id.clone()
    }

    /// File contents as of a given commit.
    pub fn bytes_at(&self, commit_id: &str, path: &str) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let commit = state.commits.iter().find(|c| c.id == commit_id)?;
        let version = commit.tree.get(path)?;
        state.blobs.get(version).cloned()
    }

    /// Number of write calls that reached the remote, including failed ones.
    pub fn write_attempts(&self) -> u64 {
        self.state.lock().write_attempts
    }

    /// Number of requests charged against the quota.
    pub fn requests(&self) -> u64 {
        self.state.lock().requests
    }
}

#[async_trait]
impl RemoteFileStore for InMemoryRemote {
    async fn read(&self, path: &str) -> Result<Option<RemoteFile>> {
        let mut state = self.state.lock();
        state.spend()?;

        let Some(version) = state.head().tree.get(path).cloned() else {
            return Ok(None);
        };
        let bytes = state
            .blobs
            .get(&version)
            .cloned()
            .ok_or_else(|| StoreError::Corruption(format!("Missing blob for {}", path)))?;
        Ok(Some(RemoteFile { bytes, version }))
    }

    async fn write(
        &self,
        path: &str,
        bytes: &[u8],
        expected: Option<&Version>,
        message: &str,
    ) -> Result<Version> {
        if !self.write_allowed {
            return Err(StoreError::WriteDisabled(path.to_string()));
        }

        let (fault, barrier) = {
            let mut state = self.state.lock();
            state.write_attempts += 1;
            let fault = state.faults.pop_front();
            let barrier = match state.barrier.as_mut() {
                Some((barrier, left)) if *left > 0 => {
                    *left -= 1;
                    Some(Arc::clone(barrier))
                }
                _ => None,
            };
            (fault, barrier)
        };

        if let Some(barrier) = barrier {
            barrier.wait().await;
        }
        if let Some(Fault::Stall(duration)) = fault {
            tokio::time::sleep(duration).await;
        }

        let mut state = self.state.lock();
        state.spend()?;

        match fault {
            Some(Fault::RateLimited { retry_after }) => {
                return Err(StoreError::RateLimited { retry_after });
            }
            Some(Fault::Network) => {
                return Err(StoreError::Network("connection reset before send".into()));
            }
            _ => {}
        }

        let current = state.head().tree.get(path);
        if current != expected {
            return Err(StoreError::VersionConflict {
                path: path.to_string(),
                expected: expected.cloned(),
            });
        }

        let version = state.commit_file(path, bytes, message);

        if fault == Some(Fault::LostAck) {
            return Err(StoreError::Network("connection reset after send".into()));
        }
        Ok(version)
    }

    async fn quota(&self) -> Result<Quota> {
        Ok(self.state.lock().quota)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut state = self.state.lock();
        state.spend()?;

        let dir = prefix.trim_end_matches('/');
        let paths = state
            .head()
            .tree
            .keys()
            .filter(|path| {
                let rest = if dir.is_empty() {
                    Some(path.as_str())
                } else {
                    path.strip_prefix(dir).and_then(|r| r.strip_prefix('/'))
                };
                rest.is_some_and(|r| !r.contains('/')) && is_data_file(path)
            })
            .cloned()
            .collect();
        Ok(paths)
    }

    async fn snapshot(&self, paths: &[String]) -> Result<Snapshot> {
        let mut state = self.state.lock();
        state.spend()?;

        let head = state.head();
        let files = paths
            .iter()
            .filter_map(|p| head.tree.get(p).map(|v| (p.clone(), v.clone())))
            .collect();
        Ok(Snapshot {
            head: head.id.clone(),
            files,
        })
    }

    async fn replace_history(&self, snapshot: &Snapshot, message: &str) -> Result<CommitInfo> {
        if !self.write_allowed {
            return Err(StoreError::WriteDisabled("history".into()));
        }

        let mut state = self.state.lock();
        state.spend()?;

        let found = state.head().id.clone();
        if found != snapshot.head {
            return Err(StoreError::CompactionRaced {
                expected: snapshot.head.clone(),
                found,
            });
        }
        if let Some((path, _)) = snapshot
            .files
            .iter()
            .find(|(_, version)| !state.blobs.contains_key(*version))
        {
            return Err(StoreError::Corruption(format!("Missing blob for {}", path)));
        }

        state.commits.clear();
        let id = state.push_commit(snapshot.files.clone(), message, None);

        // Drop blobs no longer reachable.
        let live: Vec<Version> = snapshot.files.values().cloned().collect();
        state.blobs.retain(|version, _| live.contains(version));

        Ok(CommitInfo {
            id,
            message: message.to_string(),
        })
    }

    async fn commit_count(&self) -> Result<Option<u64>> {
        Ok(Some(self.state.lock().commits.len() as u64))
    }

    fn observed_quota(&self) -> Option<Quota> {
        Some(self.state.lock().quota)
    }

    fn write_allowed(&self) -> bool {
        self.write_allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_read() {
        let remote = InMemoryRemote::new();
        assert!(remote.read("db/a.json").await.unwrap().is_none());

        let v1 = remote.write("db/a.json", b"{}", None, "create").await.unwrap();
        let file = remote.read("db/a.json").await.unwrap().unwrap();
        assert_eq!(file.bytes, b"{}");
        assert_eq!(file.version, v1);
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let remote = InMemoryRemote::new();
        let v1 = remote.write("db/a.json", b"1", None, "create").await.unwrap();

        // Creating again conflicts.
        let err = remote.write("db/a.json", b"2", None, "dup").await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));

        let v2 = remote.write("db/a.json", b"2", Some(&v1), "update").await.unwrap();
        assert_ne!(v1, v2);

        // Stale version conflicts.
        let err = remote.write("db/a.json", b"3", Some(&v1), "stale").await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn test_every_write_records_a_commit() {
        let remote = InMemoryRemote::new();
        let v1 = remote.write("db/a.json", b"1", None, "first").await.unwrap();
        remote.write("db/a.json", b"2", Some(&v1), "second").await.unwrap();

        let messages: Vec<String> = remote.history().into_iter().map(|c| c.message).collect();
        assert_eq!(messages, vec!["Initialize database", "first", "second"]);
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes() {
        let remote = InMemoryRemote::read_only();
        let err = remote.write("db/a.json", b"{}", None, "x").await.unwrap_err();
        assert!(matches!(err, StoreError::WriteDisabled(_)));
        assert!(remote.read("db/a.json").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lost_ack_still_commits() {
        let remote = InMemoryRemote::new();
        remote.inject_write_fault(Fault::LostAck);

        let err = remote.write("db/a.json", b"{}", None, "x").await.unwrap_err();
        assert!(matches!(err, StoreError::Network(_)));
        assert!(remote.read("db/a.json").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_network_fault_does_not_commit() {
        let remote = InMemoryRemote::new();
        remote.inject_write_fault(Fault::Network);

        assert!(remote.write("db/a.json", b"{}", None, "x").await.is_err());
        assert!(remote.read("db/a.json").await.unwrap().is_none());
        assert_eq!(remote.write_attempts(), 1);
    }

    #[tokio::test]
    async fn test_quota_exhaustion() {
        let remote = InMemoryRemote::new().with_quota(Quota {
            limit: 2,
            remaining: 2,
            reset_at: Timestamp::now().as_secs() + 60,
        });

        remote.read("db/a.json").await.unwrap();
        remote.read("db/a.json").await.unwrap();
        let err = remote.read("db/a.json").await.unwrap_err();
        assert!(matches!(err, StoreError::RateLimited { retry_after: Some(_) }));
        assert_eq!(remote.observed_quota().unwrap().remaining, 0);
    }

    #[tokio::test]
    async fn test_list_is_one_level() {
        let remote = InMemoryRemote::new();
        remote.put("db/users.json", b"{}", "x");
        remote.put("db/accounts.json.enc", b"x", "x");
        remote.put("db/notes.txt", b"x", "x");
        remote.put("db/archive/old.json", b"{}", "x");
        remote.put("other.json", b"{}", "x");

        let listed = remote.list("db/").await.unwrap();
        assert_eq!(listed, vec!["db/accounts.json.enc", "db/users.json"]);
    }

    #[tokio::test]
    async fn test_replace_history_keeps_snapshot() {
        let remote = InMemoryRemote::new();
        remote.put("db/a.json", b"1", "one");
        remote.put("db/a.json", b"2", "two");
        remote.put("db/b.json", b"3", "three");

        let paths = vec!["db/a.json".to_string(), "db/b.json".to_string()];
        let snapshot = remote.snapshot(&paths).await.unwrap();
        let commit = remote.replace_history(&snapshot, "compact").await.unwrap();

        assert_eq!(remote.history().len(), 1);
        assert_eq!(remote.head(), commit.id);
        assert_eq!(remote.read("db/a.json").await.unwrap().unwrap().bytes, b"2");
        assert_eq!(remote.read("db/b.json").await.unwrap().unwrap().bytes, b"3");
    }

    #[tokio::test]
    async fn test_replace_history_detects_race() {
        let remote = InMemoryRemote::new();
        remote.put("db/a.json", b"1", "one");

        let snapshot = remote.snapshot(&["db/a.json".to_string()]).await.unwrap();
        remote.put("db/a.json", b"2", "racing writer");

        let err = remote.replace_history(&snapshot, "compact").await.unwrap_err();
        assert!(matches!(err, StoreError::CompactionRaced { .. }));
        assert_eq!(remote.history().len(), 3);
    }

    #[tokio::test]
    async fn test_hold_writes_rendezvous() {
        let remote = Arc::new(InMemoryRemote::new());
        remote.hold_writes(2);

        let a = {
            let remote = Arc::clone(&remote);
            tokio::spawn(async move { remote.write("db/a.json", b"a", None, "a").await })
        };
        let b = {
            let remote = Arc::clone(&remote);
            tokio::spawn(async move { remote.write("db/a.json", b"b", None, "b").await })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(StoreError::VersionConflict { .. }))));
    }
}
