//! Filesystem-backed document store.
//!
//! Documents live as plain files under a root directory. There is no
//! compare-and-swap here: each read-modify-write cycle runs under an
//! exclusive lock on its path instead, so conflicts cannot arise. Versions
//! are still content hashes, keeping call sites identical to the remote
//! store.
//!
//! Layout:
//!
//! ```text
//! <root>/
//!   db/users.json          documents, addressed by relative path
//!   .repodb/locks/*.lock   one advisory lock file per path
//!   .repodb/commits.log    commit journal
//!   .repodb/commits.lock   guards the journal across processes
//! ```

use async_trait::async_trait;
use std::ffi::OsStr;
use std::future::Future;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use super::journal::{CommitEntry, CommitJournal};
use super::locks::{FileLock, PathLocks};
use crate::compact::CompactionReport;
use crate::crypto::{decode_content, encode_content, CryptoCodec, EncryptionPolicy};
use crate::error::{Result, StoreError};
use crate::remote::is_data_file;
use crate::store::{JsonStore, Mutation, Require, UpdateOptions};
use crate::types::{Content, Document, Hash, Version};

/// Directory under the root reserved for store metadata.
const META_DIR: &str = ".repodb";

/// Document store on the local filesystem.
pub struct LocalFileStore {
    root: PathBuf,
    lock_dir: PathBuf,
    write_allowed: bool,
    encryption: Option<EncryptionPolicy>,
    lock_timeout: Duration,
    locks: Arc<PathLocks>,
    journal: Arc<CommitJournal>,
}

impl std::fmt::Debug for LocalFileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalFileStore")
            .field("root", &self.root)
            .field("write_allowed", &self.write_allowed)
            .field("encryption", &self.encryption)
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}

impl LocalFileStore {
    /// Open or create a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>, write_allowed: bool) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let meta = root.join(META_DIR);
        let lock_dir = meta.join("locks");
        std::fs::create_dir_all(&lock_dir)?;

        let journal = CommitJournal::open(meta.join("commits.log"))?;

        Ok(Self {
            root,
            lock_dir,
            write_allowed,
            encryption: None,
            lock_timeout: Duration::from_secs(10),
            locks: Arc::new(PathLocks::new()),
            journal: Arc::new(journal),
        })
    }

    #[must_use]
    pub fn with_encryption(mut self, policy: impl Into<Option<EncryptionPolicy>>) -> Self {
        self.encryption = policy.into();
        self
    }

    /// How long to wait for another process holding a path's lock file.
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Commit journal entries, oldest first.
    pub fn history(&self) -> Result<Vec<CommitEntry>> {
        self.journal.entries()
    }

    fn codec_for(&self, path: &str) -> Option<&CryptoCodec> {
        self.encryption.as_ref().and_then(|p| p.codec_for(path))
    }

    /// Map a document path to its file, rejecting anything that escapes the root.
    fn file_for(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let mut components = relative.components().peekable();

        if components.peek().is_none() {
            return Err(StoreError::InvalidOperation("Empty document path".into()));
        }
        if components.peek() == Some(&Component::Normal(OsStr::new(META_DIR))) {
            return Err(StoreError::InvalidOperation(format!(
                "Reserved document path: {}",
                path
            )));
        }
        if !components.all(|c| matches!(c, Component::Normal(_))) {
            return Err(StoreError::InvalidOperation(format!(
                "Document path must be relative without '..': {}",
                path
            )));
        }

        Ok(self.root.join(relative))
    }

    async fn read_file(&self, path: &str, file: &Path) -> Result<Document> {
        match tokio::fs::read(file).await {
            Ok(bytes) => Ok(Document {
                path: path.to_string(),
                content: decode_content(path, &bytes, self.codec_for(path))?,
                version: Some(Version::from(Hash::from_bytes(&bytes))),
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Document::absent(path)),
            Err(e) => Err(e.into()),
        }
    }

    /// Run `work` within the call's deadline, stopping early on cancellation.
    async fn guarded<T>(
        &self,
        path: &str,
        options: &UpdateOptions,
        started: Instant,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let timed_out = || StoreError::TimeoutExceeded {
            path: path.to_string(),
            elapsed: started.elapsed(),
        };
        let bounded = async {
            match options.deadline {
                Some(deadline) => {
                    let left = deadline.saturating_sub(started.elapsed());
                    tokio::time::timeout(left, work).await.map_err(|_| timed_out())?
                }
                None => work.await,
            }
        };

        match &options.cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(StoreError::Cancelled(path.to_string())),
                result = bounded => result,
            },
            None => bounded.await,
        }
    }

    /// Rewrite the journal to one entry per data file.
    ///
    /// Document files are left as they are. The files are hashed while the
    /// journal is locked, so a write that lands meanwhile is recorded after
    /// the compacted entries rather than lost.
    pub async fn compact_history(&self) -> Result<CompactionReport> {
        if !self.write_allowed {
            return Err(StoreError::WriteDisabled("history".into()));
        }

        let root = self.root.clone();
        let journal = Arc::clone(&self.journal);

        let report = tokio::task::spawn_blocking(move || -> Result<CompactionReport> {
            let mut paths = Vec::new();
            let rewrite = journal.rewrite("Compact database history", || {
                let mut survivors = Vec::new();
                for path in data_files(&root)? {
                    let bytes = std::fs::read(root.join(&path))?;
                    survivors.push((path.clone(), Version::from(Hash::from_bytes(&bytes))));
                    paths.push(path);
                }
                Ok(survivors)
            })?;

            Ok(CompactionReport {
                paths,
                previous_head: rewrite.previous_head.to_string(),
                new_head: rewrite.kept.to_string(),
                commits_before: Some(rewrite.entries_before),
            })
        })
        .await
        .map_err(|e| StoreError::Io(io::Error::other(e)))??;

        info!(
            paths = report.paths.len(),
            commits_before = ?report.commits_before,
            "Compacted local history"
        );
        Ok(report)
    }
}

#[async_trait]
impl JsonStore for LocalFileStore {
    async fn get(&self, path: &str, require: Require) -> Result<Document> {
        let file = self.file_for(path)?;
        let document = self.read_file(path, &file).await?;

        if require == Require::Existing && !document.exists() {
            return Err(StoreError::NotFound(path.to_string()));
        }
        Ok(document)
    }

    #[tracing::instrument(skip(self, mutate, options), fields(backend = "local"))]
    async fn update(&self, path: &str, mutate: Mutation<'_>, options: UpdateOptions) -> Result<Content> {
        let file = self.file_for(path)?;
        let started = Instant::now();

        if options.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Err(StoreError::Cancelled(path.to_string()));
        }

        let lock_file = FileLock::path_for(&self.lock_dir, path);
        let (guard, file_lock) = self
            .guarded(path, &options, started, async {
                let guard = self.locks.lock(path).await;
                let file_lock = FileLock::acquire(&lock_file, self.lock_timeout).await?;
                Ok::<_, StoreError>((guard, file_lock))
            })
            .await?;

        let current = self.read_file(path, &file).await?;
        let next = mutate(current.content.clone());
        if next == current.content {
            debug!(path, "Mutation produced no change; skipping write");
            return Ok(next);
        }

        if !self.write_allowed {
            return Err(StoreError::WriteDisabled(path.to_string()));
        }
        if options.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Err(StoreError::Cancelled(path.to_string()));
        }

        let bytes = encode_content(&next, self.codec_for(path))?;
        let version = Version::from(Hash::from_bytes(&bytes));
        let journal = Arc::clone(&self.journal);
        let doc_path = path.to_string();
        let message = options.message.clone();

        // The locks move into the blocking task so they outlive a dropped
        // caller until the file and journal are both written.
        let write = tokio::task::spawn_blocking(move || -> Result<Version> {
            let _held = (guard, file_lock);
            write_atomic(&file, &bytes)?;
            journal.append(&doc_path, &version, &message)?;
            Ok(version)
        });

        let version = write
            .await
            .map_err(|e| StoreError::Io(io::Error::other(e)))??;
        debug!(path, version = %version, "Committed local update");

        Ok(next)
    }
}

/// Replace `file` with `bytes` so readers never see a partial write.
fn write_atomic(file: &Path, bytes: &[u8]) -> Result<()> {
    let dir = file
        .parent()
        .ok_or_else(|| StoreError::InvalidOperation(format!("No parent for {}", file.display())))?;
    std::fs::create_dir_all(dir)?;

    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{}.tmp", name));

    let mut out = std::fs::File::create(&tmp)?;
    out.write_all(bytes)?;
    out.sync_all()?;
    drop(out);

    std::fs::rename(&tmp, file)?;
    Ok(())
}

/// Every data file under `root`, as sorted `/`-separated relative paths.
fn data_files(root: &Path) -> Result<Vec<String>> {
    let mut found = Vec::new();
    let mut pending = vec![PathBuf::new()];

    while let Some(relative) = pending.pop() {
        for entry in std::fs::read_dir(root.join(&relative))? {
            let entry = entry?;
            let name = entry.file_name();
            if relative.as_os_str().is_empty() && name == META_DIR {
                continue;
            }

            let child = relative.join(&name);
            let kind = entry.file_type()?;
            if kind.is_dir() {
                pending.push(child);
            } else if kind.is_file() {
                let path = child
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if is_data_file(&path) {
                    found.push(path);
                }
            }
        }
    }

    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PathScope;
    use crate::merge::ConflictStrategy;
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn open(dir: &TempDir) -> LocalFileStore {
        LocalFileStore::open(dir.path(), true).unwrap()
    }

    fn set(key: &'static str, value: Value) -> impl Fn(Content) -> Content + Send + Sync {
        move |mut c: Content| {
            c.insert(key.to_string(), value.clone());
            c
        }
    }

    #[tokio::test]
    async fn test_get_absent() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        let doc = store.get("db/a.json", Require::Optional).await.unwrap();
        assert!(!doc.exists());

        let err = store.get("db/a.json", Require::Existing).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_update_writes_file_and_journal() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        let content = store
            .update("db/a.json", &set("n", json!(1)), UpdateOptions::new("create a"))
            .await
            .unwrap();
        assert_eq!(Value::Object(content), json!({"n": 1}));

        let on_disk: Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("db/a.json")).unwrap()).unwrap();
        assert_eq!(on_disk, json!({"n": 1}));

        let doc = store.get("db/a.json", Require::Existing).await.unwrap();
        let history = store.history().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message, "create a");
        assert_eq!(Some(history[0].version.clone()), doc.version);
    }

    #[tokio::test]
    async fn test_noop_skips_write() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store
            .update("db/a.json", &set("n", json!(1)), UpdateOptions::default())
            .await
            .unwrap();
        let before = store.get("db/a.json", Require::Existing).await.unwrap();

        store
            .update("db/a.json", &|c| c, UpdateOptions::default())
            .await
            .unwrap();

        let after = store.get("db/a.json", Require::Existing).await.unwrap();
        assert_eq!(before.version, after.version);
        assert_eq!(store.history().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_updates_serialize() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(open(&dir));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let bump = |mut c: Content| {
                    let n = c.get("n").and_then(Value::as_u64).unwrap_or(0);
                    c.insert("n".into(), json!(n + 1));
                    c
                };
                store
                    .update("db/counter.json", &bump, UpdateOptions::default())
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let doc = store.get("db/counter.json", Require::Existing).await.unwrap();
        assert_eq!(doc.content["n"], json!(16));
        assert_eq!(store.history().unwrap().len(), 16);
    }

    #[tokio::test]
    async fn test_write_disabled() {
        let dir = TempDir::new().unwrap();
        let store = LocalFileStore::open(dir.path(), false).unwrap();

        let err = store
            .update("db/a.json", &set("n", json!(1)), UpdateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::WriteDisabled(_)));
        assert!(!dir.path().join("db/a.json").exists());
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        for bad in ["../outside.json", "/etc/passwd.json", ".repodb/commits.log", ""] {
            let err = store.get(bad, Require::Optional).await.unwrap_err();
            assert!(matches!(err, StoreError::InvalidOperation(_)), "{bad}");
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let token = CancellationToken::new();
        token.cancel();

        let err = store
            .update(
                "db/a.json",
                &set("n", json!(1)),
                UpdateOptions::default().with_cancel(token),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_deadline_while_locked() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        // Another process holds the lock file.
        let held = FileLock::acquire(&FileLock::path_for(&store.lock_dir, "db/a.json"), Duration::from_secs(1))
            .await
            .unwrap();

        let err = store
            .update(
                "db/a.json",
                &set("n", json!(1)),
                UpdateOptions::default().with_deadline(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::TimeoutExceeded { .. }));
        assert!(store.locks.is_empty());
        drop(held);
    }

    #[tokio::test]
    async fn test_lock_timeout() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).with_lock_timeout(Duration::from_millis(30));
        let _held = FileLock::acquire(&FileLock::path_for(&store.lock_dir, "db/a.json"), Duration::from_secs(1))
            .await
            .unwrap();

        let err = store
            .update("db/a.json", &set("n", json!(1)), UpdateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Locked(_)));
    }

    #[tokio::test]
    async fn test_encrypted_documents() {
        let dir = TempDir::new().unwrap();
        let codec = CryptoCodec::from_base64(&CryptoCodec::generate_key()).unwrap();
        let store = open(&dir).with_encryption(EncryptionPolicy::new(codec, PathScope::Suffix(".enc".into())));

        store
            .update("db/secret.json.enc", &set("pin", json!("1234")), UpdateOptions::default())
            .await
            .unwrap();

        let raw = std::fs::read_to_string(dir.path().join("db/secret.json.enc")).unwrap();
        assert!(!raw.contains("1234"));

        let doc = store.get("db/secret.json.enc", Require::Existing).await.unwrap();
        assert_eq!(doc.content["pin"], json!("1234"));
    }

    #[tokio::test]
    async fn test_strategy_is_irrelevant_locally() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        for strategy in ConflictStrategy::ALL {
            store
                .update(
                    "db/a.json",
                    &set(strategy.as_str(), json!(true)),
                    UpdateOptions::default().with_strategy(strategy),
                )
                .await
                .unwrap();
        }

        let doc = store.get("db/a.json", Require::Existing).await.unwrap();
        assert_eq!(doc.content.len(), ConflictStrategy::ALL.len());
    }

    #[tokio::test]
    async fn test_compact_history() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        for i in 0..5 {
            store
                .update("db/a.json", &set("n", json!(i)), UpdateOptions::default())
                .await
                .unwrap();
        }
        store
            .update("db/nested/b.json", &set("x", json!(1)), UpdateOptions::default())
            .await
            .unwrap();
        let before = store.get("db/a.json", Require::Existing).await.unwrap();

        let report = store.compact_history().await.unwrap();
        assert_eq!(report.paths, vec!["db/a.json".to_string(), "db/nested/b.json".to_string()]);
        assert_eq!(report.commits_before, Some(6));
        assert_eq!(report.previous_head, "6");
        assert_eq!(report.new_head, "2");

        let after = store.get("db/a.json", Require::Existing).await.unwrap();
        assert_eq!(before, after);
        assert_eq!(store.history().unwrap().len(), 2);
    }
}
