//! Path-scoped locks for the local store.
//!
//! Two layers serialize a read-modify-write cycle on one path:
//! an in-process async mutex per path, so tasks queue without blocking
//! threads, and an advisory file lock, so separate processes sharing the
//! directory exclude each other too. Both release on drop.

use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::types::Hash;

/// Interval between attempts to take a contended file lock.
const FILE_LOCK_POLL: Duration = Duration::from_millis(10);

/// Registry of per-path async mutexes.
///
/// Entries are created on demand and removed when the last holder or
/// waiter is gone, so the map stays proportional to contended paths.
#[derive(Debug, Default)]
pub struct PathLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `path` within this process.
    pub async fn lock(self: &Arc<Self>, path: &str) -> PathGuard {
        let mutex = {
            let mut map = self.inner.lock();
            Arc::clone(map.entry(path.to_string()).or_default())
        };
        let guard = mutex.lock_owned().await;

        PathGuard {
            guard: Some(guard),
            path: path.to_string(),
            registry: Arc::clone(self),
        }
    }

    /// Number of paths with a live entry.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Held while a task owns a path.
#[derive(Debug)]
pub struct PathGuard {
    guard: Option<OwnedMutexGuard<()>>,
    path: String,
    registry: Arc<PathLocks>,
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        // Release before inspecting the count so our own reference is gone.
        drop(self.guard.take());

        let mut map = self.registry.inner.lock();
        if map
            .get(&self.path)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            map.remove(&self.path);
        }
    }
}

/// An exclusive advisory lock on a file, released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Lock file for `doc_path` inside `lock_dir`.
    pub fn path_for(lock_dir: &Path, doc_path: &str) -> PathBuf {
        let name = Hash::from_bytes(doc_path.as_bytes()).to_hex();
        lock_dir.join(format!("{}.lock", &name[..32]))
    }

    fn open_lock_file(path: &Path) -> Result<File> {
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?)
    }

    /// Take the lock without waiting.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        let file = Self::open_lock_file(path)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Block the current thread until the lock is free.
    ///
    /// Only for short critical sections run off the async runtime.
    pub fn acquire_blocking(path: &Path) -> Result<Self> {
        let file = Self::open_lock_file(path)?;
        file.lock_exclusive()?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Poll for the lock until `timeout` elapses.
    pub async fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        let started = Instant::now();
        loop {
            if let Some(lock) = Self::try_acquire(path)? {
                return Ok(lock);
            }
            if started.elapsed() >= timeout {
                return Err(StoreError::Locked(path.display().to_string()));
            }
            debug!(lock = %path.display(), "File lock contended");
            tokio::time::sleep(FILE_LOCK_POLL).await;
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
