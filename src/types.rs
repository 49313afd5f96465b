//! Core types for the document store.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Document content: a JSON object with string keys.
pub type Content = serde_json::Map<String, serde_json::Value>;

/// Opaque version token for a stored document.
///
/// Tokens are content-derived and assigned by the backing store; callers
/// only compare them and hand them back for compare-and-swap.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(String);

impl Version {
    pub fn new(token: impl Into<String>) -> Self {
        Version(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.0.get(..10).unwrap_or(&self.0);
        write!(f, "Version({})", short)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Hash> for Version {
    fn from(hash: Hash) -> Self {
        Version(hash.to_hex())
    }
}

/// Content hash (SHA-256).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// Compute hash from bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Hash(hasher.finalize().into())
    }

    /// Compute hash over several byte slices, each length-prefixed.
    pub fn from_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        Hash(hasher.finalize().into())
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }

    /// Whole seconds since the epoch.
    pub fn as_secs(&self) -> u64 {
        (self.0.max(0) / 1_000_000) as u64
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A document as seen by a reader.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    pub path: String,
    pub content: Content,
    /// `None` when the path has never been written.
    pub version: Option<Version>,
}

impl Document {
    /// An absent document: empty content, no version.
    pub fn absent(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: Content::new(),
            version: None,
        }
    }

    pub fn exists(&self) -> bool {
        self.version.is_some()
    }
}

/// Raw file as returned by a remote read.
#[derive(Clone, Debug)]
pub struct RemoteFile {
    pub bytes: Vec<u8>,
    pub version: Version,
}

/// Remote API rate-limit budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub limit: u64,
    pub remaining: u64,
    /// Unix seconds at which `remaining` is restored to `limit`.
    pub reset_at: u64,
}

impl Quota {
    /// Time until the quota resets, measured from `now` (Unix seconds).
    pub fn reset_in(&self, now: u64) -> Duration {
        Duration::from_secs(self.reset_at.saturating_sub(now))
    }
}

/// Audit entry left behind by every successful write or compaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub id: String,
    pub message: String,
}

/// A consistent read of several paths taken at one history head.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Identifier of the history head the snapshot was taken at.
    pub head: String,
    pub files: BTreeMap<String, Version>,
}
