//! Local filesystem fallback backend.
//!
//! Used when no remote is configured. Access to each path is serialized by
//! a lock instead of compare-and-swap, and every write is recorded in an
//! on-disk commit journal.

pub mod journal;
pub mod locks;
mod store;

pub use journal::{CommitEntry, CommitJournal, CommitKind, Rewrite};
pub use locks::{FileLock, PathGuard, PathLocks};
pub use store::LocalFileStore;
