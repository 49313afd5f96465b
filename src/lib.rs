//! # repodb
//!
//! A JSON document store layered on a file-hosting API that offers
//! conditional writes but no transactions, such as the GitHub contents API.
//!
//! ## Core Concepts
//!
//! - **Documents**: JSON objects addressed by hierarchical paths like `db/users.json`
//! - **Versions**: content-derived tokens used for compare-and-swap writes
//! - **Conflict strategies**: how a stale write is reconciled before retrying
//! - **Quota**: a shared rate-limit budget that throttles every writer
//! - **Compaction**: squashing accumulated history down to the current state
//!
//! ## Example
//!
//! ```ignore
//! use repodb::{open_store, Config, ConflictStrategy, UpdateOptions};
//! use serde_json::json;
//!
//! let config = Config::load(None)?;
//! let store = open_store(&config)?;
//!
//! let add_user = |mut doc: repodb::Content| {
//!     let users = doc.entry("users").or_insert_with(|| json!({}));
//!     users["1"] = json!({"name": "a"});
//!     doc
//! };
//! let content = store
//!     .update(
//!         "db/users.json",
//!         &add_user,
//!         UpdateOptions::new("Add user 1").with_strategy(ConflictStrategy::DeepMerge),
//!     )
//!     .await?;
//! ```

pub mod compact;
pub mod config;
pub mod crypto;
pub mod error;
pub mod local;
pub mod merge;
pub mod ratelimit;
pub mod remote;
pub mod retry;
pub mod store;
pub mod types;

// Re-exports
pub use compact::{CompactionReport, HistoryCompactor, TrackedPaths};
pub use config::{Backend, Config, Secret};
pub use crypto::{CryptoCodec, EncryptionPolicy, PathScope};
pub use error::{Result, StoreError};
pub use local::{CommitEntry, CommitKind, LocalFileStore};
pub use merge::{deep_merge, deep_merge_with, resolve, ConflictStrategy, MergePolicy};
pub use ratelimit::{QuotaSnapshot, RateLimitConfig, RateLimiter};
pub use remote::{Fault, GitHubRemote, InMemoryRemote, RemoteFileStore};
pub use retry::{RetryConfig, RetryDecision, RetryState};
pub use store::{
    open_store, Attempt, JsonStore, Mutation, OptimisticJsonStore, Require, StoreContext,
    UpdateOptions, UpdateOutcome, UpdateStats,
};
pub use types::*;
