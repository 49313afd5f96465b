//! Helpers shared by the integration tests.

#![allow(dead_code)]

use repodb::{Content, InMemoryRemote, OptimisticJsonStore, RetryConfig, StoreContext};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Route `tracing` output to the test harness; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Backoff short enough to keep tests fast.
pub fn fast_retry() -> RetryConfig {
    RetryConfig::default()
        .with_initial_backoff(Duration::from_millis(1))
        .with_max_backoff(Duration::from_millis(10))
}

pub fn fast_context() -> StoreContext {
    StoreContext::default()
        .with_rate_limit_retry(fast_retry())
        .with_network_retry(fast_retry())
}

pub fn memory_store() -> (Arc<InMemoryRemote>, OptimisticJsonStore<InMemoryRemote>) {
    init_tracing();
    let remote = Arc::new(InMemoryRemote::new());
    let store = OptimisticJsonStore::new(Arc::clone(&remote), fast_context());
    (remote, store)
}

/// Mutation that sets `users[id] = {"name": name}`.
pub fn add_user(id: &'static str, name: &'static str) -> impl Fn(Content) -> Content + Send + Sync {
    move |mut doc: Content| {
        let users = doc
            .entry("users")
            .or_insert_with(|| Value::Object(Content::new()));
        if let Value::Object(users) = users {
            users.insert(id.to_string(), serde_json::json!({ "name": name }));
        }
        doc
    }
}
