//! Optimistic JSON document store tying all components together.
//!
//! [`OptimisticJsonStore`] turns a [`RemoteFileStore`] with compare-and-swap
//! writes into read-modify-write updates:
//!
//! 1. Read the document (absent means empty with no version).
//! 2. Apply the caller's mutation to a copy.
//! 3. Write it back conditioned on the version that was read.
//! 4. On a version conflict, re-read, reconcile with the chosen
//!    [`ConflictStrategy`] and try again.
//!
//! Each write attempt is classified into an [`Attempt`] and consumed by an
//! explicit loop, so retry budgets stay visible in [`UpdateStats`].
//!
//! `ConflictExhausted`, `TimeoutExceeded` and `Cancelled` mean the outcome
//! is unknown: an acknowledgement may have been lost after the remote
//! committed. Re-read before concluding that nothing changed.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{Backend, Config};
use crate::crypto::{decode_content, encode_content, CryptoCodec, EncryptionPolicy};
use crate::error::{Result, StoreError};
use crate::local::LocalFileStore;
use crate::merge::{resolve, ConflictStrategy};
use crate::ratelimit::{RateLimiter, WritePermit};
use crate::remote::{GitHubRemote, RemoteFileStore};
use crate::retry::{RetryConfig, RetryDecision, RetryState};
use crate::types::{Content, Document, Version};

/// A caller-supplied mutation. It may run more than once per update.
pub type Mutation<'a> = &'a (dyn Fn(Content) -> Content + Send + Sync);

/// Whether `get` accepts an absent document.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Require {
    /// Absent documents read as empty content with no version.
    #[default]
    Optional,
    /// Absent documents fail with `NotFound`.
    Existing,
}

/// Read and update JSON documents by path.
#[async_trait]
pub trait JsonStore: Send + Sync {
    /// Read a document.
    async fn get(&self, path: &str, require: Require) -> Result<Document>;

    /// Apply `mutate` to the document at `path` and persist the result.
    ///
    /// Returns the content that was committed, or the current content when
    /// the mutation changed nothing.
    async fn update(&self, path: &str, mutate: Mutation<'_>, options: UpdateOptions) -> Result<Content>;
}

/// Per-call settings for [`JsonStore::update`].
#[derive(Clone, Debug)]
pub struct UpdateOptions {
    pub strategy: ConflictStrategy,
    /// Conflict resolutions allowed before giving up.
    pub max_retries: u32,
    /// Wall-clock bound across every retry of the call.
    pub deadline: Option<Duration>,
    /// Commit message recorded with the write.
    pub message: String,
    pub cancel: Option<CancellationToken>,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            strategy: ConflictStrategy::DeepMerge,
            max_retries: 5,
            deadline: None,
            message: "Update document".to_string(),
            cancel: None,
        }
    }
}

impl UpdateOptions {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// State shared by stores that draw on one quota.
///
/// Pass the same context to several stores to make them throttle together;
/// give each test its own to keep them independent.
#[derive(Clone, Debug)]
pub struct StoreContext {
    pub limiter: Arc<RateLimiter>,
    /// Backoff after the remote refuses a request for lack of quota.
    pub rate_limit_retry: RetryConfig,
    /// Backoff after a transport failure.
    pub network_retry: RetryConfig,
}

impl Default for StoreContext {
    fn default() -> Self {
        Self::new(Arc::new(RateLimiter::default()))
    }
}

impl StoreContext {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            limiter,
            rate_limit_retry: RetryConfig::default(),
            network_retry: RetryConfig::default(),
        }
    }

    #[must_use]
    pub fn with_rate_limit_retry(mut self, config: RetryConfig) -> Self {
        self.rate_limit_retry = config;
        self
    }

    #[must_use]
    pub fn with_network_retry(mut self, config: RetryConfig) -> Self {
        self.network_retry = config;
        self
    }
}

/// Outcome of one write attempt.
#[derive(Debug)]
pub enum Attempt {
    Committed(Version),
    Conflict,
    RateLimited(Option<Duration>),
    Transient(StoreError),
    Fatal(StoreError),
}

impl From<Result<Version>> for Attempt {
    fn from(result: Result<Version>) -> Self {
        match result {
            Ok(version) => Attempt::Committed(version),
            Err(StoreError::VersionConflict { .. }) => Attempt::Conflict,
            Err(StoreError::RateLimited { retry_after }) => Attempt::RateLimited(retry_after),
            Err(e @ StoreError::Network(_)) => Attempt::Transient(e),
            Err(e) => Attempt::Fatal(e),
        }
    }
}

/// Counters for one update call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpdateStats {
    /// Write requests sent.
    pub writes: u32,
    /// Writes rejected for a stale version.
    pub conflicts: u32,
    /// Requests refused for lack of quota.
    pub rate_limited: u32,
    /// Transport failures absorbed.
    pub network_errors: u32,
    /// Times the shared limiter held a write back.
    pub throttled: u32,
}

/// Result of [`OptimisticJsonStore::update_detailed`].
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateOutcome {
    pub content: Content,
    /// Version after the call; unchanged when nothing was written.
    pub version: Option<Version>,
    pub stats: UpdateStats,
}

/// Retry bookkeeping for one call.
struct Session<'a> {
    path: &'a str,
    ctx: &'a StoreContext,
    started: Instant,
    deadline: Option<Duration>,
    cancel: Option<&'a CancellationToken>,
    rate: RetryState,
    network: RetryState,
    stats: UpdateStats,
}

impl<'a> Session<'a> {
    fn new(path: &'a str, ctx: &'a StoreContext, deadline: Option<Duration>, cancel: Option<&'a CancellationToken>) -> Self {
        Self {
            path,
            ctx,
            started: Instant::now(),
            deadline,
            cancel,
            rate: RetryState::new(ctx.rate_limit_retry.clone()),
            network: RetryState::new(ctx.network_retry.clone()),
            stats: UpdateStats::default(),
        }
    }

    fn timed_out(&self) -> StoreError {
        StoreError::TimeoutExceeded {
            path: self.path.to_string(),
            elapsed: self.started.elapsed(),
        }
    }

    fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_sub(self.started.elapsed()))
    }

    /// Fail if the call was cancelled or ran out of time.
    fn check(&self) -> Result<()> {
        if self.cancel.is_some_and(|token| token.is_cancelled()) {
            return Err(StoreError::Cancelled(self.path.to_string()));
        }
        if self.remaining().is_some_and(|left| left.is_zero()) {
            return Err(self.timed_out());
        }
        Ok(())
    }

    /// Sleep unless the delay would overrun the deadline or the call is cancelled.
    async fn pause(&self, delay: Duration) -> Result<()> {
        if self.remaining().is_some_and(|left| delay >= left) {
            return Err(self.timed_out());
        }
        match self.cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(StoreError::Cancelled(self.path.to_string())),
                _ = tokio::time::sleep(delay) => Ok(()),
            },
            None => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }

    /// Run one remote call within the deadline.
    async fn bounded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        match self.remaining() {
            Some(left) => tokio::time::timeout(left, call)
                .await
                .map_err(|_| self.timed_out())?,
            None => call.await,
        }
    }

    /// Decide how to continue after a recoverable failure.
    async fn back_off(&mut self, error: StoreError) -> Result<()> {
        let decision = match &error {
            StoreError::RateLimited { retry_after } => {
                self.stats.rate_limited += 1;
                self.ctx.limiter.record_exhausted(*retry_after);
                self.rate.next_delay(*retry_after)
            }
            StoreError::Network(_) => {
                self.stats.network_errors += 1;
                self.network.next_delay(None)
            }
            _ => RetryDecision::DontRetry,
        };

        match decision {
            RetryDecision::Retry(delay) => {
                debug!(
                    path = self.path,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Backing off"
                );
                self.pause(delay).await
            }
            RetryDecision::DontRetry => Err(error),
        }
    }

    /// Wait until the shared limiter admits another write.
    async fn permit(&mut self) -> Result<WritePermit> {
        loop {
            match self.ctx.limiter.reserve_write() {
                Ok(permit) => return Ok(permit),
                Err(wait) => {
                    self.stats.throttled += 1;
                    self.pause(wait).await?;
                }
            }
        }
    }
}

/// Document store over a remote with compare-and-swap writes.
pub struct OptimisticJsonStore<R: RemoteFileStore + ?Sized> {
    remote: Arc<R>,
    ctx: StoreContext,
    encryption: Option<EncryptionPolicy>,
}

impl<R: RemoteFileStore + ?Sized> std::fmt::Debug for OptimisticJsonStore<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimisticJsonStore")
            .field("ctx", &self.ctx)
            .field("encryption", &self.encryption)
            .finish_non_exhaustive()
    }
}

impl<R: RemoteFileStore + ?Sized> OptimisticJsonStore<R> {
    pub fn new(remote: Arc<R>, ctx: StoreContext) -> Self {
        Self {
            remote,
            ctx,
            encryption: None,
        }
    }

    #[must_use]
    pub fn with_encryption(mut self, policy: impl Into<Option<EncryptionPolicy>>) -> Self {
        self.encryption = policy.into();
        self
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    pub fn context(&self) -> &StoreContext {
        &self.ctx
    }

    fn codec_for(&self, path: &str) -> Option<&CryptoCodec> {
        self.encryption.as_ref().and_then(|p| p.codec_for(path))
    }

    fn observe_quota(&self) {
        if let Some(quota) = self.remote.observed_quota() {
            self.ctx.limiter.observe(quota);
        }
    }

    /// Read and decode, absorbing rate limits and transport failures.
    async fn read(&self, session: &mut Session<'_>) -> Result<Document> {
        let path = session.path;
        loop {
            session.check()?;
            let result = session.bounded(self.remote.read(path)).await;
            self.observe_quota();

            match result {
                Ok(Some(file)) => {
                    let content = decode_content(path, &file.bytes, self.codec_for(path))?;
                    return Ok(Document {
                        path: path.to_string(),
                        content,
                        version: Some(file.version),
                    });
                }
                Ok(None) => return Ok(Document::absent(path)),
                Err(e) if e.is_recoverable() => session.back_off(e).await?,
                Err(e) => return Err(e),
            }
        }
    }

    /// Send one conditional write under a limiter permit.
    async fn attempt(
        &self,
        session: &mut Session<'_>,
        content: &Content,
        expected: Option<&Version>,
        message: &str,
    ) -> Result<Attempt> {
        let path = session.path;
        let bytes = encode_content(content, self.codec_for(path))?;

        let permit = session.permit().await?;
        session.stats.writes += 1;
        let result = session
            .bounded(self.remote.write(path, &bytes, expected, message))
            .await;
        drop(permit);
        self.observe_quota();

        match result {
            // Deadline expiry while the write was in flight is terminal.
            Err(e @ StoreError::TimeoutExceeded { .. }) => Err(e),
            other => Ok(Attempt::from(other)),
        }
    }

    /// Update a document and report how the call went.
    pub async fn update_detailed(
        &self,
        path: &str,
        mutate: Mutation<'_>,
        options: &UpdateOptions,
    ) -> Result<UpdateOutcome> {
        let mut session = Session::new(path, &self.ctx, options.deadline, options.cancel.as_ref());

        let current = self.read(&mut session).await?;
        let mut base = current.content;
        let mut version = current.version;
        let mut next = mutate(base.clone());

        loop {
            session.check()?;

            if next == base {
                debug!(path, "Mutation produced no change; skipping write");
                return Ok(UpdateOutcome {
                    content: next,
                    version,
                    stats: session.stats,
                });
            }

            let attempt = self
                .attempt(&mut session, &next, version.as_ref(), &options.message)
                .await?;

            match attempt {
                Attempt::Committed(new_version) => {
                    debug!(
                        path,
                        version = %new_version,
                        conflicts = session.stats.conflicts,
                        "Committed update"
                    );
                    return Ok(UpdateOutcome {
                        content: next,
                        version: Some(new_version),
                        stats: session.stats,
                    });
                }
                Attempt::Conflict => {
                    session.stats.conflicts += 1;
                    if session.stats.conflicts > options.max_retries {
                        return Err(StoreError::ConflictExhausted {
                            path: path.to_string(),
                            attempts: session.stats.conflicts,
                        });
                    }

                    let remote = self.read(&mut session).await?;
                    let reconciled = resolve(options.strategy, &base, &next, &remote.content, mutate);
                    debug!(
                        path,
                        attempt = session.stats.conflicts,
                        strategy = %options.strategy,
                        "Resolved version conflict"
                    );

                    base = remote.content;
                    version = remote.version;
                    next = reconciled;
                }
                Attempt::RateLimited(retry_after) => {
                    session.back_off(StoreError::RateLimited { retry_after }).await?;
                }
                Attempt::Transient(error) => session.back_off(error).await?,
                Attempt::Fatal(error) => return Err(error),
            }
        }
    }
}

#[async_trait]
impl<R: RemoteFileStore + ?Sized> JsonStore for OptimisticJsonStore<R> {
    async fn get(&self, path: &str, require: Require) -> Result<Document> {
        let mut session = Session::new(path, &self.ctx, None, None);
        let document = self.read(&mut session).await?;

        if require == Require::Existing && !document.exists() {
            return Err(StoreError::NotFound(path.to_string()));
        }
        Ok(document)
    }

    #[tracing::instrument(skip(self, mutate, options), fields(strategy = %options.strategy))]
    async fn update(&self, path: &str, mutate: Mutation<'_>, options: UpdateOptions) -> Result<Content> {
        let outcome = self.update_detailed(path, mutate, &options).await?;
        if outcome.stats.conflicts > 0 || outcome.stats.rate_limited > 0 {
            info!(
                path,
                conflicts = outcome.stats.conflicts,
                rate_limited = outcome.stats.rate_limited,
                "Update committed after retries"
            );
        }
        Ok(outcome.content)
    }
}

/// Build the store selected by `config`.
pub fn open_store(config: &Config) -> Result<Box<dyn JsonStore>> {
    config.validate()?;
    let encryption = config.encryption_policy()?;

    match config.backend {
        Backend::Remote => {
            let remote = GitHubRemote::new(&config.remote, config.write_allowed)?;
            info!(
                owner = %config.remote.owner,
                repo = %config.remote.repo,
                branch = %config.remote.branch,
                write_allowed = config.write_allowed,
                "Opening remote store"
            );
            let store = OptimisticJsonStore::new(Arc::new(remote), config.build_context())
                .with_encryption(encryption);
            Ok(Box::new(store))
        }
        Backend::Local => {
            info!(path = %config.local.path.display(), "Opening local store");
            let store = LocalFileStore::open(&config.local.path, config.write_allowed)?
                .with_encryption(encryption)
                .with_lock_timeout(Duration::from_millis(config.local.lock_timeout_ms));
            Ok(Box::new(store))
        }
    }
}
