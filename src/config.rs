//! Configuration for the document store.
//!
//! Values are resolved in order: built-in defaults, an optional TOML file,
//! then environment variables. [`Config::validate`] runs last.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::crypto::{CryptoCodec, EncryptionPolicy, PathScope};
use crate::error::{Result, StoreError};
use crate::merge::ConflictStrategy;
use crate::ratelimit::{RateLimitConfig, RateLimiter};
use crate::retry::RetryConfig;
use crate::store::{StoreContext, UpdateOptions};

/// A credential that never appears in `Debug` output.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("Secret(<empty>)")
        } else {
            f.write_str("Secret(<redacted>)")
        }
    }
}

/// Which backend `open_store` builds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Remote,
    #[default]
    Local,
}

/// Main configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend selection
    pub backend: Backend,

    /// Whether writes are sent at all; reads always work
    pub write_allowed: bool,

    /// Remote repository coordinates
    pub remote: RemoteConfig,

    /// Local fallback
    pub local: LocalConfig,

    /// Retry budgets and backoff
    pub retry: RetrySettings,

    /// Shared quota tracking
    pub rate_limit: RateLimitSettings,

    /// Encryption at rest
    pub encryption: EncryptionConfig,
}

/// Remote repository configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub owner: String,
    pub repo: String,
    /// Branch holding the database files
    pub branch: String,
    pub token: Secret,
    /// API root, overridable for GitHub Enterprise or a test server
    pub base_url: String,
    pub user_agent: String,
    /// Per-request transport timeout
    pub request_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            owner: String::new(),
            repo: String::new(),
            branch: "db-live".to_string(),
            token: Secret::default(),
            base_url: "https://api.github.com".to_string(),
            user_agent: format!("repodb/{}", env!("CARGO_PKG_VERSION")),
            request_timeout_secs: 30,
        }
    }
}

/// Local fallback configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Directory holding the database files
    pub path: PathBuf,
    /// How long to wait for another process's file lock
    pub lock_timeout_ms: u64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data"),
            lock_timeout_ms: 10_000,
        }
    }
}

/// Retry configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub strategy: ConflictStrategy,
    /// Conflict resolutions allowed per update
    pub conflict_retries: u32,
    /// Rate-limit backoffs allowed per update
    pub rate_limit_retries: u32,
    /// Transport retries allowed per update
    pub network_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter: f64,
    /// Wall-clock bound on one update; zero disables it
    pub deadline_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            strategy: ConflictStrategy::DeepMerge,
            conflict_retries: 5,
            rate_limit_retries: 3,
            network_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 60_000,
            jitter: 0.3,
            deadline_secs: 30,
        }
    }
}

/// Rate limit configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub reserve: u64,
    pub max_throttle_secs: u64,
    pub cooldown_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            reserve: 50,
            max_throttle_secs: 60,
            cooldown_secs: 5,
        }
    }
}

/// Encryption configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Base64 of a 32-byte AES-256 key
    pub key: Option<Secret>,
    /// Paths ending with this suffix are sealed
    pub suffix: String,
    /// Seal every path regardless of suffix
    pub all_paths: bool,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            key: None,
            suffix: ".enc".to_string(),
            all_paths: false,
        }
    }
}

impl Config {
    /// Load configuration: defaults, then `path` if given, then environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Config::default(),
        };

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&contents)
            .map_err(|e| StoreError::Config(format!("Failed to parse config file: {}", e)))
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_env_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn apply_env_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(flag) = lookup("USE_GITHUB_DB") {
            self.backend = if parse_flag("USE_GITHUB_DB", &flag)? {
                Backend::Remote
            } else {
                Backend::Local
            };
        }

        if let Some(flag) = lookup("DB_WRITE_ALLOWED") {
            self.write_allowed = parse_flag("DB_WRITE_ALLOWED", &flag)?;
        }

        // Remote overrides
        if let Some(owner) = lookup("DB_GITHUB_OWNER") {
            self.remote.owner = owner;
        }
        if let Some(repo) = lookup("DB_GITHUB_REPO") {
            self.remote.repo = repo;
        }
        if let Some(branch) = lookup("DB_GITHUB_BRANCH") {
            self.remote.branch = branch;
        }
        if let Some(token) = lookup("GITHUB_TOKEN") {
            self.remote.token = Secret::new(token);
        }
        if let Some(url) = lookup("DB_GITHUB_API_URL") {
            self.remote.base_url = url;
        }

        // Local overrides
        if let Some(path) = lookup("DB_LOCAL_PATH") {
            self.local.path = PathBuf::from(path);
        }

        if let Some(key) = lookup("DB_ENCRYPTION_KEY") {
            let key = key.trim();
            self.encryption.key = (!key.is_empty()).then(|| Secret::new(key));
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.backend == Backend::Remote {
            let missing: Vec<&str> = [
                ("DB_GITHUB_OWNER", self.remote.owner.is_empty()),
                ("DB_GITHUB_REPO", self.remote.repo.is_empty()),
                ("GITHUB_TOKEN", self.remote.token.is_empty()),
            ]
            .into_iter()
            .filter_map(|(name, empty)| empty.then_some(name))
            .collect();

            if !missing.is_empty() {
                return Err(StoreError::Config(format!(
                    "Remote backend requires {}",
                    missing.join(", ")
                )));
            }
        }

        if self.remote.branch.trim().is_empty() {
            return Err(StoreError::Config("Branch name is empty".into()));
        }

        let retry = &self.retry;
        if !(0.0..1.0).contains(&retry.jitter) {
            return Err(StoreError::Config("Jitter must be in [0, 1)".into()));
        }
        if retry.max_backoff_ms < retry.initial_backoff_ms {
            return Err(StoreError::Config(
                "max_backoff_ms must not be below initial_backoff_ms".into(),
            ));
        }

        if self.encryption.suffix.is_empty() && !self.encryption.all_paths {
            return Err(StoreError::Config("Encryption suffix is empty".into()));
        }
        if let Some(key) = &self.encryption.key {
            CryptoCodec::from_base64(key.expose())?;
        }

        Ok(())
    }

    /// Backoff for rate-limit refusals.
    pub fn rate_limit_retry(&self) -> RetryConfig {
        self.backoff(self.retry.rate_limit_retries)
    }

    /// Backoff for transport failures.
    pub fn network_retry(&self) -> RetryConfig {
        self.backoff(self.retry.network_retries)
    }

    fn backoff(&self, max_retries: u32) -> RetryConfig {
        RetryConfig::default()
            .with_max_retries(max_retries)
            .with_initial_backoff(Duration::from_millis(self.retry.initial_backoff_ms))
            .with_max_backoff(Duration::from_millis(self.retry.max_backoff_ms))
            .with_jitter(self.retry.jitter)
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            reserve: self.rate_limit.reserve,
            max_throttle: Duration::from_secs(self.rate_limit.max_throttle_secs),
            default_cooldown: Duration::from_secs(self.rate_limit.cooldown_secs),
        }
    }

    /// A fresh context with its own limiter.
    pub fn build_context(&self) -> StoreContext {
        StoreContext::new(Arc::new(RateLimiter::new(self.rate_limit_config())))
            .with_rate_limit_retry(self.rate_limit_retry())
            .with_network_retry(self.network_retry())
    }

    /// Encryption policy, if a key is configured.
    pub fn encryption_policy(&self) -> Result<Option<EncryptionPolicy>> {
        let Some(key) = &self.encryption.key else {
            return Ok(None);
        };
        let codec = CryptoCodec::from_base64(key.expose())?;
        let scope = if self.encryption.all_paths {
            PathScope::All
        } else {
            PathScope::Suffix(self.encryption.suffix.clone())
        };
        Ok(Some(EncryptionPolicy::new(codec, scope)))
    }

    /// Update options carrying the configured strategy and budgets.
    pub fn update_options(&self, message: impl Into<String>) -> UpdateOptions {
        let options = UpdateOptions::new(message)
            .with_strategy(self.retry.strategy)
            .with_max_retries(self.retry.conflict_retries);
        match self.retry.deadline_secs {
            0 => options,
            secs => options.with_deadline(Duration::from_secs(secs)),
        }
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        other => Err(StoreError::Config(format!("Invalid value for {}: {}", name, other))),
    }
}
