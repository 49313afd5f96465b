//! Shared tracking of the remote API quota.
//!
//! One [`RateLimiter`] is shared by every store built from the same
//! [`StoreContext`](crate::store::StoreContext). Responses feed it the
//! latest quota; writers ask it for a [`WritePermit`] before sending. When
//! the remaining budget falls to the configured reserve, new writes are
//! spread out over the time left until the quota resets, so a burst on one
//! path cannot starve unrelated paths.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::types::{Quota, Timestamp};

/// Rate limiter tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests kept in hand before throttling starts.
    pub reserve: u64,
    /// Longest single delay the limiter will ask a writer to wait.
    pub max_throttle: Duration,
    /// Wait used when exhaustion is reported without any hint.
    pub default_cooldown: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            reserve: 50,
            max_throttle: Duration::from_secs(60),
            default_cooldown: Duration::from_secs(5),
        }
    }
}

/// Point-in-time view of the limiter, for logging and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuotaSnapshot {
    pub quota: Option<Quota>,
    pub in_flight: u64,
    pub blocked_for: Option<Duration>,
}

#[derive(Debug, Default)]
struct LimiterState {
    quota: Option<Quota>,
    in_flight: u64,
    blocked_until: Option<Instant>,
    /// Earliest time the next write may go out while the quota is low.
    next_slot: Option<Instant>,
}

/// Process-wide quota tracker.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<LimiterState>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LimiterState::default()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Record the quota reported by the remote.
    pub fn observe(&self, quota: Quota) {
        let mut state = self.state.lock();
        state.quota = Some(quota);
    }

    /// Record that the remote refused a request for lack of quota.
    ///
    /// Every writer sharing this limiter waits until the hint (or the known
    /// reset time) has passed.
    pub fn record_exhausted(&self, retry_after: Option<Duration>) {
        let mut state = self.state.lock();
        let now_secs = Timestamp::now().as_secs();

        let wait = match retry_after {
            Some(hint) => hint,
            None => {
                // Without a hint the whole quota is assumed spent until reset.
                let reset = state
                    .quota
                    .filter(|q| q.remaining == 0)
                    .map(|q| q.reset_in(now_secs))
                    .filter(|d| !d.is_zero());
                if let Some(quota) = state.quota.as_mut() {
                    quota.remaining = 0;
                }
                reset.unwrap_or(self.config.default_cooldown)
            }
        }
        .min(self.config.max_throttle);

        let until = Instant::now() + wait;
        state.blocked_until = Some(match state.blocked_until {
            Some(existing) => existing.max(until),
            None => until,
        });

        warn!(wait_ms = wait.as_millis() as u64, "Remote quota exhausted");
    }

    /// How long a new write should wait before being sent.
    pub fn throttle_delay(&self) -> Duration {
        let state = self.state.lock();
        self.delay_for(&state)
    }

    fn delay_for(&self, state: &LimiterState) -> Duration {
        let now = Instant::now();
        if let Some(until) = state.blocked_until {
            if until > now {
                return until - now;
            }
        }

        let Some(quota) = state.quota else {
            return Duration::ZERO;
        };
        if quota.remaining > self.config.reserve {
            return Duration::ZERO;
        }

        if quota.remaining == 0 {
            // Nothing left until the reset; a stale quota admits the write.
            let reset_in = quota.reset_in(Timestamp::now().as_secs());
            return reset_in.min(self.config.max_throttle);
        }

        match state.next_slot {
            Some(slot) if slot > now => slot - now,
            _ => Duration::ZERO,
        }
    }

    /// Gap to leave after a write admitted under a low quota.
    ///
    /// What is left is spread evenly over the time until the reset.
    fn spacing(&self, quota: &Quota) -> Duration {
        if quota.remaining > self.config.reserve {
            return Duration::ZERO;
        }
        let reset_in = quota.reset_in(Timestamp::now().as_secs());
        let slots = (quota.remaining.min(u32::MAX as u64) as u32).saturating_add(1);
        (reset_in / slots).min(self.config.max_throttle)
    }

    /// Take a slot for one write, or learn how long to wait for one.
    pub fn reserve_write(self: &Arc<Self>) -> Result<WritePermit, Duration> {
        let mut state = self.state.lock();
        let delay = self.delay_for(&state);
        if !delay.is_zero() {
            debug!(
                delay_ms = delay.as_millis() as u64,
                in_flight = state.in_flight,
                "Throttling write"
            );
            return Err(delay);
        }

        let state = &mut *state;
        state.in_flight += 1;
        if let Some(quota) = state.quota.as_mut() {
            let gap = self.spacing(quota);
            quota.remaining = quota.remaining.saturating_sub(1);
            state.next_slot = (!gap.is_zero()).then(|| Instant::now() + gap);
        }

        Ok(WritePermit {
            limiter: Arc::clone(self),
        })
    }

    pub fn snapshot(&self) -> QuotaSnapshot {
        let state = self.state.lock();
        let now = Instant::now();
        QuotaSnapshot {
            quota: state.quota,
            in_flight: state.in_flight,
            blocked_for: state
                .blocked_until
                .filter(|until| *until > now)
                .map(|until| until - now),
        }
    }
}

/// A reserved write slot; released on drop.
#[derive(Debug)]
pub struct WritePermit {
    limiter: Arc<RateLimiter>,
}

impl Drop for WritePermit {
    fn drop(&mut self) {
        let mut state = self.limiter.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
    }
}
