//! Token-bucket gate for absolute request rate
//!
//! Caps how many tasks the pool may start per minute, independently of
//! concurrency. Tokens refill continuously; a task consumes one token to
//! start. With the default burst of one token, task starts end up evenly
//! spaced at `60 / max_per_minute` seconds.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// A token was consumed; the task may start
    Allow,
    /// Insufficient tokens; retry after the given wait
    Deny { retry_after: Duration },
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Shared token bucket limiting task starts per minute.
pub struct RateLimiter {
    /// Tokens added per second
    rate_per_sec: f64,
    /// Bucket capacity (burst allowance)
    max_tokens: f64,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    /// Limiter allowing `max_per_minute` task starts per minute with no
    /// burst allowance.
    #[must_use]
    pub fn per_minute(max_per_minute: u64) -> Self {
        Self {
            rate_per_sec: max_per_minute as f64 / 60.0,
            max_tokens: 1.0,
            state: Mutex::new(BucketState {
                tokens: 1.0,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Try to consume one token.
    pub fn check(&self) -> RateLimitDecision {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.max_tokens);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            RateLimitDecision::Allow
        } else {
            let deficit = 1.0 - state.tokens;
            let wait_secs = if self.rate_per_sec > 0.0 {
                deficit / self.rate_per_sec
            } else {
                // zero rate never allows; poll slowly
                60.0
            };
            RateLimitDecision::Deny {
                retry_after: Duration::from_secs_f64(wait_secs),
            }
        }
    }

    /// Wait until a token is available or the token is cancelled.
    ///
    /// Returns `false` when cancelled before a token could be consumed.
    pub async fn acquire(&self, cancel: &CancellationToken) -> bool {
        loop {
            match self.check() {
                RateLimitDecision::Allow => return true,
                RateLimitDecision::Deny { retry_after } => {
                    tokio::select! {
                        () = tokio::time::sleep(retry_after) => {}
                        () = cancel.cancelled() => return false,
                    }
                }
            }
        }
    }
}
