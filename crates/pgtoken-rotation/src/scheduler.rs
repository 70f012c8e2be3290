//! Refresh cadence and retry back-off
//!
//! Pure timing decisions; the engine owns the sleeping. All inputs are unix
//! milliseconds from the engine's clock.

use std::time::Duration;

use pgtoken_auth::Token;

/// Shortest delay a pulled-forward retry may use.
pub const MIN_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Exponential back-off bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    /// Delay after `failures` consecutive failures: `base * 2^(failures-1)`,
    /// capped at `max`. Zero failures means no delay.
    pub fn backoff(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32 << failures.saturating_sub(1).min(31);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    policy: RetryPolicy,
}

impl Scheduler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// When the next scheduled refresh for `token` is due.
    pub fn refresh_deadline(&self, token: &Token) -> u64 {
        token.refresh_at_ms()
    }

    /// Wait after a successful rotation.
    pub fn after_success(&self, token: &Token, now_ms: u64) -> Duration {
        Duration::from_millis(self.refresh_deadline(token).saturating_sub(now_ms))
    }

    /// Wait after a failed attempt.
    ///
    /// Back-off, raised to any server `Retry-After` (itself capped at the
    /// policy maximum), then pulled forward to half the remaining lifetime if
    /// it would otherwise reach the expiry of the token currently backing the
    /// artifact. Never below [`MIN_RETRY_DELAY`] once pulled forward.
    pub fn after_failure(
        &self,
        current: Option<&Token>,
        failures: u32,
        retry_after: Option<Duration>,
        now_ms: u64,
    ) -> Duration {
        let mut delay = self.policy.backoff(failures);
        if let Some(hint) = retry_after {
            delay = delay.max(hint.min(self.policy.max));
        }
        if let Some(token) = current
            && !token.is_expired(now_ms)
        {
            let remaining = token.remaining(now_ms);
            if delay >= remaining {
                delay = (remaining / 2).max(MIN_RETRY_DELAY);
            }
        }
        delay
    }
}
