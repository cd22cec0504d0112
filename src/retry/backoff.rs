use std::thread;
use std::time::Duration;

use tracing::trace;

use super::context::RetryContext;

/// Pause between failed attempts.
pub trait BackOffPolicy: Send + Sync {
    /// Delay before the next attempt, given the context after its failure.
    fn delay(&self, context: &RetryContext) -> Duration;

    fn back_off(&self, context: &RetryContext) {
        let delay = self.delay(context);
        if !delay.is_zero() {
            trace!(delay_ms = delay.as_millis() as u64, attempt = context.retry_count(), "backing off");
            thread::sleep(delay);
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackOffPolicy;

impl BackOffPolicy for NoBackOffPolicy {
    fn delay(&self, _context: &RetryContext) -> Duration {
        Duration::ZERO
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedBackOffPolicy {
    pub period: Duration,
}

impl FixedBackOffPolicy {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }
}

impl BackOffPolicy for FixedBackOffPolicy {
    fn delay(&self, _context: &RetryContext) -> Duration {
        self.period
    }
}

/// `base_delay_ms * 2^(attempt - 1)`, capped at `max_delay_ms`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackOffPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl ExponentialBackOffPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
        }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let factor = 2u64.checked_pow(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms)
    }
}

impl Default for ExponentialBackOffPolicy {
    fn default() -> Self {
        Self::new(100, 30_000)
    }
}

impl BackOffPolicy for ExponentialBackOffPolicy {
    fn delay(&self, context: &RetryContext) -> Duration {
        Duration::from_millis(self.delay_for_attempt(context.retry_count()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Failure;

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = ExponentialBackOffPolicy::new(1000, 5000);
        assert_eq!(policy.delay_for_attempt(1), 1000);
        assert_eq!(policy.delay_for_attempt(2), 2000);
        assert_eq!(policy.delay_for_attempt(3), 4000);
        assert_eq!(policy.delay_for_attempt(4), 5000);
        assert_eq!(policy.delay_for_attempt(80), 5000);
    }

    #[test]
    fn delay_follows_retry_count() {
        let policy = ExponentialBackOffPolicy::new(10, 1000);
        let ctx = RetryContext::new(None);
        ctx.register_failure(Failure::msg("a"));
        ctx.register_failure(Failure::msg("b"));
        assert_eq!(policy.delay(&ctx), Duration::from_millis(20));
        assert_eq!(NoBackOffPolicy.delay(&ctx), Duration::ZERO);
        assert_eq!(
            FixedBackOffPolicy::new(Duration::from_millis(5)).delay(&ctx),
            Duration::from_millis(5)
        );
    }
}
