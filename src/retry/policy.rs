use std::sync::Arc;

use super::classifier::FailureClassifier;
use super::context::RetryContext;
use crate::error::Failure;

/// Decides whether another attempt is allowed.
pub trait RetryPolicy: Send + Sync {
    /// Creates the context for a new retry operation.
    fn open(&self, parent: Option<Arc<RetryContext>>) -> Arc<RetryContext> {
        Arc::new(RetryContext::new(parent))
    }

    /// Consulted before every attempt, including the first.
    fn can_retry(&self, context: &RetryContext) -> bool;

    fn register_failure(&self, context: &RetryContext, failure: &Failure) {
        context.register_failure(failure.clone());
    }

    fn close(&self, _context: &RetryContext) {}
}

/// Retries failures accepted by a classifier up to a fixed number of
/// attempts (the first attempt included).
#[derive(Debug, Clone)]
pub struct SimpleRetryPolicy {
    max_attempts: u32,
    retryable: FailureClassifier,
}

impl SimpleRetryPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            retryable: FailureClassifier::all(),
        }
    }

    pub fn with_classifier(max_attempts: u32, retryable: FailureClassifier) -> Self {
        Self {
            max_attempts,
            retryable,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for SimpleRetryPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_ATTEMPTS)
    }
}

impl RetryPolicy for SimpleRetryPolicy {
    fn can_retry(&self, context: &RetryContext) -> bool {
        let retryable = context
            .last_failure()
            .is_none_or(|f| self.retryable.classify(&f));
        retryable && context.retry_count() < self.max_attempts
    }
}

/// Allows the first attempt only.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverRetryPolicy;

impl RetryPolicy for NeverRetryPolicy {
    fn can_retry(&self, context: &RetryContext) -> bool {
        context.last_failure().is_none()
    }
}

/// Retries forever. Only useful with a callback that eventually succeeds or
/// a listener that marks the context exhausted.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRetryPolicy;

impl RetryPolicy for AlwaysRetryPolicy {
    fn can_retry(&self, _context: &RetryContext) -> bool {
        true
    }
}
