use crate::error::{BatchError, Failure, Result};
use crate::retry::FailureClassifier;

/// Decides whether a failed item may be dropped.
pub trait SkipPolicy: Send + Sync {
    /// Classification only, ignoring any limit.
    fn is_skippable(&self, failure: &Failure) -> bool;

    /// `skip_count` is the number of skips the step has made so far,
    /// including the current chunk.
    fn should_skip(&self, failure: &Failure, _skip_count: u64) -> Result<bool> {
        Ok(self.is_skippable(failure))
    }
}

/// Skips classified failures until a limit is reached, then fails the step
/// with [`BatchError::SkipLimitExceeded`].
#[derive(Debug, Clone)]
pub struct LimitCheckingSkipPolicy {
    limit: u64,
    skippable: FailureClassifier,
}

impl LimitCheckingSkipPolicy {
    pub fn new(limit: u64, skippable: FailureClassifier) -> Self {
        Self { limit, skippable }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }
}

impl SkipPolicy for LimitCheckingSkipPolicy {
    fn is_skippable(&self, failure: &Failure) -> bool {
        self.skippable.classify(failure)
    }

    fn should_skip(&self, failure: &Failure, skip_count: u64) -> Result<bool> {
        if !self.skippable.classify(failure) {
            return Ok(false);
        }
        if skip_count < self.limit {
            Ok(true)
        } else {
            Err(BatchError::SkipLimitExceeded {
                limit: self.limit,
                source: failure.clone(),
            })
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysSkipItemPolicy;

impl SkipPolicy for AlwaysSkipItemPolicy {
    fn is_skippable(&self, _failure: &Failure) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NeverSkipItemPolicy;

impl SkipPolicy for NeverSkipItemPolicy {
    fn is_skippable(&self, _failure: &Failure) -> bool {
        false
    }
}

/// Notified after the chunk holding a skipped item commits.
pub trait SkipListener<I, O>: Send + Sync {
    fn on_skip_in_read(&self, _failure: &Failure) {}

    fn on_skip_in_process(&self, _item: &I, _failure: &Failure) {}

    fn on_skip_in_write(&self, _item: &O, _failure: &Failure) {}
}
