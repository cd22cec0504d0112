use std::sync::{Mutex, PoisonError};

use serde::Serialize;

use super::context::RetryContext;
use crate::error::Failure;

/// Callbacks around a retry operation.
///
/// `open` runs in registration order before the first attempt; `on_error`
/// and `close` run in reverse order.
pub trait RetryListener: Send + Sync {
    /// Returning `false` vetoes the whole retry operation.
    fn open(&self, _context: &RetryContext) -> bool {
        true
    }

    fn on_error(&self, _context: &RetryContext, _failure: &Failure) {}

    /// Called once, with the last failure or `None` on success.
    fn close(&self, _context: &RetryContext, _failure: Option<&Failure>) {}
}

/// Counters collected by [`RetryStatistics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryCounts {
    pub started: u64,
    pub completed: u64,
    pub recovered: u64,
    pub aborted: u64,
    pub errors: u64,
}

/// Listener that counts retry outcomes.
#[derive(Debug, Default)]
pub struct RetryStatistics {
    name: String,
    counts: Mutex<RetryCounts>,
}

impl RetryStatistics {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            counts: Mutex::new(RetryCounts::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn snapshot(&self) -> RetryCounts {
        *self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut RetryCounts)) {
        f(&mut self.counts.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

impl RetryListener for RetryStatistics {
    fn open(&self, _context: &RetryContext) -> bool {
        self.update(|c| c.started += 1);
        true
    }

    fn on_error(&self, _context: &RetryContext, _failure: &Failure) {
        self.update(|c| c.errors += 1);
    }

    fn close(&self, context: &RetryContext, failure: Option<&Failure>) {
        if context.is_recovered() {
            self.update(|c| c.recovered += 1);
        } else if failure.is_some() {
            self.update(|c| c.aborted += 1);
        } else {
            self.update(|c| c.completed += 1);
        }
    }
}
