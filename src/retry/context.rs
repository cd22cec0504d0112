use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::Failure;

#[derive(Debug, Default)]
struct Attempts {
    retry_count: u32,
    last_failure: Option<Failure>,
    attributes: HashMap<String, String>,
}

/// Bookkeeping for one logical retry operation.
///
/// Shared as an `Arc` because stateful retries park the context in a
/// [`super::RetryContextCache`] between transactions.
#[derive(Debug)]
pub struct RetryContext {
    parent: Option<Arc<RetryContext>>,
    exhausted_only: AtomicBool,
    attempts: Mutex<Attempts>,
}

impl RetryContext {
    pub const RECOVERED: &'static str = "context.recovered";
    pub const STATE_KEY: &'static str = "context.state";

    pub fn new(parent: Option<Arc<RetryContext>>) -> Self {
        Self {
            parent,
            exhausted_only: AtomicBool::new(false),
            attempts: Mutex::new(Attempts::default()),
        }
    }

    fn attempts(&self) -> MutexGuard<'_, Attempts> {
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn parent(&self) -> Option<&Arc<RetryContext>> {
        self.parent.as_ref()
    }

    /// Number of failed attempts so far.
    pub fn retry_count(&self) -> u32 {
        self.attempts().retry_count
    }

    pub fn last_failure(&self) -> Option<Failure> {
        self.attempts().last_failure.clone()
    }

    /// Counts a failed attempt. A policy normally calls this from
    /// [`super::RetryPolicy::register_failure`].
    pub fn register_failure(&self, failure: Failure) {
        let mut attempts = self.attempts();
        attempts.retry_count += 1;
        attempts.last_failure = Some(failure);
    }

    /// Stops the retry loop before the next attempt.
    pub fn set_exhausted_only(&self) {
        self.exhausted_only.store(true, Ordering::SeqCst);
    }

    pub fn is_exhausted_only(&self) -> bool {
        self.exhausted_only.load(Ordering::SeqCst)
    }

    pub fn set_attribute(&self, key: &str, value: impl Into<String>) {
        self.attempts().attributes.insert(key.to_string(), value.into());
    }

    pub fn attribute(&self, key: &str) -> Option<String> {
        self.attempts().attributes.get(key).cloned()
    }

    pub fn has_attribute(&self, key: &str) -> bool {
        self.attempts().attributes.contains_key(key)
    }

    pub fn is_recovered(&self) -> bool {
        self.has_attribute(Self::RECOVERED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_failure_counts_and_keeps_last() {
        let ctx = RetryContext::new(None);
        let first = Failure::msg("first");
        let second = Failure::msg("second");
        ctx.register_failure(first);
        ctx.register_failure(second.clone());
        assert_eq!(ctx.retry_count(), 2);
        assert!(Failure::ptr_eq(&ctx.last_failure().unwrap(), &second));
    }

    #[test]
    fn parent_link_and_flags() {
        let parent = Arc::new(RetryContext::new(None));
        let child = RetryContext::new(Some(parent.clone()));
        assert!(Arc::ptr_eq(child.parent().unwrap(), &parent));
        assert!(!child.is_exhausted_only());
        child.set_exhausted_only();
        assert!(child.is_exhausted_only());
        child.set_attribute(RetryContext::RECOVERED, "true");
        assert!(child.is_recovered());
        assert_eq!(child.attribute(RetryContext::RECOVERED).as_deref(), Some("true"));
    }
}
