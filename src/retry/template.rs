use std::sync::Arc;

use tracing::debug;

use super::backoff::{BackOffPolicy, NoBackOffPolicy};
use super::cache::RetryContextCache;
use super::classifier::FailureClassifier;
use super::context::RetryContext;
use super::listener::RetryListener;
use super::policy::{RetryPolicy, SimpleRetryPolicy};
use crate::error::{BatchError, Failure, Result};

/// Outcome of a single attempt.
pub type RetryResult<T> = std::result::Result<T, Failure>;

type NoRecovery<T> = fn(&RetryContext) -> Result<T>;

/// Identity of a stateful retry across transactions.
///
/// Two calls with the same key share one [`RetryContext`], so attempts made
/// in separate transactions still count against the same limit.
#[derive(Debug, Clone)]
pub struct RetryState {
    key: String,
    force_refresh: bool,
    rollback: FailureClassifier,
}

impl RetryState {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            force_refresh: false,
            rollback: FailureClassifier::all(),
        }
    }

    /// Skip the cache lookup: the caller knows this key is fresh.
    pub fn with_force_refresh(mut self, force_refresh: bool) -> Self {
        self.force_refresh = force_refresh;
        self
    }

    /// Failures classified `false` are retried in place instead of being
    /// handed back to the caller for a rollback.
    pub fn with_rollback_classifier(mut self, rollback: FailureClassifier) -> Self {
        self.rollback = rollback;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_force_refresh(&self) -> bool {
        self.force_refresh
    }

    pub fn rollback_for(&self, failure: &Failure) -> bool {
        self.rollback.classify(failure)
    }
}

/// Runs a callback under a [`RetryPolicy`], with back-off, listeners and an
/// optional recovery path.
///
/// Stateless execution loops in place. Stateful execution (with a
/// [`RetryState`]) returns the failure to the caller after every failed
/// attempt so that it can roll back, and picks the context up from the cache
/// on the next call with the same key.
#[derive(Clone)]
pub struct RetryTemplate {
    policy: Arc<dyn RetryPolicy>,
    backoff: Arc<dyn BackOffPolicy>,
    listeners: Vec<Arc<dyn RetryListener>>,
    cache: Arc<RetryContextCache>,
}

impl Default for RetryTemplate {
    fn default() -> Self {
        Self::new(SimpleRetryPolicy::default())
    }
}

impl RetryTemplate {
    pub fn new(policy: impl RetryPolicy + 'static) -> Self {
        Self::with_policy(Arc::new(policy))
    }

    pub fn with_policy(policy: Arc<dyn RetryPolicy>) -> Self {
        Self {
            policy,
            backoff: Arc::new(NoBackOffPolicy),
            listeners: Vec::new(),
            cache: Arc::new(RetryContextCache::default()),
        }
    }

    pub fn with_backoff(mut self, backoff: Arc<dyn BackOffPolicy>) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn RetryListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn with_cache(mut self, cache: Arc<RetryContextCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn cache(&self) -> &Arc<RetryContextCache> {
        &self.cache
    }

    /// Retries until success or exhaustion. An exhausted retry returns the
    /// last failure unchanged as [`BatchError::Item`].
    pub fn execute<T, F>(&self, callback: F) -> Result<T>
    where
        F: FnMut(&RetryContext) -> RetryResult<T>,
    {
        self.do_execute(callback, None::<NoRecovery<T>>, None, None)
    }

    pub fn execute_with_recovery<T, F, R>(&self, callback: F, recovery: R) -> Result<T>
    where
        F: FnMut(&RetryContext) -> RetryResult<T>,
        R: FnOnce(&RetryContext) -> Result<T>,
    {
        self.do_execute(callback, Some(recovery), None, None)
    }

    /// Stateful execution keyed by `state`. Without a recovery path an
    /// exhausted retry yields [`BatchError::RetryExhausted`].
    pub fn execute_stateful<T, F, R>(
        &self,
        callback: F,
        recovery: Option<R>,
        state: &RetryState,
    ) -> Result<T>
    where
        F: FnMut(&RetryContext) -> RetryResult<T>,
        R: FnOnce(&RetryContext) -> Result<T>,
    {
        self.do_execute(callback, recovery, Some(state), None)
    }

    /// Stateless execution whose context is a child of `parent`.
    pub fn execute_nested<T, F>(&self, parent: &Arc<RetryContext>, callback: F) -> Result<T>
    where
        F: FnMut(&RetryContext) -> RetryResult<T>,
    {
        self.do_execute(callback, None::<NoRecovery<T>>, None, Some(parent.clone()))
    }

    fn do_execute<T, F, R>(
        &self,
        mut callback: F,
        recovery: Option<R>,
        state: Option<&RetryState>,
        parent: Option<Arc<RetryContext>>,
    ) -> Result<T>
    where
        F: FnMut(&RetryContext) -> RetryResult<T>,
        R: FnOnce(&RetryContext) -> Result<T>,
    {
        let context = self.open(state, parent);
        if let Some(state) = state {
            context.set_attribute(RetryContext::STATE_KEY, state.key());
        }

        let mut last_failure = None;
        let result = self.run(&context, &mut callback, recovery, state, &mut last_failure);

        self.close(&context, state, last_failure.is_none());
        for listener in self.listeners.iter().rev() {
            listener.close(&context, last_failure.as_ref());
        }
        result
    }

    fn run<T, F, R>(
        &self,
        context: &Arc<RetryContext>,
        callback: &mut F,
        recovery: Option<R>,
        state: Option<&RetryState>,
        last_failure: &mut Option<Failure>,
    ) -> Result<T>
    where
        F: FnMut(&RetryContext) -> RetryResult<T>,
        R: FnOnce(&RetryContext) -> Result<T>,
    {
        if !self.listeners.iter().all(|l| l.open(context)) {
            return Err(BatchError::RetryTerminated(
                "listener vetoed the retry before the first attempt".to_string(),
            ));
        }

        while self.policy.can_retry(context) && !context.is_exhausted_only() {
            debug!(count = context.retry_count(), "retry attempt");
            *last_failure = None;
            let failure = match callback(context) {
                Ok(value) => return Ok(value),
                Err(failure) => failure,
            };
            *last_failure = Some(failure.clone());

            for listener in self.listeners.iter().rev() {
                listener.on_error(context, &failure);
            }
            self.register_failure(context, state, &failure)?;

            if self.policy.can_retry(context) && !context.is_exhausted_only() {
                self.backoff.back_off(context);
            }

            if let Some(state) = state
                && state.rollback_for(&failure)
            {
                debug!(key = state.key(), count = context.retry_count(), "rethrowing for rollback");
                return Err(BatchError::Item(failure));
            }
        }

        debug!(count = context.retry_count(), "retry failed last attempt");
        if context.is_exhausted_only() {
            return Err(match context.last_failure() {
                Some(source) => BatchError::RetryExhausted { source },
                None => BatchError::RetryTerminated(
                    "context marked exhausted before the first attempt".to_string(),
                ),
            });
        }
        self.handle_exhausted(context, recovery, state)
    }

    fn open(&self, state: Option<&RetryState>, parent: Option<Arc<RetryContext>>) -> Arc<RetryContext> {
        let Some(state) = state else {
            return self.policy.open(parent);
        };
        if state.is_force_refresh() {
            return self.policy.open(parent);
        }
        match self.cache.get(state.key()) {
            Some(context) => context,
            None => self.policy.open(parent),
        }
    }

    fn register_failure(
        &self,
        context: &Arc<RetryContext>,
        state: Option<&RetryState>,
        failure: &Failure,
    ) -> Result<()> {
        if let Some(state) = state {
            if context.retry_count() > 0 && !self.cache.contains_key(state.key()) {
                return Err(BatchError::RetryState(format!(
                    "cache entry for key {} disappeared between attempts",
                    state.key()
                )));
            }
            self.cache.put(state.key(), context.clone())?;
        }
        self.policy.register_failure(context, failure);
        Ok(())
    }

    fn handle_exhausted<T, R>(
        &self,
        context: &RetryContext,
        recovery: Option<R>,
        state: Option<&RetryState>,
    ) -> Result<T>
    where
        R: FnOnce(&RetryContext) -> Result<T>,
    {
        if let Some(state) = state {
            self.cache.remove(state.key());
        }
        if let Some(recovery) = recovery {
            let value = recovery(context)?;
            context.set_attribute(RetryContext::RECOVERED, "true");
            return Ok(value);
        }
        match (state, context.last_failure()) {
            (Some(_), Some(source)) => Err(BatchError::RetryExhausted { source }),
            (None, Some(failure)) => Err(BatchError::Item(failure)),
            (_, None) => Err(BatchError::RetryTerminated(
                "retry policy refused the first attempt".to_string(),
            )),
        }
    }

    fn close(&self, context: &RetryContext, state: Option<&RetryState>, succeeded: bool) {
        match state {
            Some(state) => {
                if succeeded {
                    self.cache.remove(state.key());
                    self.policy.close(context);
                }
            }
            None => self.policy.close(context),
        }
    }
}

/// Wraps `operation` in a stateless retry under `policy`.
pub fn with_retry<T, F>(policy: impl RetryPolicy + 'static, operation: F) -> Result<T>
where
    F: FnMut(&RetryContext) -> RetryResult<T>,
{
    RetryTemplate::new(policy).execute(operation)
}
