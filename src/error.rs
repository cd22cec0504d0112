use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Errors raised by the engine itself.
///
/// Business failures raised by readers, processors and writers travel as
/// [`Failure`] and surface through [`BatchError::Item`] unchanged, so a caller
/// can always get back to the root cause.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Flow configuration error: {0}")]
    FlowConfig(String),

    #[error("Flow execution error: {0}")]
    FlowExecution(String),

    #[error("{0}")]
    Item(Failure),

    #[error("Retry exhausted after last attempt with no recovery path: {source}")]
    RetryExhausted { source: Failure },

    #[error("Retry terminated: {0}")]
    RetryTerminated(String),

    #[error("Inconsistent retry state: {0}")]
    RetryState(String),

    #[error("Non-skippable failure in {phase}: {source}")]
    NonSkippable { phase: String, source: Failure },

    #[error("Skip limit of {limit} exceeded: {source}")]
    SkipLimitExceeded { limit: u64, source: Failure },

    #[error("Job interrupted: {0}")]
    JobInterrupted(String),

    #[error("Start limit of {limit} exceeded for step {step}")]
    StartLimitExceeded { step: String, limit: u32 },

    #[error("Job instance already complete: {0}")]
    InstanceAlreadyComplete(String),

    #[error("Job {0} is not restartable")]
    NotRestartable(String),

    #[error("No running job execution for {0}")]
    NotRunning(String),

    #[error("Job execution already running: {0}")]
    AlreadyRunning(String),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Task aborted: {0}")]
    TaskAborted(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl BatchError {
    /// The business failure at the root of this error, if any.
    pub fn root_cause(&self) -> Option<&Failure> {
        match self {
            BatchError::Item(f)
            | BatchError::RetryExhausted { source: f }
            | BatchError::NonSkippable { source: f, .. }
            | BatchError::SkipLimitExceeded { source: f, .. } => Some(f),
            _ => None,
        }
    }

    /// Converts the error into a [`Failure`], reusing the root cause when
    /// there is one.
    pub fn into_failure(self) -> Failure {
        match self {
            BatchError::Item(f) => f,
            other => Failure::new(other),
        }
    }

    pub fn is_interruption(&self) -> bool {
        matches!(self, BatchError::JobInterrupted(_))
    }
}

impl From<Failure> for BatchError {
    fn from(failure: Failure) -> Self {
        BatchError::Item(failure)
    }
}

/// A shareable business failure.
///
/// Cloning a `Failure` clones the handle, not the error: the retry layer keeps
/// the last failure in its context and still returns the very same instance
/// to the caller.
#[derive(Clone)]
pub struct Failure(Arc<anyhow::Error>);

impl Failure {
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(Arc::new(anyhow::Error::new(error)))
    }

    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self(Arc::new(anyhow::Error::msg(message)))
    }

    pub fn from_anyhow(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }

    /// True when the underlying error is of type `E`.
    pub fn is<E>(&self) -> bool
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>().is_some()
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    /// True when both handles point at the same failure instance.
    pub fn ptr_eq(a: &Failure, b: &Failure) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Failure({:?})", self.0)
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        (**self.0).source()
    }
}

impl From<anyhow::Error> for Failure {
    fn from(error: anyhow::Error) -> Self {
        Self::from_anyhow(error)
    }
}

/// Alias used by the library APIs.
pub type Result<T> = std::result::Result<T, BatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("bad record {0}")]
    struct BadRecord(u32);

    #[test]
    fn failure_downcasts_to_source_type() {
        let f = Failure::new(BadRecord(7));
        assert!(f.is::<BadRecord>());
        assert!(!f.is::<std::io::Error>());
        assert_eq!(f.downcast_ref::<BadRecord>().map(|b| b.0), Some(7));
        assert_eq!(f.to_string(), "bad record 7");
    }

    #[test]
    fn cloned_failure_is_same_instance() {
        let f = Failure::msg("boom");
        let g = f.clone();
        assert!(Failure::ptr_eq(&f, &g));
        assert!(!Failure::ptr_eq(&f, &Failure::msg("boom")));
    }

    #[test]
    fn root_cause_survives_wrapping() {
        let f = Failure::msg("disk full");
        let err = BatchError::SkipLimitExceeded { limit: 2, source: f.clone() };
        assert!(Failure::ptr_eq(err.root_cause().unwrap(), &f));
        assert_eq!(err.to_string(), "Skip limit of 2 exceeded: disk full");

        let item = BatchError::Item(f.clone());
        assert!(Failure::ptr_eq(&item.into_failure(), &f));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<BatchError>();
        assert_send_sync::<Failure>();
    }
}
