use std::fmt;
use std::sync::Arc;

use crate::error::Failure;

/// Yes/no classification of a [`Failure`], shared by retry, skip and
/// rollback decisions.
#[derive(Clone)]
pub struct FailureClassifier {
    predicate: Arc<dyn Fn(&Failure) -> bool + Send + Sync>,
}

impl FailureClassifier {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&Failure) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
        }
    }

    /// Classifies every failure as `true`.
    pub fn all() -> Self {
        Self::new(|_| true)
    }

    /// Classifies every failure as `false`.
    pub fn none() -> Self {
        Self::new(|_| false)
    }

    /// `true` only for failures whose underlying error is an `E`.
    pub fn only<E>() -> Self
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self::new(|f| f.is::<E>())
    }

    /// `true` for everything except failures whose underlying error is an `E`.
    pub fn except<E>() -> Self
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self::new(|f| !f.is::<E>())
    }

    pub fn classify(&self, failure: &Failure) -> bool {
        (self.predicate)(failure)
    }
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self::all()
    }
}

impl fmt::Debug for FailureClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FailureClassifier")
    }
}
