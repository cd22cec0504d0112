//! Bounded retry with recovery.
//!
//! [`RetryTemplate`] is the only entry point the engine uses: the chunk step
//! wraps reads and processing in stateless retries and chunk writes in a
//! stateful retry keyed by chunk, so that attempts made in separate
//! transactions share one [`RetryContext`].

pub mod backoff;
pub mod cache;
pub mod classifier;
pub mod context;
pub mod listener;
pub mod policy;
pub mod template;

pub use backoff::{BackOffPolicy, ExponentialBackOffPolicy, FixedBackOffPolicy, NoBackOffPolicy};
pub use cache::RetryContextCache;
pub use classifier::FailureClassifier;
pub use context::RetryContext;
pub use listener::{RetryCounts, RetryListener, RetryStatistics};
pub use policy::{AlwaysRetryPolicy, NeverRetryPolicy, RetryPolicy, SimpleRetryPolicy};
pub use template::{RetryResult, RetryState, RetryTemplate, with_retry};
