//! Engine configuration loaded from `skein.toml`.
//!
//! [`BatchConfig`] holds the defaults steps are built with. Fields missing
//! from the file fall back to sensible defaults; `SKEIN_COMMIT_INTERVAL` takes
//! precedence over the file.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::retry::{
    BackOffPolicy, ExponentialBackOffPolicy, FailureClassifier, NoBackOffPolicy, SimpleRetryPolicy,
};

pub const CONFIG_FILE: &str = "skein.toml";
pub const COMMIT_INTERVAL_ENV: &str = "SKEIN_COMMIT_INTERVAL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Items per chunk transaction.
    #[serde(default = "default_commit_interval")]
    pub commit_interval: usize,

    /// Attempts per item, the first one included.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,

    /// Skips allowed per step execution.
    #[serde(default = "default_skip_limit")]
    pub skip_limit: u64,

    /// Base delay of the exponential back-off; 0 disables back-off.
    #[serde(default)]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Worker threads for split branches.
    #[serde(default = "default_split_threads")]
    pub split_threads: usize,

    /// `tracing` filter directive used when `SKEIN_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_commit_interval() -> usize {
    10
}

fn default_retry_limit() -> u32 {
    3
}

fn default_skip_limit() -> u64 {
    10
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_split_threads() -> usize {
    4
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            commit_interval: default_commit_interval(),
            retry_limit: default_retry_limit(),
            skip_limit: default_skip_limit(),
            backoff_base_ms: 0,
            backoff_max_ms: default_backoff_max_ms(),
            split_threads: default_split_threads(),
            log_filter: default_log_filter(),
        }
    }
}

impl BatchConfig {
    /// Loads `skein.toml` from the current directory, or the defaults when
    /// it does not exist, then applies environment overrides.
    pub fn load() -> Result<Self> {
        let path = Path::new(CONFIG_FILE);
        let mut config = if path.exists() {
            Self::from_path(path)?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config = toml::from_str::<BatchConfig>(&contents)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Applies overrides found through `lookup`, normally the process
    /// environment.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = lookup(COMMIT_INTERVAL_ENV)
            && !value.is_empty()
        {
            self.commit_interval = value
                .parse()
                .with_context(|| format!("{COMMIT_INTERVAL_ENV}={value} is not a number"))?;
        }
        Ok(())
    }

    /// Retries failures accepted by `retryable` up to `retry_limit` attempts.
    pub fn retry_policy(&self, retryable: FailureClassifier) -> SimpleRetryPolicy {
        SimpleRetryPolicy::with_classifier(self.retry_limit, retryable)
    }

    pub fn backoff_policy(&self) -> Arc<dyn BackOffPolicy> {
        if self.backoff_base_ms == 0 {
            Arc::new(NoBackOffPolicy)
        } else {
            Arc::new(ExponentialBackOffPolicy::new(
                self.backoff_base_ms,
                self.backoff_max_ms,
            ))
        }
    }
}
