use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::context::RetryContext;
use crate::error::{BatchError, Result};

/// Parks retry contexts of stateful retries between transactions.
#[derive(Debug)]
pub struct RetryContextCache {
    capacity: usize,
    entries: Mutex<HashMap<String, Arc<RetryContext>>>,
}

impl RetryContextCache {
    pub const DEFAULT_CAPACITY: usize = 4096;

    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Arc<RetryContext>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Option<Arc<RetryContext>> {
        self.entries().get(key).cloned()
    }

    /// Stores a context. Fails when a new key would exceed the capacity,
    /// which usually means keys are not being removed.
    pub fn put(&self, key: &str, context: Arc<RetryContext>) -> Result<()> {
        let mut entries = self.entries();
        if !entries.contains_key(key) && entries.len() >= self.capacity {
            return Err(BatchError::RetryState(format!(
                "retry context cache capacity of {} exceeded",
                self.capacity
            )));
        }
        entries.insert(key.to_string(), context);
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Option<Arc<RetryContext>> {
        self.entries().remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

impl Default for RetryContextCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
