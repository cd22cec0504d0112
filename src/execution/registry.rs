//! In-flight job registry used by the launcher and monitoring tools.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use super::scope::JobExecutionContext;
use crate::error::{BatchError, Result};

/// Registry key: job name plus an optional label such as a schedule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobIdentifier {
    pub name: String,
    pub label: Option<String>,
}

impl JobIdentifier {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: None,
        }
    }

    pub fn with_label(name: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: Some(label.into()),
        }
    }
}

impl fmt::Display for JobIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "{}|{}", self.name, label),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Running job executions keyed by [`JobIdentifier`].
#[derive(Debug, Default)]
pub struct JobExecutionRegistry {
    entries: RwLock<HashMap<JobIdentifier, Arc<JobExecutionContext>>>,
}

impl JobExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a running execution. Fails if the identifier is already
    /// registered, which is how duplicate launches are refused.
    pub fn register(&self, id: JobIdentifier, context: Arc<JobExecutionContext>) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&id) {
            return Err(BatchError::AlreadyRunning(id.to_string()));
        }
        entries.insert(id, context);
        Ok(())
    }

    pub fn unregister(&self, id: &JobIdentifier) -> Option<Arc<JobExecutionContext>> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    pub fn is_registered(&self, id: &JobIdentifier) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    pub fn get(&self, id: &JobIdentifier) -> Option<Arc<JobExecutionContext>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// All registered identifiers, sorted.
    pub fn find_all(&self) -> Vec<JobIdentifier> {
        let mut ids: Vec<_> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn find_by_name(&self, name: &str) -> Vec<JobIdentifier> {
        self.find_all().into_iter().filter(|id| id.name == name).collect()
    }
}
