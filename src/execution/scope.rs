//! Runtime contexts passed explicitly through the call chain.
//!
//! A [`StepContext`] travels with one step execution, a [`ChunkContext`]
//! lives for one commit interval, and the [`JobExecutionContext`] collects
//! both so that monitoring code can see what is running right now.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::job::JobExecution;
use super::repository::JobRepository;
use super::step::StepExecution;
use crate::error::Result;

/// Context of one running step, handed to [`crate::step::Step::execute`].
pub struct StepContext {
    step_name: String,
    step_execution_id: Uuid,
    job_execution: Arc<JobExecution>,
    repository: Arc<dyn JobRepository>,
    job_context: Option<Weak<JobExecutionContext>>,
}

impl StepContext {
    pub fn new(
        step_execution: &StepExecution,
        job_execution: Arc<JobExecution>,
        repository: Arc<dyn JobRepository>,
    ) -> Self {
        Self {
            step_name: step_execution.step_name.clone(),
            step_execution_id: step_execution.id,
            job_execution,
            repository,
            job_context: None,
        }
    }

    /// Links the context to the job-level registry of open contexts.
    pub fn with_job_context(mut self, job_context: &Arc<JobExecutionContext>) -> Self {
        self.job_context = Some(Arc::downgrade(job_context));
        self
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    pub fn step_execution_id(&self) -> Uuid {
        self.step_execution_id
    }

    pub fn job_execution(&self) -> &Arc<JobExecution> {
        &self.job_execution
    }

    pub fn repository(&self) -> &Arc<dyn JobRepository> {
        &self.repository
    }

    pub fn is_stop_requested(&self) -> bool {
        self.job_execution.is_stopping()
    }

    /// Makes a chunk visible to monitoring until [`StepContext::close_chunk`].
    pub fn open_chunk(&self, chunk_number: u64) -> ChunkContext {
        let chunk = ChunkContext::new(self, chunk_number);
        if let Some(job_context) = self.job_context.as_ref().and_then(Weak::upgrade) {
            job_context.register_chunk_context(chunk.clone());
        }
        chunk
    }

    pub fn close_chunk(&self, chunk: &ChunkContext) {
        if let Some(job_context) = self.job_context.as_ref().and_then(Weak::upgrade) {
            job_context.unregister_chunk_context(chunk.id);
        }
    }

    /// Persists the step execution and refreshes the job's snapshot of it.
    pub fn update(&self, step_execution: &StepExecution) -> Result<()> {
        self.repository.update_step_execution(step_execution)?;
        self.job_execution.add_step_execution(step_execution.clone());
        Ok(())
    }
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("step_name", &self.step_name)
            .field("step_execution_id", &self.step_execution_id)
            .field("job_execution_id", &self.job_execution.id())
            .finish()
    }
}

/// One commit interval in flight.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkContext {
    pub id: Uuid,
    pub step_name: String,
    pub step_execution_id: Uuid,
    pub chunk_number: u64,
    pub started_at: DateTime<Utc>,
}

impl ChunkContext {
    pub fn new(step_context: &StepContext, chunk_number: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            step_name: step_context.step_name().to_string(),
            step_execution_id: step_context.step_execution_id(),
            chunk_number,
            started_at: Utc::now(),
        }
    }
}

/// Registry of the step and chunk contexts open for one job execution.
///
/// Each collection has its own lock; snapshot reads return copies taken
/// under that lock.
pub struct JobExecutionContext {
    job_execution: Arc<JobExecution>,
    step_contexts: Mutex<Vec<Arc<StepContext>>>,
    chunk_contexts: Mutex<Vec<ChunkContext>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl JobExecutionContext {
    pub fn new(job_execution: Arc<JobExecution>) -> Self {
        Self {
            job_execution,
            step_contexts: Mutex::new(Vec::new()),
            chunk_contexts: Mutex::new(Vec::new()),
        }
    }

    pub fn job_execution(&self) -> &Arc<JobExecution> {
        &self.job_execution
    }

    pub fn register_step_context(&self, context: Arc<StepContext>) {
        lock(&self.step_contexts).push(context);
    }

    pub fn unregister_step_context(&self, step_execution_id: Uuid) {
        lock(&self.step_contexts).retain(|c| c.step_execution_id() != step_execution_id);
    }

    pub fn step_contexts(&self) -> Vec<Arc<StepContext>> {
        lock(&self.step_contexts).clone()
    }

    pub fn register_chunk_context(&self, context: ChunkContext) {
        lock(&self.chunk_contexts).push(context);
    }

    pub fn unregister_chunk_context(&self, id: Uuid) {
        lock(&self.chunk_contexts).retain(|c| c.id != id);
    }

    pub fn chunk_contexts(&self) -> Vec<ChunkContext> {
        lock(&self.chunk_contexts).clone()
    }
}

impl std::fmt::Debug for JobExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutionContext")
            .field("job_execution_id", &self.job_execution.id())
            .field("step_contexts", &lock(&self.step_contexts).len())
            .field("chunk_contexts", &lock(&self.chunk_contexts).len())
            .finish()
    }
}
