//! Persistence boundary for job and step executions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;
use uuid::Uuid;

use super::job::{JobExecution, JobInstance, JobParameters};
use super::step::StepExecution;
use crate::error::{BatchError, Result};
use crate::status::BatchStatus;

/// Storage for execution metadata.
///
/// The engine calls [`JobRepository::update_step_execution`] at every chunk
/// commit boundary and when a step finishes.
pub trait JobRepository: Send + Sync {
    /// Creates a new execution for the instance identified by `job_name` and
    /// `parameters`, creating the instance on first launch. The execution is
    /// flagged as a restart when the instance already has executions.
    fn create_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Arc<JobExecution>>;

    fn update_job_execution(&self, execution: &JobExecution) -> Result<()>;

    fn add_step_execution(&self, step_execution: &StepExecution) -> Result<()>;

    fn update_step_execution(&self, step_execution: &StepExecution) -> Result<()>;

    /// Latest execution of `step_name` across all executions of `instance`.
    fn last_step_execution(
        &self,
        instance: &JobInstance,
        step_name: &str,
    ) -> Result<Option<StepExecution>>;

    fn step_execution_count(&self, instance: &JobInstance, step_name: &str) -> Result<u32>;

    fn last_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<Arc<JobExecution>>>;
}

#[derive(Default)]
struct Store {
    instances: HashMap<(String, JobParameters), JobInstance>,
    executions: HashMap<Uuid, Vec<Arc<JobExecution>>>,
    execution_instance: HashMap<Uuid, Uuid>,
    step_executions: HashMap<Uuid, Vec<StepExecution>>,
    step_updates: u64,
}

/// [`JobRepository`] kept in process memory.
#[derive(Default)]
pub struct InMemoryJobRepository {
    store: Mutex<Store>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of step execution writes so far.
    pub fn step_update_count(&self) -> u64 {
        self.store().step_updates
    }

    pub fn step_executions(&self, instance: &JobInstance) -> Vec<StepExecution> {
        self.store()
            .step_executions
            .get(&instance.id)
            .cloned()
            .unwrap_or_default()
    }

    fn instance_of(store: &Store, job_execution_id: Uuid) -> Result<Uuid> {
        store
            .execution_instance
            .get(&job_execution_id)
            .copied()
            .ok_or_else(|| {
                BatchError::Repository(format!("unknown job execution {job_execution_id}"))
            })
    }
}

impl JobRepository for InMemoryJobRepository {
    fn create_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Arc<JobExecution>> {
        let mut store = self.store();
        let key = (job_name.to_string(), parameters.clone());
        let instance = store
            .instances
            .entry(key)
            .or_insert_with(|| JobInstance::new(job_name, parameters.clone()))
            .clone();

        let previous = store
            .executions
            .get(&instance.id)
            .and_then(|execs| execs.last().cloned());
        if let Some(last) = &previous {
            let status = last.status();
            if status.is_running() {
                return Err(BatchError::AlreadyRunning(format!(
                    "{job_name} {parameters} (execution {})",
                    last.id()
                )));
            }
            if status == BatchStatus::Completed || status == BatchStatus::Abandoned {
                return Err(BatchError::InstanceAlreadyComplete(format!(
                    "{job_name} {parameters} is {status}"
                )));
            }
        }

        let execution = Arc::new(JobExecution::new(instance.clone(), previous.is_some()));
        if let Some(last) = previous {
            let context = last.execution_context();
            execution.update_execution_context(|ctx| *ctx = context);
        }
        debug!(job = job_name, execution = %execution.id(), restart = execution.is_restart(), "created job execution");
        store.execution_instance.insert(execution.id(), instance.id);
        store
            .executions
            .entry(instance.id)
            .or_default()
            .push(execution.clone());
        Ok(execution)
    }

    fn update_job_execution(&self, execution: &JobExecution) -> Result<()> {
        let store = self.store();
        Self::instance_of(&store, execution.id())?;
        Ok(())
    }

    fn add_step_execution(&self, step_execution: &StepExecution) -> Result<()> {
        let mut store = self.store();
        let instance = Self::instance_of(&store, step_execution.job_execution_id)?;
        store
            .step_executions
            .entry(instance)
            .or_default()
            .push(step_execution.clone());
        Ok(())
    }

    fn update_step_execution(&self, step_execution: &StepExecution) -> Result<()> {
        let mut store = self.store();
        let instance = Self::instance_of(&store, step_execution.job_execution_id)?;
        store.step_updates += 1;
        let steps = store.step_executions.entry(instance).or_default();
        match steps.iter_mut().find(|s| s.id == step_execution.id) {
            Some(existing) => *existing = step_execution.clone(),
            None => steps.push(step_execution.clone()),
        }
        Ok(())
    }

    fn last_step_execution(
        &self,
        instance: &JobInstance,
        step_name: &str,
    ) -> Result<Option<StepExecution>> {
        Ok(self
            .store()
            .step_executions
            .get(&instance.id)
            .and_then(|steps| steps.iter().rev().find(|s| s.step_name == step_name).cloned()))
    }

    fn step_execution_count(&self, instance: &JobInstance, step_name: &str) -> Result<u32> {
        let count = self
            .store()
            .step_executions
            .get(&instance.id)
            .map(|steps| steps.iter().filter(|s| s.step_name == step_name).count())
            .unwrap_or(0);
        Ok(count as u32)
    }

    fn last_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<Arc<JobExecution>>> {
        let store = self.store();
        let Some(instance) = store
            .instances
            .get(&(job_name.to_string(), parameters.clone()))
        else {
            return Ok(None);
        };
        Ok(store
            .executions
            .get(&instance.id)
            .and_then(|execs| execs.last().cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_execution_is_not_a_restart() {
        let repo = InMemoryJobRepository::new();
        let exec = repo.create_job_execution("job", &JobParameters::new()).unwrap();
        assert!(!exec.is_restart());
        assert_eq!(exec.job_name(), "job");
    }

    #[test]
    fn running_execution_blocks_a_second_one() {
        let repo = InMemoryJobRepository::new();
        let params = JobParameters::new().with("date", "2026-10-19");
        let exec = repo.create_job_execution("job", &params).unwrap();
        exec.start();
        let err = repo.create_job_execution("job", &params).unwrap_err();
        assert!(matches!(err, BatchError::AlreadyRunning(_)));
    }

    #[test]
    fn completed_instance_cannot_restart() {
        let repo = InMemoryJobRepository::new();
        let exec = repo.create_job_execution("job", &JobParameters::new()).unwrap();
        exec.set_status(BatchStatus::Completed);
        let err = repo.create_job_execution("job", &JobParameters::new()).unwrap_err();
        assert!(matches!(err, BatchError::InstanceAlreadyComplete(_)));
    }

    #[test]
    fn failed_instance_restarts_with_previous_context() {
        let repo = InMemoryJobRepository::new();
        let first = repo.create_job_execution("job", &JobParameters::new()).unwrap();
        first.update_execution_context(|ctx| ctx.put("cursor", 12)).unwrap();
        first.set_status(BatchStatus::Failed);

        let second = repo.create_job_execution("job", &JobParameters::new()).unwrap();
        assert!(second.is_restart());
        assert_eq!(second.instance().id, first.instance().id);
        assert_eq!(second.execution_context().get::<i32>("cursor").unwrap(), Some(12));
        let last = repo.last_job_execution("job", &JobParameters::new()).unwrap().unwrap();
        assert_eq!(last.id(), second.id());
    }

    #[test]
    fn step_executions_are_tracked_per_instance() {
        let repo = InMemoryJobRepository::new();
        let exec = repo.create_job_execution("job", &JobParameters::new()).unwrap();
        let mut step = StepExecution::new("load", exec.id());
        repo.add_step_execution(&step).unwrap();
        step.read_count = 3;
        repo.update_step_execution(&step).unwrap();

        let instance = exec.instance();
        assert_eq!(repo.step_execution_count(instance, "load").unwrap(), 1);
        assert_eq!(repo.last_step_execution(instance, "load").unwrap().unwrap().read_count, 3);
        assert!(repo.last_step_execution(instance, "other").unwrap().is_none());
        assert_eq!(repo.step_update_count(), 1);
    }

    #[test]
    fn unknown_execution_is_rejected() {
        let repo = InMemoryJobRepository::new();
        let step = StepExecution::new("load", Uuid::new_v4());
        assert!(matches!(
            repo.update_step_execution(&step),
            Err(BatchError::Repository(_))
        ));
    }
}
