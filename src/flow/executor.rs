use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::error::{BatchError, Result};
use crate::execution::{JobExecution, JobExecutionContext, JobRepository, StepContext, StepExecution};
use crate::status::{BatchStatus, ExitStatus, FlowExecutionStatus};
use crate::step::Step;

/// What the states of a flow need from the job running them.
pub trait FlowExecutor: Send + Sync {
    /// Runs a step and returns its exit code for transition matching.
    fn execute_step(&self, step: &dyn Step) -> Result<String>;

    fn job_execution(&self) -> &Arc<JobExecution>;

    /// The step execution most recently run or skipped by this executor.
    fn step_execution(&self) -> Option<StepExecution>;

    /// Marks the last step execution ABANDONED when it did not complete, so
    /// a restart does not replay it.
    fn abandon_step_execution(&self) -> Result<()>;

    /// True at the very beginning of an execution, or right after a step
    /// was abandoned by a stop-and-restart end state.
    fn is_restart(&self) -> bool;

    fn add_exit_status(&self, code: &str);

    fn update_job_execution_status(&self, status: &FlowExecutionStatus);

    /// An executor for a concurrent branch: same job, own last step.
    fn branch(&self) -> Arc<dyn FlowExecutor>;
}

/// The [`FlowExecutor`] used by jobs: persists through a [`JobRepository`]
/// and registers running steps in the job's [`JobExecutionContext`].
pub struct JobFlowExecutor {
    repository: Arc<dyn JobRepository>,
    job_context: Arc<JobExecutionContext>,
    last_step: Mutex<Option<StepExecution>>,
}

impl JobFlowExecutor {
    pub fn new(repository: Arc<dyn JobRepository>, job_context: Arc<JobExecutionContext>) -> Self {
        Self {
            repository,
            job_context,
            last_step: Mutex::new(None),
        }
    }

    fn last_step(&self) -> MutexGuard<'_, Option<StepExecution>> {
        self.last_step.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The previous execution of `step` in this job instance, if it ran in an
    /// earlier job execution. Errors when the step cannot be started again.
    fn previous_execution(&self, step: &dyn Step) -> Result<Option<StepExecution>> {
        let job = self.job_context.job_execution();
        let last = self
            .repository
            .last_step_execution(job.instance(), step.name())?
            .filter(|last| last.job_execution_id != job.id());
        if let Some(last) = &last
            && last.status == BatchStatus::Unknown
        {
            return Err(BatchError::FlowExecution(format!(
                "cannot restart step {} from UNKNOWN status",
                step.name()
            )));
        }
        Ok(last)
    }

    fn should_start(&self, step: &dyn Step, last: Option<&StepExecution>) -> Result<bool> {
        if let Some(last) = last
            && last.status == BatchStatus::Completed
            && !step.allow_start_if_complete()
        {
            return Ok(false);
        }
        let job = self.job_context.job_execution();
        let count = self.repository.step_execution_count(job.instance(), step.name())?;
        if count >= step.start_limit() {
            return Err(BatchError::StartLimitExceeded {
                step: step.name().to_string(),
                limit: step.start_limit(),
            });
        }
        Ok(true)
    }
}

impl FlowExecutor for JobFlowExecutor {
    fn execute_step(&self, step: &dyn Step) -> Result<String> {
        let job = self.job_context.job_execution();
        if job.is_stopping() {
            return Err(BatchError::JobInterrupted(format!(
                "job {} stopped before step {}",
                job.job_name(),
                step.name()
            )));
        }

        let last = self.previous_execution(step)?;
        if !self.should_start(step, last.as_ref())? {
            let code = last
                .as_ref()
                .map(|l| l.exit_status.exit_code().to_string())
                .unwrap_or_else(|| ExitStatus::COMPLETED_CODE.to_string());
            info!(step = step.name(), "step already complete, not restarting");
            *self.last_step() = last;
            return Ok(code);
        }

        let mut step_execution = StepExecution::new(step.name(), job.id());
        if let Some(last) = last.filter(|l| l.status != BatchStatus::Completed) {
            debug!(step = step.name(), "restoring execution context of previous run");
            step_execution.execution_context = last.execution_context;
        }
        self.repository.add_step_execution(&step_execution)?;
        job.add_step_execution(step_execution.clone());

        let context = Arc::new(
            StepContext::new(&step_execution, job.clone(), self.repository.clone())
                .with_job_context(&self.job_context),
        );
        self.job_context.register_step_context(context.clone());
        let result = step.execute(&mut step_execution, &context);
        self.job_context.unregister_step_context(step_execution.id);

        let code = step_execution.exit_status.exit_code().to_string();
        let stopped = step_execution.status == BatchStatus::Stopped;
        *self.last_step() = Some(step_execution);
        result?;

        if stopped {
            job.upgrade_status(BatchStatus::Stopping);
            return Err(BatchError::JobInterrupted(format!(
                "job {} interrupted by step {}",
                job.job_name(),
                step.name()
            )));
        }
        Ok(code)
    }

    fn job_execution(&self) -> &Arc<JobExecution> {
        self.job_context.job_execution()
    }

    fn step_execution(&self) -> Option<StepExecution> {
        self.last_step().clone()
    }

    fn abandon_step_execution(&self) -> Result<()> {
        let mut last = self.last_step();
        let Some(step_execution) = last.as_mut() else {
            return Ok(());
        };
        if matches!(
            step_execution.status,
            BatchStatus::Stopped | BatchStatus::Failed | BatchStatus::Unknown
        ) {
            warn!(step = %step_execution.step_name, status = %step_execution.status, "abandoning step execution");
            step_execution.status = BatchStatus::Abandoned;
            self.repository.update_step_execution(step_execution)?;
            self.job_execution().add_step_execution(step_execution.clone());
        }
        Ok(())
    }

    fn is_restart(&self) -> bool {
        if let Some(last) = self.last_step().as_ref()
            && last.status == BatchStatus::Abandoned
        {
            return true;
        }
        self.job_execution().step_executions().is_empty()
    }

    fn add_exit_status(&self, code: &str) {
        let job = self.job_execution();
        job.set_exit_status(job.exit_status().and(&ExitStatus::new(code)));
    }

    fn update_job_execution_status(&self, status: &FlowExecutionStatus) {
        let job = self.job_execution();
        let batch_status = BatchStatus::from_flow_status(status);
        job.set_status(batch_status);
        if batch_status == BatchStatus::Unknown {
            job.set_exit_status(job.exit_status().replace_exit_code(status.name()));
        } else {
            self.add_exit_status(status.name());
        }
    }

    fn branch(&self) -> Arc<dyn FlowExecutor> {
        Arc::new(Self::new(self.repository.clone(), self.job_context.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Failure;
    use crate::execution::{InMemoryJobRepository, JobParameters};
    use crate::status::ExitStatus;
    use crate::step::{RepeatStatus, TaskletStep};

    fn executor(repo: &Arc<InMemoryJobRepository>) -> JobFlowExecutor {
        let job = repo.create_job_execution("job", &JobParameters::new()).unwrap();
        job.start();
        JobFlowExecutor::new(repo.clone(), Arc::new(JobExecutionContext::new(job)))
    }

    fn finishing(name: &str) -> TaskletStep {
        TaskletStep::new(
            name,
            |_: &mut crate::execution::StepContribution, _: &StepContext| -> std::result::Result<RepeatStatus, Failure> {
                Ok(RepeatStatus::Finished)
            },
        )
    }

    #[test]
    fn executes_step_and_records_it() {
        let repo = Arc::new(InMemoryJobRepository::new());
        let exec = executor(&repo);
        assert!(exec.is_restart());
        let code = exec.execute_step(&finishing("load")).unwrap();
        assert_eq!(code, "COMPLETED");
        assert!(!exec.is_restart());
        assert_eq!(exec.step_execution().unwrap().status, BatchStatus::Completed);
        assert_eq!(exec.job_execution().step_executions().len(), 1);
        assert!(exec.job_context.step_contexts().is_empty());
    }

    #[test]
    fn completed_step_is_skipped_on_restart() {
        let repo = Arc::new(InMemoryJobRepository::new());
        let first = executor(&repo);
        first.execute_step(&finishing("load")).unwrap();
        first.job_execution().set_status(BatchStatus::Failed);
        first.job_execution().finish();

        let second = executor(&repo);
        let code = second.execute_step(&finishing("load")).unwrap();
        assert_eq!(code, "COMPLETED");
        assert!(second.job_execution().step_executions().is_empty());

        let rerun = finishing("load").with_allow_start_if_complete(true);
        second.execute_step(&rerun).unwrap();
        assert_eq!(second.job_execution().step_executions().len(), 1);
    }

    #[test]
    fn start_limit_is_enforced() {
        let repo = Arc::new(InMemoryJobRepository::new());
        let exec = executor(&repo);
        let step = finishing("load").with_allow_start_if_complete(true).with_start_limit(1);
        exec.execute_step(&step).unwrap();
        let err = exec.execute_step(&step).unwrap_err();
        assert!(matches!(err, BatchError::StartLimitExceeded { limit: 1, .. }));
    }

    #[test]
    fn stop_request_interrupts_before_step() {
        let repo = Arc::new(InMemoryJobRepository::new());
        let exec = executor(&repo);
        exec.job_execution().request_stop();
        let err = exec.execute_step(&finishing("load")).unwrap_err();
        assert!(err.is_interruption());
    }

    #[test]
    fn failed_step_can_be_abandoned() {
        let repo = Arc::new(InMemoryJobRepository::new());
        let exec = executor(&repo);
        let failing = TaskletStep::new(
            "load",
            |_: &mut crate::execution::StepContribution, _: &StepContext| -> std::result::Result<RepeatStatus, Failure> {
                Err(Failure::msg("boom"))
            },
        );
        assert_eq!(exec.execute_step(&failing).unwrap(), "FAILED");
        exec.abandon_step_execution().unwrap();
        assert_eq!(exec.step_execution().unwrap().status, BatchStatus::Abandoned);
        assert!(exec.is_restart());
    }

    #[test]
    fn flow_status_drives_job_status() {
        let repo = Arc::new(InMemoryJobRepository::new());
        let exec = executor(&repo);
        exec.add_exit_status("COMPLETED");
        exec.update_job_execution_status(&FlowExecutionStatus::failed());
        let job = exec.job_execution();
        assert_eq!(job.status(), BatchStatus::Failed);
        assert_eq!(job.exit_status().exit_code(), ExitStatus::FAILED_CODE);
    }

    #[test]
    fn unknown_flow_status_replaces_the_exit_code() {
        let repo = Arc::new(InMemoryJobRepository::new());
        let exec = executor(&repo);
        exec.add_exit_status("COMPLETED");
        exec.update_job_execution_status(&FlowExecutionStatus::unknown());
        let job = exec.job_execution();
        assert_eq!(job.status(), BatchStatus::Unknown);
        assert_eq!(job.exit_status().exit_code(), ExitStatus::UNKNOWN_CODE);
    }

    #[test]
    fn branches_track_their_own_last_step() {
        let repo = Arc::new(InMemoryJobRepository::new());
        let exec = executor(&repo);
        exec.execute_step(&finishing("a")).unwrap();
        let branch = exec.branch();
        assert!(branch.step_execution().is_none());
        branch.execute_step(&finishing("b")).unwrap();
        assert_eq!(exec.step_execution().unwrap().step_name, "a");
        assert_eq!(exec.job_execution().step_executions().len(), 2);
    }
}
