//! Jobs and the launcher that runs them.
//!
//! A [`FlowJob`] is a named [`Flow`] plus restart and pause behaviour. The
//! [`JobLauncher`] owns the bookkeeping around one run: it creates the
//! execution through the repository, registers it so that duplicate launches
//! are refused, turns the final flow status or error into the job status and
//! always unregisters.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::error::{BatchError, Result};
use crate::execution::{
    JobExecution, JobExecutionContext, JobExecutionRegistry, JobIdentifier, JobParameters,
    JobRepository,
};
use crate::flow::{Flow, FlowExecution, FlowExecutor, JobFlowExecutor};
use crate::status::{BatchStatus, ExitStatus};

/// Execution context key holding the state a paused job stopped at.
pub const PAUSED_STATE_KEY: &str = "flow.paused.state";

/// What a job does when its flow reaches a pause state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PauseMode {
    /// End the execution as STOPPED; the next launch resumes at the pause.
    #[default]
    Suspend,
    /// Block the launching thread until the execution is resumed or stopped.
    Wait,
}

pub struct FlowJob {
    name: String,
    flow: Arc<dyn Flow>,
    restartable: bool,
    pause_mode: PauseMode,
}

impl FlowJob {
    pub fn new(name: impl Into<String>, flow: Arc<dyn Flow>) -> Self {
        Self {
            name: name.into(),
            flow,
            restartable: true,
            pause_mode: PauseMode::default(),
        }
    }

    pub fn with_restartable(mut self, restartable: bool) -> Self {
        self.restartable = restartable;
        self
    }

    pub fn with_pause_mode(mut self, mode: PauseMode) -> Self {
        self.pause_mode = mode;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flow(&self) -> &Arc<dyn Flow> {
        &self.flow
    }

    pub fn is_restartable(&self) -> bool {
        self.restartable
    }

    /// Runs the flow to its end, or to a pause it does not wait out.
    ///
    /// A restart of an execution that was suspended at a pause state
    /// continues at that state instead of at the start.
    pub fn execute(&self, executor: &Arc<dyn FlowExecutor>) -> Result<FlowExecution> {
        let job = executor.job_execution();
        let paused_state = job.execution_context().get::<String>(PAUSED_STATE_KEY)?;
        let mut result = match paused_state {
            Some(state) if self.flow.state(&state).is_some() => {
                info!(job = %self.name, state = %state, "resuming suspended flow");
                job.pause_at(&state);
                self.flow.resume(&state, executor)?
            }
            Some(state) => {
                warn!(job = %self.name, state = %state, "paused state no longer exists, starting over");
                self.flow.start(executor)?
            }
            None => self.flow.start(executor)?,
        };

        while result.status.is_paused() {
            job.update_execution_context(|ctx| ctx.put(PAUSED_STATE_KEY, &result.name))?;
            if self.pause_mode == PauseMode::Suspend {
                info!(job = %self.name, state = %result.name, "job suspended");
                return Ok(result);
            }
            info!(job = %self.name, state = %result.name, "job paused, waiting for resume");
            if !job.wait_for_resume() {
                return Err(BatchError::JobInterrupted(format!(
                    "job {} stopped while paused at {}",
                    self.name, result.name
                )));
            }
            result = self.flow.resume(&result.name, executor)?;
        }
        job.update_execution_context(|ctx| ctx.remove(PAUSED_STATE_KEY));
        Ok(result)
    }
}

impl std::fmt::Debug for FlowJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowJob")
            .field("name", &self.name)
            .field("flow", &self.flow.name())
            .field("restartable", &self.restartable)
            .field("pause_mode", &self.pause_mode)
            .finish()
    }
}

/// Derives the registry key for a launch.
pub trait JobIdentifierFactory: Send + Sync {
    fn identify(&self, job_name: &str, parameters: &JobParameters) -> JobIdentifier;
}

/// Labels an identifier with the `schedule` parameter when present.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScheduleIdentifierFactory;

impl ScheduleIdentifierFactory {
    pub const SCHEDULE_KEY: &'static str = "schedule";
}

impl JobIdentifierFactory for ScheduleIdentifierFactory {
    fn identify(&self, job_name: &str, parameters: &JobParameters) -> JobIdentifier {
        match parameters.get(Self::SCHEDULE_KEY) {
            Some(schedule) => JobIdentifier::with_label(job_name, schedule),
            None => JobIdentifier::new(job_name),
        }
    }
}

pub struct JobLauncher {
    repository: Arc<dyn JobRepository>,
    registry: Arc<JobExecutionRegistry>,
    identifiers: Arc<dyn JobIdentifierFactory>,
}

impl JobLauncher {
    pub fn new(repository: Arc<dyn JobRepository>) -> Self {
        Self {
            repository,
            registry: Arc::new(JobExecutionRegistry::new()),
            identifiers: Arc::new(ScheduleIdentifierFactory),
        }
    }

    /// Shares a registry with other launchers.
    pub fn with_registry(mut self, registry: Arc<JobExecutionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_identifier_factory(mut self, factory: Arc<dyn JobIdentifierFactory>) -> Self {
        self.identifiers = factory;
        self
    }

    pub fn registry(&self) -> &Arc<JobExecutionRegistry> {
        &self.registry
    }

    pub fn repository(&self) -> &Arc<dyn JobRepository> {
        &self.repository
    }

    pub fn identify(&self, job: &FlowJob, parameters: &JobParameters) -> JobIdentifier {
        self.identifiers.identify(job.name(), parameters)
    }

    /// Runs `job` to completion on the calling thread.
    ///
    /// Errors only when the launch itself is refused or the repository
    /// fails; a failing job returns its execution with status FAILED and the
    /// root-cause failures recorded.
    pub fn run(&self, job: &FlowJob, parameters: &JobParameters) -> Result<Arc<JobExecution>> {
        let id = self.identify(job, parameters);
        if self.registry.is_registered(&id) {
            return Err(BatchError::AlreadyRunning(id.to_string()));
        }
        if !job.is_restartable()
            && self
                .repository
                .last_job_execution(job.name(), parameters)?
                .is_some()
        {
            return Err(BatchError::NotRestartable(job.name().to_string()));
        }

        let execution = self.repository.create_job_execution(job.name(), parameters)?;
        let context = Arc::new(JobExecutionContext::new(execution.clone()));
        if let Err(err) = self.registry.register(id.clone(), context.clone()) {
            execution.set_status(BatchStatus::Abandoned);
            execution.finish();
            self.repository.update_job_execution(&execution)?;
            return Err(err);
        }

        let outcome = self.execute(job, &execution, context);
        self.registry.unregister(&id);
        outcome?;
        Ok(execution)
    }

    fn execute(
        &self,
        job: &FlowJob,
        execution: &Arc<JobExecution>,
        context: Arc<JobExecutionContext>,
    ) -> Result<()> {
        execution.start();
        self.repository.update_job_execution(execution)?;
        info!(
            job = job.name(),
            execution = %execution.id(),
            parameters = %execution.instance().parameters,
            restart = execution.is_restart(),
            "job started"
        );

        let executor: Arc<dyn FlowExecutor> =
            Arc::new(JobFlowExecutor::new(self.repository.clone(), context));
        match job.execute(&executor) {
            Ok(result) => executor.update_job_execution_status(&result.status),
            Err(err) if err.is_interruption() => {
                info!(job = job.name(), "job stopped: {err}");
                execution.set_status(BatchStatus::Stopped);
                execution.set_exit_status(execution.exit_status().and(
                    &ExitStatus::with_description(ExitStatus::STOPPED_CODE, err.to_string()),
                ));
            }
            Err(err) => {
                error!(job = job.name(), error = %err, "job failed");
                execution.set_status(BatchStatus::Failed);
                execution.set_exit_status(execution.exit_status().and(
                    &ExitStatus::with_description(ExitStatus::FAILED_CODE, err.to_string()),
                ));
                let failure = err.root_cause().cloned().unwrap_or_else(|| err.into_failure());
                execution.add_failure(failure);
            }
        }

        execution.finish();
        self.repository.update_job_execution(execution)?;
        info!(
            job = job.name(),
            execution = %execution.id(),
            status = %execution.status(),
            exit = %execution.exit_status(),
            "job finished"
        );
        Ok(())
    }

    fn running(&self, id: &JobIdentifier) -> Result<Arc<JobExecutionContext>> {
        self.registry
            .get(id)
            .ok_or_else(|| BatchError::NotRunning(id.to_string()))
    }

    /// Asks a running execution to stop at its next state or chunk boundary.
    pub fn stop(&self, id: &JobIdentifier) -> Result<()> {
        let context = self.running(id)?;
        info!(job = %id, "stop requested");
        context.job_execution().request_stop();
        Ok(())
    }

    /// Wakes an execution waiting at a pause state.
    pub fn resume(&self, id: &JobIdentifier) -> Result<()> {
        let context = self.running(id)?;
        info!(job = %id, "resume requested");
        context.job_execution().request_resume();
        Ok(())
    }
}

/// Complete jobs run through the launcher.
#[cfg(test)]
mod end_to_end;
