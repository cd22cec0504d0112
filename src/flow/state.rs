//! The nodes of a flow.

use std::sync::Arc;

use tracing::{debug, info};

use super::execution::{FlowExecutionAggregator, MaxValueFlowExecutionAggregator};
use super::executor::FlowExecutor;
use super::Flow;
use crate::error::{BatchError, Result};
use crate::execution::{JobExecution, StepExecution};
use crate::status::{BatchStatus, FlowExecutionStatus};
use crate::step::Step;
use crate::task::{self, SyncTaskExecutor, TaskExecutor};

pub trait State: Send + Sync {
    /// Unique within the owning flow.
    fn name(&self) -> &str;

    /// Runs the state and returns the status its outgoing transitions are
    /// matched against.
    fn handle(&self, executor: &Arc<dyn FlowExecutor>) -> Result<FlowExecutionStatus>;

    fn is_end_state(&self) -> bool {
        false
    }
}

/// Runs a [`Step`] through the executor.
pub struct StepState {
    name: String,
    step: Arc<dyn Step>,
}

impl StepState {
    /// A state named after its step.
    pub fn new(step: Arc<dyn Step>) -> Self {
        Self::named(step.name().to_string(), step)
    }

    pub fn named(name: impl Into<String>, step: Arc<dyn Step>) -> Self {
        Self {
            name: name.into(),
            step,
        }
    }

    pub fn step(&self) -> &Arc<dyn Step> {
        &self.step
    }
}

impl State for StepState {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, executor: &Arc<dyn FlowExecutor>) -> Result<FlowExecutionStatus> {
        executor.abandon_step_execution()?;
        executor
            .execute_step(self.step.as_ref())
            .map(FlowExecutionStatus::new)
    }
}

/// Chooses the next route from the job and its last step execution.
pub trait JobExecutionDecider: Send + Sync {
    fn decide(
        &self,
        job_execution: &JobExecution,
        step_execution: Option<&StepExecution>,
    ) -> Result<FlowExecutionStatus>;
}

impl<F> JobExecutionDecider for F
where
    F: Fn(&JobExecution, Option<&StepExecution>) -> Result<FlowExecutionStatus> + Send + Sync,
{
    fn decide(
        &self,
        job_execution: &JobExecution,
        step_execution: Option<&StepExecution>,
    ) -> Result<FlowExecutionStatus> {
        self(job_execution, step_execution)
    }
}

pub struct DecisionState {
    name: String,
    decider: Arc<dyn JobExecutionDecider>,
}

impl DecisionState {
    pub fn new(name: impl Into<String>, decider: Arc<dyn JobExecutionDecider>) -> Self {
        Self {
            name: name.into(),
            decider,
        }
    }
}

impl State for DecisionState {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, executor: &Arc<dyn FlowExecutor>) -> Result<FlowExecutionStatus> {
        let step_execution = executor.step_execution();
        let status = self
            .decider
            .decide(executor.job_execution(), step_execution.as_ref())?;
        debug!(state = %self.name, decision = %status, "decision made");
        Ok(status)
    }
}

/// Runs a nested flow to completion and reports its final status.
pub struct FlowState {
    name: String,
    flow: Arc<dyn Flow>,
}

impl FlowState {
    pub fn new(name: impl Into<String>, flow: Arc<dyn Flow>) -> Self {
        Self {
            name: name.into(),
            flow,
        }
    }
}

impl State for FlowState {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, executor: &Arc<dyn FlowExecutor>) -> Result<FlowExecutionStatus> {
        Ok(self.flow.start(executor)?.status)
    }
}

/// Runs several flows concurrently and aggregates their outcomes.
///
/// Waits for every branch before reporting. When branches fail, the error
/// of the first branch in submission order wins and the rest are dropped.
pub struct SplitState {
    name: String,
    flows: Vec<Arc<dyn Flow>>,
    task_executor: Arc<dyn TaskExecutor>,
    aggregator: Arc<dyn FlowExecutionAggregator>,
    parent: Option<Arc<SplitState>>,
}

impl SplitState {
    pub fn new(name: impl Into<String>, flows: Vec<Arc<dyn Flow>>) -> Self {
        Self {
            name: name.into(),
            flows,
            task_executor: Arc::new(SyncTaskExecutor),
            aggregator: Arc::new(MaxValueFlowExecutionAggregator),
            parent: None,
        }
    }

    pub fn with_task_executor(mut self, task_executor: Arc<dyn TaskExecutor>) -> Self {
        self.task_executor = task_executor;
        self
    }

    pub fn with_aggregator(mut self, aggregator: Arc<dyn FlowExecutionAggregator>) -> Self {
        self.aggregator = aggregator;
        self
    }

    /// An enclosing split handled alongside this one; its status joins the
    /// aggregate.
    pub fn with_parent(mut self, parent: Arc<SplitState>) -> Self {
        self.parent = Some(parent);
        self
    }
}

impl State for SplitState {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, executor: &Arc<dyn FlowExecutor>) -> Result<FlowExecutionStatus> {
        info!(split = %self.name, branches = self.flows.len(), "starting split");
        let mut handles = Vec::with_capacity(self.flows.len());
        for flow in &self.flows {
            let flow = flow.clone();
            let branch = executor.branch();
            handles.push(task::submit(self.task_executor.as_ref(), move || {
                flow.start(&branch)
            })?);
        }

        let parent = self.parent.as_ref().map(|p| p.handle(executor));

        let mut results = Vec::with_capacity(handles.len());
        let mut first_error: Option<BatchError> = None;
        for handle in handles {
            match handle.join().and_then(|r| r) {
                Ok(execution) => results.push(execution),
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        let status = self.aggregator.aggregate(&results);
        debug!(split = %self.name, status = %status, "split finished");
        match parent {
            Some(parent) => Ok(status.max(parent?)),
            None => Ok(status),
        }
    }
}

/// Terminal state: sets the job's exit code and reports a fixed status.
///
/// A STOPPED end state reached at the beginning of a restart completes
/// instead, so a stop-and-restart route continues on the next launch.
pub struct EndState {
    name: String,
    status: FlowExecutionStatus,
    code: String,
    abandon: bool,
}

impl EndState {
    pub fn new(name: impl Into<String>, status: FlowExecutionStatus) -> Self {
        let code = status.name().to_string();
        Self {
            name: name.into(),
            status,
            code,
            abandon: false,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    /// Marks the last step execution ABANDONED when stopping, so it is not
    /// replayed on restart.
    pub fn with_abandon(mut self, abandon: bool) -> Self {
        self.abandon = abandon;
        self
    }

    pub fn status(&self) -> &FlowExecutionStatus {
        &self.status
    }
}

impl State for EndState {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, executor: &Arc<dyn FlowExecutor>) -> Result<FlowExecutionStatus> {
        if let Some(last) = executor.step_execution()
            && last.status == BatchStatus::Unknown
        {
            return Ok(FlowExecutionStatus::unknown());
        }
        if self.status.is_stop() {
            if executor.is_restart() {
                debug!(state = %self.name, "stop state reached on restart, continuing");
                return Ok(FlowExecutionStatus::completed());
            }
            if self.abandon {
                executor.abandon_step_execution()?;
            }
        }
        if !self.code.is_empty() {
            executor.add_exit_status(&self.code);
        }
        Ok(self.status.clone())
    }

    fn is_end_state(&self) -> bool {
        true
    }
}

/// Suspends the flow on first entry and lets it through on the next.
pub struct PauseState {
    name: String,
}

impl PauseState {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl State for PauseState {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, executor: &Arc<dyn FlowExecutor>) -> Result<FlowExecutionStatus> {
        let job = executor.job_execution();
        if job.paused_at().as_deref() == Some(self.name.as_str()) {
            info!(state = %self.name, "resuming paused flow");
            job.clear_pause();
            Ok(FlowExecutionStatus::completed())
        } else {
            info!(state = %self.name, "pausing flow");
            job.pause_at(&self.name);
            Ok(FlowExecutionStatus::paused())
        }
    }
}
