use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use super::Step;
use super::transaction::{ResourcelessTransactionManager, TransactionManager};
use crate::error::{BatchError, Failure, Result};
use crate::execution::{StepContext, StepContribution, StepExecution};
use crate::status::ExitStatus;

/// Whether a tasklet wants to be called again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatStatus {
    Continuable,
    Finished,
}

/// A single unit of work called repeatedly, each call in its own
/// transaction, until it returns [`RepeatStatus::Finished`].
pub trait Tasklet: Send {
    fn execute(
        &mut self,
        contribution: &mut StepContribution,
        context: &StepContext,
    ) -> std::result::Result<RepeatStatus, Failure>;
}

impl<F> Tasklet for F
where
    F: FnMut(&mut StepContribution, &StepContext) -> std::result::Result<RepeatStatus, Failure>
        + Send,
{
    fn execute(
        &mut self,
        contribution: &mut StepContribution,
        context: &StepContext,
    ) -> std::result::Result<RepeatStatus, Failure> {
        self(contribution, context)
    }
}

pub struct TaskletStep {
    name: String,
    tasklet: Mutex<Box<dyn Tasklet>>,
    transaction_manager: Arc<dyn TransactionManager>,
    allow_start_if_complete: bool,
    start_limit: u32,
}

impl TaskletStep {
    pub fn new(name: impl Into<String>, tasklet: impl Tasklet + 'static) -> Self {
        Self {
            name: name.into(),
            tasklet: Mutex::new(Box::new(tasklet)),
            transaction_manager: Arc::new(ResourcelessTransactionManager::new()),
            allow_start_if_complete: false,
            start_limit: u32::MAX,
        }
    }

    pub fn with_transaction_manager(mut self, manager: Arc<dyn TransactionManager>) -> Self {
        self.transaction_manager = manager;
        self
    }

    pub fn with_allow_start_if_complete(mut self, allow: bool) -> Self {
        self.allow_start_if_complete = allow;
        self
    }

    pub fn with_start_limit(mut self, start_limit: u32) -> Self {
        self.start_limit = start_limit;
        self
    }
}

impl Step for TaskletStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn allow_start_if_complete(&self) -> bool {
        self.allow_start_if_complete
    }

    fn start_limit(&self) -> u32 {
        self.start_limit
    }

    fn do_execute(
        &self,
        step_execution: &mut StepExecution,
        context: &StepContext,
    ) -> Result<ExitStatus> {
        let mut tasklet = self.tasklet.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if context.is_stop_requested() {
                return Ok(ExitStatus::with_description(
                    ExitStatus::STOPPED_CODE,
                    "stop requested",
                ));
            }
            let mut contribution = step_execution.new_contribution();
            let tx = self.transaction_manager.begin()?;
            match tasklet.execute(&mut contribution, context) {
                Ok(repeat) => {
                    self.transaction_manager.commit(tx)?;
                    step_execution.apply(&contribution);
                    step_execution.commit_count += 1;
                    context.update(step_execution)?;
                    debug!(step = %self.name, commits = step_execution.commit_count, "tasklet call committed");
                    if repeat == RepeatStatus::Finished {
                        return Ok(ExitStatus::completed());
                    }
                }
                Err(failure) => {
                    self.transaction_manager.rollback(tx)?;
                    step_execution.rollback_count += 1;
                    return Err(BatchError::Item(failure));
                }
            }
        }
    }
}
