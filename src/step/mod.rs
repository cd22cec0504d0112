//! Steps: the units of work a flow's step states run.
//!
//! [`Step::execute`] owns the status bookkeeping every step shares; concrete
//! steps only implement [`Step::do_execute`]. A business failure inside a
//! step never escapes as an error: it marks the execution FAILED and the flow
//! routes on that exit code. Only repository failures propagate.

pub mod chunk;
pub mod chunk_step;
pub mod item;
pub mod skip;
pub mod tasklet;
pub mod transaction;

use chrono::Utc;
use tracing::{error, info};

use crate::error::Result;
use crate::execution::{StepContext, StepExecution};
use crate::status::{BatchStatus, ExitStatus};

pub use chunk::{Chunk, SkippedItem};
pub use chunk_step::{ChunkOrientedStep, ChunkStepBuilder};
pub use item::{
    CollectingItemWriter, FnItemProcessor, ItemProcessor, ItemReader, ItemStream, ItemWriter,
    ListItemReader, PassThroughItemProcessor,
};
pub use skip::{
    AlwaysSkipItemPolicy, LimitCheckingSkipPolicy, NeverSkipItemPolicy, SkipListener, SkipPolicy,
};
pub use tasklet::{RepeatStatus, Tasklet, TaskletStep};
pub use transaction::{
    ResourcelessTransactionManager, Transaction, TransactionCounts, TransactionManager,
};

pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    /// Whether a step that already COMPLETED in an earlier execution of the
    /// same job instance runs again on restart.
    fn allow_start_if_complete(&self) -> bool {
        false
    }

    /// Maximum number of executions of this step per job instance.
    fn start_limit(&self) -> u32 {
        u32::MAX
    }

    /// The step's own work. Returns STOPPED when a stop request was
    /// observed, otherwise the exit status to merge into the execution.
    fn do_execute(&self, step_execution: &mut StepExecution, context: &StepContext)
    -> Result<ExitStatus>;

    fn execute(&self, step_execution: &mut StepExecution, context: &StepContext) -> Result<()> {
        info!(step = self.name(), execution = %step_execution.id, "step starting");
        step_execution.start_time = Some(Utc::now());
        step_execution.upgrade_status(BatchStatus::Started);
        context.update(step_execution)?;

        match self.do_execute(step_execution, context) {
            Ok(exit_status) => {
                let status = if exit_status.exit_code() == ExitStatus::STOPPED_CODE {
                    BatchStatus::Stopped
                } else {
                    BatchStatus::Completed
                };
                step_execution.upgrade_status(status);
                step_execution.exit_status = step_execution.exit_status.and(&exit_status);
            }
            Err(err) if err.is_interruption() => {
                info!(step = self.name(), "step interrupted: {err}");
                step_execution.upgrade_status(BatchStatus::Stopped);
                step_execution.exit_status = step_execution
                    .exit_status
                    .and(&ExitStatus::with_description(ExitStatus::STOPPED_CODE, err.to_string()));
            }
            Err(err) => {
                error!(step = self.name(), error = %err, "step failed");
                let failure = err.root_cause().cloned().unwrap_or_else(|| err.into_failure());
                step_execution.fail(failure);
            }
        }

        step_execution.end_time = Some(Utc::now());
        if let Err(err) = context.update(step_execution) {
            step_execution.upgrade_status(BatchStatus::Unknown);
            step_execution.exit_status = step_execution
                .exit_status
                .replace_exit_code(ExitStatus::UNKNOWN_CODE);
            return Err(err);
        }
        info!(
            step = self.name(),
            status = %step_execution.status,
            exit = %step_execution.exit_status,
            read = step_execution.read_count,
            written = step_execution.write_count,
            skipped = step_execution.skip_count(),
            "step finished"
        );
        Ok(())
    }
}
