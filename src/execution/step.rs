use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::context::ExecutionContext;
use crate::error::Failure;
use crate::status::{BatchStatus, ExitStatus};

/// Mutable record of one run of a step.
///
/// Counters are only ever changed through [`StepExecution::apply`], which the
/// chunk engine calls after a successful commit, so a rolled back chunk never
/// shows up in them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: Uuid,
    pub step_name: String,
    pub job_execution_id: Uuid,
    pub status: BatchStatus,
    pub exit_status: ExitStatus,
    pub read_count: u64,
    pub write_count: u64,
    pub filter_count: u64,
    pub commit_count: u64,
    pub rollback_count: u64,
    pub read_skip_count: u64,
    pub process_skip_count: u64,
    pub write_skip_count: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub execution_context: ExecutionContext,
    #[serde(skip)]
    pub failures: Vec<Failure>,
}

impl StepExecution {
    pub fn new(step_name: impl Into<String>, job_execution_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            step_name: step_name.into(),
            job_execution_id,
            status: BatchStatus::Starting,
            exit_status: ExitStatus::executing(),
            read_count: 0,
            write_count: 0,
            filter_count: 0,
            commit_count: 0,
            rollback_count: 0,
            read_skip_count: 0,
            process_skip_count: 0,
            write_skip_count: 0,
            start_time: None,
            end_time: None,
            execution_context: ExecutionContext::new(),
            failures: Vec::new(),
        }
    }

    pub fn skip_count(&self) -> u64 {
        self.read_skip_count + self.process_skip_count + self.write_skip_count
    }

    /// Merges the deltas of a committed chunk.
    pub fn apply(&mut self, contribution: &StepContribution) {
        self.read_count += contribution.read_count;
        self.write_count += contribution.write_count;
        self.filter_count += contribution.filter_count;
        self.read_skip_count += contribution.read_skip_count;
        self.process_skip_count += contribution.process_skip_count;
        self.write_skip_count += contribution.write_skip_count;
        self.exit_status = self.exit_status.and(&contribution.exit_status);
    }

    pub fn upgrade_status(&mut self, status: BatchStatus) {
        self.status = self.status.upgrade_to(status);
    }

    /// Records a fatal failure and marks the execution FAILED.
    pub fn fail(&mut self, failure: Failure) {
        self.upgrade_status(BatchStatus::Failed);
        self.exit_status = self
            .exit_status
            .and(&ExitStatus::with_description(ExitStatus::FAILED_CODE, failure.to_string()));
        self.failures.push(failure);
    }

    pub fn new_contribution(&self) -> StepContribution {
        StepContribution {
            step_skip_count: self.skip_count(),
            ..StepContribution::new()
        }
    }
}

/// Per-chunk deltas, applied to the [`StepExecution`] only on commit.
#[derive(Debug, Clone, Default)]
pub struct StepContribution {
    pub read_count: u64,
    pub write_count: u64,
    pub filter_count: u64,
    pub read_skip_count: u64,
    pub process_skip_count: u64,
    pub write_skip_count: u64,
    pub exit_status: ExitStatus,
    step_skip_count: u64,
}

impl StepContribution {
    pub fn new() -> Self {
        Self {
            exit_status: ExitStatus::executing(),
            ..Self::default()
        }
    }

    /// Skips already committed by the step plus the ones counted in this
    /// chunk. Skip policies check their limit against this number.
    pub fn step_skip_count(&self) -> u64 {
        self.step_skip_count + self.skip_count()
    }

    pub fn skip_count(&self) -> u64 {
        self.read_skip_count + self.process_skip_count + self.write_skip_count
    }

    pub fn set_exit_status(&mut self, status: ExitStatus) {
        self.exit_status = status;
    }
}
