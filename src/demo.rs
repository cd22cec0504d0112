//! The sample job run by `skein demo`.
//!
//! `ingest` reads 25 orders in chunks: order 7 fails once with a transient
//! error and is retried, order 13 is malformed and skipped, every tenth order
//! is filtered. The `route` decision sends runs with skips through a review
//! end code; both routes fan out to the `audit` and `report` steps in a
//! split.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::BatchConfig;
use crate::error::{Failure, Result};
use crate::execution::{
    InMemoryJobRepository, JobExecution, JobParameters, StepContext, StepContribution,
    StepExecution,
};
use crate::flow::{DecisionState, Flow, FlowBuilder, SplitState, State, StepState};
use crate::job::{FlowJob, JobLauncher};
use crate::retry::FailureClassifier;
use crate::status::{BatchStatus, ExitStatus, FlowExecutionStatus};
use crate::step::{
    ChunkStepBuilder, CollectingItemWriter, FnItemProcessor, ListItemReader, RepeatStatus, Step,
    TaskletStep,
};
use crate::task::TaskExecutor;
use crate::ui::JobProgress;

pub const JOB_NAME: &str = "orders";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: u32,
    pub cents: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub order: u32,
    pub total_cents: u64,
}

#[derive(Debug, thiserror::Error)]
#[error("pricing service timed out for order {0}")]
pub struct Transient(u32);

#[derive(Debug, thiserror::Error)]
#[error("order {0} is malformed")]
pub struct Malformed(u32);

fn orders() -> Vec<Order> {
    (1..=25)
        .map(|id| Order {
            id,
            cents: u64::from(id) * 1_250,
        })
        .collect()
}

fn ingest_step(
    config: &BatchConfig,
    progress: &Arc<JobProgress>,
    invoices: CollectingItemWriter<Invoice>,
) -> Result<Arc<dyn Step>> {
    let mut timed_out = HashSet::new();
    let price = move |order: &Order| -> std::result::Result<Option<Invoice>, Failure> {
        if order.id % 10 == 0 {
            return Ok(None);
        }
        if order.id == 13 {
            return Err(Failure::new(Malformed(order.id)));
        }
        if order.id == 7 && timed_out.insert(order.id) {
            return Err(Failure::new(Transient(order.id)));
        }
        Ok(Some(Invoice {
            order: order.id,
            total_cents: order.cents + order.cents / 5,
        }))
    };
    let step = ChunkStepBuilder::from_config("ingest", config)
        .reader(ListItemReader::new("orders", orders()))
        .processor(FnItemProcessor(price))
        .writer(invoices)
        .retry_policy(Arc::new(
            config.retry_policy(FailureClassifier::only::<Transient>()),
        ))
        .skippable(FailureClassifier::only::<Malformed>())
        .retry_listener(progress.clone())
        .skip_listener(progress.clone())
        .build()?;
    let step: Arc<dyn Step> = Arc::new(step);
    Ok(step)
}

fn tasklet_step(name: &str, fail_once: bool) -> Arc<dyn Step> {
    let failed = AtomicBool::new(!fail_once);
    let name_owned = name.to_string();
    Arc::new(TaskletStep::new(
        name,
        move |contribution: &mut StepContribution,
              _: &StepContext|
              -> std::result::Result<RepeatStatus, Failure> {
            if !failed.swap(true, Ordering::SeqCst) {
                return Err(Failure::msg(format!("{name_owned} service unavailable")));
            }
            contribution.set_exit_status(ExitStatus::completed());
            Ok(RepeatStatus::Finished)
        },
    ))
}

fn route(_job: &JobExecution, step: Option<&StepExecution>) -> Result<FlowExecutionStatus> {
    let skipped = step.map_or(0, StepExecution::skip_count);
    if skipped > 0 {
        Ok(FlowExecutionStatus::new("REVIEW"))
    } else {
        Ok(FlowExecutionStatus::completed())
    }
}

/// Builds the sample job. With `fail_report_once`, the first run of the
/// `report` step fails so that a second launch demonstrates a restart.
pub fn build_job(
    config: &BatchConfig,
    progress: &Arc<JobProgress>,
    task_executor: Arc<dyn TaskExecutor>,
    invoices: CollectingItemWriter<Invoice>,
    fail_report_once: bool,
) -> Result<FlowJob> {
    let branch = |name: &str, step: Arc<dyn Step>| -> Result<Arc<dyn Flow>> {
        let flow: Arc<dyn Flow> = Arc::new(FlowBuilder::new(name).start_step(step).build()?);
        Ok(flow)
    };
    let split: Arc<dyn State> = Arc::new(
        SplitState::new(
            "publish",
            vec![
                branch("audit-flow", tasklet_step("audit", false))?,
                branch("report-flow", tasklet_step("report", fail_report_once))?,
            ],
        )
        .with_task_executor(task_executor),
    );
    let decision: Arc<dyn State> = Arc::new(DecisionState::new("route", Arc::new(route)));

    let flow = FlowBuilder::new(JOB_NAME)
        .start(Arc::new(StepState::new(ingest_step(config, progress, invoices)?)))
        .next(decision.clone())
        .on("REVIEW")
        .to(split.clone())
        .from(decision)
        .on("*")
        .to(split)
        .build()?;
    Ok(FlowJob::new(JOB_NAME, Arc::new(flow)))
}

/// Runs the sample job, relaunching it once when the first run fails.
pub fn run(
    config: &BatchConfig,
    task_executor: Arc<dyn TaskExecutor>,
    fail_report_once: bool,
) -> Result<Vec<Arc<JobExecution>>> {
    let progress = Arc::new(JobProgress::start(JOB_NAME));
    let invoices = CollectingItemWriter::new();
    let job = build_job(config, &progress, task_executor, invoices.clone(), fail_report_once)?;
    let launcher = JobLauncher::new(Arc::new(InMemoryJobRepository::new()));
    let parameters = JobParameters::new()
        .with("schedule", "demo")
        .with("date", Utc::now().format("%Y-%m-%d").to_string());

    let mut executions = Vec::new();
    progress.message(format!("{JOB_NAME}: running"));
    let first = launcher.run(&job, &parameters)?;
    progress.report(&first);
    let failed = first.status() == BatchStatus::Failed;
    executions.push(first);
    if failed {
        progress.message(format!("{JOB_NAME}: restarting"));
        let second = launcher.run(&job, &parameters)?;
        progress.report(&second);
        executions.push(second);
    }
    progress.message(format!("{JOB_NAME}: {} invoices written", invoices.written().len()));
    progress.finish();
    if let Some(last) = executions.last() {
        progress.print_summary(&last.snapshot());
    }
    Ok(executions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{SyncTaskExecutor, TokioTaskExecutor};

    fn config() -> BatchConfig {
        BatchConfig {
            commit_interval: 4,
            ..BatchConfig::default()
        }
    }

    #[test]
    fn demo_completes_with_one_skip() {
        let executions = run(&config(), Arc::new(SyncTaskExecutor), false).unwrap();
        assert_eq!(executions.len(), 1);
        let execution = &executions[0];
        assert_eq!(execution.status(), BatchStatus::Completed);

        let ingest = execution.step_execution("ingest").unwrap();
        assert_eq!(ingest.read_count, 25);
        assert_eq!(ingest.filter_count, 2);
        assert_eq!(ingest.process_skip_count, 1);
        assert_eq!(ingest.write_count, 22);
        assert!(execution.step_execution("audit").is_some());
        assert!(execution.step_execution("report").is_some());
    }

    #[test]
    fn demo_restart_only_reruns_the_failed_branch() {
        let executor = TokioTaskExecutor::new(2).unwrap();
        let executions = run(&config(), Arc::new(executor), true).unwrap();
        assert_eq!(executions.len(), 2);
        assert_eq!(executions[0].status(), BatchStatus::Failed);

        let second = &executions[1];
        assert!(second.is_restart());
        assert_eq!(second.status(), BatchStatus::Completed);
        let rerun: Vec<String> = second
            .step_executions()
            .into_iter()
            .map(|s| s.step_name)
            .collect();
        assert_eq!(rerun, ["report"]);
    }
}
