use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{BatchError, Failure};
use crate::execution::{
    InMemoryJobRepository, JobExecution, JobParameters, JobRepository, StepContext,
    StepContribution, StepExecution,
};
use crate::flow::{
    FlowBuilder, FlowDefinition, FlowRegistry, JobExecutionDecider, PauseState, SplitState,
};
use crate::job::{FlowJob, JobLauncher, PauseMode};
use crate::status::{BatchStatus, FlowExecutionStatus};
use crate::step::{
    ChunkStepBuilder, ItemStream, ItemWriter, ListItemReader, RepeatStatus, Step, TaskletStep,
};
use crate::task::TokioTaskExecutor;

/// Refuses chunks containing 8 while `broken` is set.
#[derive(Clone, Default)]
struct LedgerWriter {
    written: Arc<Mutex<Vec<u32>>>,
    broken: Arc<AtomicBool>,
}

impl LedgerWriter {
    fn written(&self) -> Vec<u32> {
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ItemStream for LedgerWriter {}

impl ItemWriter<u32> for LedgerWriter {
    fn write(&mut self, items: &[u32]) -> Result<(), Failure> {
        if self.broken.load(Ordering::SeqCst) && items.contains(&8) {
            return Err(Failure::msg("ledger locked"));
        }
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(items);
        Ok(())
    }
}

fn tasklet(name: &str, f: impl Fn() + Send + 'static) -> Arc<dyn Step> {
    Arc::new(TaskletStep::new(
        name,
        move |_: &mut StepContribution, _: &StepContext| -> Result<RepeatStatus, Failure> {
            f();
            Ok(RepeatStatus::Finished)
        },
    ))
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn failed_chunk_step_restarts_after_last_commit() {
    let writer = LedgerWriter::default();
    writer.broken.store(true, Ordering::SeqCst);
    let step: Arc<dyn Step> = Arc::new(
        ChunkStepBuilder::<u32, u32>::new("load")
            .reader(ListItemReader::new("numbers", (1..=10).collect()))
            .pass_through()
            .writer(writer.clone())
            .commit_interval(3)
            .build()
            .unwrap(),
    );
    let flow = FlowBuilder::new("ledger").start_step(step).build().unwrap();
    let job = FlowJob::new("ledger", Arc::new(flow));
    let repository = Arc::new(InMemoryJobRepository::new());
    let launcher = JobLauncher::new(repository.clone());
    let params = JobParameters::new().with("run", "1");

    let first = launcher.run(&job, &params).unwrap();
    assert_eq!(first.status(), BatchStatus::Failed);
    let failed = first.step_execution("load").unwrap();
    assert_eq!(failed.status, BatchStatus::Failed);
    assert_eq!(failed.write_count, 6);
    assert_eq!(failed.commit_count, 2);
    assert_eq!(first.all_failures()[0].to_string(), "ledger locked");
    assert_eq!(writer.written(), [1, 2, 3, 4, 5, 6]);

    writer.broken.store(false, Ordering::SeqCst);
    let second = launcher.run(&job, &params).unwrap();
    assert!(second.is_restart());
    assert_eq!(second.status(), BatchStatus::Completed);
    let resumed = second.step_execution("load").unwrap();
    assert_eq!(resumed.read_count, 4);
    assert_eq!(resumed.write_count, 4);
    assert_eq!(writer.written(), (1..=10).collect::<Vec<_>>());

    let history = repository.step_executions(first.instance());
    assert_eq!(history.len(), 2);
    assert_eq!(
        repository
            .last_step_execution(first.instance(), "load")
            .unwrap()
            .unwrap()
            .status,
        BatchStatus::Completed
    );
}

#[test]
fn split_branches_run_on_the_tokio_pool() {
    let threads = Arc::new(Mutex::new(Vec::new()));
    let branch = |name: &str| {
        let threads = threads.clone();
        let step = tasklet(name, move || {
            let current = thread::current().name().unwrap_or_default().to_string();
            threads
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(current);
        });
        Arc::new(
            FlowBuilder::new(format!("{name}-flow"))
                .start_step(step)
                .build()
                .unwrap(),
        ) as Arc<dyn crate::flow::Flow>
    };
    let split = SplitState::new("fan-out", vec![branch("left"), branch("right")])
        .with_task_executor(Arc::new(TokioTaskExecutor::new(2).unwrap()));
    let flow = FlowBuilder::new("fan")
        .start_step(tasklet("prepare", || {}))
        .next(Arc::new(split))
        .build()
        .unwrap();
    let job = FlowJob::new("fan", Arc::new(flow));

    let execution = JobLauncher::new(Arc::new(InMemoryJobRepository::new()))
        .run(&job, &JobParameters::new())
        .unwrap();
    assert_eq!(execution.status(), BatchStatus::Completed);
    assert_eq!(execution.step_executions().len(), 3);
    let threads = threads.lock().unwrap_or_else(PoisonError::into_inner).clone();
    assert_eq!(threads.len(), 2);
    assert!(threads.iter().all(|t| t.starts_with("skein-split")));
}

#[test]
fn shared_registry_refuses_duplicates_and_restart_resumes_after_pause() {
    let repository: Arc<dyn JobRepository> = Arc::new(InMemoryJobRepository::new());
    let primary = Arc::new(JobLauncher::new(repository.clone()));
    let secondary = JobLauncher::new(repository).with_registry(primary.registry().clone());

    let published = Arc::new(AtomicBool::new(false));
    let flag = published.clone();
    let flow = FlowBuilder::new("nightly")
        .start_step(tasklet("extract", || {}))
        .next(Arc::new(PauseState::new("approval")))
        .next_step(tasklet("publish", move || flag.store(true, Ordering::SeqCst)))
        .build()
        .unwrap();
    let job = Arc::new(FlowJob::new("nightly", Arc::new(flow)).with_pause_mode(PauseMode::Wait));
    let params = JobParameters::new().with("schedule", "02:00");
    let id = primary.identify(&job, &params);
    assert_eq!(id.to_string(), "nightly|02:00");

    let runner = {
        let (launcher, job, params) = (primary.clone(), job.clone(), params.clone());
        thread::spawn(move || launcher.run(&job, &params))
    };
    wait_until(|| {
        primary
            .registry()
            .get(&id)
            .is_some_and(|ctx| ctx.job_execution().is_paused())
    });
    assert_eq!(secondary.registry().find_by_name("nightly"), [id.clone()]);
    assert!(matches!(
        secondary.run(&job, &params),
        Err(BatchError::AlreadyRunning(_))
    ));

    secondary.stop(&id).unwrap();
    let stopped = runner.join().unwrap().unwrap();
    assert_eq!(stopped.status(), BatchStatus::Stopped);
    assert!(!published.load(Ordering::SeqCst));
    assert!(secondary.registry().find_all().is_empty());

    let resumed = secondary.run(&job, &params).unwrap();
    assert_eq!(resumed.status(), BatchStatus::Completed);
    assert!(published.load(Ordering::SeqCst));
    let names: Vec<String> = resumed
        .step_executions()
        .into_iter()
        .map(|s| s.step_name)
        .collect();
    assert_eq!(names, ["publish"]);
}

const GATED: &str = r#"
name = "gated"

[[states]]
name = "extract"
kind = "step"
on = [{ pattern = "*", to = "gate" }]

[[states]]
name = "gate"
kind = "decision"
on = [{ pattern = "HOLD", to = "held" }, { pattern = "*", to = "publish" }]

[[states]]
name = "publish"
kind = "step"

[[states]]
name = "held"
kind = "end"
status = "FAILED"
code = "HELD"
"#;

#[test]
fn toml_flow_routes_on_decisions() {
    let gate = |job: &JobExecution, _: Option<&StepExecution>| -> crate::Result<FlowExecutionStatus> {
        match job.instance().parameters.get("hold") {
            Some("yes") => Ok(FlowExecutionStatus::new("HOLD")),
            _ => Ok(FlowExecutionStatus::completed()),
        }
    };
    let gate: Arc<dyn JobExecutionDecider> = Arc::new(gate);
    let registry = FlowRegistry::new()
        .with_step(tasklet("extract", || {}))
        .with_step(tasklet("publish", || {}))
        .with_decider("gate", gate);
    let flow = FlowDefinition::from_toml(GATED).unwrap().build(&registry).unwrap();
    let job = FlowJob::new("gated", Arc::new(flow));
    let launcher = JobLauncher::new(Arc::new(InMemoryJobRepository::new()));

    let held = launcher
        .run(&job, &JobParameters::new().with("hold", "yes"))
        .unwrap();
    assert_eq!(held.status(), BatchStatus::Failed);
    assert_eq!(held.exit_status().exit_code(), "HELD");
    assert!(held.step_execution("publish").is_none());

    let released = launcher
        .run(&job, &JobParameters::new().with("hold", "no"))
        .unwrap();
    assert_eq!(released.status(), BatchStatus::Completed);
    assert!(released.step_execution("publish").is_some());
}
