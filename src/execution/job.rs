use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::context::ExecutionContext;
use super::step::StepExecution;
use crate::error::Failure;
use crate::status::{BatchStatus, ExitStatus};

/// Identifying parameters of a job instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobParameters(BTreeMap<String, String>);

impl JobParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for JobParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write!(f, "{{{}}}", pairs.join(","))
    }
}

/// A logical run of a job: its name plus identifying parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: Uuid,
    pub job_name: String,
    pub parameters: JobParameters,
}

impl JobInstance {
    pub fn new(job_name: impl Into<String>, parameters: JobParameters) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_name: job_name.into(),
            parameters,
        }
    }
}

#[derive(Debug)]
struct JobExecutionState {
    status: BatchStatus,
    exit_status: ExitStatus,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    execution_context: ExecutionContext,
    failures: Vec<Failure>,
    step_executions: Vec<StepExecution>,
    paused_at: Option<String>,
    resume_requested: bool,
}

/// Shared, mutable record of one attempt at running a job instance.
///
/// Every field sits behind one lock owned by this execution; the stop flag is
/// atomic so that chunk boundaries can poll it cheaply. A paused execution
/// parks callers of [`JobExecution::wait_for_resume`] on a condition variable
/// until [`JobExecution::request_resume`] or a stop request wakes them.
#[derive(Debug)]
pub struct JobExecution {
    id: Uuid,
    instance: JobInstance,
    restart: bool,
    created_at: DateTime<Utc>,
    stop_requested: AtomicBool,
    state: Mutex<JobExecutionState>,
    resumed: Condvar,
}

/// Serializable view of a [`JobExecution`], used for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecutionSnapshot {
    pub id: Uuid,
    pub job_name: String,
    pub parameters: JobParameters,
    pub status: BatchStatus,
    pub exit_status: ExitStatus,
    pub restart: bool,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub failures: Vec<String>,
    pub step_executions: Vec<StepExecution>,
    pub execution_context: ExecutionContext,
}

impl JobExecution {
    pub fn new(instance: JobInstance, restart: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            instance,
            restart,
            created_at: Utc::now(),
            stop_requested: AtomicBool::new(false),
            state: Mutex::new(JobExecutionState {
                status: BatchStatus::Starting,
                exit_status: ExitStatus::unknown(),
                start_time: None,
                end_time: None,
                execution_context: ExecutionContext::new(),
                failures: Vec::new(),
                step_executions: Vec::new(),
                paused_at: None,
                resume_requested: false,
            }),
            resumed: Condvar::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, JobExecutionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn instance(&self) -> &JobInstance {
        &self.instance
    }

    pub fn job_name(&self) -> &str {
        &self.instance.job_name
    }

    pub fn is_restart(&self) -> bool {
        self.restart
    }

    pub fn status(&self) -> BatchStatus {
        self.state().status
    }

    pub fn set_status(&self, status: BatchStatus) {
        self.state().status = status;
    }

    pub fn upgrade_status(&self, status: BatchStatus) {
        let mut state = self.state();
        state.status = state.status.upgrade_to(status);
    }

    pub fn exit_status(&self) -> ExitStatus {
        self.state().exit_status.clone()
    }

    pub fn set_exit_status(&self, status: ExitStatus) {
        self.state().exit_status = status;
    }

    pub fn start(&self) {
        let mut state = self.state();
        state.status = BatchStatus::Started;
        state.exit_status = ExitStatus::executing();
        state.start_time = Some(Utc::now());
    }

    pub fn finish(&self) {
        self.state().end_time = Some(Utc::now());
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.state().start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.state().end_time
    }

    pub fn execution_context(&self) -> ExecutionContext {
        self.state().execution_context.clone()
    }

    pub fn update_execution_context<R>(&self, f: impl FnOnce(&mut ExecutionContext) -> R) -> R {
        f(&mut self.state().execution_context)
    }

    pub fn add_failure(&self, failure: Failure) {
        self.state().failures.push(failure);
    }

    pub fn failures(&self) -> Vec<Failure> {
        self.state().failures.clone()
    }

    /// Failures of the job itself followed by those of its steps.
    pub fn all_failures(&self) -> Vec<Failure> {
        let state = self.state();
        let mut all = state.failures.clone();
        for step in &state.step_executions {
            all.extend(step.failures.iter().cloned());
        }
        all
    }

    /// Stores the latest snapshot of a step execution, replacing an earlier
    /// snapshot with the same id.
    pub fn add_step_execution(&self, step: StepExecution) {
        let mut state = self.state();
        match state.step_executions.iter_mut().find(|s| s.id == step.id) {
            Some(existing) => *existing = step,
            None => state.step_executions.push(step),
        }
    }

    pub fn step_executions(&self) -> Vec<StepExecution> {
        self.state().step_executions.clone()
    }

    pub fn step_execution(&self, step_name: &str) -> Option<StepExecution> {
        self.state()
            .step_executions
            .iter()
            .rev()
            .find(|s| s.step_name == step_name)
            .cloned()
    }

    /// Cooperative stop: observed at flow-state and chunk boundaries only.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        {
            let mut state = self.state();
            if state.status.is_running() {
                state.status = BatchStatus::Stopping;
            }
        }
        self.resumed.notify_all();
    }

    pub fn is_stopping(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Marks the execution as suspended at the named state.
    pub fn pause_at(&self, state_name: &str) {
        let mut state = self.state();
        state.paused_at = Some(state_name.to_string());
        state.resume_requested = false;
    }

    pub fn paused_at(&self) -> Option<String> {
        self.state().paused_at.clone()
    }

    pub fn is_paused(&self) -> bool {
        self.state().paused_at.is_some()
    }

    /// Clears the pause marker and flips the execution back to STARTED.
    pub fn clear_pause(&self) {
        let mut state = self.state();
        state.paused_at = None;
        state.resume_requested = false;
        if state.status == BatchStatus::Stopped || state.status == BatchStatus::Started {
            state.status = BatchStatus::Started;
        }
    }

    /// Wakes a thread parked in [`JobExecution::wait_for_resume`].
    pub fn request_resume(&self) {
        self.state().resume_requested = true;
        self.resumed.notify_all();
    }

    /// Blocks while the execution is paused and no resume or stop has been
    /// requested. Returns `true` when resumed, `false` when stopped.
    pub fn wait_for_resume(&self) -> bool {
        let mut state = self.state();
        while state.paused_at.is_some() && !state.resume_requested && !self.is_stopping() {
            state = self.resumed.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        !self.is_stopping()
    }

    pub fn snapshot(&self) -> JobExecutionSnapshot {
        let state = self.state();
        let duration_ms = match (state.start_time, state.end_time) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        };
        JobExecutionSnapshot {
            id: self.id,
            job_name: self.instance.job_name.clone(),
            parameters: self.instance.parameters.clone(),
            status: state.status,
            exit_status: state.exit_status.clone(),
            restart: self.restart,
            created_at: self.created_at,
            start_time: state.start_time,
            end_time: state.end_time,
            duration_ms,
            failures: state.failures.iter().map(|f| f.to_string()).collect(),
            step_executions: state.step_executions.clone(),
            execution_context: state.execution_context.clone(),
        }
    }
}
