//! Pluggable execution strategy for concurrent flow branches.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;

use tokio::runtime::{Builder, Handle, Runtime};
use tracing::debug;

use crate::error::{BatchError, Result};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub trait TaskExecutor: Send + Sync {
    fn execute(&self, task: Task) -> Result<()>;
}

/// Result of a task submitted with [`submit`].
#[derive(Debug)]
pub struct TaskHandle<T> {
    receiver: mpsc::Receiver<std::thread::Result<T>>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the task has finished.
    pub fn join(self) -> Result<T> {
        match self.receiver.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(panic)) => Err(BatchError::TaskAborted(panic_message(&panic))),
            Err(_) => Err(BatchError::TaskAborted(
                "task was dropped before it ran".to_string(),
            )),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "task panicked".to_string())
}

/// Runs `work` on `executor` and returns a handle to its result. A panic in
/// `work` surfaces as [`BatchError::TaskAborted`] on join.
pub fn submit<T, F>(executor: &dyn TaskExecutor, work: F) -> Result<TaskHandle<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (sender, receiver) = mpsc::channel();
    executor.execute(Box::new(move || {
        let result = panic::catch_unwind(AssertUnwindSafe(work));
        // The receiver may already be gone if the caller gave up on the result.
        let _ = sender.send(result);
    }))?;
    Ok(TaskHandle { receiver })
}

/// Runs every task inline on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncTaskExecutor;

impl TaskExecutor for SyncTaskExecutor {
    fn execute(&self, task: Task) -> Result<()> {
        task();
        Ok(())
    }
}

enum Backend {
    Owned(Runtime),
    Shared(Handle),
}

/// Runs tasks on a tokio runtime's blocking thread pool.
pub struct TokioTaskExecutor {
    backend: Backend,
}

impl TokioTaskExecutor {
    /// Builds a dedicated runtime with up to `threads` blocking threads.
    /// Must not be dropped from inside an async context.
    pub fn new(threads: usize) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads.max(1))
            .thread_name("skein-split")
            .enable_all()
            .build()?;
        debug!(threads, "started split runtime");
        Ok(Self {
            backend: Backend::Owned(runtime),
        })
    }

    /// Uses the blocking pool of an existing runtime.
    pub fn from_handle(handle: Handle) -> Self {
        Self {
            backend: Backend::Shared(handle),
        }
    }

    fn handle(&self) -> &Handle {
        match &self.backend {
            Backend::Owned(runtime) => runtime.handle(),
            Backend::Shared(handle) => handle,
        }
    }
}

impl TaskExecutor for TokioTaskExecutor {
    fn execute(&self, task: Task) -> Result<()> {
        drop(self.handle().spawn_blocking(task));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    #[test]
    fn sync_executor_runs_inline() {
        let handle = submit(&SyncTaskExecutor, || std::thread::current().id()).unwrap();
        assert_eq!(handle.join().unwrap(), std::thread::current().id());
    }

    #[test]
    fn panics_become_task_aborted() {
        let handle = submit(&SyncTaskExecutor, || -> u32 { panic!("branch exploded") }).unwrap();
        match handle.join() {
            Err(BatchError::TaskAborted(msg)) => assert_eq!(msg, "branch exploded"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn tokio_executor_runs_tasks_concurrently() {
        let executor = TokioTaskExecutor::new(2).unwrap();
        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|i| {
                let barrier = barrier.clone();
                submit(&executor, move || {
                    barrier.wait();
                    i * 10
                })
                .unwrap()
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results, vec![0, 10]);
    }
}
