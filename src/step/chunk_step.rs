//! Chunk-oriented step engine.
//!
//! Each chunk runs in one transaction: read up to `commit_interval` items,
//! process them one by one, write them as a unit, commit. Reads and
//! processing are retried in place and fall back to the skip policy. The
//! write runs under a stateful retry keyed by chunk: every failed write rolls
//! the transaction back and tries again in a fresh one, and once the retry is
//! exhausted a skippable failure triggers an item-by-item scan to isolate the
//! bad items. The scan writes each item in its own transaction under its own
//! retry, so a skipped item leaves nothing behind. Counters reach the
//! [`StepExecution`] only when the chunk commits.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use super::Step;
use super::chunk::Chunk;
use super::item::{ItemProcessor, ItemReader, ItemWriter, PassThroughItemProcessor};
use super::skip::{LimitCheckingSkipPolicy, SkipListener, SkipPolicy};
use super::transaction::{ResourcelessTransactionManager, Transaction, TransactionManager};
use crate::config::BatchConfig;
use crate::error::{BatchError, Failure, Result};
use crate::execution::{StepContext, StepContribution, StepExecution};
use crate::retry::{
    BackOffPolicy, FailureClassifier, NoBackOffPolicy, RetryContext, RetryListener, RetryPolicy,
    RetryState, RetryTemplate, SimpleRetryPolicy,
};
use crate::status::ExitStatus;

enum Read<I> {
    Item(I),
    End,
    Skipped(Failure),
}

enum Processed<O> {
    Item(O),
    Filtered,
    Skipped(Failure),
}

enum Write {
    Written,
    Scan,
}

enum ItemWrite {
    Written,
    Skipped(Failure),
}

enum ChunkOutcome {
    Continue,
    Finished,
}

fn lock<T: ?Sized>(mutex: &Mutex<Box<T>>) -> MutexGuard<'_, Box<T>> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A step that reads, processes and writes items in committed chunks.
///
/// Build one with [`ChunkStepBuilder`].
pub struct ChunkOrientedStep<I, O> {
    name: String,
    commit_interval: usize,
    reader: Mutex<Box<dyn ItemReader<I>>>,
    processor: Mutex<Box<dyn ItemProcessor<I, O>>>,
    writer: Mutex<Box<dyn ItemWriter<O>>>,
    retry: RetryTemplate,
    skip_policy: Arc<dyn SkipPolicy>,
    rollback: FailureClassifier,
    skip_listeners: Vec<Arc<dyn SkipListener<I, O>>>,
    transaction_manager: Arc<dyn TransactionManager>,
    allow_start_if_complete: bool,
    start_limit: u32,
}

impl<I, O> ChunkOrientedStep<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn run_chunks(
        &self,
        reader: &mut dyn ItemReader<I>,
        processor: &mut dyn ItemProcessor<I, O>,
        writer: &mut dyn ItemWriter<O>,
        step_execution: &mut StepExecution,
        context: &StepContext,
    ) -> Result<ExitStatus> {
        let mut chunk_number = 0u64;
        loop {
            if context.is_stop_requested() {
                info!(step = %self.name, chunk = chunk_number, "stop requested, leaving at chunk boundary");
                return Ok(ExitStatus::with_description(
                    ExitStatus::STOPPED_CODE,
                    "stop requested",
                ));
            }
            chunk_number += 1;
            let chunk = context.open_chunk(chunk_number);
            let outcome =
                self.run_chunk(chunk_number, reader, processor, writer, step_execution, context);
            context.close_chunk(&chunk);
            if let ChunkOutcome::Finished = outcome? {
                return Ok(ExitStatus::completed());
            }
        }
    }

    fn run_chunk(
        &self,
        chunk_number: u64,
        reader: &mut dyn ItemReader<I>,
        processor: &mut dyn ItemProcessor<I, O>,
        writer: &mut dyn ItemWriter<O>,
        step_execution: &mut StepExecution,
        context: &StepContext,
    ) -> Result<ChunkOutcome> {
        let mut contribution = step_execution.new_contribution();
        let mut inputs = Chunk::new();
        let mut outputs = Chunk::new();
        let mut tx = Some(self.transaction_manager.begin()?);

        let written = self
            .read_chunk(reader, &mut inputs, &mut contribution)
            .and_then(|()| self.process_chunk(processor, &mut inputs, &mut outputs, &mut contribution))
            .and_then(|()| {
                self.write_chunk(
                    writer,
                    chunk_number,
                    &mut outputs,
                    &mut contribution,
                    step_execution,
                    &mut tx,
                )
            });
        if let Err(err) = written {
            self.roll_back(&mut tx, step_execution)?;
            warn!(step = %self.name, chunk = chunk_number, error = %err, "chunk rolled back");
            return Err(err);
        }

        let idle = contribution.read_count == 0
            && contribution.filter_count == 0
            && contribution.skip_count() == 0;
        if idle && inputs.is_end() {
            self.commit(&mut tx)?;
            return Ok(ChunkOutcome::Finished);
        }

        let streams = reader
            .update(&mut step_execution.execution_context)
            .and_then(|()| writer.update(&mut step_execution.execution_context));
        if let Err(err) = streams {
            self.roll_back(&mut tx, step_execution)?;
            return Err(err);
        }
        self.commit(&mut tx)?;

        step_execution.apply(&contribution);
        step_execution.commit_count += 1;
        context.update(step_execution)?;
        debug!(
            step = %self.name,
            chunk = chunk_number,
            read = contribution.read_count,
            written = contribution.write_count,
            skipped = contribution.skip_count(),
            "chunk committed"
        );
        self.notify_skips(&inputs, &outputs);

        Ok(if inputs.is_end() {
            ChunkOutcome::Finished
        } else {
            ChunkOutcome::Continue
        })
    }

    fn commit(&self, tx: &mut Option<Transaction>) -> Result<()> {
        let active = tx.take().ok_or_else(|| {
            BatchError::Transaction(format!("step {} has no active transaction", self.name))
        })?;
        self.transaction_manager.commit(active)
    }

    /// Rolls back `tx` if it is still active. A transaction that failed to
    /// roll back is not retried.
    fn roll_back(&self, tx: &mut Option<Transaction>, step_execution: &mut StepExecution) -> Result<()> {
        if let Some(active) = tx.take() {
            self.transaction_manager.rollback(active)?;
            step_execution.rollback_count += 1;
        }
        Ok(())
    }

    /// Fails with [`BatchError::NonSkippable`] unless the skip policy accepts
    /// the last failure in `context`.
    fn recover(&self, context: &RetryContext, phase: &str, skip_count: u64) -> Result<Failure> {
        let Some(failure) = context.last_failure() else {
            return Err(BatchError::RetryTerminated(format!(
                "{phase} recovery without a failure"
            )));
        };
        if self.skip_policy.should_skip(&failure, skip_count)? {
            Ok(failure)
        } else {
            Err(BatchError::NonSkippable {
                phase: phase.to_string(),
                source: failure,
            })
        }
    }

    fn read_chunk(
        &self,
        reader: &mut dyn ItemReader<I>,
        inputs: &mut Chunk<I>,
        contribution: &mut StepContribution,
    ) -> Result<()> {
        while inputs.len() < self.commit_interval {
            let skip_count = contribution.step_skip_count();
            let read = self.retry.execute_with_recovery(
                |_| {
                    reader
                        .read()
                        .map(|item| item.map_or(Read::End, Read::Item))
                },
                |ctx: &RetryContext| self.recover(ctx, "read", skip_count).map(Read::Skipped),
            )?;
            match read {
                Read::Item(item) => {
                    contribution.read_count += 1;
                    inputs.add(item);
                }
                Read::End => {
                    inputs.set_end();
                    break;
                }
                Read::Skipped(failure) => {
                    warn!(step = %self.name, error = %failure, "skipping failed read");
                    contribution.read_skip_count += 1;
                    inputs.skip(None, failure);
                }
            }
        }
        Ok(())
    }

    fn process_chunk(
        &self,
        processor: &mut dyn ItemProcessor<I, O>,
        inputs: &mut Chunk<I>,
        outputs: &mut Chunk<O>,
        contribution: &mut StepContribution,
    ) -> Result<()> {
        for item in inputs.take_items() {
            let skip_count = contribution.step_skip_count();
            let processed = self.retry.execute_with_recovery(
                |_| {
                    processor
                        .process(&item)
                        .map(|out| out.map_or(Processed::Filtered, Processed::Item))
                },
                |ctx: &RetryContext| {
                    self.recover(ctx, "process", skip_count)
                        .map(Processed::Skipped)
                },
            )?;
            match processed {
                Processed::Item(out) => outputs.add(out),
                Processed::Filtered => contribution.filter_count += 1,
                Processed::Skipped(failure) => {
                    warn!(step = %self.name, error = %failure, "skipping failed item in process");
                    contribution.process_skip_count += 1;
                    inputs.skip(Some(item), failure);
                }
            }
        }
        Ok(())
    }

    fn write_chunk(
        &self,
        writer: &mut dyn ItemWriter<O>,
        chunk_number: u64,
        outputs: &mut Chunk<O>,
        contribution: &mut StepContribution,
        step_execution: &mut StepExecution,
        tx: &mut Option<Transaction>,
    ) -> Result<()> {
        if outputs.is_empty() {
            return Ok(());
        }
        let key = format!("{}#{}", step_execution.id, chunk_number);
        let write = self.write_with_retry(
            key,
            tx,
            step_execution,
            || writer.write(outputs.items()).map(|()| Write::Written),
            |ctx: &RetryContext| match ctx.last_failure() {
                Some(failure) if self.skip_policy.is_skippable(&failure) => Ok(Write::Scan),
                Some(failure) => Err(BatchError::NonSkippable {
                    phase: "write".to_string(),
                    source: failure,
                }),
                None => Err(BatchError::RetryTerminated(
                    "write recovery without a failure".to_string(),
                )),
            },
        )?;
        match write {
            Write::Written => {
                contribution.write_count += outputs.len() as u64;
            }
            Write::Scan => {
                self.roll_back(tx, step_execution)?;
                self.scan(writer, chunk_number, outputs, contribution, step_execution)?;
                *tx = Some(self.transaction_manager.begin()?);
            }
        }
        Ok(())
    }

    /// Runs `write` under a stateful retry keyed by `key`. A failure
    /// classified for rollback rolls `tx` back and the next attempt runs in a
    /// new transaction. `recover` decides once the retry is exhausted.
    fn write_with_retry<T>(
        &self,
        key: String,
        tx: &mut Option<Transaction>,
        step_execution: &mut StepExecution,
        mut write: impl FnMut() -> std::result::Result<T, Failure>,
        recover: impl Fn(&RetryContext) -> Result<T>,
    ) -> Result<T> {
        let state = RetryState::new(key).with_rollback_classifier(self.rollback.clone());
        let result = loop {
            let attempt = self.retry.execute_stateful(
                |_| write(),
                Some(|ctx: &RetryContext| recover(ctx)),
                &state,
            );
            match attempt {
                Err(BatchError::Item(failure)) => {
                    warn!(step = %self.name, key = state.key(), error = %failure, "write failed, retrying in a new transaction");
                    let renewed = self
                        .roll_back(tx, step_execution)
                        .and_then(|()| self.transaction_manager.begin());
                    match renewed {
                        Ok(fresh) => *tx = Some(fresh),
                        Err(err) => break Err(err),
                    }
                }
                other => break other,
            }
        };
        if result.is_err() {
            self.retry.cache().remove(state.key());
        }
        result
    }

    /// Writes the chunk one item at a time to isolate the items that fail.
    /// Every item gets its own transaction and its own stateful retry; an
    /// item is skipped only once its retry is exhausted, and its transaction
    /// is rolled back so nothing it wrote survives.
    fn scan(
        &self,
        writer: &mut dyn ItemWriter<O>,
        chunk_number: u64,
        outputs: &mut Chunk<O>,
        contribution: &mut StepContribution,
        step_execution: &mut StepExecution,
    ) -> Result<()> {
        debug!(step = %self.name, items = outputs.len(), "scanning chunk item by item");
        for (index, item) in outputs.take_items().into_iter().enumerate() {
            let skip_count = contribution.step_skip_count();
            let mut tx = Some(self.transaction_manager.begin()?);
            let written = self.write_with_retry(
                format!("{}#{}#{}", step_execution.id, chunk_number, index),
                &mut tx,
                step_execution,
                || writer.write(std::slice::from_ref(&item)).map(|()| ItemWrite::Written),
                |ctx: &RetryContext| self.recover(ctx, "write", skip_count).map(ItemWrite::Skipped),
            );
            match written {
                Ok(ItemWrite::Written) => {
                    self.commit(&mut tx)?;
                    contribution.write_count += 1;
                    outputs.add(item);
                }
                Ok(ItemWrite::Skipped(failure)) => {
                    self.roll_back(&mut tx, step_execution)?;
                    warn!(step = %self.name, error = %failure, "skipping failed item in write");
                    contribution.write_skip_count += 1;
                    outputs.skip(Some(item), failure);
                }
                Err(err) => {
                    self.roll_back(&mut tx, step_execution)?;
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn notify_skips(&self, inputs: &Chunk<I>, outputs: &Chunk<O>) {
        for listener in &self.skip_listeners {
            for skipped in inputs.skips() {
                match &skipped.item {
                    Some(item) => listener.on_skip_in_process(item, &skipped.failure),
                    None => listener.on_skip_in_read(&skipped.failure),
                }
            }
            for skipped in outputs.skips() {
                if let Some(item) = &skipped.item {
                    listener.on_skip_in_write(item, &skipped.failure);
                }
            }
        }
    }
}

impl<I, O> Step for ChunkOrientedStep<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
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
        let mut reader = lock(&self.reader);
        let mut processor = lock(&self.processor);
        let mut writer = lock(&self.writer);

        reader.open(&step_execution.execution_context)?;
        writer.open(&step_execution.execution_context)?;

        let result = self.run_chunks(
            &mut **reader,
            &mut **processor,
            &mut **writer,
            step_execution,
            context,
        );

        let reader_closed = reader.close();
        let writer_closed = writer.close();
        let exit_status = result?;
        reader_closed?;
        writer_closed?;
        Ok(exit_status)
    }
}

/// Fluent configuration for a [`ChunkOrientedStep`].
pub struct ChunkStepBuilder<I, O> {
    name: String,
    commit_interval: usize,
    reader: Option<Box<dyn ItemReader<I>>>,
    processor: Option<Box<dyn ItemProcessor<I, O>>>,
    writer: Option<Box<dyn ItemWriter<O>>>,
    retry_limit: u32,
    retryable: FailureClassifier,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
    backoff: Arc<dyn BackOffPolicy>,
    retry_listeners: Vec<Arc<dyn RetryListener>>,
    skip_limit: u64,
    skippable: Option<FailureClassifier>,
    skip_policy: Option<Arc<dyn SkipPolicy>>,
    no_rollback: FailureClassifier,
    skip_listeners: Vec<Arc<dyn SkipListener<I, O>>>,
    transaction_manager: Option<Arc<dyn TransactionManager>>,
    allow_start_if_complete: bool,
    start_limit: u32,
}

impl<I, O> ChunkStepBuilder<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// A builder with no retries and no skips.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            commit_interval: 10,
            reader: None,
            processor: None,
            writer: None,
            retry_limit: 1,
            retryable: FailureClassifier::all(),
            retry_policy: None,
            backoff: Arc::new(NoBackOffPolicy),
            retry_listeners: Vec::new(),
            skip_limit: 0,
            skippable: None,
            skip_policy: None,
            no_rollback: FailureClassifier::none(),
            skip_listeners: Vec::new(),
            transaction_manager: None,
            allow_start_if_complete: false,
            start_limit: u32::MAX,
        }
    }

    /// Commit interval, retry limit, skip limit and back-off from `config`.
    pub fn from_config(name: impl Into<String>, config: &BatchConfig) -> Self {
        let mut builder = Self::new(name)
            .commit_interval(config.commit_interval)
            .retry_limit(config.retry_limit)
            .skip_limit(config.skip_limit);
        builder.backoff = config.backoff_policy();
        builder
    }

    pub fn reader(mut self, reader: impl ItemReader<I> + 'static) -> Self {
        self.reader = Some(Box::new(reader));
        self
    }

    pub fn processor(mut self, processor: impl ItemProcessor<I, O> + 'static) -> Self {
        self.processor = Some(Box::new(processor));
        self
    }

    pub fn writer(mut self, writer: impl ItemWriter<O> + 'static) -> Self {
        self.writer = Some(Box::new(writer));
        self
    }

    pub fn commit_interval(mut self, commit_interval: usize) -> Self {
        self.commit_interval = commit_interval;
        self
    }

    /// Maximum attempts per item or chunk write, the first one included.
    pub fn retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn retryable(mut self, retryable: FailureClassifier) -> Self {
        self.retryable = retryable;
        self
    }

    /// Replaces the policy built from `retry_limit` and `retryable`.
    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn backoff(mut self, backoff: Arc<dyn BackOffPolicy>) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn retry_listener(mut self, listener: Arc<dyn RetryListener>) -> Self {
        self.retry_listeners.push(listener);
        self
    }

    /// Skips allowed per step execution. Unless [`ChunkStepBuilder::skippable`]
    /// narrows it, every failure becomes skippable once a limit is set.
    pub fn skip_limit(mut self, skip_limit: u64) -> Self {
        self.skip_limit = skip_limit;
        self
    }

    pub fn skippable(mut self, skippable: FailureClassifier) -> Self {
        self.skippable = Some(skippable);
        self
    }

    /// Replaces the policy built from `skip_limit` and `skippable`.
    pub fn skip_policy(mut self, policy: Arc<dyn SkipPolicy>) -> Self {
        self.skip_policy = Some(policy);
        self
    }

    /// Write failures classified `true` are retried without rolling back.
    pub fn no_rollback(mut self, no_rollback: FailureClassifier) -> Self {
        self.no_rollback = no_rollback;
        self
    }

    pub fn skip_listener(mut self, listener: Arc<dyn SkipListener<I, O>>) -> Self {
        self.skip_listeners.push(listener);
        self
    }

    pub fn transaction_manager(mut self, manager: Arc<dyn TransactionManager>) -> Self {
        self.transaction_manager = Some(manager);
        self
    }

    pub fn allow_start_if_complete(mut self, allow: bool) -> Self {
        self.allow_start_if_complete = allow;
        self
    }

    pub fn start_limit(mut self, start_limit: u32) -> Self {
        self.start_limit = start_limit;
        self
    }

    pub fn build(self) -> Result<ChunkOrientedStep<I, O>> {
        let missing = |what: &str| {
            BatchError::FlowConfig(format!("chunk step {} has no {what}", self.name))
        };
        if self.commit_interval == 0 {
            return Err(BatchError::FlowConfig(format!(
                "chunk step {} needs a commit interval of at least 1",
                self.name
            )));
        }
        let reader = self.reader.ok_or_else(|| missing("reader"))?;
        let processor = self.processor.ok_or_else(|| missing("processor"))?;
        let writer = self.writer.ok_or_else(|| missing("writer"))?;

        let policy = self.retry_policy.unwrap_or_else(|| {
            Arc::new(SimpleRetryPolicy::with_classifier(self.retry_limit, self.retryable))
        });
        let retry = self
            .retry_listeners
            .into_iter()
            .fold(RetryTemplate::with_policy(policy).with_backoff(self.backoff), |t, l| {
                t.with_listener(l)
            });

        let skip_policy = self.skip_policy.unwrap_or_else(|| {
            let skippable = self.skippable.unwrap_or_else(|| {
                if self.skip_limit > 0 {
                    FailureClassifier::all()
                } else {
                    FailureClassifier::none()
                }
            });
            Arc::new(LimitCheckingSkipPolicy::new(self.skip_limit, skippable))
        });

        let no_rollback = self.no_rollback;
        Ok(ChunkOrientedStep {
            name: self.name,
            commit_interval: self.commit_interval,
            reader: Mutex::new(reader),
            processor: Mutex::new(processor),
            writer: Mutex::new(writer),
            retry,
            skip_policy,
            rollback: FailureClassifier::new(move |f| !no_rollback.classify(f)),
            skip_listeners: self.skip_listeners,
            transaction_manager: self
                .transaction_manager
                .unwrap_or_else(|| Arc::new(ResourcelessTransactionManager::new())),
            allow_start_if_complete: self.allow_start_if_complete,
            start_limit: self.start_limit,
        })
    }
}

impl<T> ChunkStepBuilder<T, T>
where
    T: Clone + Send + 'static,
{
    /// Uses [`PassThroughItemProcessor`].
    pub fn pass_through(self) -> Self {
        self.processor(PassThroughItemProcessor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecutionContext;
    use crate::status::BatchStatus;
    use crate::step::item::{CollectingItemWriter, FnItemProcessor, ItemStream, ListItemReader};
    use crate::step::test_support::step_fixture;
    use crate::step::transaction::TransactionCounts;

    #[derive(Debug, thiserror::Error)]
    #[error("bad item {0}")]
    struct BadItem(i32);

    /// Writer that fails whole chunks containing any of `poison`, a
    /// configurable number of times per chunk before giving up.
    struct FlakyWriter {
        poison: Vec<i32>,
        failures_left: Option<u32>,
        inner: CollectingItemWriter<i32>,
        calls: Arc<Mutex<u32>>,
    }

    impl ItemStream for FlakyWriter {}

    impl ItemWriter<i32> for FlakyWriter {
        fn write(&mut self, items: &[i32]) -> std::result::Result<(), Failure> {
            *self.calls.lock().unwrap() += 1;
            if let Some(bad) = items.iter().find(|i| self.poison.contains(i)) {
                match &mut self.failures_left {
                    Some(0) => {}
                    Some(n) => {
                        *n -= 1;
                        return Err(Failure::new(BadItem(*bad)));
                    }
                    None => return Err(Failure::new(BadItem(*bad))),
                }
            }
            self.inner.write(items)
        }
    }

    #[derive(Default)]
    struct RecordingSkips {
        process: Mutex<Vec<i32>>,
        write: Mutex<Vec<i32>>,
    }

    impl SkipListener<i32, i32> for RecordingSkips {
        fn on_skip_in_process(&self, item: &i32, _failure: &Failure) {
            self.process.lock().unwrap().push(*item);
        }

        fn on_skip_in_write(&self, item: &i32, _failure: &Failure) {
            self.write.lock().unwrap().push(*item);
        }
    }

    /// Side effects of [`StagingWriter`]: staged until the transaction
    /// commits, dropped when it rolls back.
    #[derive(Clone, Default)]
    struct Staging {
        pending: Arc<Mutex<Vec<i32>>>,
        committed: Arc<Mutex<Vec<i32>>>,
    }

    impl Staging {
        fn committed(&self) -> Vec<i32> {
            self.committed.lock().unwrap().clone()
        }
    }

    struct StagingTransactions {
        staging: Staging,
        ledger: ResourcelessTransactionManager,
    }

    impl TransactionManager for StagingTransactions {
        fn begin(&self) -> Result<Transaction> {
            self.ledger.begin()
        }

        fn commit(&self, transaction: Transaction) -> Result<()> {
            self.ledger.commit(transaction)?;
            let staged = std::mem::take(&mut *self.staging.pending.lock().unwrap());
            self.staging.committed.lock().unwrap().extend(staged);
            Ok(())
        }

        fn rollback(&self, transaction: Transaction) -> Result<()> {
            self.ledger.rollback(transaction)?;
            self.staging.pending.lock().unwrap().clear();
            Ok(())
        }
    }

    /// Stages every item it is given, then fails when `fails` says so.
    struct StagingWriter {
        staging: Staging,
        fails: Box<dyn FnMut(&[i32]) -> bool + Send>,
    }

    impl ItemStream for StagingWriter {}

    impl ItemWriter<i32> for StagingWriter {
        fn write(&mut self, items: &[i32]) -> std::result::Result<(), Failure> {
            self.staging.pending.lock().unwrap().extend_from_slice(items);
            if (self.fails)(items) {
                return Err(Failure::new(BadItem(items[0])));
            }
            Ok(())
        }
    }

    fn staged_step(
        retry_limit: u32,
        fails: impl FnMut(&[i32]) -> bool + Send + 'static,
    ) -> (ChunkOrientedStep<i32, i32>, Staging, Arc<StagingTransactions>) {
        let staging = Staging::default();
        let tm = Arc::new(StagingTransactions {
            staging: staging.clone(),
            ledger: ResourcelessTransactionManager::new(),
        });
        let step = ChunkStepBuilder::new("load")
            .commit_interval(4)
            .retry_limit(retry_limit)
            .skip_limit(3)
            .reader(ListItemReader::new("numbers", vec![1, 2, 3, 4]))
            .pass_through()
            .writer(StagingWriter {
                staging: staging.clone(),
                fails: Box::new(fails),
            })
            .transaction_manager(tm.clone())
            .build()
            .unwrap();
        (step, staging, tm)
    }

    fn doubling() -> FnItemProcessor<impl FnMut(&i32) -> std::result::Result<Option<i32>, Failure>> {
        FnItemProcessor(|n: &i32| -> std::result::Result<Option<i32>, Failure> { Ok(Some(n * 2)) })
    }

    #[test]
    fn exact_commit_interval_commits_one_chunk() {
        let writer = CollectingItemWriter::new();
        let step = ChunkStepBuilder::new("load")
            .commit_interval(5)
            .reader(ListItemReader::new("numbers", vec![1, 2, 3, 4, 5]))
            .processor(doubling())
            .writer(writer.clone())
            .build()
            .unwrap();
        let (_repo, mut se, ctx) = step_fixture("load");
        step.execute(&mut se, &ctx).unwrap();

        assert_eq!(se.status, BatchStatus::Completed);
        assert_eq!(se.exit_status.exit_code(), "COMPLETED");
        assert_eq!(se.read_count, 5);
        assert_eq!(se.write_count, 5);
        assert_eq!(se.commit_count, 1);
        assert_eq!(se.rollback_count, 0);
        assert_eq!(writer.written(), vec![2, 4, 6, 8, 10]);
        assert_eq!(
            se.execution_context.get::<usize>("numbers.read.count").unwrap(),
            Some(5)
        );
    }

    #[test]
    fn partial_last_chunk_and_filtering() {
        let writer = CollectingItemWriter::new();
        let step = ChunkStepBuilder::new("load")
            .commit_interval(3)
            .reader(ListItemReader::new("numbers", (1..=7).collect()))
            .processor(FnItemProcessor(|n: &i32| -> std::result::Result<Option<i32>, Failure> {
                Ok((n % 2 == 1).then_some(*n))
            }))
            .writer(writer.clone())
            .build()
            .unwrap();
        let (repo, mut se, ctx) = step_fixture("load");
        step.execute(&mut se, &ctx).unwrap();

        assert_eq!(se.read_count, 7);
        assert_eq!(se.filter_count, 3);
        assert_eq!(se.write_count, 4);
        assert_eq!(se.commit_count, 3);
        assert_eq!(writer.written(), vec![1, 3, 5, 7]);
        // start, one per commit, finish
        assert_eq!(repo.step_update_count(), 5);
    }

    #[test]
    fn process_failures_are_retried_then_skipped() {
        let attempts = Arc::new(Mutex::new(0));
        let counter = attempts.clone();
        let listener = Arc::new(RecordingSkips::default());
        let writer = CollectingItemWriter::new();
        let step = ChunkStepBuilder::new("load")
            .commit_interval(10)
            .retry_limit(3)
            .skip_limit(5)
            .reader(ListItemReader::new("numbers", vec![1, 2, 3]))
            .processor(FnItemProcessor(move |n: &i32| -> std::result::Result<Option<i32>, Failure> {
                if *n == 2 {
                    *counter.lock().unwrap() += 1;
                    return Err(Failure::new(BadItem(*n)));
                }
                Ok(Some(*n))
            }))
            .writer(writer.clone())
            .skip_listener(listener.clone())
            .build()
            .unwrap();
        let (_repo, mut se, ctx) = step_fixture("load");
        step.execute(&mut se, &ctx).unwrap();

        assert_eq!(*attempts.lock().unwrap(), 3);
        assert_eq!(se.status, BatchStatus::Completed);
        assert_eq!(se.process_skip_count, 1);
        assert_eq!(writer.written(), vec![1, 3]);
        assert_eq!(*listener.process.lock().unwrap(), vec![2]);
    }

    #[test]
    fn fatal_process_failure_fails_the_step_with_root_cause() {
        let step = ChunkStepBuilder::new("load")
            .reader(ListItemReader::new("numbers", vec![1, 2]))
            .processor(FnItemProcessor(|n: &i32| -> std::result::Result<Option<i32>, Failure> {
                Err(Failure::new(BadItem(*n)))
            }))
            .writer(CollectingItemWriter::new())
            .build()
            .unwrap();
        let (_repo, mut se, ctx) = step_fixture("load");
        step.execute(&mut se, &ctx).unwrap();

        assert_eq!(se.status, BatchStatus::Failed);
        assert_eq!(se.exit_status.exit_code(), "FAILED");
        assert_eq!(se.read_count, 0);
        assert_eq!(se.rollback_count, 1);
        assert_eq!(se.failures[0].downcast_ref::<BadItem>().map(|b| b.0), Some(1));
    }

    #[test]
    fn skip_limit_exceeded_fails_the_step() {
        let step = ChunkStepBuilder::new("load")
            .skip_limit(1)
            .reader(ListItemReader::new("numbers", vec![1, 2, 3]))
            .processor(FnItemProcessor(|n: &i32| -> std::result::Result<Option<i32>, Failure> {
                if *n > 1 { Err(Failure::new(BadItem(*n))) } else { Ok(Some(*n)) }
            }))
            .writer(CollectingItemWriter::new())
            .build()
            .unwrap();
        let (_repo, mut se, ctx) = step_fixture("load");
        step.execute(&mut se, &ctx).unwrap();

        assert_eq!(se.status, BatchStatus::Failed);
        assert!(se.failures[0].is::<BadItem>());
        assert_eq!(se.skip_count(), 0);
    }

    #[test]
    fn write_failure_rolls_back_and_scans_for_bad_item() {
        let calls = Arc::new(Mutex::new(0));
        let collected = CollectingItemWriter::new();
        let listener = Arc::new(RecordingSkips::default());
        let tm = Arc::new(ResourcelessTransactionManager::new());
        let step = ChunkStepBuilder::new("load")
            .commit_interval(4)
            .retry_limit(2)
            .skip_limit(3)
            .reader(ListItemReader::new("numbers", vec![1, 2, 3, 4]))
            .pass_through()
            .writer(FlakyWriter {
                poison: vec![3],
                failures_left: None,
                inner: collected.clone(),
                calls: calls.clone(),
            })
            .skip_listener(listener.clone())
            .transaction_manager(tm.clone())
            .build()
            .unwrap();
        let (_repo, mut se, ctx) = step_fixture("load");
        step.execute(&mut se, &ctx).unwrap();

        assert_eq!(se.status, BatchStatus::Completed);
        // two failed chunk attempts, the chunk transaction before the scan,
        // then two failed attempts and the skip of item 3
        assert_eq!(se.rollback_count, 6);
        assert_eq!(se.write_skip_count, 1);
        assert_eq!(se.write_count, 3);
        assert_eq!(se.commit_count, 1);
        assert_eq!(collected.written(), vec![1, 2, 4]);
        assert_eq!(*listener.write.lock().unwrap(), vec![3]);
        // two chunk attempts, then 1, 2, 3 three times, 4
        assert_eq!(*calls.lock().unwrap(), 7);
        assert_eq!(
            tm.counts(),
            TransactionCounts { begun: 11, committed: 5, rolled_back: 6 }
        );
        assert_eq!(tm.active(), 0);
    }

    #[test]
    fn transient_write_failure_succeeds_on_retry() {
        let collected = CollectingItemWriter::new();
        let step = ChunkStepBuilder::new("load")
            .commit_interval(2)
            .retry_limit(3)
            .reader(ListItemReader::new("numbers", vec![1, 2]))
            .pass_through()
            .writer(FlakyWriter {
                poison: vec![2],
                failures_left: Some(1),
                inner: collected.clone(),
                calls: Arc::new(Mutex::new(0)),
            })
            .build()
            .unwrap();
        let (_repo, mut se, ctx) = step_fixture("load");
        step.execute(&mut se, &ctx).unwrap();

        assert_eq!(se.status, BatchStatus::Completed);
        assert_eq!(se.rollback_count, 1);
        assert_eq!(se.write_count, 2);
        assert_eq!(se.write_skip_count, 0);
        assert_eq!(collected.written(), vec![1, 2]);
    }

    #[test]
    fn rolled_back_chunk_write_leaves_no_side_effects() {
        let mut failed = false;
        let (step, staging, tm) = staged_step(2, move |_| !std::mem::replace(&mut failed, true));
        let (_repo, mut se, ctx) = step_fixture("load");
        step.execute(&mut se, &ctx).unwrap();

        assert_eq!(se.status, BatchStatus::Completed);
        assert_eq!(se.rollback_count, 1);
        assert_eq!(se.write_count, 4);
        assert_eq!(staging.committed(), vec![1, 2, 3, 4]);
        assert_eq!(tm.ledger.active(), 0);
    }

    #[test]
    fn skipped_write_item_leaves_no_side_effects() {
        let (step, staging, tm) = staged_step(1, |items| items.contains(&3));
        let (_repo, mut se, ctx) = step_fixture("load");
        step.execute(&mut se, &ctx).unwrap();

        assert_eq!(se.status, BatchStatus::Completed);
        assert_eq!(se.write_skip_count, 1);
        assert_eq!(se.write_count, 3);
        assert_eq!(staging.committed(), vec![1, 2, 4]);
        assert!(staging.pending.lock().unwrap().is_empty());
        assert_eq!(tm.ledger.active(), 0);
        assert!(step.retry.cache().is_empty());
    }

    #[test]
    fn scan_retries_an_item_before_skipping_it() {
        let mut item_failures = 1;
        let (step, staging, _tm) = staged_step(3, move |items| {
            if !items.contains(&3) {
                return false;
            }
            if items.len() > 1 {
                return true;
            }
            item_failures -= 1;
            item_failures >= 0
        });
        let (_repo, mut se, ctx) = step_fixture("load");
        step.execute(&mut se, &ctx).unwrap();

        assert_eq!(se.status, BatchStatus::Completed);
        assert_eq!(se.write_skip_count, 0);
        assert_eq!(se.write_count, 4);
        assert_eq!(se.commit_count, 1);
        assert_eq!(staging.committed(), vec![1, 2, 3, 4]);
    }

    /// Refuses to open more than `allowed` transactions.
    struct RefusingTransactions {
        allowed: u64,
        ledger: ResourcelessTransactionManager,
    }

    impl TransactionManager for RefusingTransactions {
        fn begin(&self) -> Result<Transaction> {
            if self.ledger.counts().begun >= self.allowed {
                return Err(BatchError::Transaction("begin refused".to_string()));
            }
            self.ledger.begin()
        }

        fn commit(&self, transaction: Transaction) -> Result<()> {
            self.ledger.commit(transaction)
        }

        fn rollback(&self, transaction: Transaction) -> Result<()> {
            self.ledger.rollback(transaction)
        }
    }

    #[test]
    fn failed_begin_after_rollback_reports_the_begin_error() {
        let tm = Arc::new(RefusingTransactions {
            allowed: 1,
            ledger: ResourcelessTransactionManager::new(),
        });
        let step = ChunkStepBuilder::new("load")
            .retry_limit(2)
            .reader(ListItemReader::new("numbers", vec![1, 2]))
            .pass_through()
            .writer(FlakyWriter {
                poison: vec![1],
                failures_left: None,
                inner: CollectingItemWriter::new(),
                calls: Arc::new(Mutex::new(0)),
            })
            .transaction_manager(tm.clone())
            .build()
            .unwrap();
        let (_repo, mut se, ctx) = step_fixture("load");
        step.execute(&mut se, &ctx).unwrap();

        assert_eq!(se.status, BatchStatus::Failed);
        assert_eq!(se.rollback_count, 1);
        let cause = se.failures[0].downcast_ref::<BatchError>();
        assert!(matches!(cause, Some(BatchError::Transaction(m)) if m == "begin refused"));
        assert_eq!(tm.ledger.active(), 0);
        assert_eq!(tm.ledger.counts().rolled_back, 1);
        assert!(step.retry.cache().is_empty());
    }

    #[test]
    fn non_skippable_write_failure_fails_the_step() {
        let step = ChunkStepBuilder::new("load")
            .retry_limit(2)
            .reader(ListItemReader::new("numbers", vec![1, 2]))
            .pass_through()
            .writer(FlakyWriter {
                poison: vec![1],
                failures_left: None,
                inner: CollectingItemWriter::new(),
                calls: Arc::new(Mutex::new(0)),
            })
            .build()
            .unwrap();
        let (_repo, mut se, ctx) = step_fixture("load");
        step.execute(&mut se, &ctx).unwrap();

        assert_eq!(se.status, BatchStatus::Failed);
        assert_eq!(se.write_count, 0);
        assert_eq!(se.commit_count, 0);
        // two rolled back attempts plus the abandoned recovery transaction
        assert_eq!(se.rollback_count, 3);
        assert!(se.failures[0].is::<BadItem>());
    }

    #[test]
    fn stop_request_is_observed_between_chunks() {
        let step = ChunkStepBuilder::new("load")
            .commit_interval(2)
            .reader(ListItemReader::new("n", vec![1, 2, 3, 4]))
            .pass_through()
            .writer(CollectingItemWriter::new())
            .build()
            .unwrap();
        let (_repo, mut se, ctx) = step_fixture("load");
        ctx.job_execution().request_stop();
        step.execute(&mut se, &ctx).unwrap();

        assert_eq!(se.status, BatchStatus::Stopped);
        assert_eq!(se.exit_status.exit_code(), "STOPPED");
        assert_eq!(se.read_count, 0);
    }

    #[test]
    fn restart_resumes_from_saved_reader_position() {
        let writer = CollectingItemWriter::new();
        let step = ChunkStepBuilder::new("load")
            .commit_interval(2)
            .reader(ListItemReader::new("numbers", vec![1, 2, 3, 4]))
            .pass_through()
            .writer(writer.clone())
            .build()
            .unwrap();
        let (_repo, mut se, ctx) = step_fixture("load");
        let mut saved = ExecutionContext::new();
        saved.put("numbers.read.count", 2usize).unwrap();
        se.execution_context = saved;
        step.execute(&mut se, &ctx).unwrap();

        assert_eq!(writer.written(), vec![3, 4]);
        assert_eq!(se.read_count, 2);
    }

    #[test]
    fn builder_rejects_missing_parts() {
        let err = ChunkStepBuilder::<i32, i32>::new("load")
            .reader(ListItemReader::new("n", vec![1]))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, BatchError::FlowConfig(_)));
        let err = ChunkStepBuilder::<i32, i32>::new("load")
            .commit_interval(0)
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("commit interval"));
    }
}
