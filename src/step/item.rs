//! Item-level collaborators of the chunk engine.
//!
//! Business failures are returned as [`Failure`]; the engine decides whether
//! to retry, skip or abort. Lifecycle errors from [`ItemStream`] are engine
//! errors and always fail the step.

use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{Failure, Result};
use crate::execution::ExecutionContext;

/// Open/update/close hooks used to save and restore a position across
/// restarts. `update` is called just before every chunk commit.
pub trait ItemStream: Send {
    fn open(&mut self, _context: &ExecutionContext) -> Result<()> {
        Ok(())
    }

    fn update(&mut self, _context: &mut ExecutionContext) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub trait ItemReader<T>: ItemStream {
    /// Next item, or `None` at end of data.
    fn read(&mut self) -> std::result::Result<Option<T>, Failure>;
}

pub trait ItemProcessor<I, O>: Send {
    /// Transforms an item. `None` filters it out of the chunk.
    fn process(&mut self, item: &I) -> std::result::Result<Option<O>, Failure>;
}

pub trait ItemWriter<T>: ItemStream {
    fn write(&mut self, items: &[T]) -> std::result::Result<(), Failure>;
}

/// Reads from an in-memory list and saves its position in the step's
/// execution context, so a restarted step resumes after the last commit.
#[derive(Debug, Clone)]
pub struct ListItemReader<T> {
    name: String,
    items: Vec<T>,
    position: usize,
}

impl<T> ListItemReader<T> {
    pub fn new(name: impl Into<String>, items: Vec<T>) -> Self {
        Self {
            name: name.into(),
            items,
            position: 0,
        }
    }

    fn position_key(&self) -> String {
        format!("{}.read.count", self.name)
    }

    pub fn position(&self) -> usize {
        self.position
    }
}

impl<T: Send> ItemStream for ListItemReader<T> {
    fn open(&mut self, context: &ExecutionContext) -> Result<()> {
        self.position = context.get::<usize>(&self.position_key())?.unwrap_or(0);
        Ok(())
    }

    fn update(&mut self, context: &mut ExecutionContext) -> Result<()> {
        context.put(self.position_key(), self.position)
    }
}

impl<T: Clone + Send> ItemReader<T> for ListItemReader<T> {
    fn read(&mut self) -> std::result::Result<Option<T>, Failure> {
        let item = self.items.get(self.position).cloned();
        if item.is_some() {
            self.position += 1;
        }
        Ok(item)
    }
}

/// Adapts a closure to [`ItemProcessor`].
pub struct FnItemProcessor<F>(pub F);

impl<I, O, F> ItemProcessor<I, O> for FnItemProcessor<F>
where
    F: FnMut(&I) -> std::result::Result<Option<O>, Failure> + Send,
{
    fn process(&mut self, item: &I) -> std::result::Result<Option<O>, Failure> {
        (self.0)(item)
    }
}

/// Hands every item through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughItemProcessor;

impl<T: Clone> ItemProcessor<T, T> for PassThroughItemProcessor {
    fn process(&mut self, item: &T) -> std::result::Result<Option<T>, Failure> {
        Ok(Some(item.clone()))
    }
}

/// Keeps written items in memory. Clones share the same buffer.
#[derive(Debug)]
pub struct CollectingItemWriter<T> {
    written: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for CollectingItemWriter<T> {
    fn clone(&self) -> Self {
        Self {
            written: self.written.clone(),
        }
    }
}

impl<T> Default for CollectingItemWriter<T> {
    fn default() -> Self {
        Self {
            written: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Clone> CollectingItemWriter<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn written(&self) -> Vec<T> {
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<T: Send> ItemStream for CollectingItemWriter<T> {}

impl<T: Clone + Send> ItemWriter<T> for CollectingItemWriter<T> {
    fn write(&mut self, items: &[T]) -> std::result::Result<(), Failure> {
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(items);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_reader_resumes_from_saved_position() {
        let mut reader = ListItemReader::new("orders", vec![1, 2, 3]);
        let mut ctx = ExecutionContext::new();
        reader.open(&ctx).unwrap();
        assert_eq!(reader.read().unwrap(), Some(1));
        reader.update(&mut ctx).unwrap();

        let mut restarted = ListItemReader::new("orders", vec![1, 2, 3]);
        restarted.open(&ctx).unwrap();
        assert_eq!(restarted.read().unwrap(), Some(2));
        assert_eq!(restarted.read().unwrap(), Some(3));
        assert_eq!(restarted.read().unwrap(), None);
        assert_eq!(restarted.position(), 3);
    }

    #[test]
    fn fn_processor_can_filter() {
        let mut processor = FnItemProcessor(|n: &i32| -> std::result::Result<Option<i32>, Failure> {
            Ok(if n % 2 == 0 { Some(n * 10) } else { None })
        });
        assert_eq!(processor.process(&2).unwrap(), Some(20));
        assert_eq!(processor.process(&3).unwrap(), None);
    }

    #[test]
    fn collecting_writer_clones_share_the_buffer() {
        let writer = CollectingItemWriter::new();
        let mut handle = writer.clone();
        handle.write(&["a", "b"]).unwrap();
        assert_eq!(writer.written(), vec!["a", "b"]);
    }
}
