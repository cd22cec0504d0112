use crate::error::Failure;

/// An item dropped from a chunk, with the failure that caused it. Read
/// skips carry no item.
#[derive(Debug, Clone)]
pub struct SkippedItem<T> {
    pub item: Option<T>,
    pub failure: Failure,
}

/// In-memory buffer for one commit interval.
#[derive(Debug, Clone)]
pub struct Chunk<T> {
    items: Vec<T>,
    skips: Vec<SkippedItem<T>>,
    end: bool,
}

impl<T> Default for Chunk<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            skips: Vec::new(),
            end: false,
        }
    }
}

impl<T> Chunk<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, item: T) {
        self.items.push(item);
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn take_items(&mut self) -> Vec<T> {
        std::mem::take(&mut self.items)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn skip(&mut self, item: Option<T>, failure: Failure) {
        self.skips.push(SkippedItem { item, failure });
    }

    pub fn skips(&self) -> &[SkippedItem<T>] {
        &self.skips
    }

    /// Marks that the reader reported end of data while filling this chunk.
    pub fn set_end(&mut self) {
        self.end = true;
    }

    pub fn is_end(&self) -> bool {
        self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_leaves_skips_and_end_flag() {
        let mut chunk = Chunk::new();
        chunk.add(1);
        chunk.add(2);
        chunk.skip(Some(3), Failure::msg("bad"));
        chunk.set_end();
        assert_eq!(chunk.take_items(), vec![1, 2]);
        assert!(chunk.is_empty());
        assert_eq!(chunk.skips().len(), 1);
        assert!(chunk.is_end());
    }
}
