//! Prefetched rows of one scan.

use std::collections::VecDeque;

use bedrock::Field;

use crate::tuple::ScanDirection;

/// A row materialized ahead of delivery, with the ordering key of the index
/// record it came from so the scan can be repositioned behind it.
#[derive(Debug, Clone)]
pub struct CachedRow {
    pub row: Vec<u8>,
    pub key: Vec<Field>,
    pub delete_marked: bool,
}

/// Bounded FIFO of rows gathered in one direction. Direction changes drain
/// it without delivering anything.
#[derive(Debug)]
pub struct FetchCache {
    rows: VecDeque<CachedRow>,
    capacity: usize,
    threshold: usize,
    direction: Option<ScanDirection>,
    consecutive: usize,
}

impl FetchCache {
    pub fn new(capacity: usize, threshold: usize) -> Self {
        Self {
            rows: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            threshold,
            direction: None,
            consecutive: 0,
        }
    }

    /// Records a fetch call. Returns true when the direction differs from
    /// the previous call.
    pub fn note_fetch(&mut self, direction: ScanDirection) -> bool {
        let changed = self.direction.is_some_and(|d| d != direction);
        if changed || self.direction.is_none() {
            self.consecutive = 0;
        }
        self.direction = Some(direction);
        self.consecutive += 1;
        changed
    }

    /// Whether this fetch should gather rows ahead.
    pub fn is_active(&self) -> bool {
        self.capacity > 1 && self.consecutive > self.threshold
    }

    pub fn push(&mut self, row: CachedRow) {
        debug_assert!(self.rows.len() < self.capacity);
        self.rows.push_back(row);
    }

    pub fn pop(&mut self) -> Option<CachedRow> {
        self.rows.pop_front()
    }

    /// Drops every buffered row and returns how many there were.
    pub fn invalidate(&mut self) -> usize {
        let dropped = self.rows.len();
        self.rows.clear();
        dropped
    }

    pub fn reset(&mut self) {
        self.invalidate();
        self.direction = None;
        self.consecutive = 0;
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.rows.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(n: u8) -> CachedRow {
        CachedRow {
            row: vec![n],
            key: vec![Field::bytes([n])],
            delete_marked: false,
        }
    }

    #[test]
    fn activates_after_threshold_same_direction_fetches() {
        let mut cache = FetchCache::new(8, 2);
        assert!(!cache.note_fetch(ScanDirection::Ascending));
        cache.note_fetch(ScanDirection::Ascending);
        assert!(!cache.is_active());
        cache.note_fetch(ScanDirection::Ascending);
        assert!(cache.is_active());

        assert!(cache.note_fetch(ScanDirection::Descending));
        assert!(!cache.is_active());
    }

    #[test]
    fn fifo_and_invalidate() {
        let mut cache = FetchCache::new(3, 0);
        cache.push(row(1));
        cache.push(row(2));
        cache.push(row(3));
        assert!(cache.is_full());
        assert_eq!(cache.pop().map(|r| r.row), Some(vec![1]));
        assert_eq!(cache.invalidate(), 2);
        assert!(cache.is_empty());
    }
}
