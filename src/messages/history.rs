use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;

/// Bounded, shared ring buffer that keeps the most recent records
///
/// Oldest records are discarded once `capacity` is reached.
#[derive(Debug, Clone)]
pub struct BoundedHistory<T> {
    records: Arc<RwLock<VecDeque<T>>>,
    capacity: usize,
}

impl<T: Clone> BoundedHistory<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Arc::new(RwLock::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn push(&self, record: T) {
        if self.capacity == 0 {
            return;
        }
        let mut records = self.records.write();
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// All records, oldest first
    pub fn get_all(&self) -> Vec<T> {
        self.records.read().iter().cloned().collect()
    }

    /// The newest `n` records, oldest first
    pub fn recent(&self, n: usize) -> Vec<T> {
        let records = self.records.read();
        let skip = records.len().saturating_sub(n);
        records.iter().skip(skip).cloned().collect()
    }

    pub fn last(&self) -> Option<T> {
        self.records.read().back().cloned()
    }

    pub fn clear(&self) {
        self.records.write().clear();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}
