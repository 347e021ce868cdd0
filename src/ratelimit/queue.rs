//! FIFO log of action timestamps.

use std::collections::VecDeque;

use crate::error::{RateWindowError, Result};

/// Timestamps appended in non-decreasing order, so the front is always the
/// oldest entry.
#[derive(Debug, Clone, Default)]
pub struct TimestampQueue {
    entries: VecDeque<i64>,
}

impl TimestampQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Oldest timestamp.
    pub fn front(&self) -> Result<i64> {
        self.entries
            .front()
            .copied()
            .ok_or(RateWindowError::EmptyState("front of empty queue"))
    }

    /// Append at the tail.
    pub fn push_back(&mut self, timestamp: i64) {
        self.entries.push_back(timestamp);
    }

    /// Remove and return the oldest timestamp.
    pub fn pop_front(&mut self) -> Result<i64> {
        self.entries
            .pop_front()
            .ok_or(RateWindowError::EmptyState("pop from empty queue"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut queue = TimestampQueue::new();
        queue.push_back(100);
        queue.push_back(200);
        queue.push_back(300);

        assert_eq!(queue.front().unwrap(), 100);
        assert_eq!(queue.pop_front().unwrap(), 100);
        assert_eq!(queue.pop_front().unwrap(), 200);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_empty_queue_access_fails() {
        let mut queue = TimestampQueue::new();

        assert!(matches!(queue.front(), Err(RateWindowError::EmptyState(_))));
        assert!(matches!(queue.pop_front(), Err(RateWindowError::EmptyState(_))));
    }
}
