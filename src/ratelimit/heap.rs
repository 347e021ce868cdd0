//! A fixed-capacity binary min-heap.

use crate::error::{RateWindowError, Result};

/// Binary min-heap that refuses to grow past its capacity.
///
/// The sliding-window limiter sizes it to the threshold: a caller never holds
/// more than `threshold` timestamps, so a full heap is a logic error rather
/// than something to grow out of.
#[derive(Debug, Clone)]
pub struct BoundedMinHeap<T> {
    items: Vec<T>,
    capacity: usize,
}

impl<T: Ord + Copy> BoundedMinHeap<T> {
    /// Create an empty heap holding at most `capacity` items.
    ///
    /// Nothing is allocated up front; `capacity` only bounds `push`.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Smallest item.
    pub fn peek(&self) -> Result<T> {
        self.items
            .first()
            .copied()
            .ok_or(RateWindowError::EmptyState("peek on empty heap"))
    }

    /// Insert an item, failing if the heap is already full.
    pub fn push(&mut self, item: T) -> Result<()> {
        if self.items.len() == self.capacity {
            return Err(RateWindowError::EmptyState("push on full heap"));
        }
        self.items.push(item);
        self.sift_up(self.items.len() - 1);
        Ok(())
    }

    /// Remove and return the smallest item.
    pub fn pop(&mut self) -> Result<T> {
        if self.items.is_empty() {
            return Err(RateWindowError::EmptyState("pop on empty heap"));
        }
        let top = self.items.swap_remove(0);
        if !self.items.is_empty() {
            self.sift_down(0);
        }
        Ok(top)
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.items[parent] <= self.items[index] {
                break;
            }
            self.items.swap(parent, index);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.items.len();
        loop {
            let left = 2 * index + 1;
            let right = left + 1;
            let mut smallest = index;

            if left < len && self.items[left] < self.items[smallest] {
                smallest = left;
            }
            if right < len && self.items[right] < self.items[smallest] {
                smallest = right;
            }
            if smallest == index {
                break;
            }
            self.items.swap(index, smallest);
            index = smallest;
        }
    }
}
