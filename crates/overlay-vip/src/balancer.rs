//! Client-side round-robin selection.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Hands out items in rotation. Lock-free; shared across concurrent callers.
#[derive(Debug)]
pub struct RoundRobin<T> {
    items: Vec<T>,
    cursor: AtomicUsize,
}

impl<T> RoundRobin<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items,
            cursor: AtomicUsize::new(0),
        }
    }

    /// The next item in rotation, or `None` when there are none.
    pub fn next(&self) -> Option<&T> {
        if self.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed);
        self.items.get(idx % self.items.len())
    }

    /// Number of items in the rotation.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
