//! Min-heap of stream indices for the k-way merge.
//!
//! The heap stores only stream indices; the caller supplies the head-record order on every
//! operation because heads live in pooled buffers the heap does not own. Streams whose heads
//! compare equal pop in ascending stream order.

use std::cmp::Ordering;

#[derive(Debug, Default)]
pub struct MergeHeap {
    slots: Vec<usize>,
}

impl MergeHeap {
    #[must_use]
    pub fn with_capacity(streams: usize) -> Self {
        Self { slots: Vec::with_capacity(streams) }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Stream with the smallest head.
    #[must_use]
    pub fn peek(&self) -> Option<usize> {
        self.slots.first().copied()
    }

    /// Whether `stream` currently has a slot.
    #[must_use]
    pub fn contains(&self, stream: usize) -> bool {
        self.slots.contains(&stream)
    }

    pub fn push(&mut self, stream: usize, heads: impl Fn(usize, usize) -> Ordering) {
        self.slots.push(stream);
        let mut child = self.slots.len() - 1;
        while child > 0 {
            let parent = (child - 1) / 2;
            if !less(&heads, self.slots[child], self.slots[parent]) {
                break;
            }
            self.slots.swap(child, parent);
            child = parent;
        }
    }

    pub fn pop(&mut self, heads: impl Fn(usize, usize) -> Ordering) -> Option<usize> {
        if self.slots.is_empty() {
            return None;
        }
        let top = self.slots.swap_remove(0);
        let len = self.slots.len();
        let mut parent = 0;
        loop {
            let left = 2 * parent + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let mut smallest = left;
            if right < len && less(&heads, self.slots[right], self.slots[left]) {
                smallest = right;
            }
            if !less(&heads, self.slots[smallest], self.slots[parent]) {
                break;
            }
            self.slots.swap(parent, smallest);
            parent = smallest;
        }
        Some(top)
    }
}

fn less(heads: &impl Fn(usize, usize) -> Ordering, a: usize, b: usize) -> bool {
    heads(a, b).then(a.cmp(&b)) == Ordering::Less
}
