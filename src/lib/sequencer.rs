//! Min-heap staging areas and strict sequencing.
//!
//! [`PendingHeap`] is the one priority queue used throughout the engine; its order comes from
//! a [`HeapOrder`] policy rather than a bespoke heap per payload. [`SequencingQueue`] builds
//! on it to restore strict `0, 1, 2, ...` order over work that completes out of order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::marker::PhantomData;

use crate::errors::{PipelineError, Result};

// ============================================================================
// Generic heap
// ============================================================================

/// Ordering policy for a [`PendingHeap`]; the minimum element is popped first.
pub trait HeapOrder<T> {
    fn cmp(a: &T, b: &T) -> Ordering;
}

/// Values that expose an ordering key.
pub trait Keyed {
    type Key: Ord;

    fn key(&self) -> Self::Key;
}

/// Policy ordering [`Keyed`] values by ascending key.
pub struct ByKey;

impl<T: Keyed> HeapOrder<T> for ByKey {
    fn cmp(a: &T, b: &T) -> Ordering {
        a.key().cmp(&b.key())
    }
}

struct Entry<T, O> {
    value: T,
    _order: PhantomData<fn() -> O>,
}

impl<T, O: HeapOrder<T>> PartialEq for Entry<T, O> {
    fn eq(&self, other: &Self) -> bool {
        O::cmp(&self.value, &other.value) == Ordering::Equal
    }
}

impl<T, O: HeapOrder<T>> Eq for Entry<T, O> {}

impl<T, O: HeapOrder<T>> PartialOrd for Entry<T, O> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T, O: HeapOrder<T>> Ord for Entry<T, O> {
    // BinaryHeap is a max-heap; reverse so the policy minimum sits on top.
    fn cmp(&self, other: &Self) -> Ordering {
        O::cmp(&other.value, &self.value)
    }
}

/// Binary min-heap under policy `O`.
pub struct PendingHeap<T, O = ByKey> {
    heap: BinaryHeap<Entry<T, O>>,
}

impl<T, O: HeapOrder<T>> Default for PendingHeap<T, O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, O: HeapOrder<T>> PendingHeap<T, O> {
    #[must_use]
    pub fn new() -> Self {
        Self { heap: BinaryHeap::new() }
    }

    pub fn push(&mut self, value: T) {
        self.heap.push(Entry { value, _order: PhantomData });
    }

    pub fn pop(&mut self) -> Option<T> {
        self.heap.pop().map(|e| e.value)
    }

    #[must_use]
    pub fn peek(&self) -> Option<&T> {
        self.heap.peek().map(|e| &e.value)
    }

    /// Pop the minimum only if `accept` approves it.
    pub fn pop_if(&mut self, accept: impl FnOnce(&T) -> bool) -> Option<T> {
        if accept(self.peek()?) { self.pop() } else { None }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

// ============================================================================
// Sequencing
// ============================================================================

/// A value tagged with its position in a sequence.
pub struct Sequenced<V> {
    pub id: u64,
    pub value: V,
}

impl<V> Keyed for Sequenced<V> {
    type Key = u64;

    fn key(&self) -> u64 {
        self.id
    }
}

/// Re-establishes strict id order over values pushed in any order.
///
/// ```
/// use bamflow_lib::sequencer::SequencingQueue;
///
/// let mut queue = SequencingQueue::new();
/// queue.push(1, "b").unwrap();
/// assert_eq!(queue.pop_next(), None); // 0 has not arrived yet
/// queue.push(0, "a").unwrap();
/// assert_eq!(queue.pop_next(), Some("a"));
/// assert_eq!(queue.pop_next(), Some("b"));
/// ```
pub struct SequencingQueue<V> {
    heap: PendingHeap<Sequenced<V>>,
    next_id: u64,
}

impl<V> Default for SequencingQueue<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> SequencingQueue<V> {
    #[must_use]
    pub fn new() -> Self {
        Self { heap: PendingHeap::new(), next_id: 0 }
    }

    /// Park `value` under `id`.
    ///
    /// # Errors
    ///
    /// Returns an internal error if `id` was already consumed.
    pub fn push(&mut self, id: u64, value: V) -> Result<()> {
        if id < self.next_id {
            return Err(PipelineError::internal(format!(
                "sequence id {id} pushed after {} was already consumed",
                self.next_id - 1
            )));
        }
        self.heap.push(Sequenced { id, value });
        Ok(())
    }

    /// Smallest parked id, if any.
    #[must_use]
    pub fn peek_min_id(&self) -> Option<u64> {
        self.heap.peek().map(|s| s.id)
    }

    /// Pop the smallest parked value if its id equals `expected`.
    pub fn pop_if_min_id_equals(&mut self, expected: u64) -> Option<V> {
        self.heap.pop_if(|s| s.id == expected).map(|s| s.value)
    }

    /// The value [`Self::pop_next`] would return, without consuming it.
    #[must_use]
    pub fn peek_next(&self) -> Option<&V> {
        self.heap.peek().filter(|s| s.id == self.next_id).map(|s| &s.value)
    }

    /// Pop the value carrying the next expected id and advance the counter by one.
    pub fn pop_next(&mut self) -> Option<V> {
        let value = self.pop_if_min_id_equals(self.next_id)?;
        self.next_id += 1;
        Some(value)
    }

    /// The id [`Self::pop_next`] is waiting for.
    #[must_use]
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Whether a parked id has fallen behind the counter, i.e. was pushed twice.
    #[must_use]
    pub fn has_stale(&self) -> bool {
        self.peek_min_id().is_some_and(|id| id < self.next_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
