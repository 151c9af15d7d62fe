//! Sorting primitives shared by the block sort and the streaming merge.
//!
//! - [`block`]: split points, per-fragment base sort and the pairwise merge tree used to sort one
//!   buffer in parallel.
//! - [`merge_heap`]: min-heap of input stream indices for the k-way merge.
//!
//! Both take the record order from an injected
//! [`RecordComparator`](crate::format::RecordComparator) and are stable: equal records keep
//! fragment order in the block sort and stream order in the k-way merge.

pub mod block;
pub mod merge_heap;

pub use block::{RecordRef, base_sort, merge_rounds, merge_runs, split_points};
pub use merge_heap::MergeHeap;
