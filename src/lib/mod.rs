#![deny(unsafe_code)]
// Clippy lint configuration for CI
// These lints are allowed because:
// - cast_*: Record offsets, ranks and counters are cast between integer widths on purpose
// - missing_*_doc: Documentation improvements tracked separately
// - needless_pass_by_value: Leases and jobs are moved through the stages by design of the pools
// - items_after_statements: Some test code uses late item declarations
// - unused_self: Trait implementations may not use self
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::needless_pass_by_value,
    clippy::items_after_statements,
    clippy::unused_self,
    clippy::too_many_lines,
    clippy::too_many_arguments,
    clippy::redundant_closure_for_method_calls,
    clippy::struct_excessive_bools,
    clippy::uninlined_format_args
)]

//! # bamflow - parallel BAM/SAM sorting, merging and duplicate marking
//!
//! The engine runs every stage of a sort or merge as small work packages on one shared
//! priority-ordered thread pool. Stages hand data to each other through bounded object pools and
//! restore order with sequencing queues, so memory stays bounded and output order is
//! deterministic regardless of which worker ran which package.
//!
//! ## Overview
//!
//! ### Infrastructure
//!
//! - **[`pool`]** - Bounded and growing free lists handing out move-only leases
//! - **[`sequencer`]** - Pending heaps and strict id-order sequencing queues
//! - **[`fanin`]** - Fire-once fan-in counters and serial stage gates
//! - **[`thread_pool`]** - Priority work-package scheduler with panic mode
//!
//! ### Data
//!
//! - **[`codec`]** - BGZF and plain-text block codecs
//! - **[`format`]** - BAM, SAM and rank-framed record formats, headers and comparators
//! - **[`buffer`]** - Record buffers moved between stages
//! - **[`temp`]** - Temporary files for sorted runs and spills
//!
//! ### Stages
//!
//! - **[`engine`]** - Decode, sort, merge and writeback stages
//! - **[`sort`]** - In-memory block sort primitives and the merge heap
//! - **[`read_ends`]** - Duplicate marking through spilled read-ends runs
//! - **[`metrics`]** - Duplication metrics
//! - **[`driver`]** - `sort` and `merge` runs
//!
//! ## Quick Start
//!
//! ```no_run
//! use bamflow_lib::driver::{EngineConfig, sort};
//! use std::path::Path;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = EngineConfig::default().with_threads(8).with_mark_duplicates(true);
//! let stats = sort(Path::new("input.bam"), Path::new("sorted.bam"), &config)?;
//! println!("{} records in {} runs", stats.records, stats.runs);
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod codec;
pub mod driver;
pub mod engine;
pub mod errors;
pub mod fanin;
pub mod format;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod read_ends;
pub mod sequencer;
pub mod sort;
pub mod temp;
pub mod thread_pool;
