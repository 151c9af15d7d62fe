//! CLI command implementations for bamflow.
//!
//! - [`sort`] - Sort a BAM/SAM file, optionally marking duplicates
//! - [`merge`] - Merge sorted BAM/SAM files

pub mod command;
pub mod common;
pub mod merge;
pub mod sort;
