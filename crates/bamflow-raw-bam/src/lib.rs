#![deny(unsafe_code)]

//! Zero-copy access to raw BAM records.
//!
//! All functions operate on record bytes *without* the leading 4-byte `block_size`.

pub mod cigar;
pub mod fields;
pub mod tags;

#[cfg(any(test, feature = "test-utils"))]
pub mod builder;

pub use cigar::*;
pub use fields::*;
pub use tags::*;

#[cfg(any(test, feature = "test-utils"))]
pub use builder::*;
