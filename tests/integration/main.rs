//! Integration tests for the bamflow library.
//!
//! These tests drive whole sort and merge runs through the public driver API on synthetic inputs
//! and read the results back with noodles.

mod helpers;
mod test_duplicates;
mod test_error_paths;
mod test_merge;
mod test_sort;
