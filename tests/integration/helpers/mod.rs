//! Shared helpers for the integration tests.

pub mod assertions;
pub mod bam_generator;
