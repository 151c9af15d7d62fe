//! Work packages: one variant per kind of work, carrying that stage's payload.

use super::decode::{DecompressJob, ValidateJob};
use super::sort_control::{BaseSortJob, MergeRunsJob, ReorderJob, RewriteJob};
use super::writeback::{ChecksumJob, CompressJob, IndexJob, WriteJob};
use crate::read_ends::{FlushJob, IntervalJob};

/// Execution priorities; lower runs first.
///
/// Stages closer to the output run first so that buffers drain before new input is read.
pub mod priority {
    pub const WRITE: u32 = 0;
    pub const CHECKSUM: u32 = 1;
    pub const INDEX: u32 = 1;
    pub const COMPRESS: u32 = 2;
    pub const MERGE: u32 = 3;
    pub const REORDER: u32 = 4;
    pub const MERGE_RUNS: u32 = 5;
    pub const BASE_SORT: u32 = 5;
    pub const REWRITE: u32 = 6;
    pub const READ_ENDS: u32 = 6;
    pub const VALIDATE: u32 = 7;
    pub const PARSE: u32 = 8;
    pub const DECOMPRESS: u32 = 9;
    pub const READ: u32 = 10;
}

/// A unit of work for one stage.
pub enum Request {
    Read { stream: usize },
    Decompress(DecompressJob),
    Parse { stream: usize },
    Validate(ValidateJob),
    Rewrite(RewriteJob),
    BaseSort(BaseSortJob),
    MergeRuns(MergeRunsJob),
    Reorder(ReorderJob),
    Merge,
    Compress(CompressJob),
    Write(WriteJob),
    Checksum(ChecksumJob),
    Index(IndexJob),
    FlushReadEnds(FlushJob),
    MergeReadEnds(IntervalJob),
}

impl Request {
    #[must_use]
    pub fn priority(&self) -> u32 {
        match self {
            Self::Read { .. } => priority::READ,
            Self::Decompress(_) => priority::DECOMPRESS,
            Self::Parse { .. } => priority::PARSE,
            Self::Validate(_) => priority::VALIDATE,
            Self::Rewrite(_) => priority::REWRITE,
            Self::BaseSort(_) => priority::BASE_SORT,
            Self::MergeRuns(_) => priority::MERGE_RUNS,
            Self::Reorder(_) => priority::REORDER,
            Self::Merge => priority::MERGE,
            Self::Compress(_) => priority::COMPRESS,
            Self::Write(_) => priority::WRITE,
            Self::Checksum(_) => priority::CHECKSUM,
            Self::Index(_) => priority::INDEX,
            Self::FlushReadEnds(_) | Self::MergeReadEnds(_) => priority::READ_ENDS,
        }
    }

    /// Short name for diagnostics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Read { .. } => "read",
            Self::Decompress(_) => "decompress",
            Self::Parse { .. } => "parse",
            Self::Validate(_) => "validate",
            Self::Rewrite(_) => "rewrite",
            Self::BaseSort(_) => "base sort",
            Self::MergeRuns(_) => "merge runs",
            Self::Reorder(_) => "reorder",
            Self::Merge => "merge",
            Self::Compress(_) => "compress",
            Self::Write(_) => "write",
            Self::Checksum(_) => "checksum",
            Self::Index(_) => "index",
            Self::FlushReadEnds(_) => "flush read ends",
            Self::MergeReadEnds(_) => "merge read ends",
        }
    }
}
