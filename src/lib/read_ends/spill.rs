//! Sorted on-disk runs of read ends.
//!
//! A run is a sequence of [`ENCODED_LEN`]-byte entries in [`ReadEnds`] order, appended to a
//! temporary file. Its [`SparseIndex`] keeps the first entry of every [`INDEX_BLOCK`]
//! entries (level 0) and, above that, the first entry of every [`INDEX_FANOUT`] entries of the
//! level below, so an interval merge can start reading a run near any group key.

use std::io::Read;
use std::sync::Arc;

use super::{Category, ENCODED_LEN, GroupKey, ReadEnds};
use crate::errors::{IoContext, Result};
use crate::temp::{Segment, TempFileProvider};

/// Entries per level-0 index block.
pub const INDEX_BLOCK: usize = 256;

/// Entries of one level summarized by one entry of the level above.
pub const INDEX_FANOUT: usize = 32;

/// Multi-level sparse index over a sorted run.
#[derive(Debug, Clone, Default)]
pub struct SparseIndex {
    levels: Vec<Vec<ReadEnds>>,
}

impl SparseIndex {
    /// Index a sorted run.
    #[must_use]
    pub fn build(entries: &[ReadEnds]) -> Self {
        if entries.is_empty() {
            return Self::default();
        }
        let mut levels = vec![entries.iter().step_by(INDEX_BLOCK).copied().collect::<Vec<_>>()];
        while let Some(top) = levels.last().filter(|top| top.len() > INDEX_FANOUT) {
            let next = top.iter().step_by(INDEX_FANOUT).copied().collect();
            levels.push(next);
        }
        Self { levels }
    }

    /// First entry of every level-0 block.
    #[must_use]
    pub fn block_keys(&self) -> &[ReadEnds] {
        self.levels.first().map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Level-0 block from which reading finds every entry with a group key `>= key`.
    #[must_use]
    pub fn seek_block(&self, key: &GroupKey) -> usize {
        let mut range = 0..self.levels.last().map_or(0, Vec::len);
        for (depth, level) in self.levels.iter().enumerate().rev() {
            let end = range.end.min(level.len());
            let slice = &level[range.start..end];
            let below = slice.partition_point(|e| e.group_key() < *key);
            let index = range.start + below.saturating_sub(1);
            if depth == 0 {
                return index;
            }
            range = index * INDEX_FANOUT..(index + 1) * INDEX_FANOUT;
        }
        0
    }
}

/// One sorted run on disk.
#[derive(Debug, Clone)]
pub struct SpilledRun {
    pub category: Category,
    pub segment: Segment,
    pub count: u64,
    pub index: SparseIndex,
}

/// Sort `entries`, append them to a temporary file as one run and clear them.
///
/// # Errors
///
/// Returns an error if the temporary file cannot be written.
pub fn spill(
    category: Category,
    entries: &mut Vec<ReadEnds>,
    provider: &TempFileProvider,
) -> Result<SpilledRun> {
    entries.sort_unstable();
    let index = SparseIndex::build(entries);

    let mut file = provider.acquire()?;
    let offset = file.len();
    let mut bytes = Vec::with_capacity(INDEX_BLOCK * ENCODED_LEN);
    for chunk in entries.chunks(INDEX_BLOCK) {
        bytes.clear();
        chunk.iter().for_each(|e| e.encode(&mut bytes));
        file.append(&bytes)?;
    }
    let len = file.len() - offset;
    let segment = file.segment(offset, len);
    provider.release(file)?;

    let count = entries.len() as u64;
    entries.clear();
    Ok(SpilledRun { category, segment, count, index })
}

/// Sequential reader over a run, starting at a level-0 block.
pub struct RunReader {
    reader: Box<dyn Read + Send>,
    remaining: u64,
    path: std::path::PathBuf,
}

impl RunReader {
    /// Open `run` positioned at the start of level-0 block `block`.
    ///
    /// # Errors
    ///
    /// Returns an error if the run file cannot be opened.
    pub fn open(run: &Arc<SpilledRun>, block: usize) -> Result<Self> {
        let skip = (block * INDEX_BLOCK) as u64;
        let remaining = run.count.saturating_sub(skip);
        let skip_bytes = skip.min(run.count) * ENCODED_LEN as u64;
        let segment = Segment {
            path: run.segment.path.clone(),
            offset: run.segment.offset + skip_bytes,
            len: run.segment.len - skip_bytes,
        };
        Ok(Self { reader: Box::new(segment.open()?), remaining, path: segment.path })
    }

    /// Next entry, or `None` at the end of the run.
    ///
    /// # Errors
    ///
    /// Returns an error if the run file is shorter than its entry count.
    pub fn next_entry(&mut self) -> Result<Option<ReadEnds>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let mut bytes = [0u8; ENCODED_LEN];
        self.reader.read_exact(&mut bytes).with_path(&self.path)?;
        self.remaining -= 1;
        Ok(Some(ReadEnds::decode(&bytes)))
    }
}
