//! Record buffers passed between stages.
//!
//! All buffers are pool-owned and recycled; their capacity is fixed when the pool is built. A
//! record that is larger than an empty buffer's byte capacity is still accepted so that no input
//! can wedge the parser, at the cost of growing that one arena.

use crate::pool::Recycle;

/// Byte range of one record inside an arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordSpan {
    pub start: usize,
    pub len: usize,
}

/// Append-only arena of records with their parse ranks.
#[derive(Debug, Default)]
pub struct Fragment {
    data: Vec<u8>,
    spans: Vec<RecordSpan>,
    ranks: Vec<u64>,
}

impl Fragment {
    #[must_use]
    pub fn with_capacity(bytes: usize, records: usize) -> Self {
        Self {
            data: Vec::with_capacity(bytes),
            spans: Vec::with_capacity(records),
            ranks: Vec::with_capacity(records),
        }
    }

    pub fn push(&mut self, record: &[u8], rank: u64) {
        self.spans.push(RecordSpan { start: self.data.len(), len: record.len() });
        self.data.extend_from_slice(record);
        self.ranks.push(rank);
    }

    /// Append raw bytes that the caller has already framed, recording them as one record.
    pub fn push_with(&mut self, rank: u64, write: impl FnOnce(&mut Vec<u8>)) {
        let start = self.data.len();
        write(&mut self.data);
        self.spans.push(RecordSpan { start, len: self.data.len() - start });
        self.ranks.push(rank);
    }

    #[must_use]
    pub fn record(&self, i: usize) -> &[u8] {
        let span = self.spans[i];
        &self.data[span.start..span.start + span.len]
    }

    #[must_use]
    pub fn rank(&self, i: usize) -> u64 {
        self.ranks[i]
    }

    pub fn records(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.spans.iter().map(|s| &self.data[s.start..s.start + s.len])
    }

    /// Number of records held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.spans.clear();
        self.ranks.clear();
    }
}

// ============================================================================
// AlignmentBuffer
// ============================================================================

/// Parse output: the records of one stream in parse order.
#[derive(Debug)]
pub struct AlignmentBuffer {
    id: u64,
    stream: usize,
    is_final: bool,
    byte_capacity: usize,
    record_capacity: usize,
    records: Fragment,
}

impl AlignmentBuffer {
    #[must_use]
    pub fn new(byte_capacity: usize, record_capacity: usize) -> Self {
        let record_capacity = record_capacity.max(1);
        Self {
            id: 0,
            stream: 0,
            is_final: false,
            byte_capacity,
            record_capacity,
            records: Fragment::with_capacity(byte_capacity, record_capacity),
        }
    }

    /// Position in the stream's sequence of buffers.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn stream(&self) -> usize {
        self.stream
    }

    pub fn assign(&mut self, stream: usize, id: u64) {
        self.stream = stream;
        self.id = id;
    }

    #[must_use]
    pub fn is_final(&self) -> bool {
        self.is_final
    }

    pub fn set_final(&mut self) {
        self.is_final = true;
    }

    /// Whether a record of `len` bytes can be appended.
    #[must_use]
    pub fn fits(&self, len: usize) -> bool {
        self.records.is_empty()
            || (self.records.len() < self.record_capacity
                && self.records.bytes().len() + len <= self.byte_capacity)
    }

    pub fn push(&mut self, record: &[u8], rank: u64) {
        self.records.push(record, rank);
    }

    #[must_use]
    pub fn records(&self) -> &Fragment {
        &self.records
    }

    /// Number of records held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Recycle for AlignmentBuffer {
    fn recycle(&mut self) {
        self.id = 0;
        self.stream = 0;
        self.is_final = false;
        self.records.clear();
    }
}

// ============================================================================
// FragmentBuffer
// ============================================================================

/// A buffer split into independently writable parts, one per worker.
#[derive(Debug, Default)]
pub struct FragmentBuffer {
    pub id: u64,
    pub is_final: bool,
    pub fragments: Vec<Fragment>,
}

impl FragmentBuffer {
    #[must_use]
    pub fn new(parts: usize, bytes_per_part: usize, records_per_part: usize) -> Self {
        Self {
            id: 0,
            is_final: false,
            fragments: (0..parts.max(1))
                .map(|_| Fragment::with_capacity(bytes_per_part, records_per_part))
                .collect(),
        }
    }

    #[must_use]
    pub fn total_records(&self) -> usize {
        self.fragments.iter().map(Fragment::len).sum()
    }

    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.fragments.iter().map(|f| f.bytes().len()).sum()
    }

    /// Byte content of every part in order.
    pub fn parts(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.fragments.iter().map(Fragment::bytes)
    }
}

impl Recycle for FragmentBuffer {
    fn recycle(&mut self) {
        self.id = 0;
        self.is_final = false;
        self.fragments.iter_mut().for_each(Fragment::clear);
    }
}

// ============================================================================
// Input blocks
// ============================================================================

/// Compressed blocks from one read request.
#[derive(Debug, Default)]
pub struct RawBatch {
    pub blocks: Vec<Vec<u8>>,
}

impl Recycle for RawBatch {
    // Block buffers are reused in place by the next read.
    fn recycle(&mut self) {}
}
