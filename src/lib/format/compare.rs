//! Record ordering strategies.

use std::cmp::Ordering;

use bamflow_raw_bam::flags;

/// Total order over records of one format, injected into the sort and merge stages.
pub trait RecordComparator: Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Whether `records` are non-decreasing under `comparator`.
pub fn is_sorted<'a>(
    comparator: &dyn RecordComparator,
    records: impl IntoIterator<Item = &'a [u8]>,
) -> bool {
    let mut prev: Option<&[u8]> = None;
    for record in records {
        if prev.is_some_and(|p| comparator.compare(p, record) == Ordering::Greater) {
            return false;
        }
        prev = Some(record);
    }
    true
}

/// Coordinate key: reference index (unplaced last), position, then strand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CoordinateKey {
    tid: u32,
    pos: i32,
    reverse: bool,
}

impl CoordinateKey {
    #[must_use]
    pub fn new(ref_id: i32, pos: i32, flag: u16) -> Self {
        if ref_id < 0 {
            return Self { tid: u32::MAX, pos: i32::MAX, reverse: false };
        }
        Self { tid: ref_id as u32, pos, reverse: flag & flags::REVERSE != 0 }
    }
}

/// Queryname key: read name bytes, then segment (unpaired, first, last).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct QuerynameKey<'a> {
    name: &'a [u8],
    segment: u8,
}

impl<'a> QuerynameKey<'a> {
    #[must_use]
    pub fn new(name: &'a [u8], flag: u16) -> Self {
        let segment = if flag & flags::FIRST_SEGMENT != 0 {
            1
        } else if flag & flags::LAST_SEGMENT != 0 {
            2
        } else {
            0
        };
        Self { name, segment }
    }
}
