//! Rank-framed records used for sorted runs between the two sort phases.
//!
//! ```text
//! ┌────────────┬──────────────┬───────────────────────┐
//! │ rank (u64) │ length (u32) │ record in inner format │
//! └────────────┴──────────────┴───────────────────────┘
//! ```
//!
//! The rank is the record's parse-order ordinal in the original input; it indexes the duplicate
//! bitvector and breaks ties so the final merge is stable.

use std::cmp::Ordering;
use std::sync::Arc;

use super::compare::RecordComparator;
use super::{AlignmentHeader, ParsedRecord, RecordFields, RecordFormat, SortOrder};

/// Size of the rank and length prefix.
pub const FRAME_SIZE: usize = 12;

/// Append `record` framed with `rank`.
pub fn write_framed(rank: u64, record: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(&rank.to_le_bytes());
    out.extend_from_slice(&(record.len() as u32).to_le_bytes());
    out.extend_from_slice(record);
}

/// Rank stored in a framed record.
#[must_use]
pub fn rank_of(framed: &[u8]) -> u64 {
    framed
        .get(..8)
        .map_or(0, |b| u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
}

#[inline]
fn payload(framed: &[u8]) -> &[u8] {
    framed.get(FRAME_SIZE..).unwrap_or_default()
}

/// Rank framing around another format. Runs carry no header; the one supplied at construction
/// is reported instead.
pub struct RankedFormat {
    inner: Arc<dyn RecordFormat>,
    header: AlignmentHeader,
}

impl RankedFormat {
    #[must_use]
    pub fn new(inner: Arc<dyn RecordFormat>, header: AlignmentHeader) -> Self {
        Self { inner, header }
    }
}

impl RecordFormat for RankedFormat {
    fn name(&self) -> &'static str {
        "ranked"
    }

    fn parse_header(
        &self,
        _data: &[u8],
        _at_eof: bool,
    ) -> Result<Option<(AlignmentHeader, usize)>, String> {
        Ok(Some((self.header.clone(), 0)))
    }

    fn next_record(&self, data: &[u8]) -> Result<Option<ParsedRecord>, String> {
        if data.len() < FRAME_SIZE {
            return Ok(None);
        }
        let len = u32::from_le_bytes([data[8], data[9], data[10], data[11]]) as usize;
        if data.len() < FRAME_SIZE + len {
            return Ok(None);
        }
        Ok(Some(ParsedRecord { len: FRAME_SIZE + len, rank: Some(rank_of(data)) }))
    }

    fn validate(&self, record: &[u8], _header: &AlignmentHeader) -> Result<(), String> {
        let inner = payload(record);
        match self.inner.next_record(inner)? {
            Some(parsed) if parsed.len == inner.len() => Ok(()),
            _ => Err(format!(
                "framed record of {} bytes is not one {} record",
                inner.len(),
                self.inner.name()
            )),
        }
    }

    fn comparator(&self, order: SortOrder, header: &AlignmentHeader) -> Arc<dyn RecordComparator> {
        Arc::new(RankedComparator { inner: self.inner.comparator(order, header) })
    }

    fn fields<'a>(
        &self,
        record: &'a [u8],
        header: &AlignmentHeader,
    ) -> Result<RecordFields<'a>, String> {
        self.inner.fields(payload(record), header)
    }

    fn write_record(&self, record: &[u8], duplicate: bool, out: &mut Vec<u8>) {
        self.inner.write_record(payload(record), duplicate, out);
    }

    fn header_bytes(&self, header: &AlignmentHeader) -> Vec<u8> {
        self.inner.header_bytes(header)
    }
}

/// Orders framed records by their payload, then by rank.
struct RankedComparator {
    inner: Arc<dyn RecordComparator>,
}

impl RecordComparator for RankedComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.inner.compare(payload(a), payload(b)).then_with(|| rank_of(a).cmp(&rank_of(b)))
    }
}
