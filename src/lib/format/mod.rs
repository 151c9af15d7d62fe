//! Record formats understood by the decode pipeline.
//!
//! A [`RecordFormat`] knows how to find the header and the record boundaries in a decompressed
//! byte stream, how to validate a record, and which comparator orders its records. Records are
//! opaque byte slices everywhere else in the engine.

pub mod bam;
pub mod compare;
pub mod header;
pub mod ranked;
pub mod sam;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bamflow_raw_bam::CigarSpan;

pub use bam::BamFormat;
pub use compare::RecordComparator;
pub use header::AlignmentHeader;
pub use ranked::RankedFormat;
pub use sam::SamFormat;

/// Record order produced by `sort` and expected by `merge`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SortOrder {
    /// Reference index (unmapped last), then position, then strand.
    #[default]
    Coordinate,
    /// Read name, then first/second of pair.
    Queryname,
}

impl SortOrder {
    /// Value written to the `@HD SO:` field.
    #[must_use]
    pub fn header_value(self) -> &'static str {
        match self {
            Self::Coordinate => "coordinate",
            Self::Queryname => "queryname",
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.header_value())
    }
}

/// On-disk container of an input or output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum InputFormat {
    /// BGZF-compressed binary records.
    #[default]
    Bam,
    /// Uncompressed text records.
    Sam,
}

impl FromStr for InputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s.to_ascii_lowercase().as_str() {
            "bam" => Ok(Self::Bam),
            "sam" => Ok(Self::Sam),
            other => Err(format!("unknown input format '{other}'")),
        }
    }
}

impl InputFormat {
    /// Record format for this container.
    #[must_use]
    pub fn record_format(self) -> Arc<dyn RecordFormat> {
        match self {
            Self::Bam => Arc::new(BamFormat),
            Self::Sam => Arc::new(SamFormat),
        }
    }
}

/// Location of one record found by [`RecordFormat::next_record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedRecord {
    /// Bytes the record occupies at the start of the input, framing included.
    pub len: usize,
    /// Parse rank carried inside the record, for formats that store one.
    pub rank: Option<u64>,
}

/// Fields consulted by duplicate marking.
#[derive(Debug, Clone, Copy)]
pub struct RecordFields<'a> {
    pub flags: u16,
    pub ref_id: i32,
    /// 0-based leftmost position.
    pub pos: i32,
    pub mate_ref_id: i32,
    pub mate_pos: i32,
    pub name: &'a [u8],
    pub span: CigarSpan,
    /// Span of the mate's alignment, from its `MC` tag.
    pub mate_span: Option<CigarSpan>,
    pub read_group: Option<&'a [u8]>,
    /// Sum of base qualities >= 15.
    pub score: u32,
}

/// Minimum base quality counted towards a read's duplicate-marking score.
pub const MIN_SCORING_QUALITY: u8 = 15;

/// Sum the qualities that count towards the duplicate-marking score.
#[must_use]
pub fn quality_score(qualities: impl IntoIterator<Item = u8>) -> u32 {
    qualities.into_iter().filter(|&q| q >= MIN_SCORING_QUALITY && q != 0xff).map(u32::from).sum()
}

/// Framing, validation and ordering of one record format.
pub trait RecordFormat: Send + Sync {
    fn name(&self) -> &'static str;

    /// Try to parse a header from the start of a stream.
    ///
    /// Returns `Ok(None)` when more bytes are needed; `at_eof` says none will come.
    fn parse_header(
        &self,
        data: &[u8],
        at_eof: bool,
    ) -> Result<Option<(AlignmentHeader, usize)>, String>;

    /// Find the record at the start of `data`; `Ok(None)` when it is incomplete.
    fn next_record(&self, data: &[u8]) -> Result<Option<ParsedRecord>, String>;

    /// Complete a trailing partial record at end of input, if the format allows it.
    ///
    /// Returns `false` when the tail is a truncated record.
    fn terminate_partial(&self, _tail: &mut Vec<u8>) -> bool {
        false
    }

    /// Check one record against the header.
    fn validate(&self, record: &[u8], header: &AlignmentHeader) -> Result<(), String>;

    /// Comparator implementing `order` over records of this format.
    fn comparator(&self, order: SortOrder, header: &AlignmentHeader)
    -> Arc<dyn RecordComparator>;

    /// Fields used by duplicate marking. Only called on validated records.
    fn fields<'a>(
        &self,
        record: &'a [u8],
        header: &AlignmentHeader,
    ) -> Result<RecordFields<'a>, String>;

    /// Append `record` to `out`, setting the duplicate flag when `duplicate` is true.
    fn write_record(&self, record: &[u8], duplicate: bool, out: &mut Vec<u8>);

    /// Serialized header as it starts an output stream.
    fn header_bytes(&self, header: &AlignmentHeader) -> Vec<u8>;
}
