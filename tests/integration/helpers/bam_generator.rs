//! Synthetic BAM and SAM inputs.
//!
//! Reads are generated from a seeded RNG so that every test run sees the same data, and BAM inputs
//! are cut into deliberately uneven BGZF blocks so that records straddle block boundaries.

use std::fs;
use std::path::Path;

use bamflow_bgzf::{BGZF_EOF, BlockCompressor, MAX_BLOCK_SIZE};
use bamflow_lib::format::AlignmentHeader;
use bamflow_raw_bam::RecordBuilder;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Header shared by every synthetic input.
pub const HEADER_TEXT: &str = "@HD\tVN:1.6\tSO:unsorted\n\
@SQ\tSN:chr1\tLN:1000000\n\
@SQ\tSN:chr2\tLN:800000\n\
@SQ\tSN:chr3\tLN:500000\n\
@RG\tID:A\tSM:sample\tLB:lib1\n";

/// Reference names in dictionary order.
pub const REFERENCES: [&str; 3] = ["chr1", "chr2", "chr3"];

const READ_LENGTH: usize = 30;
const BASES: &[u8] = b"ACGTTGCAACGGTACCATGCATGCAAGTCC";

/// One single-end read.
#[derive(Debug, Clone)]
pub struct SyntheticRead {
    pub name: String,
    /// Reference index, `None` when unmapped.
    pub reference: Option<usize>,
    /// 0-based leftmost position.
    pub position: u32,
    pub reverse: bool,
    /// Base quality of every base.
    pub quality: u8,
}

impl SyntheticRead {
    fn flags(&self) -> u16 {
        match (self.reference, self.reverse) {
            (None, _) => 0x4,
            (Some(_), true) => 0x10,
            (Some(_), false) => 0,
        }
    }

    /// Append the BAM encoding, including `block_size`.
    pub fn write_bam(&self, out: &mut Vec<u8>) {
        let quals = vec![self.quality; READ_LENGTH];
        let mut builder = RecordBuilder::new(self.name.as_bytes())
            .flags(self.flags())
            .sequence(&BASES[..READ_LENGTH], &quals)
            .string_tag(b"RG", b"A");
        if let Some(reference) = self.reference {
            builder =
                builder.reference(reference as i32, self.position as i32).mapq(60).cigar("30M");
        }
        builder.write_with_block_size(out);
    }

    /// SAM line including the trailing newline.
    pub fn to_sam(&self) -> String {
        let quals: String =
            std::iter::repeat_n(char::from(self.quality + 33), READ_LENGTH).collect();
        let seq = std::str::from_utf8(&BASES[..READ_LENGTH]).expect("ASCII bases");
        let (rname, pos, mapq, cigar) = match self.reference {
            Some(r) => (REFERENCES[r], self.position + 1, 60, "30M"),
            None => ("*", 0, 0, "*"),
        };
        format!(
            "{}\t{}\t{rname}\t{pos}\t{mapq}\t{cigar}\t*\t0\t0\t{seq}\t{quals}\tRG:Z:A\n",
            self.name,
            self.flags()
        )
    }
}

/// `count` reads with positions below `max_position`; every 97th read is unmapped.
pub fn synthetic_reads(count: usize, max_position: u32, seed: u64) -> Vec<SyntheticRead> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|i| {
            let mapped = i % 97 != 96;
            SyntheticRead {
                name: format!("read{i:06}"),
                reference: mapped.then(|| rng.random_range(0..REFERENCES.len())),
                position: if mapped { rng.random_range(0..max_position) } else { 0 },
                reverse: rng.random_bool(0.5),
                quality: rng.random_range(10..40),
            }
        })
        .collect()
}

/// Parsed header of [`HEADER_TEXT`].
pub fn header() -> AlignmentHeader {
    AlignmentHeader::from_text(HEADER_TEXT).expect("valid header text")
}

/// Split `total` bytes into `count` blocks of uneven size.
pub fn uneven_block_sizes(total: usize, count: usize) -> Vec<usize> {
    let weights: Vec<usize> = (0..count).map(|i| i % 5 + 1).collect();
    let weight_sum: usize = weights.iter().sum();
    let mut sizes: Vec<usize> = weights.iter().map(|w| total * w / weight_sum).collect();
    let assigned: usize = sizes.iter().sum();
    if let Some(last) = sizes.last_mut() {
        *last += total - assigned;
    }
    assert!(sizes.iter().all(|&s| s <= MAX_BLOCK_SIZE), "input too large for {count} blocks");
    sizes
}

/// Uncompressed BAM stream: header followed by raw records.
pub fn raw_bam(records: &[Vec<u8>]) -> Vec<u8> {
    raw_bam_with_header(&header(), records)
}

/// Uncompressed BAM stream with a custom header.
pub fn raw_bam_with_header(header: &AlignmentHeader, records: &[Vec<u8>]) -> Vec<u8> {
    let mut raw = header.to_bam_bytes();
    for record in records {
        raw.extend_from_slice(record);
    }
    raw
}

/// Compress `raw` into `blocks` uneven BGZF blocks followed by the EOF marker.
pub fn bgzf_encode(raw: &[u8], blocks: usize) -> Vec<u8> {
    let mut compressor = BlockCompressor::new(6).expect("compressor");
    let mut out = Vec::new();
    let mut start = 0;
    for size in uneven_block_sizes(raw.len(), blocks) {
        compressor.compress_block(&raw[start..start + size], &mut out).expect("compress");
        start += size;
    }
    out.extend_from_slice(&BGZF_EOF);
    out
}

/// BAM encoding of each read, with `block_size`.
pub fn encode_reads(reads: &[SyntheticRead]) -> Vec<Vec<u8>> {
    reads
        .iter()
        .map(|read| {
            let mut out = Vec::new();
            read.write_bam(&mut out);
            out
        })
        .collect()
}

/// Write `reads` as a BGZF-compressed BAM split into `blocks` blocks.
pub fn write_bam(path: &Path, reads: &[SyntheticRead], blocks: usize) {
    fs::write(path, bgzf_encode(&raw_bam(&encode_reads(reads)), blocks)).expect("write BAM");
}

/// Write `reads` as a BAM whose header is parsed from `header_text`.
pub fn write_bam_with_header(
    path: &Path,
    header_text: &str,
    reads: &[SyntheticRead],
    blocks: usize,
) {
    let header = AlignmentHeader::from_text(header_text).expect("valid header text");
    let raw = raw_bam_with_header(&header, &encode_reads(reads));
    fs::write(path, bgzf_encode(&raw, blocks)).expect("write BAM");
}

/// Write `reads` as SAM text.
pub fn write_sam(path: &Path, reads: &[SyntheticRead]) {
    let mut text = HEADER_TEXT.to_string();
    for read in reads {
        text.push_str(&read.to_sam());
    }
    fs::write(path, text).expect("write SAM");
}
