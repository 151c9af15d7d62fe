//! Duplicate-marking read ends.
//!
//! Every primary, mapped, non-QC-fail read contributes a fixed-size [`ReadEnds`] key: a
//! fragment end for itself and, when its mate is mapped too, a pair end covering both reads.
//! Keys are collected per worker in pooled containers, spilled to sorted runs on disk, and
//! finally merged per key interval to decide which parse ranks are duplicates.
//!
//! - [`spill`]: sorted runs with a multi-level sparse index.
//! - [`marking`]: duplicate rules applied to one group of equal keys.
//! - [`collector`]: container pools, flush and interval merge as engine work.

pub mod collector;
pub mod marking;
pub mod spill;

use std::cmp::Ordering;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use ahash::RandomState;
use bamflow_raw_bam::flags;

use crate::errors::{PipelineError, Result};
use crate::format::{AlignmentHeader, RecordFields};

pub use collector::{FlushJob, IntervalJob, ReadEndsCollector};

/// Bytes of one encoded [`ReadEnds`].
pub const ENCODED_LEN: usize = 41;

/// Fixed seeds so read-name hashes, and with them tie-breaks, are identical across runs.
const NAME_HASH_SEEDS: [u64; 4] =
    [0x243f_6a88_85a3_08d3, 0x1319_8a2e_0370_7344, 0xa409_3822_299f_31d0, 0x082e_fa98_ec4e_6c89];

/// The two kinds of read ends, kept in separate containers and merged separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Fragment,
    Pair,
}

/// Fields that must match for two read ends to be duplicates of each other.
pub type GroupKey = (u16, i32, i32, bool, i32, i32, bool);

/// Duplicate-marking key of one read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadEnds {
    pub library: u16,
    pub ref1: i32,
    /// Unclipped 5' position of the first end.
    pub pos1: i32,
    pub reverse1: bool,
    /// `-1` for fragment ends.
    pub ref2: i32,
    pub pos2: i32,
    pub reverse2: bool,
    /// Read is paired and its mate is mapped.
    pub paired: bool,
    pub score: u32,
    pub name_hash: u64,
    /// Parse rank of the read.
    pub rank: u64,
}

impl ReadEnds {
    #[must_use]
    pub fn group_key(&self) -> GroupKey {
        (self.library, self.ref1, self.pos1, self.reverse1, self.ref2, self.pos2, self.reverse2)
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.library.to_le_bytes());
        out.extend_from_slice(&self.ref1.to_le_bytes());
        out.extend_from_slice(&self.pos1.to_le_bytes());
        out.push(u8::from(self.reverse1));
        out.extend_from_slice(&self.ref2.to_le_bytes());
        out.extend_from_slice(&self.pos2.to_le_bytes());
        out.push(u8::from(self.reverse2));
        out.push(u8::from(self.paired));
        out.extend_from_slice(&self.score.to_le_bytes());
        out.extend_from_slice(&self.name_hash.to_le_bytes());
        out.extend_from_slice(&self.rank.to_le_bytes());
    }

    /// Decode one entry from exactly [`ENCODED_LEN`] bytes.
    #[must_use]
    pub fn decode(bytes: &[u8; ENCODED_LEN]) -> Self {
        let u16_at = |i: usize| u16::from_le_bytes([bytes[i], bytes[i + 1]]);
        let i32_at =
            |i: usize| i32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let u32_at =
            |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let u64_at = |i: usize| {
            let mut word = [0u8; 8];
            word.copy_from_slice(&bytes[i..i + 8]);
            u64::from_le_bytes(word)
        };
        Self {
            library: u16_at(0),
            ref1: i32_at(2),
            pos1: i32_at(6),
            reverse1: bytes[10] != 0,
            ref2: i32_at(11),
            pos2: i32_at(15),
            reverse2: bytes[19] != 0,
            paired: bytes[20] != 0,
            score: u32_at(21),
            name_hash: u64_at(25),
            rank: u64_at(33),
        }
    }
}

impl Ord for ReadEnds {
    fn cmp(&self, other: &Self) -> Ordering {
        self.group_key()
            .cmp(&other.group_key())
            .then(self.name_hash.cmp(&other.name_hash))
            .then(self.rank.cmp(&other.rank))
    }
}

impl PartialOrd for ReadEnds {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// What one record contributes to duplicate marking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Secondary, supplementary or QC-failed.
    Ignored,
    /// Primary unmapped read of a library.
    Unmapped { library: u16 },
    Ends { fragment: ReadEnds, pair: Option<ReadEnds> },
}

/// Stable hash of a read name.
#[must_use]
pub fn name_hash(name: &[u8]) -> u64 {
    let [k0, k1, k2, k3] = NAME_HASH_SEEDS;
    RandomState::with_seeds(k0, k1, k2, k3).hash_one(name)
}

/// Derive the read ends of one record.
#[must_use]
pub fn observe(fields: &RecordFields<'_>, rank: u64, header: &AlignmentHeader) -> Observation {
    let flag = fields.flags;
    if flag & (flags::SECONDARY | flags::SUPPLEMENTARY | flags::QC_FAIL) != 0 {
        return Observation::Ignored;
    }
    let library = header.library_ordinal(fields.read_group);
    if flag & flags::UNMAPPED != 0 || fields.ref_id < 0 {
        return Observation::Unmapped { library };
    }

    let reverse = flag & flags::REVERSE != 0;
    let own = (fields.ref_id, fields.span.unclipped_5prime(fields.pos, reverse), reverse);
    let paired =
        flag & flags::PAIRED != 0 && flag & flags::MATE_UNMAPPED == 0 && fields.mate_ref_id >= 0;
    let hash = name_hash(fields.name);
    let fragment = ReadEnds {
        library,
        ref1: own.0,
        pos1: own.1,
        reverse1: own.2,
        ref2: -1,
        pos2: -1,
        reverse2: false,
        paired,
        score: fields.score,
        name_hash: hash,
        rank,
    };
    let pair = paired.then(|| {
        let mate_reverse = flag & flags::MATE_REVERSE != 0;
        let mate_pos = fields
            .mate_span
            .map_or(fields.mate_pos, |span| span.unclipped_5prime(fields.mate_pos, mate_reverse));
        let mate = (fields.mate_ref_id, mate_pos, mate_reverse);
        let (low, high) = if own <= mate { (own, mate) } else { (mate, own) };
        ReadEnds {
            ref1: low.0,
            pos1: low.1,
            reverse1: low.2,
            ref2: high.0,
            pos2: high.1,
            reverse2: high.2,
            ..fragment
        }
    });
    Observation::Ends { fragment, pair }
}

/// Bit vector of duplicate parse ranks, written concurrently by interval merges.
#[derive(Debug)]
pub struct DuplicateSet {
    words: Vec<AtomicU64>,
    len: u64,
}

impl DuplicateSet {
    #[must_use]
    pub fn new(len: u64) -> Self {
        let words = (0..len.div_ceil(64)).map(|_| AtomicU64::new(0)).collect();
        Self { words, len }
    }

    /// Mark `rank` as a duplicate.
    ///
    /// # Errors
    ///
    /// Returns an internal error if `rank` is outside the set.
    pub fn insert(&self, rank: u64) -> Result<()> {
        if rank >= self.len {
            return Err(PipelineError::internal(format!(
                "duplicate rank {rank} outside {} parsed records",
                self.len
            )));
        }
        self.words[(rank / 64) as usize].fetch_or(1 << (rank % 64), AtomicOrdering::Relaxed);
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, rank: u64) -> bool {
        if rank >= self.len {
            return false;
        }
        self.words[(rank / 64) as usize].load(AtomicOrdering::Relaxed) & (1 << (rank % 64)) != 0
    }

    /// Number of ranks marked.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.words.iter().map(|w| u64::from(w.load(AtomicOrdering::Relaxed).count_ones())).sum()
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bamflow_raw_bam::CigarSpan;

    fn header() -> AlignmentHeader {
        AlignmentHeader::from_text("@HD\tVN:1.6\n@SQ\tSN:chr1\tLN:1000\n@RG\tID:rg1\tLB:libA\n")
            .unwrap()
    }

    fn fields(flags: u16, pos: i32, mate_pos: i32) -> RecordFields<'static> {
        RecordFields {
            flags,
            ref_id: 0,
            pos,
            mate_ref_id: 0,
            mate_pos,
            name: b"read1",
            span: CigarSpan { leading_clip: 2, reference_len: 10, trailing_clip: 3 },
            mate_span: None,
            read_group: Some(b"rg1"),
            score: 60,
        }
    }

    #[test]
    fn test_encode_decode_layout() {
        let ends = ReadEnds {
            library: 3,
            ref1: 1,
            pos1: -7,
            reverse1: true,
            ref2: 2,
            pos2: 900,
            reverse2: false,
            paired: true,
            score: 1234,
            name_hash: u64::MAX - 5,
            rank: 42,
        };
        let mut bytes = Vec::new();
        ends.encode(&mut bytes);
        assert_eq!(bytes.len(), ENCODED_LEN);
        let array: [u8; ENCODED_LEN] = bytes.try_into().unwrap();
        assert_eq!(ReadEnds::decode(&array), ends);
    }

    #[test]
    fn test_observe_fragment_uses_unclipped_five_prime() {
        let header = header();
        let Observation::Ends { fragment, pair } = observe(&fields(0, 100, -1), 7, &header) else {
            panic!("expected ends");
        };
        assert_eq!(pair, None);
        assert_eq!((fragment.ref1, fragment.pos1, fragment.reverse1), (0, 98, false));
        assert_eq!(fragment.library, header.library_ordinal(Some(b"rg1")));
        assert_eq!(fragment.rank, 7);

        let observed = observe(&fields(flags::REVERSE, 100, -1), 8, &header);
        let Observation::Ends { fragment, .. } = observed else {
            panic!("expected ends");
        };
        assert_eq!(fragment.pos1, 100 + 10 + 3 - 1);
    }

    #[test]
    fn test_observe_pair_orders_ends() {
        let header = header();
        let flag = flags::PAIRED | flags::MATE_REVERSE;
        let observed = observe(&fields(flag, 500, 200), 1, &header);
        let Observation::Ends { fragment, pair: Some(pair) } = observed else {
            panic!("expected pair ends");
        };
        assert!(fragment.paired);
        assert_eq!((pair.ref1, pair.pos1, pair.reverse1), (0, 200, true));
        assert_eq!((pair.ref2, pair.pos2, pair.reverse2), (0, 498, false));
    }

    #[test]
    fn test_observe_skips_and_unmapped() {
        let header = header();
        assert_eq!(observe(&fields(flags::SECONDARY, 1, -1), 0, &header), Observation::Ignored);
        assert_eq!(observe(&fields(flags::QC_FAIL, 1, -1), 0, &header), Observation::Ignored);
        let unmapped = observe(&fields(flags::UNMAPPED, 1, -1), 0, &header);
        assert!(matches!(unmapped, Observation::Unmapped { .. }));
        let mate_unmapped = flags::PAIRED | flags::MATE_UNMAPPED;
        let observed = observe(&fields(mate_unmapped, 1, 1), 0, &header);
        let Observation::Ends { fragment, pair } = observed else {
            panic!("expected ends");
        };
        assert!(!fragment.paired);
        assert_eq!(pair, None);
    }

    #[test]
    fn test_duplicate_set() {
        let set = DuplicateSet::new(130);
        set.insert(0).unwrap();
        set.insert(129).unwrap();
        set.insert(129).unwrap();
        assert!(set.insert(130).is_err());
        assert!(set.contains(129) && !set.contains(64) && !set.contains(500));
        assert_eq!(set.count(), 2);
    }

    #[test]
    fn test_name_hash_is_stable() {
        assert_eq!(name_hash(b"q1"), name_hash(b"q1"));
        assert_ne!(name_hash(b"q1"), name_hash(b"q2"));
    }
}
