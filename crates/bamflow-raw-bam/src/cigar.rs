//! CIGAR helpers for unclipped 5' coordinates.
//!
//! Both the binary CIGAR of a record and the textual CIGAR found in an `MC` tag (or a SAM
//! line) reduce to a [`CigarSpan`], from which the unclipped 5' position follows.

use crate::fields::{MIN_RECORD_LEN, l_read_name, n_cigar_op};

/// CIGAR operation codes in BAM encoding order.
pub const CIGAR_OPS: &[u8; 9] = b"MIDNSHP=X";

/// Clip and reference extents of an alignment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CigarSpan {
    /// Soft and hard clips before the first reference-consuming operation.
    pub leading_clip: i32,
    /// Reference bases consumed (M, D, N, =, X).
    pub reference_len: i32,
    /// Soft and hard clips after the last reference-consuming operation.
    pub trailing_clip: i32,
}

impl CigarSpan {
    fn push(&mut self, op: u8, len: i32) {
        match op {
            0 | 2 | 3 | 7 | 8 => {
                self.reference_len += len;
                self.trailing_clip = 0;
            }
            4 | 5 if self.reference_len == 0 => self.leading_clip += len,
            4 | 5 => self.trailing_clip += len,
            _ => {}
        }
    }

    /// Reduce `(length, op code)` pairs.
    pub fn from_ops<I: IntoIterator<Item = (u32, u8)>>(ops: I) -> Self {
        let mut span = Self::default();
        for (len, op) in ops {
            span.push(op, len as i32);
        }
        span
    }

    /// Unclipped 5' position: unclipped start for forward reads, unclipped end for reverse.
    #[must_use]
    pub fn unclipped_5prime(&self, pos: i32, reverse: bool) -> i32 {
        if reverse {
            pos + self.reference_len + self.trailing_clip - 1
        } else {
            pos - self.leading_clip
        }
    }
}

/// Iterate the binary CIGAR of a record as `(length, op code)` pairs.
///
/// Yields nothing when the CIGAR would run past the end of the record.
pub fn cigar_ops(bam: &[u8]) -> impl Iterator<Item = (u32, u8)> + '_ {
    let start = MIN_RECORD_LEN + l_read_name(bam) as usize;
    let end = start + n_cigar_op(bam) as usize * 4;
    let raw: &[u8] = if end <= bam.len() { &bam[start..end] } else { &[] };
    raw.chunks_exact(4).map(|c| {
        let v = u32::from_le_bytes([c[0], c[1], c[2], c[3]]);
        (v >> 4, (v & 0xf) as u8)
    })
}

/// Span of the binary CIGAR of a record.
#[must_use]
pub fn cigar_span(bam: &[u8]) -> CigarSpan {
    CigarSpan::from_ops(cigar_ops(bam))
}

/// Parse a textual CIGAR (e.g. `5S90M5S`) into `(length, op code)` pairs.
///
/// Returns `None` for `*`, empty or malformed strings.
#[must_use]
pub fn parse_cigar_text(text: &[u8]) -> Option<Vec<(u32, u8)>> {
    if text.is_empty() || text == b"*" {
        return None;
    }
    let mut ops = Vec::new();
    let mut len: u32 = 0;
    let mut have_digits = false;
    for &b in text {
        if b.is_ascii_digit() {
            len = len.checked_mul(10)?.checked_add(u32::from(b - b'0'))?;
            have_digits = true;
        } else {
            let code = CIGAR_OPS.iter().position(|&c| c == b)? as u8;
            if !have_digits {
                return None;
            }
            ops.push((len, code));
            len = 0;
            have_digits = false;
        }
    }
    if have_digits { None } else { Some(ops) }
}

/// Encode `(length, op code)` pairs as BAM CIGAR words.
#[must_use]
pub fn encode_cigar(ops: &[(u32, u8)]) -> Vec<u32> {
    ops.iter().map(|&(len, op)| (len << 4) | u32::from(op)).collect()
}
