//! Raw BAM record construction for tests and fixtures.

use crate::cigar::{encode_cigar, parse_cigar_text};

/// Builder for complete raw BAM records.
///
/// ```rust,ignore
/// let rec = RecordBuilder::new(b"q1")
///     .flags(flags::PAIRED | flags::FIRST_SEGMENT)
///     .reference(0, 100)
///     .cigar("50M")
///     .mate(0, 300)
///     .sequence(&bases, &quals)
///     .string_tag(b"RG", b"A")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    name: Vec<u8>,
    flag: u16,
    ref_id: i32,
    pos: i32,
    mapq: u8,
    cigar: Vec<u32>,
    mate_ref_id: i32,
    mate_pos: i32,
    tlen: i32,
    bases: Vec<u8>,
    quals: Vec<u8>,
    aux: Vec<u8>,
}

impl RecordBuilder {
    /// Start an unmapped record with the given read name.
    #[must_use]
    pub fn new(name: &[u8]) -> Self {
        Self {
            name: name.to_vec(),
            flag: 0,
            ref_id: -1,
            pos: -1,
            mapq: 0,
            cigar: Vec::new(),
            mate_ref_id: -1,
            mate_pos: -1,
            tlen: 0,
            bases: Vec::new(),
            quals: Vec::new(),
            aux: Vec::new(),
        }
    }

    #[must_use]
    pub fn flags(mut self, flag: u16) -> Self {
        self.flag = flag;
        self
    }

    #[must_use]
    pub fn reference(mut self, ref_id: i32, pos: i32) -> Self {
        self.ref_id = ref_id;
        self.pos = pos;
        self
    }

    #[must_use]
    pub fn mapq(mut self, mapq: u8) -> Self {
        self.mapq = mapq;
        self
    }

    /// Set the CIGAR from text.
    ///
    /// # Panics
    ///
    /// Panics on a malformed CIGAR string.
    #[must_use]
    pub fn cigar(mut self, cigar: &str) -> Self {
        let ops = parse_cigar_text(cigar.as_bytes()).expect("valid CIGAR");
        self.cigar = encode_cigar(&ops);
        self
    }

    #[must_use]
    pub fn mate(mut self, ref_id: i32, pos: i32) -> Self {
        self.mate_ref_id = ref_id;
        self.mate_pos = pos;
        self
    }

    #[must_use]
    pub fn template_length(mut self, tlen: i32) -> Self {
        self.tlen = tlen;
        self
    }

    /// Set bases (ASCII) and raw Phred qualities; an empty `quals` writes 0xff.
    #[must_use]
    pub fn sequence(mut self, bases: &[u8], quals: &[u8]) -> Self {
        self.bases = bases.to_vec();
        self.quals = if quals.is_empty() { vec![0xff; bases.len()] } else { quals.to_vec() };
        self
    }

    #[must_use]
    pub fn string_tag(mut self, tag: &[u8; 2], value: &[u8]) -> Self {
        self.aux.extend_from_slice(tag);
        self.aux.push(b'Z');
        self.aux.extend_from_slice(value);
        self.aux.push(0);
        self
    }

    #[must_use]
    pub fn int_tag(mut self, tag: &[u8; 2], value: i32) -> Self {
        self.aux.extend_from_slice(tag);
        self.aux.push(b'i');
        self.aux.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Record bytes without the `block_size` prefix.
    ///
    /// # Panics
    ///
    /// Panics if the name exceeds 254 bytes or the qualities do not match the bases.
    #[must_use]
    pub fn build(&self) -> Vec<u8> {
        assert!(self.name.len() < 255, "read name too long");
        assert_eq!(self.bases.len(), self.quals.len(), "bases and quals differ in length");
        let end = self.pos + self.cigar_reference_len().max(1);

        let mut buf = Vec::with_capacity(64 + self.name.len() + self.bases.len() * 2);
        buf.extend_from_slice(&self.ref_id.to_le_bytes());
        buf.extend_from_slice(&self.pos.to_le_bytes());
        buf.push((self.name.len() + 1) as u8);
        buf.push(self.mapq);
        buf.extend_from_slice(&reg2bin(self.pos, end).to_le_bytes());
        buf.extend_from_slice(&(self.cigar.len() as u16).to_le_bytes());
        buf.extend_from_slice(&self.flag.to_le_bytes());
        buf.extend_from_slice(&(self.bases.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.mate_ref_id.to_le_bytes());
        buf.extend_from_slice(&self.mate_pos.to_le_bytes());
        buf.extend_from_slice(&self.tlen.to_le_bytes());
        buf.extend_from_slice(&self.name);
        buf.push(0);
        for op in &self.cigar {
            buf.extend_from_slice(&op.to_le_bytes());
        }
        for pair in self.bases.chunks(2) {
            let hi = base_code(pair[0]);
            let lo = pair.get(1).map_or(0, |&b| base_code(b));
            buf.push((hi << 4) | lo);
        }
        buf.extend_from_slice(&self.quals);
        buf.extend_from_slice(&self.aux);
        buf
    }

    /// Append the record with its 4-byte `block_size` prefix.
    pub fn write_with_block_size(&self, out: &mut Vec<u8>) {
        let rec = self.build();
        out.extend_from_slice(&(rec.len() as u32).to_le_bytes());
        out.extend_from_slice(&rec);
    }

    fn cigar_reference_len(&self) -> i32 {
        self.cigar
            .iter()
            .filter(|op| matches!(*op & 0xf, 0 | 2 | 3 | 7 | 8))
            .map(|op| (op >> 4) as i32)
            .sum()
    }
}

fn base_code(base: u8) -> u8 {
    b"=ACMGRSVTWYHKDBN"
        .iter()
        .position(|&c| c == base.to_ascii_uppercase())
        .map_or(15, |i| i as u8)
}

/// UCSC binning scheme bin for the half-open interval `[beg, end)`.
#[must_use]
pub fn reg2bin(beg: i32, end: i32) -> u16 {
    if beg < 0 {
        return 4680;
    }
    let end = end - 1;
    let bin = if beg >> 14 == end >> 14 {
        ((1 << 15) - 1) / 7 + (beg >> 14)
    } else if beg >> 17 == end >> 17 {
        ((1 << 12) - 1) / 7 + (beg >> 17)
    } else if beg >> 20 == end >> 20 {
        ((1 << 9) - 1) / 7 + (beg >> 20)
    } else if beg >> 23 == end >> 23 {
        ((1 << 6) - 1) / 7 + (beg >> 23)
    } else if beg >> 26 == end >> 26 {
        ((1 << 3) - 1) / 7 + (beg >> 26)
    } else {
        0
    };
    bin as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::*;

    #[test]
    fn test_unmapped_defaults() {
        let rec = RecordBuilder::new(b"u").sequence(b"ACG", &[]).build();
        assert_eq!(ref_id(&rec), -1);
        assert_eq!(pos(&rec), -1);
        assert_eq!(qualities(&rec), &[0xff; 3]);
        assert_eq!(u16::from_le_bytes([rec[10], rec[11]]), 4680);
    }

    #[test]
    fn test_block_size_prefix() {
        let mut out = Vec::new();
        RecordBuilder::new(b"p").write_with_block_size(&mut out);
        let size = u32::from_le_bytes([out[0], out[1], out[2], out[3]]) as usize;
        assert_eq!(size, out.len() - 4);
        assert_eq!(read_name(&out[4..]), b"p");
    }

    #[test]
    fn test_reg2bin() {
        assert_eq!(reg2bin(0, 1), 4681);
        assert_eq!(reg2bin(-1, 0), 4680);
        assert_eq!(reg2bin(16384, 16385), 4682);
    }
}
