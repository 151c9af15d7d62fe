//! Fixed-offset field extraction from BAM records.
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0-3     4     refID (i32)
//! 4-7     4     pos (i32, 0-based)
//! 8       1     l_read_name (u8, includes NUL)
//! 9       1     mapq (u8)
//! 10-11   2     bin (u16)
//! 12-13   2     n_cigar_op (u16)
//! 14-15   2     flag (u16)
//! 16-19   4     l_seq (u32)
//! 20-23   4     next_refID (i32)
//! 24-27   4     next_pos (i32)
//! 28-31   4     tlen (i32)
//! 32+     var   read_name, cigar, seq, qual, aux
//! ```
//!
//! The accessors below index directly and assume at least [`MIN_RECORD_LEN`] bytes; callers
//! check [`variable_fields_len`] against the record length before trusting offsets past the
//! fixed section.

/// Length of the fixed section of a BAM record.
pub const MIN_RECORD_LEN: usize = 32;

/// BAM flag bits.
pub mod flags {
    /// Read is paired in sequencing.
    pub const PAIRED: u16 = 0x1;
    /// Read is unmapped.
    pub const UNMAPPED: u16 = 0x4;
    /// Mate is unmapped.
    pub const MATE_UNMAPPED: u16 = 0x8;
    /// Read is reverse complemented.
    pub const REVERSE: u16 = 0x10;
    /// Mate is reverse complemented.
    pub const MATE_REVERSE: u16 = 0x20;
    /// First segment in template.
    pub const FIRST_SEGMENT: u16 = 0x40;
    /// Last segment in template.
    pub const LAST_SEGMENT: u16 = 0x80;
    /// Secondary alignment.
    pub const SECONDARY: u16 = 0x100;
    /// Not passing quality controls.
    pub const QC_FAIL: u16 = 0x200;
    /// PCR or optical duplicate.
    pub const DUPLICATE: u16 = 0x400;
    /// Supplementary alignment.
    pub const SUPPLEMENTARY: u16 = 0x800;
}

#[inline]
fn le_i32(bam: &[u8], at: usize) -> i32 {
    i32::from_le_bytes([bam[at], bam[at + 1], bam[at + 2], bam[at + 3]])
}

#[inline]
#[must_use]
pub fn ref_id(bam: &[u8]) -> i32 {
    le_i32(bam, 0)
}

#[inline]
#[must_use]
pub fn pos(bam: &[u8]) -> i32 {
    le_i32(bam, 4)
}

#[inline]
#[must_use]
pub fn l_read_name(bam: &[u8]) -> u8 {
    bam[8]
}

#[inline]
#[must_use]
pub fn mapq(bam: &[u8]) -> u8 {
    bam[9]
}

#[inline]
#[must_use]
pub fn n_cigar_op(bam: &[u8]) -> u16 {
    u16::from_le_bytes([bam[12], bam[13]])
}

#[inline]
#[must_use]
pub fn flags(bam: &[u8]) -> u16 {
    u16::from_le_bytes([bam[14], bam[15]])
}

#[inline]
#[must_use]
pub fn l_seq(bam: &[u8]) -> u32 {
    u32::from_le_bytes([bam[16], bam[17], bam[18], bam[19]])
}

#[inline]
#[must_use]
pub fn mate_ref_id(bam: &[u8]) -> i32 {
    le_i32(bam, 20)
}

#[inline]
#[must_use]
pub fn mate_pos(bam: &[u8]) -> i32 {
    le_i32(bam, 24)
}

#[inline]
#[must_use]
pub fn template_length(bam: &[u8]) -> i32 {
    le_i32(bam, 28)
}

/// Overwrite the flag field in place.
#[inline]
pub fn set_flags(bam: &mut [u8], new_flags: u16) {
    bam[14..16].copy_from_slice(&new_flags.to_le_bytes());
}

/// Read name without its NUL terminator.
#[inline]
#[must_use]
pub fn read_name(bam: &[u8]) -> &[u8] {
    let l = bam[8] as usize;
    if l > 1 { &bam[32..32 + l - 1] } else { &[] }
}

/// Bytes occupied by everything between the fixed section and the aux data:
/// read name, CIGAR, packed sequence and qualities.
#[inline]
#[must_use]
pub fn variable_fields_len(bam: &[u8]) -> usize {
    let l_seq = l_seq(bam) as usize;
    l_read_name(bam) as usize + n_cigar_op(bam) as usize * 4 + l_seq.div_ceil(2) + l_seq
}

/// Offset of the first aux field.
#[inline]
#[must_use]
pub fn aux_offset(bam: &[u8]) -> usize {
    MIN_RECORD_LEN + variable_fields_len(bam)
}

/// Aux data, or an empty slice when the record is truncated.
#[inline]
#[must_use]
pub fn aux_data(bam: &[u8]) -> &[u8] {
    let offset = aux_offset(bam);
    if offset <= bam.len() { &bam[offset..] } else { &[] }
}

/// Raw Phred base qualities (0xff when absent).
#[inline]
#[must_use]
pub fn qualities(bam: &[u8]) -> &[u8] {
    let l_seq = l_seq(bam) as usize;
    let cigar_end = MIN_RECORD_LEN + l_read_name(bam) as usize + n_cigar_op(bam) as usize * 4;
    let start = cigar_end + l_seq.div_ceil(2);
    if start + l_seq <= bam.len() { &bam[start..start + l_seq] } else { &[] }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::RecordBuilder;

    #[test]
    fn test_fixed_fields() {
        let rec = RecordBuilder::new(b"read1")
            .flags(flags::PAIRED | flags::REVERSE)
            .reference(2, 1000)
            .mapq(60)
            .cigar("10M")
            .mate(3, 2000)
            .template_length(-150)
            .sequence(b"ACGTACGTAC", &[30; 10])
            .build();

        assert_eq!(ref_id(&rec), 2);
        assert_eq!(pos(&rec), 1000);
        assert_eq!(mapq(&rec), 60);
        assert_eq!(flags(&rec), flags::PAIRED | flags::REVERSE);
        assert_eq!(l_read_name(&rec), 6);
        assert_eq!(n_cigar_op(&rec), 1);
        assert_eq!(l_seq(&rec), 10);
        assert_eq!(mate_ref_id(&rec), 3);
        assert_eq!(mate_pos(&rec), 2000);
        assert_eq!(template_length(&rec), -150);
        assert_eq!(read_name(&rec), b"read1");
        assert_eq!(qualities(&rec), &[30; 10]);
        assert_eq!(aux_offset(&rec), rec.len());
    }

    #[test]
    fn test_set_flags() {
        let mut rec = RecordBuilder::new(b"r").flags(flags::PAIRED).build();
        set_flags(&mut rec, flags::PAIRED | flags::DUPLICATE);
        assert_eq!(flags(&rec), flags::PAIRED | flags::DUPLICATE);
    }

    #[test]
    fn test_aux_data_truncated_record() {
        let rec =
            RecordBuilder::new(b"abc").sequence(b"ACGT", &[20; 4]).string_tag(b"RG", b"x").build();
        assert!(!aux_data(&rec).is_empty());
        assert!(aux_data(&rec[..aux_offset(&rec) - 1]).is_empty());
    }
}
