//! Binary BAM records: `block_size` framed, little-endian fixed section.

use std::cmp::Ordering;
use std::sync::Arc;

use bamflow_raw_bam::{
    CigarSpan, MIN_RECORD_LEN, aux_data, cigar_span, find_string_tag, flags, l_read_name,
    mate_pos, mate_ref_id, parse_cigar_text, pos, qualities, read_name, ref_id, set_flags,
    variable_fields_len,
};

use super::compare::{CoordinateKey, QuerynameKey, RecordComparator};
use super::{AlignmentHeader, ParsedRecord, RecordFields, RecordFormat, SortOrder, quality_score};

/// Largest record accepted; anything bigger is treated as corruption.
pub const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

const BAM_MAGIC: &[u8; 4] = b"BAM\x01";

/// BAM record framing. Records keep their 4-byte `block_size` prefix.
#[derive(Debug, Clone, Copy, Default)]
pub struct BamFormat;

fn le_u32(data: &[u8], at: usize) -> Option<u32> {
    data.get(at..at + 4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Strip the `block_size` prefix.
#[inline]
fn body(record: &[u8]) -> &[u8] {
    &record[4.min(record.len())..]
}

impl RecordFormat for BamFormat {
    fn name(&self) -> &'static str {
        "BAM"
    }

    fn parse_header(
        &self,
        data: &[u8],
        at_eof: bool,
    ) -> Result<Option<(AlignmentHeader, usize)>, String> {
        let incomplete = |what: &str| {
            if at_eof { Err(format!("truncated BAM header ({what})")) } else { Ok(None) }
        };
        if data.len() < 8 {
            return incomplete("magic");
        }
        if &data[..4] != BAM_MAGIC {
            return Err("missing BAM magic number".to_string());
        }
        let Some(l_text) = le_u32(data, 4) else { return incomplete("text length") };
        let mut at = 8 + l_text as usize;
        let Some(text) = data.get(8..at) else { return incomplete("text") };
        // Text may be NUL padded.
        let text_end = text.iter().position(|&b| b == 0).unwrap_or(text.len());
        let text = std::str::from_utf8(&text[..text_end])
            .map_err(|_| "header text is not valid UTF-8".to_string())?;

        let Some(n_ref) = le_u32(data, at) else { return incomplete("reference count") };
        at += 4;
        let mut references = Vec::with_capacity(n_ref as usize);
        for _ in 0..n_ref {
            let Some(l_name) = le_u32(data, at) else { return incomplete("reference name") };
            let name_end = at + 4 + l_name as usize;
            let Some(raw_name) = data.get(at + 4..name_end) else {
                return incomplete("reference name");
            };
            let Some(l_ref) = le_u32(data, name_end) else { return incomplete("reference length") };
            let name = raw_name.strip_suffix(b"\0").unwrap_or(raw_name);
            let name = String::from_utf8(name.to_vec())
                .map_err(|_| "reference name is not valid UTF-8".to_string())?;
            references.push((name, l_ref as usize));
            at = name_end + 4;
        }

        let header = AlignmentHeader::with_references(text, references)?;
        Ok(Some((header, at)))
    }

    fn next_record(&self, data: &[u8]) -> Result<Option<ParsedRecord>, String> {
        let Some(block_size) = le_u32(data, 0) else { return Ok(None) };
        let block_size = block_size as usize;
        if block_size < MIN_RECORD_LEN {
            return Err(format!("block_size {block_size} is smaller than the fixed record section"));
        }
        if block_size > MAX_RECORD_SIZE {
            return Err(format!("block_size {block_size} exceeds {MAX_RECORD_SIZE}"));
        }
        if data.len() < 4 + block_size {
            return Ok(None);
        }
        Ok(Some(ParsedRecord { len: 4 + block_size, rank: None }))
    }

    fn validate(&self, record: &[u8], header: &AlignmentHeader) -> Result<(), String> {
        let bam = body(record);
        if bam.len() < MIN_RECORD_LEN {
            return Err(format!("record of {} bytes is shorter than the fixed section", bam.len()));
        }
        let l_name = l_read_name(bam) as usize;
        if l_name == 0 || MIN_RECORD_LEN + l_name > bam.len() {
            return Err(format!("read name length {l_name} does not fit in the record"));
        }
        if bam[MIN_RECORD_LEN + l_name - 1] != 0 {
            return Err("read name is not NUL terminated".to_string());
        }
        if MIN_RECORD_LEN + variable_fields_len(bam) > bam.len() {
            return Err("CIGAR, sequence and qualities run past the end of the record".to_string());
        }

        let n_ref = header.references().len() as i32;
        for (what, id) in [("reference", ref_id(bam)), ("mate reference", mate_ref_id(bam))] {
            if id < -1 || id >= n_ref {
                return Err(format!("{what} id {id} is outside the dictionary of {n_ref}"));
            }
        }
        for (what, p) in [("position", pos(bam)), ("mate position", mate_pos(bam))] {
            if p < -1 {
                return Err(format!("{what} {p} is negative"));
            }
        }
        Ok(())
    }

    fn comparator(
        &self,
        order: SortOrder,
        _header: &AlignmentHeader,
    ) -> Arc<dyn RecordComparator> {
        match order {
            SortOrder::Coordinate => Arc::new(BamCoordinate),
            SortOrder::Queryname => Arc::new(BamQueryname),
        }
    }

    fn fields<'a>(
        &self,
        record: &'a [u8],
        _header: &AlignmentHeader,
    ) -> Result<RecordFields<'a>, String> {
        let bam = body(record);
        let aux = aux_data(bam);
        let mate_span = find_string_tag(aux, b"MC")
            .and_then(parse_cigar_text)
            .map(CigarSpan::from_ops);
        Ok(RecordFields {
            flags: bamflow_raw_bam::flags(bam),
            ref_id: ref_id(bam),
            pos: pos(bam),
            mate_ref_id: mate_ref_id(bam),
            mate_pos: mate_pos(bam),
            name: read_name(bam),
            span: cigar_span(bam),
            mate_span,
            read_group: find_string_tag(aux, b"RG"),
            score: quality_score(qualities(bam).iter().copied()),
        })
    }

    fn write_record(&self, record: &[u8], duplicate: bool, out: &mut Vec<u8>) {
        let start = out.len();
        out.extend_from_slice(record);
        if duplicate && record.len() >= 4 + MIN_RECORD_LEN {
            let bam = &mut out[start + 4..];
            let flag = bamflow_raw_bam::flags(bam) | flags::DUPLICATE;
            set_flags(bam, flag);
        }
    }

    fn header_bytes(&self, header: &AlignmentHeader) -> Vec<u8> {
        header.to_bam_bytes()
    }
}

struct BamCoordinate;

impl RecordComparator for BamCoordinate {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        let key = |r: &[u8]| {
            let bam = body(r);
            CoordinateKey::new(ref_id(bam), pos(bam), bamflow_raw_bam::flags(bam))
        };
        key(a).cmp(&key(b))
    }
}

struct BamQueryname;

impl RecordComparator for BamQueryname {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        fn key(r: &[u8]) -> QuerynameKey<'_> {
            let bam = body(r);
            QuerynameKey::new(read_name(bam), bamflow_raw_bam::flags(bam))
        }
        key(a).cmp(&key(b))
    }
}
