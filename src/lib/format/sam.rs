//! Line-oriented SAM records. A record is one line including its `\n`.

use std::cmp::Ordering;
use std::sync::Arc;

use ahash::AHashMap;
use bamflow_raw_bam::{CigarSpan, flags, parse_cigar_text};
use bstr::ByteSlice;

use super::compare::{CoordinateKey, QuerynameKey, RecordComparator};
use super::{AlignmentHeader, ParsedRecord, RecordFields, RecordFormat, SortOrder, quality_score};

const MANDATORY_FIELDS: usize = 11;

/// SAM text framing.
#[derive(Debug, Clone, Copy, Default)]
pub struct SamFormat;

fn strip_newline(record: &[u8]) -> &[u8] {
    let line = record.strip_suffix(b"\n").unwrap_or(record);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// The first eleven columns; missing columns are empty.
fn columns(record: &[u8]) -> [&[u8]; MANDATORY_FIELDS] {
    let mut cols: [&[u8]; MANDATORY_FIELDS] = [&[]; MANDATORY_FIELDS];
    for (slot, col) in cols.iter_mut().zip(strip_newline(record).split_str("\t")) {
        *slot = col;
    }
    cols
}

fn parse_num<T: std::str::FromStr>(field: &[u8]) -> Option<T> {
    field.to_str().ok()?.parse().ok()
}

fn optional_tag<'a>(record: &'a [u8], prefix: &[u8; 5]) -> Option<&'a [u8]> {
    strip_newline(record)
        .split_str("\t")
        .skip(MANDATORY_FIELDS)
        .find_map(|field| field.strip_prefix(prefix.as_slice()))
}

/// Reference name lookup shared by the comparators.
#[derive(Debug, Clone, Default)]
struct ReferenceLookup {
    index: AHashMap<Vec<u8>, i32>,
}

impl ReferenceLookup {
    fn new(header: &AlignmentHeader) -> Self {
        let index = header
            .references()
            .iter()
            .enumerate()
            .map(|(i, (name, _))| (name.as_bytes().to_vec(), i as i32))
            .collect();
        Self { index }
    }

    fn get(&self, name: &[u8]) -> i32 {
        self.index.get(name).copied().unwrap_or(-1)
    }

    fn mate(&self, rnext: &[u8], own: i32) -> i32 {
        if rnext == b"=" { own } else { self.get(rnext) }
    }
}

impl RecordFormat for SamFormat {
    fn name(&self) -> &'static str {
        "SAM"
    }

    fn parse_header(
        &self,
        data: &[u8],
        at_eof: bool,
    ) -> Result<Option<(AlignmentHeader, usize)>, String> {
        let mut at = 0;
        let end = loop {
            if at >= data.len() {
                if at_eof {
                    break data.len();
                }
                return Ok(None);
            }
            if data[at] != b'@' {
                break at;
            }
            match data[at..].find_byte(b'\n') {
                Some(i) => at += i + 1,
                None if at_eof => break data.len(),
                None => return Ok(None),
            }
        };
        let text = std::str::from_utf8(&data[..end])
            .map_err(|_| "header text is not valid UTF-8".to_string())?;
        let mut text = text.to_string();
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        Ok(Some((AlignmentHeader::from_text(&text)?, end)))
    }

    fn next_record(&self, data: &[u8]) -> Result<Option<ParsedRecord>, String> {
        Ok(data.find_byte(b'\n').map(|i| ParsedRecord { len: i + 1, rank: None }))
    }

    fn terminate_partial(&self, tail: &mut Vec<u8>) -> bool {
        if !tail.is_empty() {
            tail.push(b'\n');
        }
        true
    }

    fn validate(&self, record: &[u8], header: &AlignmentHeader) -> Result<(), String> {
        let line = strip_newline(record);
        let n = line.split_str("\t").count();
        if n < MANDATORY_FIELDS {
            return Err(format!("{n} tab-separated fields, expected at least {MANDATORY_FIELDS}"));
        }
        let [qname, flag, rname, pos, mapq, cigar, rnext, pnext, tlen, _, _] = columns(record);
        if qname.is_empty() {
            return Err("empty QNAME".to_string());
        }
        if parse_num::<u16>(flag).is_none() {
            return Err(format!("FLAG '{}' is not a 16-bit integer", flag.as_bstr()));
        }
        if parse_num::<u32>(pos).is_none() || parse_num::<u32>(pnext).is_none() {
            return Err("POS and PNEXT must be non-negative integers".to_string());
        }
        if parse_num::<u8>(mapq).is_none() {
            return Err(format!("MAPQ '{}' is not in 0..=255", mapq.as_bstr()));
        }
        if parse_num::<i32>(tlen).is_none() {
            return Err(format!("TLEN '{}' is not an integer", tlen.as_bstr()));
        }
        if cigar != b"*" && parse_cigar_text(cigar).is_none() {
            return Err(format!("malformed CIGAR '{}'", cigar.as_bstr()));
        }
        for (what, name) in [("RNAME", rname), ("RNEXT", rnext)] {
            let known = name == b"*"
                || (what == "RNEXT" && name == b"=")
                || header.reference_index(name).is_some();
            if !known {
                return Err(format!("{what} '{}' is not in the header", name.as_bstr()));
            }
        }
        Ok(())
    }

    fn comparator(&self, order: SortOrder, header: &AlignmentHeader) -> Arc<dyn RecordComparator> {
        match order {
            SortOrder::Coordinate => Arc::new(SamCoordinate { refs: ReferenceLookup::new(header) }),
            SortOrder::Queryname => Arc::new(SamQueryname),
        }
    }

    fn fields<'a>(
        &self,
        record: &'a [u8],
        header: &AlignmentHeader,
    ) -> Result<RecordFields<'a>, String> {
        let [qname, flag, rname, pos, _, cigar, rnext, pnext, _, _, qual] = columns(record);
        let refs = ReferenceLookup::new(header);
        let ref_id = refs.get(rname);
        let span = parse_cigar_text(cigar).map(CigarSpan::from_ops).unwrap_or_default();
        let mate_span =
            optional_tag(record, b"MC:Z:").and_then(parse_cigar_text).map(CigarSpan::from_ops);
        let score = if qual == b"*" {
            0
        } else {
            quality_score(qual.iter().map(|q| q.saturating_sub(33)))
        };
        Ok(RecordFields {
            flags: parse_num(flag).unwrap_or(0),
            ref_id,
            pos: parse_num::<i32>(pos).unwrap_or(0) - 1,
            mate_ref_id: refs.mate(rnext, ref_id),
            mate_pos: parse_num::<i32>(pnext).unwrap_or(0) - 1,
            name: qname,
            span,
            mate_span,
            read_group: optional_tag(record, b"RG:Z:"),
            score,
        })
    }

    fn write_record(&self, record: &[u8], duplicate: bool, out: &mut Vec<u8>) {
        let flag_range = record.find_byte(b'\t').and_then(|start| {
            let start = start + 1;
            record[start..].find_byte(b'\t').map(|len| start..start + len)
        });
        let Some(range) = flag_range.filter(|_| duplicate) else {
            out.extend_from_slice(record);
            return;
        };
        let Some(flag) = parse_num::<u16>(&record[range.clone()]) else {
            out.extend_from_slice(record);
            return;
        };
        out.extend_from_slice(&record[..range.start]);
        out.extend_from_slice((flag | flags::DUPLICATE).to_string().as_bytes());
        out.extend_from_slice(&record[range.end..]);
    }

    fn header_bytes(&self, header: &AlignmentHeader) -> Vec<u8> {
        header.to_sam_bytes()
    }
}

struct SamCoordinate {
    refs: ReferenceLookup,
}

impl SamCoordinate {
    fn key(&self, record: &[u8]) -> CoordinateKey {
        let mut cols = strip_newline(record).split_str("\t");
        let _qname = cols.next();
        let flag = cols.next().and_then(parse_num::<u16>).unwrap_or(0);
        let ref_id = cols.next().map_or(-1, |r| self.refs.get(r));
        let pos = cols.next().and_then(parse_num::<i32>).unwrap_or(0) - 1;
        CoordinateKey::new(ref_id, pos, flag)
    }
}

impl RecordComparator for SamCoordinate {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.key(a).cmp(&self.key(b))
    }
}

struct SamQueryname;

fn queryname_key(record: &[u8]) -> QuerynameKey<'_> {
    let mut cols = strip_newline(record).split_str("\t");
    let name = cols.next().unwrap_or_default();
    let flag = cols.next().and_then(parse_num::<u16>).unwrap_or(0);
    QuerynameKey::new(name, flag)
}

impl RecordComparator for SamQueryname {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        queryname_key(a).cmp(&queryname_key(b))
    }
}
