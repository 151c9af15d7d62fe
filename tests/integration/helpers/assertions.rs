//! Readers and checks for engine output.

use std::fs::{self, File};
use std::path::Path;

use noodles::bam;
use noodles::sam;
use noodles::sam::alignment::RecordBuf;

/// Header text and records of a BAM file, read independently of the engine.
pub fn read_bam(path: &Path) -> (String, Vec<RecordBuf>) {
    let mut reader = bam::io::Reader::new(File::open(path).expect("open BAM"));
    let header = reader.read_header().expect("read header");
    let records =
        reader.record_bufs(&header).collect::<std::io::Result<Vec<_>>>().expect("read records");

    let mut writer = sam::io::Writer::new(Vec::new());
    writer.write_header(&header).expect("render header");
    let text = String::from_utf8(writer.get_ref().clone()).expect("UTF-8 header");
    (text, records)
}

/// Coordinate key: reference, position and strand, with unmapped reads last.
pub fn coordinate_key(record: &RecordBuf) -> (usize, usize, bool) {
    if record.flags().is_unmapped() {
        return (usize::MAX, 0, false);
    }
    let reference = record.reference_sequence_id().unwrap_or(usize::MAX);
    let position = record.alignment_start().map_or(0, usize::from);
    (reference, position, record.flags().is_reverse_complemented())
}

/// Read name as a `String`.
pub fn name(record: &RecordBuf) -> String {
    record.name().map(|n| String::from_utf8_lossy(n.as_ref()).to_string()).unwrap_or_default()
}

/// Assert that `records` are in coordinate order and that equal keys keep input order.
///
/// Synthetic read names encode the input position, so input order is name order.
pub fn assert_coordinate_sorted(records: &[RecordBuf]) {
    for (i, pair) in records.windows(2).enumerate() {
        let (a, b) = (coordinate_key(&pair[0]), coordinate_key(&pair[1]));
        assert!(a <= b, "records {i} and {} out of order: {a:?} > {b:?}", i + 1);
        if a == b {
            let (first, second) = (name(&pair[0]), name(&pair[1]));
            assert!(first < second, "tie at {a:?} reordered: {first} before {second}");
        }
    }
}

/// Names of the records flagged as duplicates, in output order.
pub fn duplicate_names(records: &[RecordBuf]) -> Vec<String> {
    records.iter().filter(|r| r.flags().is_duplicate()).map(name).collect()
}

/// Header lines and alignment lines of a SAM file.
pub fn read_sam(path: &Path) -> (Vec<String>, Vec<String>) {
    let text = fs::read_to_string(path).expect("read SAM");
    text.lines().map(str::to_string).partition(|line| line.starts_with('@'))
}

/// Coordinate key of a SAM line, using `references` to order RNAME.
pub fn sam_coordinate_key(line: &str, references: &[&str]) -> (usize, u64, bool) {
    let columns: Vec<&str> = line.split('\t').collect();
    let flag: u16 = columns[1].parse().expect("FLAG");
    if flag & 0x4 != 0 {
        return (usize::MAX, 0, false);
    }
    let reference = references.iter().position(|r| *r == columns[2]).unwrap_or(usize::MAX);
    (reference, columns[3].parse().expect("POS"), flag & 0x10 != 0)
}
