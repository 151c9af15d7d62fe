//! K-way merging of already sorted inputs.

use std::path::PathBuf;

use bamflow_lib::driver::{self, EngineConfig};
use bamflow_lib::errors::PipelineError;
use rstest::rstest;
use tempfile::TempDir;

use crate::helpers::assertions::{assert_coordinate_sorted, name, read_bam};
use crate::helpers::bam_generator::{synthetic_reads, write_bam, write_bam_with_header};

/// Sort contiguous chunks of one read set into separate files, so that stream order matches name
/// order and tie stability can be checked by name.
fn sorted_inputs(dir: &TempDir, chunks: &[usize], max_position: u32) -> Vec<PathBuf> {
    let total = chunks.iter().sum();
    let reads = synthetic_reads(total, max_position, 21);
    let config = EngineConfig::default().with_threads(2).with_memory(1024 * 1024);
    let mut start = 0;
    chunks
        .iter()
        .enumerate()
        .map(|(i, &len)| {
            let unsorted = dir.path().join(format!("chunk_{i}.bam"));
            let sorted = dir.path().join(format!("chunk_{i}.sorted.bam"));
            write_bam(&unsorted, &reads[start..start + len], 3);
            driver::sort(&unsorted, &sorted, &config).unwrap();
            start += len;
            sorted
        })
        .collect()
}

#[rstest]
#[case(1)]
#[case(4)]
fn test_merge_keeps_ties_in_input_order(#[case] threads: usize) {
    let dir = TempDir::new().unwrap();
    let inputs = sorted_inputs(&dir, &[2_000, 1_500, 2_500], 1_000);
    let output = dir.path().join("merged.bam");

    let config = EngineConfig::default().with_threads(threads).with_memory(2 * 1024 * 1024);
    let stats = driver::merge(&inputs, &output, &config).unwrap();

    assert_eq!(stats.records, 6_000);
    let (header, records) = read_bam(&output);
    assert!(header.contains("SO:coordinate"));
    assert_eq!(records.len(), 6_000);
    assert_coordinate_sorted(&records);
}

#[test]
fn test_merge_single_input_reproduces_it() {
    let dir = TempDir::new().unwrap();
    let inputs = sorted_inputs(&dir, &[3_000], 50_000);
    let output = dir.path().join("merged.bam");

    driver::merge(&inputs, &output, &EngineConfig::default().with_threads(3)).unwrap();

    let expected: Vec<String> = read_bam(&inputs[0]).1.iter().map(name).collect();
    let actual: Vec<String> = read_bam(&output).1.iter().map(name).collect();
    assert_eq!(actual, expected);
}

#[test]
fn test_merge_with_header_only_input() {
    let dir = TempDir::new().unwrap();
    let mut inputs = sorted_inputs(&dir, &[1_000], 10_000);
    let empty = dir.path().join("empty.bam");
    write_bam(&empty, &[], 1);
    inputs.insert(0, empty);
    let output = dir.path().join("merged.bam");

    let stats = driver::merge(&inputs, &output, &EngineConfig::default().with_threads(2)).unwrap();

    assert_eq!(stats.records, 1_000);
    let records = read_bam(&output).1;
    assert_eq!(records.len(), 1_000);
    assert_coordinate_sorted(&records);
}

#[test]
fn test_merge_without_inputs_is_rejected() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("merged.bam");
    assert!(driver::merge(&[], &output, &EngineConfig::default()).is_err());
}

#[rstest]
#[case::reordered("@SQ\tSN:chr2\tLN:800000\n@SQ\tSN:chr1\tLN:1000000\n@SQ\tSN:chr3\tLN:500000\n")]
#[case::missing("@SQ\tSN:chr1\tLN:1000000\n@SQ\tSN:chr2\tLN:800000\n")]
#[case::length("@SQ\tSN:chr1\tLN:1000000\n@SQ\tSN:chr2\tLN:800000\n@SQ\tSN:chr3\tLN:1\n")]
fn test_merge_rejects_a_different_reference_dictionary(#[case] references: &str) {
    let dir = TempDir::new().unwrap();
    let mut inputs = sorted_inputs(&dir, &[1_500, 1_500], 1_000);
    let other = dir.path().join("other.bam");
    let mut reads = synthetic_reads(200, 1_000, 5);
    for read in &mut reads {
        read.reference = read.reference.map(|_| 0);
    }
    reads.sort_by_key(|r| (r.reference.is_none(), r.position, r.reverse));
    write_bam_with_header(&other, &format!("@HD\tVN:1.6\tSO:coordinate\n{references}"), &reads, 2);
    inputs.insert(1, other);

    let output = dir.path().join("merged.bam");
    let result = driver::merge(&inputs, &output, &EngineConfig::default().with_threads(3));
    match result {
        Err(PipelineError::Header { stream, reason }) => {
            assert_eq!(stream, 1);
            assert!(reason.contains("first input"), "reason: {reason}");
        }
        other => panic!("expected a header error, got {other:?}"),
    }
}
