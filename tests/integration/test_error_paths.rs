//! Failures must surface as the first error and never hang the engine.

use std::fs;
use std::time::Instant;

use bamflow_lib::driver::{self, EngineConfig};
use bamflow_lib::errors::PipelineError;
use bamflow_lib::thread_pool::POLL_INTERVAL;
use bamflow_raw_bam::RecordBuilder;
use rstest::rstest;
use tempfile::TempDir;

use crate::helpers::bam_generator::{bgzf_encode, encode_reads, raw_bam, synthetic_reads, write_bam};

/// A failing record aborts the run promptly: the driver returns well within one wait interval,
/// every worker is joined and nothing reaches the output or stays in scratch space.
#[rstest]
#[case(1)]
#[case(4)]
fn test_invalid_record_is_reported_by_ordinal(#[case] threads: usize) {
    let dir = TempDir::new().unwrap();
    let temp = TempDir::new().unwrap();
    let input = dir.path().join("input.bam");
    let output = dir.path().join("out.bam");
    let mut records = encode_reads(&synthetic_reads(10_000, 100_000, 42));
    let mut bad = Vec::new();
    RecordBuilder::new(b"bad")
        .reference(99, 10)
        .cigar("4M")
        .sequence(b"ACGT", &[30; 4])
        .write_with_block_size(&mut bad);
    records[4217] = bad;
    fs::write(&input, bgzf_encode(&raw_bam(&records), 37)).unwrap();

    let config = EngineConfig::default()
        .with_threads(threads)
        .with_memory(2 * 1024 * 1024)
        .with_temp_dir(Some(temp.path().to_path_buf()));
    let start = Instant::now();
    let result = driver::sort(&input, &output, &config);
    let elapsed = start.elapsed();

    match result {
        Err(PipelineError::Validation { stream, record, reason }) => {
            assert_eq!(stream, 0);
            assert_eq!(record, 4217);
            assert!(reason.contains("reference id 99"), "reason: {reason}");
        }
        other => panic!("expected a validation error, got {other:?}"),
    }
    assert!(elapsed < POLL_INTERVAL, "driver took {elapsed:?} to report the failure");
    assert_eq!(fs::metadata(&output).unwrap().len(), 0, "no output after a failed sort");
    assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0, "runs removed after a failed sort");
}

#[test]
fn test_truncated_record_is_rejected() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("input.bam");
    let mut raw = raw_bam(&encode_reads(&synthetic_reads(500, 1_000, 8)));
    raw.truncate(raw.len() - 10);
    fs::write(&input, bgzf_encode(&raw, 3)).unwrap();

    let config = EngineConfig::default().with_threads(2);
    let result = driver::sort(&input, &dir.path().join("out.bam"), &config);
    match result {
        Err(PipelineError::Validation { record, reason, .. }) => {
            assert_eq!(record, 499);
            assert!(reason.contains("truncated"), "reason: {reason}");
        }
        other => panic!("expected a validation error, got {other:?}"),
    }
}

#[test]
fn test_corrupt_block_is_an_io_error() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("input.bam");
    write_bam(&input, &synthetic_reads(2_000, 1_000, 8), 4);
    let mut bytes = fs::read(&input).unwrap();
    let middle = bytes.len() / 2;
    for b in &mut bytes[middle..middle + 16] {
        *b ^= 0x5a;
    }
    fs::write(&input, bytes).unwrap();

    let config = EngineConfig::default().with_threads(3);
    let result = driver::sort(&input, &dir.path().join("out.bam"), &config);
    assert!(result.is_err());
}

#[test]
fn test_missing_input_is_an_io_error() {
    let dir = TempDir::new().unwrap();
    let result = driver::sort(
        &dir.path().join("missing.bam"),
        &dir.path().join("out.bam"),
        &EngineConfig::default(),
    );
    assert!(matches!(result, Err(PipelineError::Io { .. })));
}

#[test]
fn test_bad_magic_is_a_header_error() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("input.bam");
    let mut raw = raw_bam(&encode_reads(&synthetic_reads(10, 1_000, 8)));
    raw[..4].copy_from_slice(b"CRAM");
    fs::write(&input, bgzf_encode(&raw, 1)).unwrap();

    let config = EngineConfig::default().with_threads(2);
    let result = driver::sort(&input, &dir.path().join("out.bam"), &config);
    assert!(matches!(result, Err(PipelineError::Header { stream: 0, .. })));
}

#[rstest]
#[case(EngineConfig::default().with_threads(0))]
#[case(EngineConfig::default().with_memory(1024))]
#[case(EngineConfig::default().with_input_depth(0))]
#[case(EngineConfig::default().with_compression_level(13))]
fn test_invalid_parameters_are_rejected_up_front(#[case] config: EngineConfig) {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("input.bam");
    write_bam(&input, &synthetic_reads(10, 1_000, 1), 1);
    let result = driver::sort(&input, &dir.path().join("out.bam"), &config);
    assert!(matches!(result, Err(PipelineError::InvalidParameter { .. })));
}
