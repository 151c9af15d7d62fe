//! End-to-end sorting of BAM and SAM inputs.

use std::time::Duration;

use bamflow_lib::driver::{self, EngineConfig};
use bamflow_lib::format::{InputFormat, SortOrder};
use rstest::rstest;
use tempfile::TempDir;

use crate::helpers::assertions::{
    assert_coordinate_sorted, name, read_bam, read_sam, sam_coordinate_key,
};
use crate::helpers::bam_generator::{REFERENCES, synthetic_reads, write_bam, write_sam};

fn config(dir: &TempDir, threads: usize, memory: usize) -> EngineConfig {
    EngineConfig::default()
        .with_threads(threads)
        .with_memory(memory)
        .with_temp_dir(Some(dir.path().to_path_buf()))
}

#[test]
fn test_sort_uneven_blocks_with_four_threads() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("input.bam");
    let output = dir.path().join("sorted.bam");
    let reads = synthetic_reads(10_000, 100_000, 42);
    write_bam(&input, &reads, 37);

    let stats = driver::sort(&input, &output, &config(&dir, 4, 4 * 1024 * 1024)).unwrap();

    assert_eq!(stats.records, 10_000);
    assert!(stats.runs > 1, "expected several runs, got {}", stats.runs);
    let (header, records) = read_bam(&output);
    assert!(header.contains("SO:coordinate"), "header: {header}");
    assert_eq!(records.len(), 10_000);
    assert_coordinate_sorted(&records);

    let mut expected: Vec<String> = reads.iter().map(|r| r.name.clone()).collect();
    let mut actual: Vec<String> = records.iter().map(name).collect();
    expected.sort();
    actual.sort();
    assert_eq!(actual, expected);
}

#[rstest]
#[case(1)]
#[case(2)]
#[case(8)]
fn test_output_order_does_not_depend_on_thread_count(#[case] threads: usize) {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("input.bam");
    write_bam(&input, &synthetic_reads(5_000, 2_000, 7), 11);

    let baseline = dir.path().join("baseline.bam");
    driver::sort(&input, &baseline, &config(&dir, 3, 2 * 1024 * 1024)).unwrap();
    let output = dir.path().join("sorted.bam");
    driver::sort(&input, &output, &config(&dir, threads, 2 * 1024 * 1024)).unwrap();

    let expected: Vec<String> = read_bam(&baseline).1.iter().map(name).collect();
    let actual: Vec<String> = read_bam(&output).1.iter().map(name).collect();
    assert_eq!(actual, expected);
}

/// Random sleeps on pool exhaustion shake out lost wake-ups and ordering races.
#[test]
fn test_repeated_sorts_with_exhaustion_jitter() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("input.bam");
    write_bam(&input, &synthetic_reads(10_000, 100_000, 3), 37);

    for iteration in 0..100 {
        let output = dir.path().join(format!("sorted_{iteration}.bam"));
        let cfg = config(&dir, 4, 2 * 1024 * 1024)
            .with_input_depth(2)
            .with_blocks_per_read(1)
            .with_exhaustion_jitter(Duration::from_micros(50));
        let stats = driver::sort(&input, &output, &cfg).unwrap();
        assert_eq!(stats.records, 10_000, "iteration {iteration}");
        let records = read_bam(&output).1;
        assert_eq!(records.len(), 10_000, "iteration {iteration}");
        assert_coordinate_sorted(&records);
        std::fs::remove_file(&output).unwrap();
    }
}

#[test]
fn test_sort_by_queryname() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("input.bam");
    let output = dir.path().join("sorted.bam");
    let mut reads = synthetic_reads(2_000, 10_000, 11);
    reads.reverse();
    write_bam(&input, &reads, 5);

    let cfg = config(&dir, 2, 1024 * 1024).with_order(SortOrder::Queryname);
    driver::sort(&input, &output, &cfg).unwrap();

    let (header, records) = read_bam(&output);
    assert!(header.contains("SO:queryname"), "header: {header}");
    let names: Vec<String> = records.iter().map(name).collect();
    assert_eq!(names.len(), 2_000);
    assert!(names.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_sort_sam_text() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("input.sam");
    let output = dir.path().join("sorted.sam");
    let reads = synthetic_reads(4_000, 20_000, 5);
    write_sam(&input, &reads);

    let cfg = config(&dir, 4, 1024 * 1024).with_input_format(InputFormat::Sam);
    let stats = driver::sort(&input, &output, &cfg).unwrap();

    assert_eq!(stats.records, 4_000);
    let (header, lines) = read_sam(&output);
    assert!(header[0].contains("SO:coordinate"), "header: {header:?}");
    assert_eq!(header.len(), 5);
    assert_eq!(lines.len(), 4_000);
    let keys: Vec<_> = lines.iter().map(|l| sam_coordinate_key(l, &REFERENCES)).collect();
    assert!(keys.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn test_sort_header_only_input() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("input.bam");
    let output = dir.path().join("sorted.bam");
    write_bam(&input, &[], 1);

    let stats = driver::sort(&input, &output, &config(&dir, 2, 1024 * 1024)).unwrap();

    assert_eq!(stats.records, 0);
    assert_eq!(stats.runs, 0);
    let (header, records) = read_bam(&output);
    assert!(header.contains("SO:coordinate"));
    assert!(records.is_empty());
}

#[test]
fn test_sort_reports_block_checksums() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("input.bam");
    let output = dir.path().join("sorted.bam");
    write_bam(&input, &synthetic_reads(1_000, 10_000, 9), 3);

    let plain = driver::sort(&input, &output, &config(&dir, 2, 1024 * 1024)).unwrap();
    assert!(plain.checksums.is_empty());

    let checked =
        driver::sort(&input, &output, &config(&dir, 2, 1024 * 1024).with_checksum(true)).unwrap();
    assert!(!checked.checksums.is_empty());
    let cfg = config(&dir, 4, 1024 * 1024).with_checksum(true);
    let again = driver::sort(&input, &output, &cfg).unwrap();
    assert_eq!(again.checksums, checked.checksums);
}

#[test]
fn test_temp_files_are_removed() {
    let dir = TempDir::new().unwrap();
    let temp = TempDir::new().unwrap();
    let input = dir.path().join("input.bam");
    let output = dir.path().join("sorted.bam");
    write_bam(&input, &synthetic_reads(3_000, 10_000, 13), 4);

    let cfg = config(&dir, 4, 1024 * 1024).with_temp_dir(Some(temp.path().to_path_buf()));
    let stats = driver::sort(&input, &output, &cfg).unwrap();

    assert!(stats.temp_files > 0);
    assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
}
