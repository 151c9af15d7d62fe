//! Duplicate marking during a coordinate sort.

use std::collections::BTreeMap;

use bamflow_lib::driver::{self, EngineConfig};
use bamflow_lib::errors::PipelineError;
use bamflow_lib::format::SortOrder;
use rstest::rstest;
use tempfile::TempDir;

use crate::helpers::assertions::{coordinate_key, duplicate_names, read_bam};
use crate::helpers::bam_generator::{synthetic_reads, write_bam};

const READS: usize = 4_000;

fn marked_sort(dir: &TempDir, threads: usize, spill_threshold: usize) -> (Vec<String>, u64) {
    let input = dir.path().join("input.bam");
    if !input.exists() {
        // Few distinct positions, so most reads collide.
        write_bam(&input, &synthetic_reads(READS, 400, 17), 9);
    }
    let output = dir.path().join(format!("marked_{threads}_{spill_threshold}.bam"));
    let config = EngineConfig::default()
        .with_threads(threads)
        .with_memory(1024 * 1024)
        .with_mark_duplicates(true)
        .with_spill_threshold(spill_threshold)
        .with_temp_dir(Some(dir.path().to_path_buf()));
    let stats = driver::sort(&input, &output, &config).unwrap();
    let mut names = duplicate_names(&read_bam(&output).1);
    names.sort();
    (names, stats.duplicates)
}

#[rstest]
#[case(1, 1_000_000)]
#[case(4, 100)]
#[case(8, 7)]
fn test_duplicates_do_not_depend_on_threads_or_spilling(
    #[case] threads: usize,
    #[case] spill: usize,
) {
    let dir = TempDir::new().unwrap();
    let (baseline, baseline_count) = marked_sort(&dir, 2, 1_000_000);
    let (names, count) = marked_sort(&dir, threads, spill);

    assert!(!baseline.is_empty());
    assert_eq!(baseline.len() as u64, baseline_count);
    assert_eq!(count, baseline_count);
    assert_eq!(names, baseline);
}

#[test]
fn test_one_read_kept_per_position_and_strand() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("input.bam");
    let output = dir.path().join("marked.bam");
    write_bam(&input, &synthetic_reads(READS, 400, 23), 9);

    let config = EngineConfig::default()
        .with_threads(4)
        .with_memory(1024 * 1024)
        .with_mark_duplicates(true);
    let stats = driver::sort(&input, &output, &config).unwrap();

    let records = read_bam(&output).1;
    let mut kept: BTreeMap<(usize, usize, bool), usize> = BTreeMap::new();
    let mut unmapped_duplicates = 0;
    for record in &records {
        if record.flags().is_unmapped() {
            unmapped_duplicates += usize::from(record.flags().is_duplicate());
            continue;
        }
        let entry = kept.entry(coordinate_key(record)).or_default();
        if !record.flags().is_duplicate() {
            *entry += 1;
        }
    }
    assert_eq!(unmapped_duplicates, 0);
    assert!(kept.values().all(|&n| n == 1), "every position keeps exactly one read");

    let mapped = records.iter().filter(|r| !r.flags().is_unmapped()).count() as u64;
    assert_eq!(stats.duplicates, mapped - kept.len() as u64);

    assert_eq!(stats.metrics.len(), 1);
    let metrics = &stats.metrics[0];
    assert_eq!(metrics.library, "lib1");
    assert_eq!(metrics.unpaired_reads_examined, mapped);
    assert_eq!(metrics.unpaired_read_duplicates, stats.duplicates);
    assert_eq!(metrics.unmapped_reads, records.len() as u64 - mapped);
}

#[test]
fn test_duplicate_marking_requires_coordinate_order() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("input.bam");
    write_bam(&input, &synthetic_reads(10, 100, 1), 1);

    let config =
        EngineConfig::default().with_mark_duplicates(true).with_order(SortOrder::Queryname);
    let result = driver::sort(&input, &dir.path().join("out.bam"), &config);
    assert!(matches!(result, Err(PipelineError::InvalidParameter { .. })));
}
