//! Sort a BAM or SAM file.
//!
//! Each buffer of input records is sorted in parallel and written as a run to temporary files;
//! the runs are then k-way merged into the output. With `--mark-duplicates` the duplicate flag
//! is set on the merged records and per-library duplication metrics can be written.

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Parser;
use log::info;

use bamflow_lib::driver;
use bamflow_lib::logging::format_count;
use bamflow_lib::metrics::write_metrics;

use crate::commands::command::Command;
use crate::commands::common::{EngineOptions, validate_file_exists};

/// Sort a BAM/SAM file.
#[derive(Debug, Parser)]
#[command(
    name = "sort",
    about = "\x1b[38;5;72m[SORT]\x1b[0m   \x1b[36mSort a BAM/SAM file by coordinate or queryname\x1b[0m",
    long_about = r#"
Sort a BAM or SAM file with a parallel block sort followed by a k-way merge.

PHASES:

  1. The input is decoded in parallel, cut into buffers that fit the memory
     budget and every buffer is sorted by all threads. Sorted buffers are written
     as runs to temporary files.
  2. All runs are merged into the output, which gets an updated @HD SO: tag.

DUPLICATE MARKING:

  With --mark-duplicates (coordinate order only) read ends are collected while
  sorting, spilled to disk and merged between the two phases. Duplicates get the
  0x400 flag in the output and --metrics writes per-library duplication metrics.

EXAMPLES:

  bamflow sort -i input.bam -o sorted.bam -@ 8 -m 4G
  bamflow sort -i input.bam -o marked.bam --mark-duplicates --metrics dups.txt
  bamflow sort -i input.sam -o sorted.sam --input-format sam --order queryname
"#
)]
pub struct Sort {
    /// Input file.
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,

    /// Output file.
    #[arg(short = 'o', long = "output")]
    pub output: PathBuf,

    /// Temporary directory for sorted runs and read-ends spills.
    #[arg(short = 'T', long = "tmp-dir")]
    pub tmp_dir: Option<PathBuf>,

    /// Number of temporary files the runs are spread across.
    #[arg(long = "temp-streams")]
    pub temp_streams: Option<usize>,

    /// Mark duplicate reads while sorting.
    #[arg(long = "mark-duplicates", default_value = "false")]
    pub mark_duplicates: bool,

    /// Write duplication metrics to this file (requires --mark-duplicates).
    #[arg(long = "metrics")]
    pub metrics: Option<PathBuf>,

    /// Read-ends entries held per container before it is spilled to disk.
    #[arg(long = "spill-threshold", default_value = "1000000")]
    pub spill_threshold: usize,

    #[command(flatten)]
    pub engine: EngineOptions,
}

impl Command for Sort {
    fn execute(&self, _command_line: &str) -> Result<()> {
        validate_file_exists(&self.input, "Input file")?;
        if self.metrics.is_some() && !self.mark_duplicates {
            bail!("--metrics requires --mark-duplicates");
        }

        info!("Starting Sort");
        info!("Input: {}", self.input.display());
        info!("Output: {}", self.output.display());
        self.engine.log();
        if let Some(ref tmp) = self.tmp_dir {
            info!("Temp directory: {}", tmp.display());
        }

        let mut config = self
            .engine
            .to_config()
            .with_temp_dir(self.tmp_dir.clone())
            .with_mark_duplicates(self.mark_duplicates)
            .with_spill_threshold(self.spill_threshold);
        if let Some(streams) = self.temp_streams {
            config = config.with_temp_streams(streams);
        }

        let stats = driver::sort(&self.input, &self.output, &config)?;

        info!("=== Summary ===");
        info!("Records sorted: {}", format_count(stats.records));
        info!("Sorted runs: {}", format_count(stats.runs));
        info!("Temporary files: {}", stats.temp_files);
        if self.mark_duplicates {
            info!("Duplicates marked: {}", format_count(stats.duplicates));
        }
        if let Some(crc) = stats.checksums.first() {
            info!("Output block checksums: {} (first {crc:08x})", stats.checksums.len());
        }
        if let Some(path) = &self.metrics {
            write_metrics(path, stats.metrics)?;
        }
        info!("Output: {}", self.output.display());
        Ok(())
    }
}
