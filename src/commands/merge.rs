//! Merge sorted BAM or SAM files into one output.

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Parser;
use log::info;

use bamflow_lib::driver;
use bamflow_lib::logging::format_count;

use crate::commands::command::Command;
use crate::commands::common::{EngineOptions, validate_files_exist};

/// Merge sorted BAM/SAM files.
#[derive(Debug, Parser)]
#[command(
    name = "merge",
    about = "\x1b[38;5;72m[MERGE]\x1b[0m  \x1b[36mMerge sorted BAM/SAM files into one sorted file\x1b[0m",
    long_about = r#"
Merge files that are already sorted in the same order into one output.

The header of the first input is written with an updated @HD SO: tag. Records
comparing equal are written in input order.

EXAMPLES:

  bamflow merge -i a.bam -i b.bam -i c.bam -o merged.bam -@ 4
"#
)]
pub struct Merge {
    /// Sorted input files.
    #[arg(short = 'i', long = "input", required = true, num_args = 1..)]
    pub inputs: Vec<PathBuf>,

    /// Output file.
    #[arg(short = 'o', long = "output")]
    pub output: PathBuf,

    #[command(flatten)]
    pub engine: EngineOptions,
}

impl Command for Merge {
    fn execute(&self, _command_line: &str) -> Result<()> {
        if self.inputs.is_empty() {
            bail!("At least one input is required");
        }
        validate_files_exist(&self.inputs, "Input file")?;

        info!("Starting Merge");
        for input in &self.inputs {
            info!("Input: {}", input.display());
        }
        info!("Output: {}", self.output.display());
        self.engine.log();

        let stats = driver::merge(&self.inputs, &self.output, &self.engine.to_config())?;

        info!("=== Summary ===");
        info!("Records merged: {}", format_count(stats.records));
        info!("Output: {}", self.output.display());
        Ok(())
    }
}
