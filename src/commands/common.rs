//! Common CLI options shared across commands.
//!
//! Shared argument structures are composed into command structs using `#[command(flatten)]`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Args;
use log::info;

use bamflow_lib::driver::EngineConfig;
use bamflow_lib::format::{InputFormat, SortOrder};
use bamflow_lib::logging::format_bytes;

/// Engine sizing options.
#[derive(Debug, Clone, Args)]
pub struct EngineOptions {
    /// Number of worker threads.
    #[arg(short = '@', short_alias = 't', long = "threads", default_value = "1")]
    pub threads: usize,

    /// Total memory for record buffers.
    ///
    /// Accepts values like "512M", "1G", "2G".
    #[arg(short = 'm', long = "max-memory", default_value = "768M", value_parser = parse_memory)]
    pub max_memory: usize,

    /// Decompressed blocks kept in flight per input.
    #[arg(long = "input-depth", default_value = "8")]
    pub input_depth: usize,

    /// Record order.
    #[arg(long = "order", value_enum, default_value = "coordinate")]
    pub order: SortOrder,

    /// Input (and output) container format.
    #[arg(long = "input-format", value_enum, default_value = "bam")]
    pub input_format: InputFormat,

    /// Compute a CRC32 of every output block.
    #[arg(long = "checksum", default_value = "false")]
    pub checksum: bool,

    /// Sleep up to this many microseconds whenever a buffer pool runs dry (for testing).
    #[arg(long = "exhaustion-jitter-us", hide = true)]
    pub exhaustion_jitter_us: Option<u64>,

    #[command(flatten)]
    pub compression: CompressionOptions,
}

impl EngineOptions {
    /// Build the engine configuration from the options.
    pub fn to_config(&self) -> EngineConfig {
        let mut config = EngineConfig::default()
            .with_threads(self.threads)
            .with_memory(self.max_memory)
            .with_input_depth(self.input_depth)
            .with_order(self.order)
            .with_input_format(self.input_format)
            .with_checksum(self.checksum)
            .with_compression_level(self.compression.compression_level);
        if let Some(us) = self.exhaustion_jitter_us {
            config = config.with_exhaustion_jitter(Duration::from_micros(us));
        }
        config
    }

    /// Log the settings at the start of a run.
    pub fn log(&self) {
        info!("Threads: {}", self.threads);
        info!("Max memory: {}", format_bytes(self.max_memory as u64));
        info!("Order: {}", self.order);
        info!("Format: {:?}", self.input_format);
    }
}

/// Output compression options.
#[derive(Debug, Clone, Args)]
pub struct CompressionOptions {
    /// Compression level for output BAM (0-12).
    ///
    /// Level 1 is fastest with larger files.
    /// Level 12 produces smallest files but is slowest.
    #[arg(long, default_value_t = 6, value_parser = clap::value_parser!(u32).range(0..=12))]
    pub compression_level: u32,
}

/// Parse a memory size string (e.g. "512M", "1G", "64K" or plain bytes).
pub fn parse_memory(s: &str) -> Result<usize, String> {
    let s = s.trim().to_uppercase();
    if s.is_empty() {
        return Err("Empty memory specification".to_string());
    }
    let (num_str, multiplier) = if let Some(n) = s.strip_suffix('G') {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('M') {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('K') {
        (n, 1024)
    } else {
        (s.as_str(), 1)
    };
    let num: f64 = num_str.parse().map_err(|_| format!("Invalid number: {num_str}"))?;
    if num <= 0.0 {
        return Err("Memory size must be positive".to_string());
    }
    Ok((num * f64::from(multiplier)) as usize)
}

/// Fail when `path` does not exist.
pub fn validate_file_exists(path: &Path, description: &str) -> Result<()> {
    if !path.exists() {
        bail!("{description} does not exist: {}", path.display());
    }
    Ok(())
}

/// Fail when any of `paths` does not exist.
pub fn validate_files_exist(paths: &[PathBuf], description: &str) -> Result<()> {
    for path in paths {
        validate_file_exists(path, description)?;
    }
    Ok(())
}
