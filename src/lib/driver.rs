//! Top-level `sort` and `merge` runs wired from the engine stages.
//!
//! A sort runs in two phases over two thread pools:
//!
//! 1. decode → block sort → writeback into a small set of temporary streams. Every decoded
//!    buffer becomes one sorted run of rank-framed records. With duplicate marking, the
//!    read-ends containers are flushed and merged on the same pool once the runs are written.
//! 2. Every run is decoded again as its own stream and k-way merged into the output, which gets
//!    the header with an updated sort order, duplicate flags and the codec EOF marker.
//!
//! A merge is phase 2 alone over already sorted inputs.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::info;

use crate::codec::{BgzfCodec, BlockCodec, PlainCodec};
use crate::engine::decode::{BufferReturn, DecodeConfig, DecodeStage, InputStream};
use crate::engine::merge_control::{MergeConfig, MergeStage};
use crate::engine::sort_control::{SortConfig, SortStage};
use crate::engine::writeback::{
    BlockRelease, OutputSink, WriteData, WritebackConfig, WritebackStage,
};
use crate::engine::EnginePool;
use crate::errors::{IoContext, PipelineError, Result};
use crate::format::{AlignmentHeader, InputFormat, RankedFormat, RecordFormat, SortOrder};
use crate::logging::{OperationTimer, format_bytes, format_count};
use crate::metrics::{DuplicationMetrics, MetricsCollector};
use crate::read_ends::{DuplicateSet, ReadEndsCollector};
use crate::temp::{Segment, TempFileProvider};

/// Compression level of the temporary runs.
pub const TEMP_COMPRESSION: u32 = 1;

/// Smallest record footprint assumed when sizing record tables.
const MIN_RECORD_BYTES: usize = 32;

/// Smallest decode buffer handed to a stream.
const MIN_BUFFER_BYTES: usize = 64 * 1024;

/// Uncompressed bytes per merged output buffer.
const MERGE_OUTPUT_BYTES: usize = 4 * 1024 * 1024;

// ============================================================================
// Configuration
// ============================================================================

/// Settings shared by `sort` and `merge`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub threads: usize,
    /// Memory budget for record buffers, in bytes.
    pub memory: usize,
    /// Decompressed blocks in flight per input stream.
    pub input_depth: usize,
    /// Compressed blocks fetched by one read.
    pub blocks_per_read: usize,
    pub compression_level: u32,
    pub temp_streams: usize,
    pub temp_dir: Option<PathBuf>,
    /// Read-ends entries a container holds before it is spilled.
    pub spill_threshold: usize,
    pub order: SortOrder,
    pub input_format: InputFormat,
    pub mark_duplicates: bool,
    pub checksum: bool,
    /// Upper bound of the random sleep taken at every pool-exhaustion point.
    pub exhaustion_jitter: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let threads = std::thread::available_parallelism().map_or(1, std::num::NonZero::get);
        Self {
            threads,
            memory: 768 * 1024 * 1024,
            input_depth: 8,
            blocks_per_read: 16,
            compression_level: 6,
            temp_streams: threads.min(4),
            temp_dir: None,
            spill_threshold: 1_000_000,
            order: SortOrder::Coordinate,
            input_format: InputFormat::Bam,
            mark_duplicates: false,
            checksum: false,
            exhaustion_jitter: None,
        }
    }
}

impl EngineConfig {
    /// Set the worker count; the temp stream count follows it.
    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self.temp_streams = threads.clamp(1, 4);
        self
    }

    #[must_use]
    pub fn with_memory(mut self, memory: usize) -> Self {
        self.memory = memory;
        self
    }

    #[must_use]
    pub fn with_input_depth(mut self, depth: usize) -> Self {
        self.input_depth = depth;
        self
    }

    #[must_use]
    pub fn with_blocks_per_read(mut self, blocks: usize) -> Self {
        self.blocks_per_read = blocks;
        self
    }

    #[must_use]
    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression_level = level;
        self
    }

    #[must_use]
    pub fn with_temp_streams(mut self, streams: usize) -> Self {
        self.temp_streams = streams;
        self
    }

    #[must_use]
    pub fn with_temp_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.temp_dir = dir;
        self
    }

    #[must_use]
    pub fn with_spill_threshold(mut self, entries: usize) -> Self {
        self.spill_threshold = entries;
        self
    }

    #[must_use]
    pub fn with_order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    #[must_use]
    pub fn with_input_format(mut self, format: InputFormat) -> Self {
        self.input_format = format;
        self
    }

    #[must_use]
    pub fn with_mark_duplicates(mut self, enabled: bool) -> Self {
        self.mark_duplicates = enabled;
        self
    }

    #[must_use]
    pub fn with_checksum(mut self, enabled: bool) -> Self {
        self.checksum = enabled;
        self
    }

    #[must_use]
    pub fn with_exhaustion_jitter(mut self, jitter: Duration) -> Self {
        self.exhaustion_jitter = Some(jitter);
        self
    }

    /// Check every value against its allowed range.
    pub fn validate(&self) -> Result<()> {
        let invalid = |parameter: &str, reason: String| {
            Err(PipelineError::InvalidParameter { parameter: parameter.to_string(), reason })
        };
        if self.threads == 0 {
            return invalid("threads", "must be at least 1".to_string());
        }
        if self.memory < 1024 * 1024 {
            let memory = format_bytes(self.memory as u64);
            return invalid("memory", format!("{memory} is below the 1MB minimum"));
        }
        if self.input_depth == 0 {
            return invalid("input_depth", "must be at least 1".to_string());
        }
        if self.blocks_per_read == 0 {
            return invalid("blocks_per_read", "must be at least 1".to_string());
        }
        if self.compression_level > 12 {
            let level = self.compression_level;
            return invalid("compression_level", format!("{level} is outside 0..=12"));
        }
        if self.temp_streams == 0 {
            return invalid("temp_streams", "must be at least 1".to_string());
        }
        if self.spill_threshold == 0 {
            return invalid("spill_threshold", "must be at least 1".to_string());
        }
        if self.mark_duplicates && self.order != SortOrder::Coordinate {
            return invalid("mark_duplicates", "requires coordinate order".to_string());
        }
        Ok(())
    }

    /// Buffers per pool; bounded so memory per buffer stays useful at high thread counts.
    fn buffers(&self) -> usize {
        self.threads.clamp(1, 8)
    }

    /// Bytes per sort buffer: each record lives in a decode, a rewrite and a reorder buffer.
    fn sort_buffer_bytes(&self) -> usize {
        (self.memory / (3 * self.buffers())).max(MIN_BUFFER_BYTES)
    }

    fn output_slots(&self) -> usize {
        2 * self.threads
    }

    /// Codec of the user-facing inputs and outputs.
    fn codec(&self) -> Arc<dyn BlockCodec> {
        match self.input_format {
            InputFormat::Bam => Arc::new(BgzfCodec::new(self.compression_level)),
            InputFormat::Sam => Arc::new(PlainCodec::default()),
        }
    }
}

// ============================================================================
// Results
// ============================================================================

/// Counters of a finished sort.
#[derive(Debug, Clone, Default)]
pub struct SortStats {
    pub records: u64,
    pub runs: u64,
    pub duplicates: u64,
    pub temp_files: usize,
    pub checksums: Vec<u32>,
    pub metrics: Vec<DuplicationMetrics>,
}

/// Counters of a finished merge.
#[derive(Debug, Clone, Default)]
pub struct MergeStats {
    pub records: u64,
    pub checksums: Vec<u32>,
}

// ============================================================================
// Sort
// ============================================================================

/// Sort the file at `input` into `output`.
pub fn sort(input: &Path, output: &Path, config: &EngineConfig) -> Result<SortStats> {
    let reader = File::open(input).with_path(input)?;
    let writer = File::create(output).with_path(output)?;
    let output = OutputSink::new(output, BufWriter::new(writer));
    sort_streams(InputStream::new(input, reader), output, config)
}

/// Output of phase 1.
struct SortedRuns {
    header: Arc<AlignmentHeader>,
    segments: Vec<Segment>,
    records: u64,
    duplicates: Option<Arc<DuplicateSet>>,
}

/// Sort one input stream into `output`.
pub fn sort_streams(
    input: InputStream,
    output: OutputSink,
    config: &EngineConfig,
) -> Result<SortStats> {
    config.validate()?;
    let timer = OperationTimer::new("Sorting");
    let format = config.input_format.record_format();
    let provider = Arc::new(TempFileProvider::new(config.temp_dir.as_deref())?);
    let metrics = Arc::new(MetricsCollector::new());

    let runs = sort_runs(input, &format, &provider, &metrics, config)?;
    info!("Phase 2: merging {} sorted runs", format_count(runs.segments.len() as u64));
    let ranked: Arc<dyn RecordFormat> =
        Arc::new(RankedFormat::new(Arc::clone(&format), (*runs.header).clone()));
    let inputs = runs
        .segments
        .iter()
        .map(|segment| Ok(InputStream::new(&segment.path, segment.open()?)))
        .collect::<Result<Vec<_>>>()?;
    let merged = if inputs.is_empty() {
        write_header_only(format.as_ref(), &runs.header, output, config)?
    } else {
        let buffer_bytes = (config.memory / (2 * inputs.len()))
            .clamp(MIN_BUFFER_BYTES, config.sort_buffer_bytes());
        let run_config = DecodeConfig {
            blocks_per_read: 1,
            input_depth: 2,
            buffers_per_stream: 2,
            buffer_bytes,
            buffer_records: buffer_bytes / MIN_RECORD_BYTES,
        };
        let run_codec: Arc<dyn BlockCodec> = Arc::new(BgzfCodec::new(TEMP_COMPRESSION));
        let duplicates = runs.duplicates.clone();
        merge_decoded(inputs, run_codec, ranked, run_config, output, duplicates, config)?
    };

    let stats = SortStats {
        records: runs.records,
        runs: runs.segments.len() as u64,
        duplicates: runs.duplicates.as_ref().map_or(0, |d| d.count()),
        temp_files: provider.files_created(),
        checksums: merged.checksums,
        metrics: if config.mark_duplicates { metrics.metrics() } else { Vec::new() },
    };
    if merged.records != stats.records {
        return Err(PipelineError::internal(format!(
            "sorted {} records but wrote {}",
            stats.records, merged.records
        )));
    }
    timer.log_completion(stats.records);
    Ok(stats)
}

/// Phase 1: block-sort `input` into runs on temporary files.
fn sort_runs(
    input: InputStream,
    format: &Arc<dyn RecordFormat>,
    provider: &Arc<TempFileProvider>,
    metrics: &Arc<MetricsCollector>,
    config: &EngineConfig,
) -> Result<SortedRuns> {
    info!("Phase 1: sorting blocks of {} with {} threads", input.name.display(), config.threads);
    let pool = EnginePool::new(config.threads, config.exhaustion_jitter)?;
    let scheduler = pool.scheduler();

    let mut files =
        (0..config.temp_streams).map(|_| provider.acquire()).collect::<Result<Vec<_>>>()?;
    let bases: Vec<u64> = files.iter().map(|f| f.len()).collect();
    let sinks = files
        .iter()
        .map(|f| Ok(OutputSink::new(f.path(), f.writer()?)))
        .collect::<Result<Vec<_>>>()?;
    let writeback = WritebackStage::new(
        Arc::new(BgzfCodec::new(TEMP_COMPRESSION)),
        sinks,
        WritebackConfig { checksum: false, write_eof: false, output_slots: config.output_slots() },
        scheduler,
    )?;

    let read_ends = if config.mark_duplicates {
        let collector = ReadEndsCollector::new(
            Arc::clone(format),
            Arc::clone(provider),
            config.spill_threshold,
            metrics.clone(),
            scheduler,
        )?;
        Some(collector)
    } else {
        None
    };

    let buffer_bytes = config.sort_buffer_bytes();
    let buffer_records = (buffer_bytes / MIN_RECORD_BYTES).max(1);
    let parts = config.threads;
    let sort_config = SortConfig {
        order: config.order,
        parts,
        fragment_buffers: config.buffers(),
        bytes_per_part: buffer_bytes.div_ceil(parts),
        records_per_part: buffer_records.div_ceil(parts),
        frame_ranks: true,
    };
    let sort = SortStage::new(
        Arc::clone(format),
        sort_config,
        Arc::clone(&writeback),
        read_ends.clone(),
        scheduler,
    )?;
    let decode_config = DecodeConfig {
        blocks_per_read: config.blocks_per_read,
        input_depth: config.input_depth,
        buffers_per_stream: config.buffers(),
        buffer_bytes,
        buffer_records,
    };
    let decode = DecodeStage::new(
        vec![input],
        config.codec(),
        Arc::clone(format),
        decode_config,
        sort.clone(),
        scheduler,
    )?;
    let release: Weak<dyn BlockRelease> = Arc::downgrade(&sort) as _;
    writeback.connect_release(release)?;
    let upstream: Weak<dyn BufferReturn> = Arc::downgrade(&decode) as _;
    sort.connect_upstream(upstream)?;

    decode.start(scheduler);
    pool.wait(&writeback.completion())?;
    let records = sort.records();
    let header =
        sort.header().ok_or_else(|| PipelineError::internal("sort finished without a header"))?;
    info!("Sorted {} records into {} runs", format_count(records), format_count(sort.runs()));

    let duplicates = match &read_ends {
        Some(collector) => {
            pool.wait(&*collector.flush(scheduler)?)?;
            pool.wait(&*collector.merge(records, scheduler)?)?;
            let duplicates = collector.duplicates();
            if let Some(d) = &duplicates {
                info!("Marked {} duplicate records", format_count(d.count()));
            }
            duplicates
        }
        None => None,
    };
    pool.join()?;

    let summary = writeback.summary()?;
    for (file, &len) in files.iter_mut().zip(&summary.stream_lengths) {
        file.record_external_append(len);
    }
    let segments = (0..sort.runs())
        .map(|run| {
            let extent = summary
                .block_extent(run)
                .ok_or_else(|| {
                    PipelineError::internal(format!("no location recorded for run {run}"))
                })?;
            Ok(files[extent.stream].segment(bases[extent.stream] + extent.offset, extent.len))
        })
        .collect::<Result<Vec<_>>>()?;
    for file in files {
        provider.release(file)?;
    }
    Ok(SortedRuns { header, segments, records, duplicates })
}

/// Output of an input without records: the header and the EOF marker.
fn write_header_only(
    format: &dyn RecordFormat,
    header: &AlignmentHeader,
    output: OutputSink,
    config: &EngineConfig,
) -> Result<MergeStats> {
    let pool = EnginePool::new(1, None)?;
    let scheduler = pool.scheduler();
    let writeback = WritebackStage::new(
        config.codec(),
        vec![output],
        WritebackConfig { checksum: config.checksum, write_eof: true, output_slots: 1 },
        scheduler,
    )?;
    let header = header.with_sort_order(config.order.header_value());
    writeback.submit(0, WriteData::Bytes(format.header_bytes(&header)), scheduler)?;
    writeback.finish(1, scheduler)?;
    pool.wait(&writeback.completion())?;
    pool.join()?;
    let summary = writeback.summary()?;
    Ok(MergeStats { records: 0, checksums: summary.checksum(0).into_iter().collect() })
}

// ============================================================================
// Merge
// ============================================================================

/// Merge the sorted files in `inputs` into `output`.
pub fn merge(inputs: &[PathBuf], output: &Path, config: &EngineConfig) -> Result<MergeStats> {
    let streams = inputs
        .iter()
        .map(|path| Ok(InputStream::new(path, File::open(path).with_path(path)?)))
        .collect::<Result<Vec<_>>>()?;
    let writer = File::create(output).with_path(output)?;
    merge_streams(streams, OutputSink::new(output, BufWriter::new(writer)), config)
}

/// Merge sorted input streams into `output`; the header comes from the first input.
pub fn merge_streams(
    inputs: Vec<InputStream>,
    output: OutputSink,
    config: &EngineConfig,
) -> Result<MergeStats> {
    config.validate()?;
    let timer = OperationTimer::new("Merging");
    info!("Merging {} inputs with {} threads", inputs.len(), config.threads);
    let buffer_bytes = (config.memory / (2 * inputs.len().max(1)))
        .clamp(MIN_BUFFER_BYTES, config.sort_buffer_bytes());
    let decode_config = DecodeConfig {
        blocks_per_read: config.blocks_per_read,
        input_depth: config.input_depth,
        buffers_per_stream: 2,
        buffer_bytes,
        buffer_records: buffer_bytes / MIN_RECORD_BYTES,
    };
    let stats = merge_decoded(
        inputs,
        config.codec(),
        config.input_format.record_format(),
        decode_config,
        output,
        None,
        config,
    )?;
    timer.log_completion(stats.records);
    Ok(stats)
}

/// K-way merge of decoded streams through writeback into `output`.
fn merge_decoded(
    inputs: Vec<InputStream>,
    codec: Arc<dyn BlockCodec>,
    format: Arc<dyn RecordFormat>,
    decode_config: DecodeConfig,
    output: OutputSink,
    duplicates: Option<Arc<DuplicateSet>>,
    config: &EngineConfig,
) -> Result<MergeStats> {
    let pool = EnginePool::new(config.threads, config.exhaustion_jitter)?;
    let scheduler = pool.scheduler();
    let writeback = WritebackStage::new(
        config.codec(),
        vec![output],
        WritebackConfig {
            checksum: config.checksum,
            write_eof: true,
            output_slots: config.output_slots(),
        },
        scheduler,
    )?;
    let merge_config = MergeConfig {
        order: config.order,
        output_buffers: config.buffers() + 1,
        output_bytes: MERGE_OUTPUT_BYTES,
        output_records: MERGE_OUTPUT_BYTES / MIN_RECORD_BYTES,
    };
    let merge = MergeStage::new(
        Arc::clone(&format),
        inputs.len(),
        merge_config,
        Arc::clone(&writeback),
        duplicates,
        scheduler,
    )?;
    let decode = DecodeStage::new(inputs, codec, format, decode_config, merge.clone(), scheduler)?;
    let release: Weak<dyn BlockRelease> = Arc::downgrade(&merge) as _;
    writeback.connect_release(release)?;
    let upstream: Weak<dyn BufferReturn> = Arc::downgrade(&decode) as _;
    merge.connect_upstream(upstream)?;

    decode.start(scheduler);
    pool.wait(&writeback.completion())?;
    pool.join()?;

    let summary = writeback.summary()?;
    let checksums = summary.checksums.values().map(|&(crc, _)| crc).collect();
    Ok(MergeStats { records: merge.records(), checksums })
}
