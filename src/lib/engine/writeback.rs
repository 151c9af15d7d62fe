//! Writeback pipeline: compress → write → checksum/index, ending in a sentinel write.
//!
//! ```text
//! submit(id, data) ─▶ SequencingQueue ─▶ sub-blocks (≤ max block size, never spanning parts)
//!                                              │ compress heap keyed (block, sub)
//!                                              ▼
//!                           Compress (needs an output slot) ──▶ Checksum (optional)
//!                                              │
//!                                              ▼
//!                 write cursor (block, sub) ─▶ per-stream FIFO ─▶ Write ─▶ Index
//! ```
//!
//! A block is assigned to the least used output stream when its first sub-block reaches the
//! write cursor and all its sub-blocks go to that stream, so every block occupies one
//! contiguous byte range of one stream. A block's data is released once every write, index and
//! checksum part has arrived. When the input is finished and the last block is released, a
//! sentinel write flushes every stream, appends the codec EOF marker if requested and raises the
//! completion flag.

use std::collections::{BTreeMap, VecDeque};
use std::io::Write;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crc32fast::Hasher;
use crossbeam_queue::SegQueue;
use log::debug;
use parking_lot::Mutex;

use super::request::Request;
use super::{Scheduler, Upstream, get_or_stall, misrouted, put_and_wake, submit};
use crate::buffer::FragmentBuffer;
use crate::codec::BlockCodec;
use crate::errors::{IoContext, PipelineError, Result};
use crate::fanin::{FanInSlot, SerialGate};
use crate::pool::{FreeList, Lease};
use crate::sequencer::{Keyed, PendingHeap, SequencingQueue};
use crate::thread_pool::{CompletionFlag, Dispatcher, DispatcherId};

/// Content of one output block.
pub enum WriteData {
    /// A pooled buffer returned upstream through [`BlockRelease`] once written.
    Buffer(Lease<FragmentBuffer>),
    /// Owned bytes, dropped once written.
    Bytes(Vec<u8>),
}

impl WriteData {
    fn part(&self, index: usize) -> &[u8] {
        match self {
            Self::Buffer(buffer) => buffer.fragments.get(index).map_or(&[], |f| f.bytes()),
            Self::Bytes(bytes) if index == 0 => bytes,
            Self::Bytes(_) => &[],
        }
    }

    fn part_lengths(&self) -> Vec<usize> {
        match self {
            Self::Buffer(buffer) => buffer.parts().map(<[u8]>::len).collect(),
            Self::Bytes(bytes) => vec![bytes.len()],
        }
    }
}

/// Capability to take back a written buffer.
pub trait BlockRelease: Send + Sync {
    fn block_released(&self, buffer: Lease<FragmentBuffer>, scheduler: &Scheduler) -> Result<()>;
}

/// One destination stream.
pub struct OutputSink {
    pub name: PathBuf,
    pub writer: Box<dyn Write + Send>,
}

impl OutputSink {
    pub fn new(name: impl Into<PathBuf>, writer: impl Write + Send + 'static) -> Self {
        Self { name: name.into(), writer: Box::new(writer) }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WritebackConfig {
    /// Compute CRC32 of every uncompressed sub-block.
    pub checksum: bool,
    /// Append the codec EOF marker to every stream at the end.
    pub write_eof: bool,
    /// Compressed sub-blocks that may be in flight.
    pub output_slots: usize,
}

/// Where one compressed sub-block landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLocation {
    pub block: u64,
    pub sub: usize,
    pub stream: usize,
    pub offset: u64,
    pub compressed: usize,
    pub uncompressed: usize,
}

/// Byte range a whole block occupies on its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockExtent {
    pub stream: usize,
    pub offset: u64,
    pub len: u64,
}

/// Result of a completed writeback.
#[derive(Debug, Default)]
pub struct WritebackSummary {
    /// Sub-block locations in `(block, sub)` order.
    pub locations: Vec<BlockLocation>,
    /// Combined CRC32 and uncompressed length per block, when checksums were requested.
    pub checksums: BTreeMap<u64, (u32, u64)>,
    /// Bytes written per stream, including any EOF marker.
    pub stream_lengths: Vec<u64>,
}

impl WritebackSummary {
    /// Byte range of `block`, or `None` for an empty or unknown block.
    #[must_use]
    pub fn block_extent(&self, block: u64) -> Option<BlockExtent> {
        let start = self.locations.partition_point(|l| l.block < block);
        let end = self.locations.partition_point(|l| l.block <= block);
        if start >= end {
            return None;
        }
        let (first, last) = (&self.locations[start], &self.locations[end - 1]);
        Some(BlockExtent {
            stream: first.stream,
            offset: first.offset,
            len: last.offset + last.compressed as u64 - first.offset,
        })
    }

    /// Combined CRC32 of the uncompressed content of `block`.
    #[must_use]
    pub fn checksum(&self, block: u64) -> Option<u32> {
        self.checksums.get(&block).map(|&(crc, _)| crc)
    }
}

// ============================================================================
// Jobs
// ============================================================================

struct BlockState {
    id: u64,
    subs: usize,
    data: FanInSlot<WriteData>,
}

/// A sub-block waiting for an output slot.
struct PendingSub {
    block: Arc<BlockState>,
    sub: usize,
    part: usize,
    range: Range<usize>,
}

impl Keyed for PendingSub {
    type Key = (u64, usize);

    fn key(&self) -> (u64, usize) {
        (self.block.id, self.sub)
    }
}

pub struct CompressJob {
    pending: PendingSub,
    out: Lease<Vec<u8>>,
}

pub struct ChecksumJob {
    block: Arc<BlockState>,
    sub: usize,
    part: usize,
    range: Range<usize>,
}

pub enum WriteJob {
    /// Drain the queue of one output stream.
    Stream(usize),
    /// Flush all streams and signal completion.
    Sentinel,
}

pub struct IndexJob {
    block: Arc<BlockState>,
    location: BlockLocation,
}

/// A compressed sub-block waiting for the write cursor; `data` is `None` for an empty block.
struct Compressed {
    block: Arc<BlockState>,
    sub: usize,
    uncompressed: usize,
    data: Option<Lease<Vec<u8>>>,
}

impl Keyed for Compressed {
    type Key = (u64, usize);

    fn key(&self) -> (u64, usize) {
        (self.block.id, self.sub)
    }
}

struct StreamQueue {
    queue: VecDeque<Compressed>,
    uses: u64,
}

struct Sink {
    name: PathBuf,
    writer: Box<dyn Write + Send>,
    offset: u64,
}

struct WriteCursor {
    block: u64,
    sub: usize,
    /// Stream the block under the cursor was assigned to.
    stream: usize,
    ready: PendingHeap<Compressed>,
}

// ============================================================================
// WritebackStage
// ============================================================================

/// Compression and ordered output for one destination.
pub struct WritebackStage {
    id: DispatcherId,
    codec: Arc<dyn BlockCodec>,
    config: WritebackConfig,
    release: Upstream<dyn BlockRelease>,
    incoming: Mutex<SequencingQueue<WriteData>>,
    pending: Mutex<PendingHeap<PendingSub>>,
    output_pool: FreeList<Vec<u8>>,
    output_stalled: AtomicBool,
    cursor: Mutex<WriteCursor>,
    queues: Vec<Mutex<StreamQueue>>,
    gates: Vec<SerialGate>,
    sinks: Vec<Mutex<Sink>>,
    locations: SegQueue<BlockLocation>,
    checksums: Mutex<BTreeMap<(u64, usize), Hasher>>,
    /// Blocks accepted from `incoming` whose data has not been released yet.
    live: AtomicUsize,
    /// Number of blocks, once [`WritebackStage::finish`] was called.
    total: Mutex<Option<u64>>,
    sentinel_fired: AtomicBool,
    done: Arc<CompletionFlag>,
}

impl WritebackStage {
    /// Build the stage over `sinks` and register its dispatcher.
    pub fn new(
        codec: Arc<dyn BlockCodec>,
        sinks: Vec<OutputSink>,
        config: WritebackConfig,
        scheduler: &Scheduler,
    ) -> Result<Arc<Self>> {
        if sinks.is_empty() {
            return Err(PipelineError::InvalidParameter {
                parameter: "output streams".to_string(),
                reason: "at least one output stream is required".to_string(),
            });
        }
        let max_block = codec.max_block_size();
        let streams = sinks.len();
        let id = scheduler.next_dispatcher_id();
        let stage = Arc::new(Self {
            id,
            codec,
            config,
            release: Upstream::default(),
            incoming: Mutex::new(SequencingQueue::new()),
            pending: Mutex::new(PendingHeap::new()),
            output_pool: FreeList::new(config.output_slots.max(1), || {
                Vec::with_capacity(max_block)
            }),
            output_stalled: AtomicBool::new(false),
            cursor: Mutex::new(WriteCursor {
                block: 0,
                sub: 0,
                stream: 0,
                ready: PendingHeap::new(),
            }),
            queues: (0..streams)
                .map(|_| Mutex::new(StreamQueue { queue: VecDeque::new(), uses: 0 }))
                .collect(),
            gates: (0..streams).map(|_| SerialGate::new()).collect(),
            sinks: sinks
                .into_iter()
                .map(|s| Mutex::new(Sink { name: s.name, writer: s.writer, offset: 0 }))
                .collect(),
            locations: SegQueue::new(),
            checksums: Mutex::new(BTreeMap::new()),
            live: AtomicUsize::new(0),
            total: Mutex::new(None),
            sentinel_fired: AtomicBool::new(false),
            done: scheduler.completion_flag(),
        });
        scheduler.register(id, stage.clone())?;
        Ok(stage)
    }

    /// Link the stage that takes written buffers back.
    pub fn connect_release(&self, release: std::sync::Weak<dyn BlockRelease>) -> Result<()> {
        self.release.connect(release)
    }

    /// Flag raised after the sentinel write.
    #[must_use]
    pub fn completion(&self) -> Arc<CompletionFlag> {
        Arc::clone(&self.done)
    }

    /// Queue block `id`. Blocks are written in id order, starting at zero with no gaps.
    pub fn submit(&self, id: u64, data: WriteData, scheduler: &Scheduler) -> Result<()> {
        if self.total.lock().is_some_and(|total| id >= total) {
            let message = format!("writeback block {id} is beyond the finished total");
            return Err(PipelineError::internal(message));
        }
        let ready = {
            let mut incoming = self.incoming.lock();
            incoming.push(id, data)?;
            let mut ready = Vec::new();
            while let Some(data) = incoming.pop_next() {
                ready.push((incoming.next_id() - 1, data));
            }
            ready
        };
        for (block, data) in ready {
            self.accept(block, data, scheduler)?;
        }
        Ok(())
    }

    /// Blocks `0..total` make up the whole output. Blocks still in flight may be submitted after
    /// this call; the sentinel waits until every one of them has been written.
    pub fn finish(&self, total: u64, scheduler: &Scheduler) -> Result<()> {
        let accepted = self.incoming.lock().next_id();
        if accepted > total {
            return Err(PipelineError::internal(format!(
                "writeback accepted {accepted} blocks but expected {total}"
            )));
        }
        {
            let mut slot = self.total.lock();
            if slot.is_some() {
                return Err(PipelineError::internal("writeback finished twice"));
            }
            *slot = Some(total);
        }
        debug!("Writeback input finished after {total} blocks");
        self.check_sentinel(scheduler);
        Ok(())
    }

    /// Everything written, once the completion flag is set.
    pub fn summary(&self) -> Result<WritebackSummary> {
        if !self.done.is_set() {
            return Err(PipelineError::internal("writeback summary requested before completion"));
        }
        let mut locations = Vec::with_capacity(self.locations.len());
        while let Some(location) = self.locations.pop() {
            locations.push(location);
        }
        locations.sort_by_key(|l| (l.block, l.sub));

        let mut checksums: BTreeMap<u64, (u32, u64)> = BTreeMap::new();
        let mut combined: BTreeMap<u64, Hasher> = BTreeMap::new();
        for ((block, _), hasher) in std::mem::take(&mut *self.checksums.lock()) {
            combined.entry(block).or_default().combine(&hasher);
        }
        for (block, hasher) in combined {
            let len =
                locations.iter().filter(|l| l.block == block).map(|l| l.uncompressed as u64).sum();
            checksums.insert(block, (hasher.finalize(), len));
        }
        let stream_lengths = self.sinks.iter().map(|s| s.lock().offset).collect();
        Ok(WritebackSummary { locations, checksums, stream_lengths })
    }

    // ------------------------------------------------------------------------
    // Compress
    // ------------------------------------------------------------------------

    /// Split an in-order block into sub-blocks and queue them.
    fn accept(&self, block: u64, data: WriteData, scheduler: &Scheduler) -> Result<()> {
        let max = self.codec.max_block_size().max(1);
        let mut subs = Vec::new();
        for (part, len) in data.part_lengths().into_iter().enumerate() {
            let mut start = 0;
            while start < len {
                let end = (start + max).min(len);
                subs.push((part, start..end));
                start = end;
            }
        }
        let per_sub = if self.config.checksum { 3 } else { 2 };
        self.live.fetch_add(1, Ordering::SeqCst);

        if subs.is_empty() {
            // Nothing to write; the cursor still has to step over the block.
            let state = Arc::new(BlockState { id: block, subs: 0, data: FanInSlot::new(data, 1) });
            let marker =
                Compressed { block: Arc::clone(&state), sub: 0, uncompressed: 0, data: None };
            if let Some(data) = state.data.arrive()? {
                self.release_block(data, scheduler)?;
            }
            return self.enqueue_write(marker, scheduler);
        }

        let slot = FanInSlot::new(data, subs.len() * per_sub);
        let state = Arc::new(BlockState { id: block, subs: subs.len(), data: slot });
        {
            let mut pending = self.pending.lock();
            for (sub, (part, range)) in subs.into_iter().enumerate() {
                if self.config.checksum {
                    let job =
                        ChecksumJob { block: Arc::clone(&state), sub, part, range: range.clone() };
                    submit(scheduler, self.id, Request::Checksum(job));
                }
                pending.push(PendingSub { block: Arc::clone(&state), sub, part, range });
            }
        }
        self.dispatch_compress(scheduler);
        Ok(())
    }

    fn dispatch_compress(&self, scheduler: &Scheduler) {
        let mut stalled = false;
        {
            let mut pending = self.pending.lock();
            while !pending.is_empty() {
                let Some(out) = get_or_stall(&self.output_pool, &self.output_stalled) else {
                    stalled = true;
                    break;
                };
                let Some(next) = pending.pop() else { break };
                submit(scheduler, self.id, Request::Compress(CompressJob { pending: next, out }));
            }
        }
        if stalled {
            scheduler.on_exhaustion();
        }
    }

    fn compress(&self, job: CompressJob, scheduler: &Scheduler) -> Result<()> {
        let CompressJob { pending, mut out } = job;
        let uncompressed = pending.range.len();
        {
            let data = pending.block.data.read()?;
            let bytes = data
                .part(pending.part)
                .get(pending.range.clone())
                .ok_or_else(|| PipelineError::internal("sub-block range outside its block"))?;
            self.codec
                .compress_into(bytes, &mut out)
                .map_err(|e| PipelineError::io(self.codec.name(), e))?;
        }
        let compressed =
            Compressed { block: pending.block, sub: pending.sub, uncompressed, data: Some(out) };
        self.enqueue_write(compressed, scheduler)
    }

    fn checksum(&self, job: ChecksumJob, scheduler: &Scheduler) -> Result<()> {
        let mut hasher = Hasher::new();
        {
            let data = job.block.data.read()?;
            let bytes = data
                .part(job.part)
                .get(job.range.clone())
                .ok_or_else(|| PipelineError::internal("sub-block range outside its block"))?;
            hasher.update(bytes);
        }
        self.checksums.lock().insert((job.block.id, job.sub), hasher);
        self.arrive(&job.block, scheduler)
    }

    // ------------------------------------------------------------------------
    // Write
    // ------------------------------------------------------------------------

    /// Park a compressed sub-block and move everything the write cursor allows onto streams.
    fn enqueue_write(&self, item: Compressed, scheduler: &Scheduler) -> Result<()> {
        let mut wake = Vec::new();
        {
            let mut cursor = self.cursor.lock();
            cursor.ready.push(item);
            loop {
                let expected = (cursor.block, cursor.sub);
                let Some(next) = cursor.ready.pop_if(|c| c.key() == expected) else { break };
                let last = next.block.subs <= next.sub + 1;
                if next.data.is_some() {
                    if next.sub == 0 {
                        cursor.stream = self.least_used_stream();
                    }
                    let stream = cursor.stream;
                    self.queues[stream].lock().queue.push_back(next);
                    wake.push(stream);
                }
                if last {
                    cursor.block += 1;
                    cursor.sub = 0;
                } else {
                    cursor.sub += 1;
                }
            }
        }
        wake.dedup();
        for stream in wake {
            if self.gates[stream].try_schedule() {
                submit(scheduler, self.id, Request::Write(WriteJob::Stream(stream)));
            }
        }
        self.check_sentinel(scheduler);
        Ok(())
    }

    /// Pick the stream for a new block and count the use.
    fn least_used_stream(&self) -> usize {
        let mut best = 0;
        let mut best_uses = u64::MAX;
        for (i, queue) in self.queues.iter().enumerate() {
            let uses = queue.lock().uses;
            if uses < best_uses {
                best = i;
                best_uses = uses;
            }
        }
        self.queues[best].lock().uses += 1;
        best
    }

    fn write_stream(&self, stream: usize, scheduler: &Scheduler) -> Result<()> {
        let next = self.queues[stream].lock().queue.pop_front();
        if let Some(item) = next {
            self.write_one(stream, item, scheduler)?;
        }
        let again = !self.queues[stream].lock().queue.is_empty();
        if self.gates[stream].complete(again) {
            submit(scheduler, self.id, Request::Write(WriteJob::Stream(stream)));
        }
        Ok(())
    }

    fn write_one(&self, stream: usize, item: Compressed, scheduler: &Scheduler) -> Result<()> {
        let Compressed { block, sub, uncompressed, data } = item;
        let data = data.ok_or_else(|| PipelineError::internal("empty block queued for write"))?;
        let offset = {
            let mut sink = self.sinks[stream].lock();
            let offset = sink.offset;
            let Sink { name, writer, .. } = &mut *sink;
            writer.write_all(&data).with_path(name.as_path())?;
            sink.offset += data.len() as u64;
            offset
        };
        let location = BlockLocation {
            block: block.id,
            sub,
            stream,
            offset,
            compressed: data.len(),
            uncompressed,
        };
        let released = put_and_wake(&self.output_pool, data, &self.output_stalled)?;
        if released || !self.pending.lock().is_empty() {
            self.dispatch_compress(scheduler);
        }
        let job = IndexJob { block: Arc::clone(&block), location };
        submit(scheduler, self.id, Request::Index(job));
        self.arrive(&block, scheduler)
    }

    fn index(&self, job: IndexJob, scheduler: &Scheduler) -> Result<()> {
        self.locations.push(job.location);
        self.arrive(&job.block, scheduler)
    }

    // ------------------------------------------------------------------------
    // Release and completion
    // ------------------------------------------------------------------------

    fn arrive(&self, block: &BlockState, scheduler: &Scheduler) -> Result<()> {
        if let Some(data) = block.data.arrive()? {
            self.release_block(data, scheduler)?;
            self.check_sentinel(scheduler);
        }
        Ok(())
    }

    fn release_block(&self, data: WriteData, scheduler: &Scheduler) -> Result<()> {
        self.live.fetch_sub(1, Ordering::SeqCst);
        match data {
            WriteData::Buffer(buffer) => self.release.get()?.block_released(buffer, scheduler),
            WriteData::Bytes(_) => Ok(()),
        }
    }

    /// Submit the sentinel once the last block has been written and released.
    fn check_sentinel(&self, scheduler: &Scheduler) {
        let Some(total) = *self.total.lock() else { return };
        if self.cursor.lock().block < total || self.live.load(Ordering::SeqCst) > 0 {
            return;
        }
        if !self.sentinel_fired.swap(true, Ordering::SeqCst) {
            submit(scheduler, self.id, Request::Write(WriteJob::Sentinel));
        }
    }

    fn write_sentinel(&self) -> Result<()> {
        for sink in &self.sinks {
            let mut sink = sink.lock();
            let Sink { name, writer, offset } = &mut *sink;
            if self.config.write_eof {
                let marker = self.codec.eof_marker();
                writer.write_all(marker).with_path(name.as_path())?;
                *offset += marker.len() as u64;
            }
            writer.flush().with_path(name.as_path())?;
        }
        debug!("Writeback complete: {} location(s) recorded", self.locations.len());
        self.done.set();
        Ok(())
    }
}

impl Dispatcher<Request> for WritebackStage {
    fn dispatch(&self, request: Request, scheduler: &Scheduler) -> Result<()> {
        match request {
            Request::Compress(job) => self.compress(job, scheduler),
            Request::Checksum(job) => self.checksum(job, scheduler),
            Request::Write(WriteJob::Stream(stream)) => self.write_stream(stream, scheduler),
            Request::Write(WriteJob::Sentinel) => self.write_sentinel(),
            Request::Index(job) => self.index(job, scheduler),
            other => Err(misrouted("writeback", &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PlainCodec;
    use crate::engine::EnginePool;
    use crate::engine::testing::SharedSink;

    struct Returned(Mutex<Vec<u64>>, FreeList<FragmentBuffer>);

    impl BlockRelease for Returned {
        fn block_released(&self, buffer: Lease<FragmentBuffer>, _: &Scheduler) -> Result<()> {
            self.0.lock().push(buffer.id);
            self.1.put(buffer)
        }
    }

    fn config(checksum: bool, write_eof: bool) -> WritebackConfig {
        WritebackConfig { checksum, write_eof, output_slots: 3 }
    }

    fn block_bytes(summary: &WritebackSummary, sinks: &[SharedSink], block: u64) -> Vec<u8> {
        let extent = summary.block_extent(block).unwrap();
        let bytes = sinks[extent.stream].bytes();
        bytes[extent.offset as usize..(extent.offset + extent.len) as usize].to_vec()
    }

    #[test]
    fn test_blocks_written_in_order_across_streams() {
        let pool = EnginePool::new(4, None).unwrap();
        let sinks = vec![SharedSink::default(), SharedSink::default()];
        let outputs = sinks
            .iter()
            .enumerate()
            .map(|(i, s)| OutputSink::new(format!("s{i}"), s.clone()))
            .collect();
        let codec = Arc::new(PlainCodec::with_unit_size(7));
        let stage =
            WritebackStage::new(codec, outputs, config(true, false), pool.scheduler()).unwrap();

        let blocks: Vec<Vec<u8>> = (0..6u8).map(|i| vec![b'a' + i; 5 + 4 * i as usize]).collect();
        for id in [2u64, 0, 5, 1, 4, 3] {
            let data = WriteData::Bytes(blocks[id as usize].clone());
            stage.submit(id, data, pool.scheduler()).unwrap();
        }
        stage.finish(6, pool.scheduler()).unwrap();
        pool.wait(&stage.completion()).unwrap();
        pool.join().unwrap();

        let summary = stage.summary().unwrap();
        for (id, expected) in blocks.iter().enumerate() {
            assert_eq!(&block_bytes(&summary, &sinks, id as u64), expected);
            assert_eq!(summary.checksum(id as u64), Some(crc32fast::hash(expected)));
        }
        let subs = summary.locations.iter().filter(|l| l.block == 5).count();
        assert_eq!(subs, 25usize.div_ceil(7));
        let total: u64 = blocks.iter().map(|b| b.len() as u64).sum();
        assert_eq!(summary.stream_lengths.iter().sum::<u64>(), total);
        assert!(summary.stream_lengths.iter().all(|&n| n > 0), "both streams used");
    }

    #[test]
    fn test_buffers_released_and_empty_blocks_skipped() {
        let pool = EnginePool::new(2, None).unwrap();
        let sink = SharedSink::default();
        let codec = Arc::new(PlainCodec::with_unit_size(4));
        let outputs = vec![OutputSink::new("out", sink.clone())];
        let stage =
            WritebackStage::new(codec, outputs, config(false, false), pool.scheduler()).unwrap();
        let buffers = FreeList::new(3, || FragmentBuffer::new(2, 16, 4));
        let returned = Arc::new(Returned(Mutex::new(Vec::new()), buffers));
        let release: Arc<dyn BlockRelease> = returned.clone();
        let weak: std::sync::Weak<dyn BlockRelease> = Arc::downgrade(&release);
        stage.connect_release(weak).unwrap();

        for id in 0..3u64 {
            let mut buffer = returned.1.get();
            buffer.id = id;
            if id != 1 {
                buffer.fragments[0].push(b"0123456", 0);
                buffer.fragments[1].push(b"xy", 1);
            }
            stage.submit(id, WriteData::Buffer(buffer), pool.scheduler()).unwrap();
        }
        stage.finish(3, pool.scheduler()).unwrap();
        pool.wait(&stage.completion()).unwrap();
        pool.join().unwrap();

        let mut ids = returned.0.lock().clone();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(returned.1.outstanding(), 0);
        assert_eq!(sink.bytes(), b"0123456xy0123456xy".to_vec());
        let summary = stage.summary().unwrap();
        assert_eq!(summary.block_extent(1), None);
        // Sub-blocks never span fragment boundaries.
        assert_eq!(summary.locations.iter().filter(|l| l.block == 0).count(), 3);
    }

    #[test]
    fn test_no_blocks_writes_only_the_eof_marker() {
        let pool = EnginePool::new(1, None).unwrap();
        let sink = SharedSink::default();
        let codec = Arc::new(crate::codec::BgzfCodec::new(6));
        let outputs = vec![OutputSink::new("out", sink.clone())];
        let stage =
            WritebackStage::new(codec, outputs, config(false, true), pool.scheduler()).unwrap();
        stage.finish(0, pool.scheduler()).unwrap();
        pool.wait(&stage.completion()).unwrap();
        pool.join().unwrap();
        assert_eq!(sink.bytes(), bamflow_bgzf::BGZF_EOF.to_vec());
        assert!(stage.summary().unwrap().locations.is_empty());
    }

    #[test]
    fn test_finish_waits_for_blocks_submitted_later() {
        let pool = EnginePool::new(2, None).unwrap();
        let sink = SharedSink::default();
        let stage = WritebackStage::new(
            Arc::new(PlainCodec::default()),
            vec![OutputSink::new("out", sink.clone())],
            config(false, false),
            pool.scheduler(),
        )
        .unwrap();

        stage.submit(1, WriteData::Bytes(b"second".to_vec()), pool.scheduler()).unwrap();
        stage.finish(2, pool.scheduler()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(200));
        assert!(!stage.completion().is_set(), "completion must wait for block 0");
        assert!(sink.bytes().is_empty());

        stage.submit(0, WriteData::Bytes(b"first ".to_vec()), pool.scheduler()).unwrap();
        pool.wait(&stage.completion()).unwrap();
        pool.join().unwrap();
        assert_eq!(sink.bytes(), b"first second".to_vec());
    }

    #[test]
    fn test_blocks_beyond_the_finished_total_are_rejected() {
        let pool = EnginePool::new(1, None).unwrap();
        let stage = WritebackStage::new(
            Arc::new(PlainCodec::default()),
            vec![OutputSink::new("out", SharedSink::default())],
            config(false, false),
            pool.scheduler(),
        )
        .unwrap();
        stage.submit(0, WriteData::Bytes(b"a".to_vec()), pool.scheduler()).unwrap();
        stage.submit(1, WriteData::Bytes(b"b".to_vec()), pool.scheduler()).unwrap();
        assert!(stage.finish(1, pool.scheduler()).is_err());
        stage.finish(2, pool.scheduler()).unwrap();
        assert!(stage.submit(2, WriteData::Bytes(b"c".to_vec()), pool.scheduler()).is_err());
        pool.wait(&stage.completion()).unwrap();
        pool.join().unwrap();
    }

    #[test]
    fn test_finish_twice_is_an_error() {
        let pool = EnginePool::new(1, None).unwrap();
        let stage = WritebackStage::new(
            Arc::new(PlainCodec::default()),
            vec![OutputSink::new("out", SharedSink::default())],
            config(false, false),
            pool.scheduler(),
        )
        .unwrap();
        stage.finish(0, pool.scheduler()).unwrap();
        assert!(stage.finish(0, pool.scheduler()).is_err());
        pool.wait(&stage.completion()).unwrap();
        pool.join().unwrap();
    }
}
