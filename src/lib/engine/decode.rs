//! Stream decode pipeline: read → decompress → parse → validate.
//!
//! Per stream:
//!
//! ```text
//! Read ──▶ raw batch (FanInSlot, one part per block)
//!            │ sub-blocks parked in a heap by sequence number
//!            ▼
//! Decompress (needs a decompressed slot; exhaustion stalls the stream)
//!            │ completions pushed to a SequencingQueue
//!            ▼
//! Parse (serial per stream; carries partial records and the stall remainder in `work`)
//!            │ full buffer, or the final buffer at end of input
//!            ▼
//! Validate (buffer split into ceil(fill / threads)-record fragments) ──▶ listener
//! ```
//!
//! A read is issued only while no other read of the same stream is queued or running, and a
//! parse likewise. The end of a stream travels through the parse queue as an `End` marker
//! carrying the next sequence number, so it is seen after every decompressed block.

use std::io::Read;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use log::debug;
use parking_lot::Mutex;

use super::request::Request;
use super::{Scheduler, get_or_stall, misrouted, put_and_wake, submit};
use crate::buffer::{AlignmentBuffer, RawBatch};
use crate::codec::BlockCodec;
use crate::errors::{IoContext, PipelineError, Result};
use crate::fanin::{FanInSlot, SerialGate};
use crate::format::{AlignmentHeader, RecordFormat};
use crate::pool::{FreeList, Lease};
use crate::sequencer::{Keyed, PendingHeap, SequencingQueue};
use crate::thread_pool::{Dispatcher, DispatcherId};

/// Receives the output of the decode pipeline.
pub trait DecodeListener: Send + Sync {
    /// The header of `stream` was parsed. Called once per stream, before any of its buffers.
    fn header_ready(
        &self,
        stream: usize,
        header: Arc<AlignmentHeader>,
        scheduler: &Scheduler,
    ) -> Result<()>;

    /// A validated buffer. Buffers of one stream may arrive out of id order.
    fn buffer_ready(&self, buffer: Lease<AlignmentBuffer>, scheduler: &Scheduler) -> Result<()>;
}

/// Capability to hand a consumed buffer back to the decoder that produced it.
pub trait BufferReturn: Send + Sync {
    fn return_buffer(&self, buffer: Lease<AlignmentBuffer>, scheduler: &Scheduler) -> Result<()>;
}

/// One input of the decode pipeline.
pub struct InputStream {
    pub name: PathBuf,
    pub reader: Box<dyn Read + Send>,
}

impl InputStream {
    pub fn new(name: impl Into<PathBuf>, reader: impl Read + Send + 'static) -> Self {
        Self { name: name.into(), reader: Box::new(reader) }
    }
}

/// Sizing of the decode pools.
#[derive(Debug, Clone, Copy)]
pub struct DecodeConfig {
    /// Compressed blocks fetched by one read.
    pub blocks_per_read: usize,
    /// Decompressed blocks that may be in flight per stream.
    pub input_depth: usize,
    /// Parse buffers per stream.
    pub buffers_per_stream: usize,
    pub buffer_bytes: usize,
    pub buffer_records: usize,
}

// ============================================================================
// Jobs
// ============================================================================

struct SubBlock {
    seq: u64,
    batch: Arc<FanInSlot<Lease<RawBatch>>>,
    index: usize,
}

impl Keyed for SubBlock {
    type Key = u64;

    fn key(&self) -> u64 {
        self.seq
    }
}

/// Decompress one block of a raw batch into a pooled slot.
pub struct DecompressJob {
    stream: usize,
    block: SubBlock,
    out: Lease<Vec<u8>>,
}

/// Validate a record range of one parsed buffer.
pub struct ValidateJob {
    stream: usize,
    buffer: Arc<FanInSlot<Lease<AlignmentBuffer>>>,
    records: Range<usize>,
}

enum ParseInput {
    Data(Lease<Vec<u8>>),
    End,
}

// ============================================================================
// Per-stream state
// ============================================================================

#[derive(Default)]
struct ParseState {
    work: Vec<u8>,
    cursor: usize,
    header_done: bool,
    at_eof: bool,
    finished: bool,
    current: Option<Lease<AlignmentBuffer>>,
    next_buffer_id: u64,
    next_rank: u64,
}

struct ReadState {
    reader: Option<Box<dyn Read + Send>>,
    next_seq: u64,
}

struct StreamState {
    name: PathBuf,
    read: Mutex<ReadState>,
    read_gate: SerialGate,
    read_stalled: AtomicBool,
    raw_pool: FreeList<RawBatch>,
    pending: Mutex<PendingHeap<SubBlock>>,
    decompressed_pool: FreeList<Vec<u8>>,
    decompress_stalled: AtomicBool,
    parse_queue: Mutex<SequencingQueue<ParseInput>>,
    parse_gate: SerialGate,
    parse_stalled: AtomicBool,
    parse: Mutex<ParseState>,
    buffers: FreeList<AlignmentBuffer>,
    header: OnceLock<Arc<AlignmentHeader>>,
}

/// Things the parse pass must do once its lock is released.
#[derive(Default)]
struct ParseOutcome {
    header: Option<Arc<AlignmentHeader>>,
    ready: Vec<Lease<AlignmentBuffer>>,
    woke_decompress: bool,
    again: bool,
}

// ============================================================================
// DecodeStage
// ============================================================================

/// Decode pipeline over one or more input streams.
pub struct DecodeStage {
    id: DispatcherId,
    codec: Arc<dyn BlockCodec>,
    format: Arc<dyn RecordFormat>,
    config: DecodeConfig,
    threads: usize,
    streams: Vec<StreamState>,
    listener: Arc<dyn DecodeListener>,
}

impl DecodeStage {
    /// Build the stage and register its dispatcher.
    pub fn new(
        inputs: Vec<InputStream>,
        codec: Arc<dyn BlockCodec>,
        format: Arc<dyn RecordFormat>,
        config: DecodeConfig,
        listener: Arc<dyn DecodeListener>,
        scheduler: &Scheduler,
    ) -> Result<Arc<Self>> {
        let streams = inputs
            .into_iter()
            .map(|input| StreamState {
                name: input.name,
                read: Mutex::new(ReadState { reader: Some(input.reader), next_seq: 0 }),
                read_gate: SerialGate::new(),
                read_stalled: AtomicBool::new(false),
                raw_pool: FreeList::new(2, RawBatch::default),
                pending: Mutex::new(PendingHeap::new()),
                decompressed_pool: FreeList::new(config.input_depth, Vec::new),
                decompress_stalled: AtomicBool::new(false),
                parse_queue: Mutex::new(SequencingQueue::new()),
                parse_gate: SerialGate::new(),
                parse_stalled: AtomicBool::new(false),
                parse: Mutex::new(ParseState::default()),
                buffers: FreeList::new(config.buffers_per_stream, || {
                    AlignmentBuffer::new(config.buffer_bytes, config.buffer_records)
                }),
                header: OnceLock::new(),
            })
            .collect();

        let id = scheduler.next_dispatcher_id();
        let stage = Arc::new(Self {
            id,
            codec,
            format,
            config,
            threads: scheduler.num_threads(),
            streams,
            listener,
        });
        scheduler.register(id, stage.clone())?;
        Ok(stage)
    }

    #[must_use]
    pub fn num_streams(&self) -> usize {
        self.streams.len()
    }

    /// Header of `stream`, once parsed.
    #[must_use]
    pub fn header(&self, stream: usize) -> Option<Arc<AlignmentHeader>> {
        self.streams.get(stream).and_then(|s| s.header.get().cloned())
    }

    /// Issue the first read of every stream.
    pub fn start(&self, scheduler: &Scheduler) {
        for stream in 0..self.streams.len() {
            self.schedule_read(stream, scheduler);
        }
    }

    fn stream(&self, stream: usize) -> Result<&StreamState> {
        self.streams
            .get(stream)
            .ok_or_else(|| PipelineError::internal(format!("unknown input stream {stream}")))
    }

    fn schedule_read(&self, stream: usize, scheduler: &Scheduler) {
        if self.streams[stream].read_gate.try_schedule() {
            submit(scheduler, self.id, Request::Read { stream });
        }
    }

    fn schedule_parse(&self, stream: usize, scheduler: &Scheduler) {
        if self.streams[stream].parse_gate.try_schedule() {
            submit(scheduler, self.id, Request::Parse { stream });
        }
    }

    // ------------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------------

    fn read(&self, index: usize, scheduler: &Scheduler) -> Result<()> {
        let stream = self.stream(index)?;
        let again = self.read_once(index, stream, scheduler)?;
        if stream.read_gate.complete(again) {
            submit(scheduler, self.id, Request::Read { stream: index });
        }
        Ok(())
    }

    /// One read request; returns whether reading should continue immediately.
    fn read_once(&self, index: usize, stream: &StreamState, scheduler: &Scheduler) -> Result<bool> {
        let mut read = stream.read.lock();
        let ReadState { reader, next_seq } = &mut *read;
        let Some(source) = reader.as_mut() else { return Ok(false) };

        let Some(mut batch) = get_or_stall(&stream.raw_pool, &stream.read_stalled) else {
            drop(read);
            scheduler.on_exhaustion();
            return Ok(false);
        };
        let n = self
            .codec
            .read_blocks(source.as_mut(), self.config.blocks_per_read, &mut batch.blocks)
            .with_path(&stream.name)?;

        if n == 0 {
            *reader = None;
            let end = *next_seq;
            drop(read);
            debug!("Input {} reached end of stream after {end} blocks", stream.name.display());
            if put_and_wake(&stream.raw_pool, batch, &stream.read_stalled)? {
                self.schedule_read(index, scheduler);
            }
            stream.parse_queue.lock().push(end, ParseInput::End)?;
            self.schedule_parse(index, scheduler);
            return Ok(false);
        }

        let batch = Arc::new(FanInSlot::new(batch, n));
        {
            let mut pending = stream.pending.lock();
            for block in 0..n {
                pending.push(SubBlock { seq: *next_seq, batch: Arc::clone(&batch), index: block });
                *next_seq += 1;
            }
        }
        drop(read);
        self.dispatch_decompress(index, stream, scheduler);
        Ok(true)
    }

    // ------------------------------------------------------------------------
    // Decompress
    // ------------------------------------------------------------------------

    /// Start decompression of parked sub-blocks in sequence order while slots are free.
    fn dispatch_decompress(&self, index: usize, stream: &StreamState, scheduler: &Scheduler) {
        let mut stalled = false;
        {
            let mut pending = stream.pending.lock();
            while !pending.is_empty() {
                let Some(out) = get_or_stall(&stream.decompressed_pool, &stream.decompress_stalled)
                else {
                    stalled = true;
                    break;
                };
                let Some(block) = pending.pop() else { break };
                let job = DecompressJob { stream: index, block, out };
                submit(scheduler, self.id, Request::Decompress(job));
            }
        }
        if stalled {
            scheduler.on_exhaustion();
        }
    }

    fn decompress(&self, job: DecompressJob, scheduler: &Scheduler) -> Result<()> {
        let DecompressJob { stream: index, block, mut out } = job;
        let stream = self.stream(index)?;
        {
            let raw = block.batch.read()?;
            let data = raw
                .blocks
                .get(block.index)
                .ok_or_else(|| PipelineError::internal("sub-block index outside its batch"))?;
            self.codec.decompress_into(data, &mut out).with_path(&stream.name)?;
        }
        if let Some(batch) = block.batch.arrive()? {
            if put_and_wake(&stream.raw_pool, batch, &stream.read_stalled)? {
                self.schedule_read(index, scheduler);
            }
        }
        stream.parse_queue.lock().push(block.seq, ParseInput::Data(out))?;
        self.schedule_parse(index, scheduler);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Parse
    // ------------------------------------------------------------------------

    fn parse(&self, index: usize, scheduler: &Scheduler) -> Result<()> {
        let stream = self.stream(index)?;
        let outcome = self.parse_pass(index, stream)?;

        if outcome.woke_decompress {
            self.dispatch_decompress(index, stream, scheduler);
        }
        if let Some(header) = outcome.header {
            self.listener.header_ready(index, header, scheduler)?;
        }
        for buffer in outcome.ready {
            self.hand_off(index, buffer, scheduler)?;
        }
        if stream.parse_gate.complete(outcome.again) {
            submit(scheduler, self.id, Request::Parse { stream: index });
        } else if !outcome.again && stream.parse_stalled.load(Ordering::SeqCst) {
            scheduler.on_exhaustion();
        }
        Ok(())
    }

    /// Parse as far as input and buffers allow.
    fn parse_pass(&self, index: usize, stream: &StreamState) -> Result<ParseOutcome> {
        let mut outcome = ParseOutcome::default();
        let mut guard = stream.parse.lock();
        let state = &mut *guard;
        if state.finished {
            return Ok(outcome);
        }

        loop {
            if !state.header_done {
                let parsed = self
                    .format
                    .parse_header(&state.work[state.cursor..], state.at_eof)
                    .map_err(|reason| PipelineError::Header { stream: index, reason })?;
                match parsed {
                    Some((header, consumed)) => {
                        state.cursor += consumed;
                        state.header_done = true;
                        let header = Arc::new(header);
                        if stream.header.set(Arc::clone(&header)).is_err() {
                            return Err(PipelineError::internal("header parsed twice"));
                        }
                        outcome.header = Some(header);
                    }
                    None if state.at_eof => {
                        return Err(PipelineError::Header {
                            stream: index,
                            reason: "input ended inside the header".to_string(),
                        });
                    }
                    None => {}
                }
            }

            if state.header_done {
                if state.current.is_none() {
                    match get_or_stall(&stream.buffers, &stream.parse_stalled) {
                        Some(mut buffer) => {
                            buffer.assign(index, state.next_buffer_id);
                            state.next_buffer_id += 1;
                            state.current = Some(buffer);
                        }
                        // The unparsed remainder stays in `work` until a buffer returns.
                        None => break,
                    }
                }
                if self.fill_current(index, state, &mut outcome)? {
                    continue;
                }
                if state.at_eof {
                    if state.cursor < state.work.len() {
                        return Err(PipelineError::Validation {
                            stream: index,
                            record: state.next_rank,
                            reason: "input ends with a truncated record".to_string(),
                        });
                    }
                    if let Some(mut last) = state.current.take() {
                        last.set_final();
                        outcome.ready.push(last);
                    }
                    state.finished = true;
                    debug!("Parsed {} records from {}", state.next_rank, stream.name.display());
                    break;
                }
            }

            let next = stream.parse_queue.lock().pop_next();
            match next {
                None => break,
                Some(ParseInput::Data(chunk)) => {
                    state.work.drain(..state.cursor);
                    state.cursor = 0;
                    state.work.extend_from_slice(&chunk);
                    outcome.woke_decompress |=
                        put_and_wake(&stream.decompressed_pool, chunk, &stream.decompress_stalled)?;
                }
                Some(ParseInput::End) => {
                    state.at_eof = true;
                    state.work.drain(..state.cursor);
                    state.cursor = 0;
                    if !state.work.is_empty() && !self.format.terminate_partial(&mut state.work) {
                        return Err(PipelineError::Validation {
                            stream: index,
                            record: state.next_rank,
                            reason: "input ends with a truncated record".to_string(),
                        });
                    }
                }
            }
        }
        Ok(outcome)
    }

    /// Move complete records from `work` into the current buffer.
    ///
    /// Returns `true` when the buffer filled up and was queued, so the caller needs a new one.
    fn fill_current(
        &self,
        index: usize,
        state: &mut ParseState,
        outcome: &mut ParseOutcome,
    ) -> Result<bool> {
        let Some(buffer) = state.current.as_mut() else { return Ok(false) };
        loop {
            let record = self
                .format
                .next_record(&state.work[state.cursor..])
                .map_err(|reason| PipelineError::Validation {
                    stream: index,
                    record: state.next_rank,
                    reason,
                })?;
            let Some(record) = record else { return Ok(false) };
            if !buffer.fits(record.len) {
                if let Some(full) = state.current.take() {
                    outcome.ready.push(full);
                }
                return Ok(true);
            }
            let rank = record.rank.unwrap_or(state.next_rank);
            let end = state.cursor + record.len;
            buffer.push(&state.work[state.cursor..end], rank);
            state.cursor = end;
            state.next_rank += 1;
        }
    }

    // ------------------------------------------------------------------------
    // Validate
    // ------------------------------------------------------------------------

    fn hand_off(
        &self,
        index: usize,
        buffer: Lease<AlignmentBuffer>,
        scheduler: &Scheduler,
    ) -> Result<()> {
        let fill = buffer.len();
        if fill == 0 {
            return self.listener.buffer_ready(buffer, scheduler);
        }
        let chunk = fill.div_ceil(self.threads).max(1);
        let parts = fill.div_ceil(chunk);
        let shared = Arc::new(FanInSlot::new(buffer, parts));
        for part in 0..parts {
            let records = part * chunk..((part + 1) * chunk).min(fill);
            let job = ValidateJob { stream: index, buffer: Arc::clone(&shared), records };
            submit(scheduler, self.id, Request::Validate(job));
        }
        Ok(())
    }

    fn validate(&self, job: ValidateJob, scheduler: &Scheduler) -> Result<()> {
        let stream = self.stream(job.stream)?;
        let header = stream
            .header
            .get()
            .ok_or_else(|| PipelineError::internal("record validated before its header"))?;
        {
            let buffer = job.buffer.read()?;
            let records = buffer.records();
            for i in job.records.clone() {
                self.format.validate(records.record(i), header).map_err(|reason| {
                    PipelineError::Validation {
                        stream: job.stream,
                        record: records.rank(i),
                        reason,
                    }
                })?;
            }
        }
        if let Some(buffer) = job.buffer.arrive()? {
            self.listener.buffer_ready(buffer, scheduler)?;
        }
        Ok(())
    }
}

impl BufferReturn for DecodeStage {
    fn return_buffer(&self, buffer: Lease<AlignmentBuffer>, scheduler: &Scheduler) -> Result<()> {
        let index = buffer.stream();
        let stream = self.stream(index)?;
        if put_and_wake(&stream.buffers, buffer, &stream.parse_stalled)? {
            self.schedule_parse(index, scheduler);
        }
        Ok(())
    }
}

impl Dispatcher<Request> for DecodeStage {
    fn dispatch(&self, request: Request, scheduler: &Scheduler) -> Result<()> {
        match request {
            Request::Read { stream } => self.read(stream, scheduler),
            Request::Decompress(job) => self.decompress(job, scheduler),
            Request::Parse { stream } => self.parse(stream, scheduler),
            Request::Validate(job) => self.validate(job, scheduler),
            other => Err(misrouted("decode", &other)),
        }
    }
}
