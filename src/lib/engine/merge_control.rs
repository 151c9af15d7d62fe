//! K-way merge of sorted input streams into the writeback pipeline.
//!
//! Every stream contributes its current head record to a [`MergeHeap`]. The merge pass repeatedly
//! emits the smallest head into the current output buffer and advances that stream. A stream
//! whose next decoded buffer has not arrived yet stops the pass; the pass resumes when the buffer
//! is delivered. Output block 0 is the header; merged buffers follow as blocks 1, 2, ...

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use log::debug;
use parking_lot::Mutex;

use super::decode::{BufferReturn, DecodeListener};
use super::request::Request;
use super::writeback::{BlockRelease, WriteData, WritebackStage};
use super::{Scheduler, Upstream, get_or_stall, misrouted, put_and_wake, submit};
use crate::buffer::{AlignmentBuffer, FragmentBuffer};
use crate::errors::{PipelineError, Result};
use crate::fanin::SerialGate;
use crate::format::{AlignmentHeader, RecordComparator, RecordFormat, SortOrder};
use crate::pool::{FreeList, Lease};
use crate::read_ends::DuplicateSet;
use crate::sequencer::SequencingQueue;
use crate::sort::MergeHeap;
use crate::thread_pool::{Dispatcher, DispatcherId};

#[derive(Debug, Clone, Copy)]
pub struct MergeConfig {
    pub order: SortOrder,
    pub output_buffers: usize,
    pub output_bytes: usize,
    pub output_records: usize,
}

struct Head {
    buffer: Lease<AlignmentBuffer>,
    next: usize,
}

impl Head {
    fn record(&self) -> &[u8] {
        self.buffer.records().record(self.next)
    }

    fn rank(&self) -> u64 {
        self.buffer.records().rank(self.next)
    }
}

#[derive(Default)]
struct StreamSlot {
    arrived: SequencingQueue<Lease<AlignmentBuffer>>,
    head: Option<Head>,
    finished: bool,
}

struct MergeState {
    streams: Vec<StreamSlot>,
    heap: MergeHeap,
    output: Option<Lease<FragmentBuffer>>,
    next_block: u64,
    done: bool,
}

/// Work collected under the state lock and carried out after it is released.
#[derive(Default)]
struct PassOutcome {
    consumed: Vec<Lease<AlignmentBuffer>>,
    blocks: Vec<(u64, Lease<FragmentBuffer>)>,
    /// Output block count, once every stream is done.
    finished: Option<u64>,
    stalled: bool,
}

/// Why two reference dictionaries differ, if they do.
fn reference_mismatch(first: &[(String, usize)], other: &[(String, usize)]) -> Option<String> {
    if first.len() != other.len() {
        return Some(format!(
            "{} reference sequences where the first input has {}",
            other.len(),
            first.len()
        ));
    }
    first.iter().zip(other).enumerate().find(|(_, (a, b))| a != b).map(|(i, (a, b))| {
        format!("reference {i} is {}:{} where the first input has {}:{}", b.0, b.1, a.0, a.1)
    })
}

fn head_order<'a>(
    streams: &'a [StreamSlot],
    comparator: &'a dyn RecordComparator,
) -> impl Fn(usize, usize) -> std::cmp::Ordering + 'a {
    move |a, b| {
        let record = |s: usize| streams[s].head.as_ref().map_or(&[][..], |h| h.record());
        comparator.compare(record(a), record(b))
    }
}

/// Merges the decoded streams of a [`super::decode::DecodeStage`] into one output.
pub struct MergeStage {
    id: DispatcherId,
    format: Arc<dyn RecordFormat>,
    config: MergeConfig,
    comparator: OnceLock<Arc<dyn RecordComparator>>,
    duplicates: Option<Arc<DuplicateSet>>,
    upstream: Upstream<dyn BufferReturn>,
    writeback: Arc<WritebackStage>,
    gate: SerialGate,
    state: Mutex<MergeState>,
    output_pool: FreeList<FragmentBuffer>,
    output_stalled: AtomicBool,
    /// Headers seen so far, by stream.
    headers: Mutex<Vec<Option<Arc<AlignmentHeader>>>>,
    records: AtomicU64,
    duplicates_marked: AtomicU64,
}

impl MergeStage {
    /// Build the stage for `streams` inputs and register its dispatcher.
    ///
    /// Records whose rank is set in `duplicates` are written with the duplicate flag.
    pub fn new(
        format: Arc<dyn RecordFormat>,
        streams: usize,
        config: MergeConfig,
        writeback: Arc<WritebackStage>,
        duplicates: Option<Arc<DuplicateSet>>,
        scheduler: &Scheduler,
    ) -> Result<Arc<Self>> {
        if streams == 0 {
            return Err(PipelineError::InvalidParameter {
                parameter: "inputs".to_string(),
                reason: "at least one input is required".to_string(),
            });
        }
        let id = scheduler.next_dispatcher_id();
        let stage = Arc::new(Self {
            id,
            format,
            config,
            comparator: OnceLock::new(),
            duplicates,
            upstream: Upstream::default(),
            writeback,
            gate: SerialGate::new(),
            state: Mutex::new(MergeState {
                streams: (0..streams).map(|_| StreamSlot::default()).collect(),
                heap: MergeHeap::with_capacity(streams),
                output: None,
                next_block: 1,
                done: false,
            }),
            output_pool: FreeList::new(config.output_buffers.max(1), || {
                FragmentBuffer::new(1, config.output_bytes, config.output_records)
            }),
            output_stalled: AtomicBool::new(false),
            headers: Mutex::new(vec![None; streams]),
            records: AtomicU64::new(0),
            duplicates_marked: AtomicU64::new(0),
        });
        scheduler.register(id, stage.clone())?;
        Ok(stage)
    }

    pub fn connect_upstream(&self, upstream: Weak<dyn BufferReturn>) -> Result<()> {
        self.upstream.connect(upstream)
    }

    /// Records written so far.
    #[must_use]
    pub fn records(&self) -> u64 {
        self.records.load(Ordering::SeqCst)
    }

    /// Records written with the duplicate flag so far.
    #[must_use]
    pub fn duplicates_marked(&self) -> u64 {
        self.duplicates_marked.load(Ordering::SeqCst)
    }

    fn schedule(&self, scheduler: &Scheduler) {
        if self.gate.try_schedule() {
            submit(scheduler, self.id, Request::Merge);
        }
    }

    fn merge(&self, scheduler: &Scheduler) -> Result<()> {
        let outcome = match self.comparator.get() {
            Some(comparator) => self.merge_pass(comparator.as_ref())?,
            None => PassOutcome::default(),
        };
        if !outcome.consumed.is_empty() {
            let upstream = self.upstream.get()?;
            for buffer in outcome.consumed {
                upstream.return_buffer(buffer, scheduler)?;
            }
        }
        for (block, buffer) in outcome.blocks {
            self.writeback.submit(block, WriteData::Buffer(buffer), scheduler)?;
        }
        if let Some(total) = outcome.finished {
            debug!("Merged {} records", self.records());
            self.writeback.finish(total, scheduler)?;
        }
        if self.gate.complete(false) {
            submit(scheduler, self.id, Request::Merge);
        } else if outcome.stalled {
            scheduler.on_exhaustion();
        }
        Ok(())
    }

    /// Record ids index each input's own reference dictionary, so every input must share the
    /// dictionary of the first. Headers may arrive in any stream order.
    fn check_references(&self, stream: usize, header: &Arc<AlignmentHeader>) -> Result<()> {
        let mut headers = self.headers.lock();
        let slot = headers
            .get_mut(stream)
            .ok_or_else(|| PipelineError::internal(format!("merge has no input {stream}")))?;
        if slot.replace(Arc::clone(header)).is_some() {
            let message = format!("merge header for input {stream} set twice");
            return Err(PipelineError::internal(message));
        }
        let Some(first) = headers[0].clone() else { return Ok(()) };
        let others: Vec<usize> =
            if stream == 0 { (1..headers.len()).collect() } else { vec![stream] };
        for other in others {
            let Some(candidate) = &headers[other] else { continue };
            if let Some(reason) = reference_mismatch(first.references(), candidate.references()) {
                return Err(PipelineError::Header { stream: other, reason });
            }
        }
        Ok(())
    }

    /// Merge until a stream runs dry, the output pool is exhausted or every stream is done.
    fn merge_pass(&self, comparator: &dyn RecordComparator) -> Result<PassOutcome> {
        let mut outcome = PassOutcome::default();
        let mut guard = self.state.lock();
        let MergeState { streams, heap, output, next_block, done } = &mut *guard;
        if *done {
            return Ok(outcome);
        }

        loop {
            // Refill every stream that has no head; a missing buffer stops the merge.
            let mut missing = false;
            for index in 0..streams.len() {
                while streams[index].head.is_none() && !streams[index].finished {
                    let slot = &mut streams[index];
                    let Some(buffer) = slot.arrived.pop_next() else {
                        missing = true;
                        break;
                    };
                    slot.finished = buffer.is_final();
                    if buffer.is_empty() {
                        outcome.consumed.push(buffer);
                    } else {
                        slot.head = Some(Head { buffer, next: 0 });
                        heap.push(index, head_order(streams, comparator));
                    }
                }
            }
            if missing {
                break;
            }

            let Some(top) = heap.peek() else {
                if let Some(last) = output.take() {
                    if last.total_records() > 0 {
                        outcome.blocks.push((*next_block, last));
                        *next_block += 1;
                    } else {
                        self.output_pool.put(last)?;
                    }
                }
                *done = true;
                outcome.finished = Some(*next_block);
                break;
            };

            if output.is_none() {
                let Some(mut buffer) = get_or_stall(&self.output_pool, &self.output_stalled) else {
                    outcome.stalled = true;
                    break;
                };
                buffer.id = *next_block;
                *output = Some(buffer);
            }
            let Some(out) = output.as_mut() else { break };
            let head = streams[top]
                .head
                .as_ref()
                .ok_or_else(|| PipelineError::internal("heap holds a stream without a head"))?;

            let fragment = &mut out.fragments[0];
            let full = !fragment.is_empty()
                && (fragment.len() >= self.config.output_records
                    || fragment.bytes().len() + head.record().len() > self.config.output_bytes);
            if full {
                if let Some(done_buffer) = output.take() {
                    outcome.blocks.push((*next_block, done_buffer));
                    *next_block += 1;
                }
                continue;
            }

            let duplicate = self.duplicates.as_ref().is_some_and(|d| d.contains(head.rank()));
            fragment.push_with(head.rank(), |bytes| {
                self.format.write_record(head.record(), duplicate, bytes);
            });
            self.records.fetch_add(1, Ordering::Relaxed);
            if duplicate {
                self.duplicates_marked.fetch_add(1, Ordering::Relaxed);
            }

            heap.pop(head_order(streams, comparator));
            let slot = &mut streams[top];
            let exhausted = slot.head.as_mut().is_some_and(|h| {
                h.next += 1;
                h.next == h.buffer.len()
            });
            if exhausted {
                if let Some(h) = slot.head.take() {
                    outcome.consumed.push(h.buffer);
                }
            } else {
                heap.push(top, head_order(streams, comparator));
            }
        }
        Ok(outcome)
    }
}

impl DecodeListener for MergeStage {
    fn header_ready(
        &self,
        stream: usize,
        header: Arc<AlignmentHeader>,
        scheduler: &Scheduler,
    ) -> Result<()> {
        self.check_references(stream, &header)?;
        if stream != 0 {
            return Ok(());
        }
        let output_header = header.with_sort_order(self.config.order.header_value());
        let bytes = self.format.header_bytes(&output_header);
        let comparator = self.format.comparator(self.config.order, &header);
        self.comparator
            .set(comparator)
            .map_err(|_| PipelineError::internal("merge header set twice"))?;
        self.writeback.submit(0, WriteData::Bytes(bytes), scheduler)?;
        self.schedule(scheduler);
        Ok(())
    }

    fn buffer_ready(&self, buffer: Lease<AlignmentBuffer>, scheduler: &Scheduler) -> Result<()> {
        {
            let mut state = self.state.lock();
            let slot = state
                .streams
                .get_mut(buffer.stream())
                .ok_or_else(|| {
                    PipelineError::internal(format!("merge has no input {}", buffer.stream()))
                })?;
            slot.arrived.push(buffer.id(), buffer)?;
        }
        self.schedule(scheduler);
        Ok(())
    }
}

impl BlockRelease for MergeStage {
    fn block_released(&self, buffer: Lease<FragmentBuffer>, scheduler: &Scheduler) -> Result<()> {
        if put_and_wake(&self.output_pool, buffer, &self.output_stalled)? {
            self.schedule(scheduler);
        }
        Ok(())
    }
}

impl Dispatcher<Request> for MergeStage {
    fn dispatch(&self, request: Request, scheduler: &Scheduler) -> Result<()> {
        match request {
            Request::Merge => self.merge(scheduler),
            other => Err(misrouted("merge", &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use rstest::rstest;

    use super::*;
    use crate::codec::PlainCodec;
    use crate::engine::EnginePool;
    use crate::engine::decode::{DecodeConfig, DecodeStage, InputStream};
    use crate::engine::testing::SharedSink;
    use crate::engine::writeback::{OutputSink, WritebackConfig};
    use crate::format::SamFormat;

    const HEADER: &str = "@HD\tVN:1.6\n@SQ\tSN:chr1\tLN:100000\n";

    fn line(name: &str, pos: usize) -> String {
        format!("{name}\t0\tchr1\t{pos}\t60\t4M\t*\t0\t0\tACGT\tIIII\n")
    }

    fn sam(positions: &[usize], stream: usize) -> Vec<u8> {
        let mut text = HEADER.to_string();
        for (i, &pos) in positions.iter().enumerate() {
            text.push_str(&line(&format!("s{stream}_{i}"), pos));
        }
        text.into_bytes()
    }

    fn run_merge(
        inputs: Vec<Vec<u8>>,
        threads: usize,
        duplicates: Option<Arc<DuplicateSet>>,
    ) -> (Vec<u8>, u64) {
        let pool = EnginePool::new(threads, None).unwrap();
        let scheduler = pool.scheduler();
        let sink = SharedSink::default();
        let writeback = WritebackStage::new(
            Arc::new(PlainCodec::with_unit_size(50)),
            vec![OutputSink::new("out.sam", sink.clone())],
            WritebackConfig { checksum: true, write_eof: false, output_slots: 3 },
            scheduler,
        )
        .unwrap();
        let config = MergeConfig {
            order: SortOrder::Coordinate,
            output_buffers: 2,
            output_bytes: 256,
            output_records: 8,
        };
        let streams = inputs.len();
        let merge = MergeStage::new(
            Arc::new(SamFormat),
            streams,
            config,
            Arc::clone(&writeback),
            duplicates,
            scheduler,
        )
        .unwrap();
        let inputs = inputs
            .into_iter()
            .enumerate()
            .map(|(i, data)| InputStream::new(format!("in{i}.sam"), Cursor::new(data)))
            .collect();
        let decode_config = DecodeConfig {
            blocks_per_read: 2,
            input_depth: 2,
            buffers_per_stream: 2,
            buffer_bytes: 1 << 16,
            buffer_records: 5,
        };
        let decode = DecodeStage::new(
            inputs,
            Arc::new(PlainCodec::with_unit_size(33)),
            Arc::new(SamFormat),
            decode_config,
            merge.clone(),
            scheduler,
        )
        .unwrap();
        let release: Weak<dyn BlockRelease> = Arc::downgrade(&merge) as _;
        writeback.connect_release(release).unwrap();
        let upstream: Weak<dyn BufferReturn> = Arc::downgrade(&decode) as _;
        merge.connect_upstream(upstream).unwrap();

        decode.start(scheduler);
        pool.wait(&writeback.completion()).unwrap();
        pool.join().unwrap();
        (sink.bytes(), merge.records())
    }

    fn body(output: &[u8]) -> Vec<String> {
        String::from_utf8(output.to_vec())
            .unwrap()
            .lines()
            .filter(|l| !l.starts_with('@'))
            .map(str::to_string)
            .collect()
    }

    #[rstest]
    #[case(1)]
    #[case(4)]
    fn test_merge_is_sorted_and_stable_across_streams(#[case] threads: usize) {
        let a: Vec<usize> = (0..40).map(|i| 10 + i * 3).collect();
        let b: Vec<usize> = (0..25).map(|i| 10 + i * 5).collect();
        let c: Vec<usize> = vec![10, 10, 13, 500];
        let (output, records) = run_merge(vec![sam(&a, 0), sam(&b, 1), sam(&c, 2)], threads, None);
        assert_eq!(records, 69);
        assert!(output.starts_with(b"@HD\tVN:1.6\tSO:coordinate\n"));

        let lines = body(&output);
        assert_eq!(lines.len(), 69);
        let keys: Vec<(usize, usize, usize)> = lines
            .iter()
            .map(|l| {
                let cols: Vec<&str> = l.split('\t').collect();
                let (stream, index) = cols[0][1..].split_once('_').unwrap();
                (cols[3].parse().unwrap(), stream.parse().unwrap(), index.parse().unwrap())
            })
            .collect();
        let mut expected = keys.clone();
        expected.sort_unstable();
        assert_eq!(keys, expected, "position, then stream, then input order");
    }

    #[test]
    fn test_header_only_stream_is_finished_immediately() {
        let inputs = vec![HEADER.as_bytes().to_vec(), sam(&[5, 6, 7], 1)];
        let (output, records) = run_merge(inputs, 2, None);
        assert_eq!(records, 3);
        assert_eq!(body(&output).len(), 3);
    }

    #[test]
    fn test_duplicate_ranks_are_flagged() {
        let duplicates = Arc::new(DuplicateSet::new(12));
        for rank in [1, 4, 11] {
            duplicates.insert(rank).unwrap();
        }
        let positions: Vec<usize> = (1..=12).collect();
        let (output, _) = run_merge(vec![sam(&positions, 0)], 3, Some(duplicates));
        let flags: Vec<u16> = body(&output)
            .iter()
            .map(|l| l.split('\t').nth(1).unwrap().parse().unwrap())
            .collect();
        let marked: Vec<usize> =
            flags.iter().enumerate().filter(|(_, f)| **f & 0x400 != 0).map(|(i, _)| i).collect();
        assert_eq!(marked, vec![1, 4, 11]);
    }
}
