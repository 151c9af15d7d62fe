//! Block sort of one decoded input: rewrite → base sort → merge tree → reorder → post-sort.
//!
//! ```text
//! buffer_ready ─▶ admission (id order, needs a rewrite buffer)
//!                   │ Rewrite × P: copy record ranges into P fragments, observe read ends
//!                   ▼ last part returns the source buffer to decode
//!                 BaseSort × P ─▶ MergeRuns (ceil(log2 P) rounds, ties to the left run)
//!                   │
//!                   ▼
//!                 reorder admission (id order, needs a reorder buffer)
//!                   │ Reorder × P: copy records into final position, rank framed
//!                   ▼ last part returns the rewrite buffer
//!                 post-sort SequencingQueue (buffer id) ─▶ writeback block per buffer
//! ```
//!
//! Every buffer becomes one sorted run. Buffers enter both pooled steps strictly in id order, so
//! a buffer waiting for a pool slot is never blocked by later buffers holding every slot while
//! they wait behind it in the post-sort queue.

use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;

use log::debug;
use parking_lot::{MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard};

use super::decode::{BufferReturn, DecodeListener};
use super::request::Request;
use super::writeback::{BlockRelease, WriteData, WritebackStage};
use super::{Scheduler, Upstream, get_or_stall, misrouted, put_and_wake, submit};
use crate::buffer::{AlignmentBuffer, Fragment, FragmentBuffer};
use crate::errors::{PipelineError, Result};
use crate::fanin::{FanIn, FanInSlot};
use crate::format::ranked::write_framed;
use crate::format::{AlignmentHeader, RecordComparator, RecordFormat, SortOrder};
use crate::pool::{FreeList, Lease};
use crate::read_ends::ReadEndsCollector;
use crate::sequencer::SequencingQueue;
use crate::sort::{RecordRef, base_sort, merge_rounds, merge_runs, split_points};
use crate::thread_pool::{Dispatcher, DispatcherId};

#[derive(Debug, Clone, Copy)]
pub struct SortConfig {
    pub order: SortOrder,
    /// Fragments per buffer; normally the thread count.
    pub parts: usize,
    /// Buffers in each of the rewrite and reorder pools.
    pub fragment_buffers: usize,
    pub bytes_per_part: usize,
    pub records_per_part: usize,
    /// Prefix every output record with its parse rank.
    pub frame_ranks: bool,
}

// ============================================================================
// Jobs
// ============================================================================

/// Fragments moved out of a pooled buffer so that each part can be filled under its own lock.
struct PartedTarget {
    shell: Mutex<Option<Lease<FragmentBuffer>>>,
    parts: Vec<Mutex<Fragment>>,
}

impl PartedTarget {
    fn new(mut buffer: Lease<FragmentBuffer>) -> Self {
        let parts = std::mem::take(&mut buffer.fragments).into_iter().map(Mutex::new).collect();
        Self { shell: Mutex::new(Some(buffer)), parts }
    }

    fn part(&self, index: usize) -> Result<parking_lot::MutexGuard<'_, Fragment>> {
        self.parts
            .get(index)
            .map(|part| part.lock())
            .ok_or_else(|| PipelineError::internal(format!("fragment {index} outside its buffer")))
    }

    /// Put the fragments back; only called by the last part.
    fn reassemble(&self) -> Result<Lease<FragmentBuffer>> {
        let mut buffer = self
            .shell
            .lock()
            .take()
            .ok_or_else(|| PipelineError::internal("fragment buffer reassembled twice"))?;
        buffer.fragments = self.parts.iter().map(|p| std::mem::take(&mut *p.lock())).collect();
        Ok(buffer)
    }
}

struct RewriteBatch {
    source: FanInSlot<Lease<AlignmentBuffer>>,
    target: PartedTarget,
}

/// Copy one record range of a decoded buffer into one fragment.
pub struct RewriteJob {
    batch: Arc<RewriteBatch>,
    part: usize,
    records: Range<usize>,
}

/// Sorting state of one buffer.
struct SortContext {
    buffer: RwLock<Option<Lease<FragmentBuffer>>>,
    runs: Vec<Mutex<Vec<RecordRef>>>,
    rounds: Vec<Vec<(usize, usize)>>,
}

impl SortContext {
    fn buffer(&self) -> Result<MappedRwLockReadGuard<'_, FragmentBuffer>> {
        RwLockReadGuard::try_map(self.buffer.read(), |b| b.as_deref())
            .map_err(|_| PipelineError::internal("sort buffer read after release"))
    }

    fn id(&self) -> Result<u64> {
        Ok(self.buffer()?.id)
    }
}

pub struct BaseSortJob {
    context: Arc<SortContext>,
    fragment: usize,
    fan_in: Arc<FanIn>,
}

pub struct MergeRunsJob {
    context: Arc<SortContext>,
    round: usize,
    left: usize,
    right: usize,
    fan_in: Arc<FanIn>,
}

struct ReorderBatch {
    context: Arc<SortContext>,
    order: Vec<RecordRef>,
    target: PartedTarget,
    fan_in: FanIn,
}

/// Copy one range of the sorted order into final position.
pub struct ReorderJob {
    batch: Arc<ReorderBatch>,
    part: usize,
    records: Range<usize>,
}

/// Entry of the reorder queue; empty input buffers pass through it to keep the ids dense.
enum ReorderEntry {
    Sorted(Arc<SortContext>),
    Empty { is_final: bool },
}

/// A buffer leaving the sort, in id order; `None` for an empty input buffer.
struct Sorted {
    buffer: Option<Lease<FragmentBuffer>>,
    is_final: bool,
}

struct PostSort {
    queue: SequencingQueue<Sorted>,
    next_block: u64,
    finished: bool,
}

// ============================================================================
// SortStage
// ============================================================================

/// Turns decoded buffers into sorted runs.
pub struct SortStage {
    id: DispatcherId,
    format: Arc<dyn RecordFormat>,
    config: SortConfig,
    header: OnceLock<Arc<AlignmentHeader>>,
    comparator: OnceLock<Arc<dyn RecordComparator>>,
    upstream: Upstream<dyn BufferReturn>,
    writeback: Arc<WritebackStage>,
    read_ends: Option<Arc<ReadEndsCollector>>,
    admission: Mutex<SequencingQueue<Lease<AlignmentBuffer>>>,
    rewrite_pool: FreeList<FragmentBuffer>,
    rewrite_stalled: AtomicBool,
    reorder_queue: Mutex<SequencingQueue<ReorderEntry>>,
    reorder_pool: FreeList<FragmentBuffer>,
    reorder_stalled: AtomicBool,
    post_sort: Mutex<PostSort>,
    records: AtomicU64,
}

impl SortStage {
    /// Build the stage and register its dispatcher.
    pub fn new(
        format: Arc<dyn RecordFormat>,
        config: SortConfig,
        writeback: Arc<WritebackStage>,
        read_ends: Option<Arc<ReadEndsCollector>>,
        scheduler: &Scheduler,
    ) -> Result<Arc<Self>> {
        let parts = config.parts.max(1);
        let config = SortConfig { parts, ..config };
        let factory = || FragmentBuffer::new(parts, config.bytes_per_part, config.records_per_part);
        let id = scheduler.next_dispatcher_id();
        let stage = Arc::new(Self {
            id,
            format,
            config,
            header: OnceLock::new(),
            comparator: OnceLock::new(),
            upstream: Upstream::default(),
            writeback,
            read_ends,
            admission: Mutex::new(SequencingQueue::new()),
            rewrite_pool: FreeList::new(config.fragment_buffers.max(1), factory),
            rewrite_stalled: AtomicBool::new(false),
            reorder_queue: Mutex::new(SequencingQueue::new()),
            reorder_pool: FreeList::new(config.fragment_buffers.max(1), factory),
            reorder_stalled: AtomicBool::new(false),
            post_sort: Mutex::new(PostSort {
                queue: SequencingQueue::new(),
                next_block: 0,
                finished: false,
            }),
            records: AtomicU64::new(0),
        });
        scheduler.register(id, stage.clone())?;
        Ok(stage)
    }

    /// Link the decoder that takes consumed buffers back.
    pub fn connect_upstream(&self, upstream: std::sync::Weak<dyn BufferReturn>) -> Result<()> {
        self.upstream.connect(upstream)
    }

    /// Records sorted so far.
    #[must_use]
    pub fn records(&self) -> u64 {
        self.records.load(Ordering::SeqCst)
    }

    /// Runs handed to writeback so far; run `i` is writeback block `i`.
    #[must_use]
    pub fn runs(&self) -> u64 {
        self.post_sort.lock().next_block
    }

    #[must_use]
    pub fn header(&self) -> Option<Arc<AlignmentHeader>> {
        self.header.get().cloned()
    }

    fn comparator(&self) -> Result<&Arc<dyn RecordComparator>> {
        self.comparator
            .get()
            .ok_or_else(|| PipelineError::internal("sort started before the header"))
    }

    // ------------------------------------------------------------------------
    // Rewrite
    // ------------------------------------------------------------------------

    /// Start rewrites for the buffers at the head of the admission queue while buffers are free.
    fn drain_admission(&self, scheduler: &Scheduler) -> Result<()> {
        loop {
            let mut admission = self.admission.lock();
            let Some(empty) = admission.peek_next().map(|b| b.is_empty()) else { break };
            let target = if empty {
                None
            } else {
                let Some(target) = get_or_stall(&self.rewrite_pool, &self.rewrite_stalled) else {
                    drop(admission);
                    scheduler.on_exhaustion();
                    break;
                };
                Some(target)
            };
            let source = admission
                .pop_next()
                .ok_or_else(|| PipelineError::internal("admission head vanished"))?;
            drop(admission);
            match target {
                Some(target) => self.start_rewrite(source, target, scheduler),
                None => self.skip_empty(source, scheduler)?,
            }
        }
        Ok(())
    }

    fn skip_empty(&self, source: Lease<AlignmentBuffer>, scheduler: &Scheduler) -> Result<()> {
        let (id, is_final) = (source.id(), source.is_final());
        self.upstream.get()?.return_buffer(source, scheduler)?;
        self.reorder_queue.lock().push(id, ReorderEntry::Empty { is_final })?;
        self.drain_reorder(scheduler)
    }

    fn start_rewrite(
        &self,
        source: Lease<AlignmentBuffer>,
        mut target: Lease<FragmentBuffer>,
        scheduler: &Scheduler,
    ) {
        target.id = source.id();
        target.is_final = source.is_final();
        let ranges = split_points(source.len(), self.config.parts);
        let batch = Arc::new(RewriteBatch {
            source: FanInSlot::new(source, ranges.len()),
            target: PartedTarget::new(target),
        });
        for (part, records) in ranges.into_iter().enumerate() {
            let job = RewriteJob { batch: Arc::clone(&batch), part, records };
            submit(scheduler, self.id, Request::Rewrite(job));
        }
    }

    fn rewrite(&self, job: RewriteJob, scheduler: &Scheduler) -> Result<()> {
        {
            let source = job.batch.source.read()?;
            let records = source.records();
            let mut fragment = job.batch.target.part(job.part)?;
            for i in job.records.clone() {
                fragment.push(records.record(i), records.rank(i));
            }
            if let Some(read_ends) = &self.read_ends {
                let observed = job.records.clone().map(|i| (records.record(i), records.rank(i)));
                read_ends.observe_records(observed)?;
            }
        }
        let Some(source) = job.batch.source.arrive()? else { return Ok(()) };
        self.records.fetch_add(source.len() as u64, Ordering::SeqCst);
        self.upstream.get()?.return_buffer(source, scheduler)?;
        let buffer = job.batch.target.reassemble()?;
        self.start_sort(buffer, scheduler)
    }

    // ------------------------------------------------------------------------
    // Sort
    // ------------------------------------------------------------------------

    fn start_sort(&self, buffer: Lease<FragmentBuffer>, scheduler: &Scheduler) -> Result<()> {
        let fragments = buffer.fragments.len();
        let context = Arc::new(SortContext {
            buffer: RwLock::new(Some(buffer)),
            runs: (0..fragments).map(|_| Mutex::new(Vec::new())).collect(),
            rounds: merge_rounds(fragments),
        });
        let fan_in = Arc::new(FanIn::new(fragments));
        for fragment in 0..fragments {
            let job = BaseSortJob {
                context: Arc::clone(&context),
                fragment,
                fan_in: Arc::clone(&fan_in),
            };
            submit(scheduler, self.id, Request::BaseSort(job));
        }
        Ok(())
    }

    fn base_sort(&self, job: BaseSortJob, scheduler: &Scheduler) -> Result<()> {
        let comparator = self.comparator()?;
        let run = {
            let buffer = job.context.buffer()?;
            let fragment = buffer
                .fragments
                .get(job.fragment)
                .ok_or_else(|| PipelineError::internal("base sort of a missing fragment"))?;
            base_sort(job.fragment, fragment, comparator.as_ref())
        };
        *job.context.runs[job.fragment].lock() = run;
        if job.fan_in.arrive()? {
            self.start_round(job.context, 0, scheduler)?;
        }
        Ok(())
    }

    /// Launch merge round `round`, or hand the buffer to reorder once every round is done.
    fn start_round(
        &self,
        context: Arc<SortContext>,
        round: usize,
        scheduler: &Scheduler,
    ) -> Result<()> {
        let Some(pairs) = context.rounds.get(round) else {
            let id = context.id()?;
            self.reorder_queue.lock().push(id, ReorderEntry::Sorted(context))?;
            return self.drain_reorder(scheduler);
        };
        let fan_in = Arc::new(FanIn::new(pairs.len()));
        for &(left, right) in pairs {
            let job = MergeRunsJob {
                context: Arc::clone(&context),
                round,
                left,
                right,
                fan_in: Arc::clone(&fan_in),
            };
            submit(scheduler, self.id, Request::MergeRuns(job));
        }
        Ok(())
    }

    fn merge_runs(&self, job: MergeRunsJob, scheduler: &Scheduler) -> Result<()> {
        let comparator = self.comparator()?;
        let left = std::mem::take(&mut *job.context.runs[job.left].lock());
        let right = std::mem::take(&mut *job.context.runs[job.right].lock());
        let mut merged = Vec::new();
        {
            let buffer = job.context.buffer()?;
            merge_runs(&buffer, &left, &right, comparator.as_ref(), &mut merged);
        }
        *job.context.runs[job.left].lock() = merged;
        if job.fan_in.arrive()? {
            self.start_round(job.context, job.round + 1, scheduler)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Reorder
    // ------------------------------------------------------------------------

    fn drain_reorder(&self, scheduler: &Scheduler) -> Result<()> {
        loop {
            let mut queue = self.reorder_queue.lock();
            match queue.peek_next() {
                None => break,
                Some(ReorderEntry::Empty { .. }) => {
                    let id = queue.next_id();
                    if let Some(ReorderEntry::Empty { is_final }) = queue.pop_next() {
                        drop(queue);
                        self.post_sort_push(id, Sorted { buffer: None, is_final }, scheduler)?;
                    }
                    continue;
                }
                Some(ReorderEntry::Sorted(_)) => {}
            }
            let Some(target) = get_or_stall(&self.reorder_pool, &self.reorder_stalled) else {
                drop(queue);
                scheduler.on_exhaustion();
                break;
            };
            let Some(ReorderEntry::Sorted(context)) = queue.pop_next() else {
                return Err(PipelineError::internal("reorder head vanished"));
            };
            drop(queue);
            self.start_reorder(context, target, scheduler)?;
        }
        Ok(())
    }

    fn start_reorder(
        &self,
        context: Arc<SortContext>,
        mut target: Lease<FragmentBuffer>,
        scheduler: &Scheduler,
    ) -> Result<()> {
        let order = std::mem::take(&mut *context.runs[0].lock());
        {
            let source = context.buffer()?;
            target.id = source.id;
            target.is_final = source.is_final;
        }
        let ranges = split_points(order.len(), self.config.parts);
        let batch = Arc::new(ReorderBatch {
            context,
            order,
            target: PartedTarget::new(target),
            fan_in: FanIn::new(ranges.len()),
        });
        for (part, records) in ranges.into_iter().enumerate() {
            let job = ReorderJob { batch: Arc::clone(&batch), part, records };
            submit(scheduler, self.id, Request::Reorder(job));
        }
        Ok(())
    }

    fn reorder(&self, job: ReorderJob, scheduler: &Scheduler) -> Result<()> {
        let batch = &job.batch;
        {
            let source = batch.context.buffer()?;
            let mut fragment = batch.target.part(job.part)?;
            for &record in &batch.order[job.records.clone()] {
                let (bytes, rank) = (record.resolve(&source), record.rank(&source));
                if self.config.frame_ranks {
                    fragment.push_with(rank, |out| write_framed(rank, bytes, out));
                } else {
                    fragment.push(bytes, rank);
                }
            }
        }
        if !batch.fan_in.arrive()? {
            return Ok(());
        }
        let source = batch
            .context
            .buffer
            .write()
            .take()
            .ok_or_else(|| PipelineError::internal("sorted buffer released twice"))?;
        put_and_wake(&self.rewrite_pool, source, &self.rewrite_stalled)?;
        self.drain_admission(scheduler)?;

        let sorted = batch.target.reassemble()?;
        let (id, is_final) = (sorted.id, sorted.is_final);
        self.post_sort_push(id, Sorted { buffer: Some(sorted), is_final }, scheduler)
    }

    // ------------------------------------------------------------------------
    // Post-sort
    // ------------------------------------------------------------------------

    /// Hand sorted buffers to writeback in buffer id order.
    fn post_sort_push(&self, id: u64, sorted: Sorted, scheduler: &Scheduler) -> Result<()> {
        let mut blocks = Vec::new();
        let mut finish = None;
        {
            let mut post = self.post_sort.lock();
            post.queue.push(id, sorted)?;
            while let Some(next) = post.queue.pop_next() {
                if post.finished {
                    return Err(PipelineError::internal("buffer sorted after the final buffer"));
                }
                if let Some(buffer) = next.buffer {
                    blocks.push((post.next_block, buffer));
                    post.next_block += 1;
                }
                if next.is_final {
                    post.finished = true;
                    finish = Some(post.next_block);
                    debug!("Sorted {} records into {} runs", self.records(), post.next_block);
                }
            }
        }
        for (block, buffer) in blocks {
            self.writeback.submit(block, WriteData::Buffer(buffer), scheduler)?;
        }
        if let Some(total) = finish {
            self.writeback.finish(total, scheduler)?;
        }
        Ok(())
    }
}

impl DecodeListener for SortStage {
    fn header_ready(
        &self,
        stream: usize,
        header: Arc<AlignmentHeader>,
        _scheduler: &Scheduler,
    ) -> Result<()> {
        if stream != 0 {
            let message = format!("sort received a header for input {stream}");
            return Err(PipelineError::internal(message));
        }
        let comparator = self.format.comparator(self.config.order, &header);
        self.comparator
            .set(comparator)
            .map_err(|_| PipelineError::internal("sort header set twice"))?;
        if let Some(read_ends) = &self.read_ends {
            read_ends.set_header(Arc::clone(&header))?;
        }
        self.header.set(header).map_err(|_| PipelineError::internal("sort header set twice"))
    }

    fn buffer_ready(&self, buffer: Lease<AlignmentBuffer>, scheduler: &Scheduler) -> Result<()> {
        self.admission.lock().push(buffer.id(), buffer)?;
        self.drain_admission(scheduler)
    }
}

impl BlockRelease for SortStage {
    fn block_released(&self, buffer: Lease<FragmentBuffer>, scheduler: &Scheduler) -> Result<()> {
        put_and_wake(&self.reorder_pool, buffer, &self.reorder_stalled)?;
        self.drain_reorder(scheduler)
    }
}

impl Dispatcher<Request> for SortStage {
    fn dispatch(&self, request: Request, scheduler: &Scheduler) -> Result<()> {
        match request {
            Request::Rewrite(job) => self.rewrite(job, scheduler),
            Request::BaseSort(job) => self.base_sort(job, scheduler),
            Request::MergeRuns(job) => self.merge_runs(job, scheduler),
            Request::Reorder(job) => self.reorder(job, scheduler),
            other => Err(misrouted("sort", &other)),
        }
    }
}
