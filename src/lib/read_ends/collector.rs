//! Read-ends collection, flush and interval merge as engine work.
//!
//! ```text
//! rewrite jobs ── observe_records ──▶ per-worker containers (one per category)
//!                                        │ threshold reached: spill a sorted run
//! flush ── every container ──▶ FlushJob × containers ──▶ flag
//! merge ── key intervals per category ──▶ IntervalJob × intervals ──▶ flag
//!                                          │ k-way merge of the runs in the interval
//!                                          ▼
//!                              DuplicateSet (by parse rank) + MetricsSink
//! ```
//!
//! Interval boundaries are group keys, so a group of equal keys is always decided by one job
//! and the duplicate set does not depend on how many intervals there are.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use log::debug;
use parking_lot::Mutex;

use super::marking::{Tallies, mark_fragments, mark_pairs};
use super::spill::{RunReader, SpilledRun, spill};
use super::{Category, DuplicateSet, GroupKey, Observation, ReadEnds, observe};
use crate::engine::request::Request;
use crate::engine::{Scheduler, misrouted, submit};
use crate::errors::{PipelineError, Result};
use crate::fanin::FanIn;
use crate::format::{AlignmentHeader, RecordFormat};
use crate::metrics::MetricsSink;
use crate::pool::{GrowingFreeList, Lease};
use crate::temp::TempFileProvider;
use crate::thread_pool::{CompletionFlag, Dispatcher, DispatcherId};

/// Pair ends a merge interval should cover before pairs are split further.
pub const PAIR_ENDS_PER_INTERVAL: u64 = 4096;

type Container = Vec<ReadEnds>;

/// Spill one container.
pub struct FlushJob {
    category: Category,
    container: Lease<Container>,
    round: Arc<Round>,
}

/// Merge the runs of one category over `[lower, upper)`; `None` is unbounded.
pub struct IntervalJob {
    category: Category,
    runs: Arc<Vec<Arc<SpilledRun>>>,
    lower: Option<GroupKey>,
    upper: Option<GroupKey>,
    round: Arc<Round>,
}

/// Fan-in of one flush or merge.
struct Round {
    fan_in: FanIn,
    done: Arc<CompletionFlag>,
}

pub struct ReadEndsCollector {
    id: DispatcherId,
    format: Arc<dyn RecordFormat>,
    provider: Arc<TempFileProvider>,
    spill_threshold: usize,
    sink: Arc<dyn MetricsSink>,
    header: OnceLock<Arc<AlignmentHeader>>,
    fragments: GrowingFreeList<Container>,
    pairs: GrowingFreeList<Container>,
    runs: Mutex<Vec<Arc<SpilledRun>>>,
    unmapped: Mutex<Tallies>,
    observed: AtomicU64,
    duplicates: OnceLock<Arc<DuplicateSet>>,
}

impl ReadEndsCollector {
    /// Build the collector and register its dispatcher.
    pub fn new(
        format: Arc<dyn RecordFormat>,
        provider: Arc<TempFileProvider>,
        spill_threshold: usize,
        sink: Arc<dyn MetricsSink>,
        scheduler: &Scheduler,
    ) -> Result<Arc<Self>> {
        let id = scheduler.next_dispatcher_id();
        let collector = Arc::new(Self {
            id,
            format,
            provider,
            spill_threshold: spill_threshold.max(1),
            sink,
            header: OnceLock::new(),
            fragments: GrowingFreeList::new(Vec::new),
            pairs: GrowingFreeList::new(Vec::new),
            runs: Mutex::new(Vec::new()),
            unmapped: Mutex::new(Tallies::default()),
            observed: AtomicU64::new(0),
            duplicates: OnceLock::new(),
        });
        scheduler.register(id, collector.clone())?;
        Ok(collector)
    }

    /// Header used to resolve libraries. Must be set before the first observation.
    pub fn set_header(&self, header: Arc<AlignmentHeader>) -> Result<()> {
        self.header.set(header).map_err(|_| PipelineError::internal("read-ends header set twice"))
    }

    fn header(&self) -> Result<&Arc<AlignmentHeader>> {
        self.header
            .get()
            .ok_or_else(|| PipelineError::internal("read ends observed before the header"))
    }

    /// Duplicate ranks, once a merge was started.
    #[must_use]
    pub fn duplicates(&self) -> Option<Arc<DuplicateSet>> {
        self.duplicates.get().cloned()
    }

    /// Number of spilled runs so far.
    #[must_use]
    pub fn runs(&self) -> usize {
        self.runs.lock().len()
    }

    /// Containers allocated per category.
    #[must_use]
    pub fn containers(&self) -> (usize, usize) {
        (self.fragments.allocated(), self.pairs.allocated())
    }

    /// Record the read ends of `(record, rank)` pairs from one worker.
    pub fn observe_records<'a>(
        &self,
        records: impl IntoIterator<Item = (&'a [u8], u64)>,
    ) -> Result<()> {
        let header = self.header()?;
        let mut fragments = self.fragments.get();
        let mut pairs = self.pairs.get();
        let mut unmapped = Tallies::default();
        let mut seen = 0;

        for (record, rank) in records {
            seen += 1;
            let fields = self
                .format
                .fields(record, header)
                .map_err(|reason| PipelineError::Validation { stream: 0, record: rank, reason })?;
            match observe(&fields, rank, header) {
                Observation::Ignored => {}
                Observation::Unmapped { library } => unmapped.library(library).unmapped += 1,
                Observation::Ends { fragment, pair } => {
                    fragments.push(fragment);
                    if let Some(pair) = pair {
                        pairs.push(pair);
                    }
                }
            }
            if fragments.len() >= self.spill_threshold {
                self.spill_container(Category::Fragment, &mut fragments)?;
            }
            if pairs.len() >= self.spill_threshold {
                self.spill_container(Category::Pair, &mut pairs)?;
            }
        }

        self.fragments.put(fragments)?;
        self.pairs.put(pairs)?;
        self.observed.fetch_add(seen, Ordering::Relaxed);
        let mut totals = self.unmapped.lock();
        for (library, tally) in unmapped.0 {
            totals.library(library).unmapped += tally.unmapped;
        }
        Ok(())
    }

    fn spill_container(&self, category: Category, container: &mut Container) -> Result<()> {
        let run = spill(category, container, &self.provider)?;
        debug!("Spilled {} {category:?} read ends", run.count);
        self.runs.lock().push(Arc::new(run));
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Flush
    // ------------------------------------------------------------------------

    /// Spill every container; the returned flag is set when all are on disk.
    pub fn flush(&self, scheduler: &Scheduler) -> Result<Arc<CompletionFlag>> {
        let done = scheduler.completion_flag();
        let mut containers: Vec<(Category, Lease<Container>)> =
            self.fragments.take_all()?.into_iter().map(|c| (Category::Fragment, c)).collect();
        containers.extend(self.pairs.take_all()?.into_iter().map(|c| (Category::Pair, c)));
        debug!(
            "Flushing {} read-ends containers after {} records",
            containers.len(),
            self.observed.load(Ordering::Relaxed)
        );
        if containers.is_empty() {
            done.set();
            return Ok(done);
        }
        let round =
            Arc::new(Round { fan_in: FanIn::new(containers.len()), done: Arc::clone(&done) });
        for (category, container) in containers {
            let job = FlushJob { category, container, round: Arc::clone(&round) };
            submit(scheduler, self.id, Request::FlushReadEnds(job));
        }
        Ok(done)
    }

    fn flush_one(&self, job: FlushJob) -> Result<()> {
        let FlushJob { category, mut container, round } = job;
        if !container.is_empty() {
            self.spill_container(category, &mut container)?;
        }
        match category {
            Category::Fragment => self.fragments.put(container)?,
            Category::Pair => self.pairs.put(container)?,
        }
        if round.fan_in.arrive()? {
            debug!("Read-ends flush complete: {} runs", self.runs.lock().len());
            round.done.set();
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Merge
    // ------------------------------------------------------------------------

    /// Merge all runs into a duplicate set over `total_records` parse ranks.
    pub fn merge(&self, total_records: u64, scheduler: &Scheduler) -> Result<Arc<CompletionFlag>> {
        self.duplicates
            .set(Arc::new(DuplicateSet::new(total_records)))
            .map_err(|_| PipelineError::internal("read-ends merge started twice"))?;
        let done = scheduler.completion_flag();
        let runs = self.runs.lock().clone();

        let mut jobs = Vec::new();
        for category in [Category::Fragment, Category::Pair] {
            let selected: Vec<Arc<SpilledRun>> =
                runs.iter().filter(|r| r.category == category && r.count > 0).cloned().collect();
            if selected.is_empty() {
                continue;
            }
            let bounds = interval_bounds(category, &selected, scheduler.num_threads());
            let selected = Arc::new(selected);
            let mut lower = None;
            for upper in bounds.into_iter().map(Some).chain(std::iter::once(None)) {
                jobs.push((category, Arc::clone(&selected), lower, upper));
                lower = upper;
            }
        }
        debug!("Merging {} read-ends runs in {} intervals", runs.len(), jobs.len());

        if jobs.is_empty() {
            self.report_unmapped()?;
            done.set();
            return Ok(done);
        }
        let round = Arc::new(Round { fan_in: FanIn::new(jobs.len()), done: Arc::clone(&done) });
        for (category, runs, lower, upper) in jobs {
            let job = IntervalJob { category, runs, lower, upper, round: Arc::clone(&round) };
            submit(scheduler, self.id, Request::MergeReadEnds(job));
        }
        Ok(done)
    }

    fn merge_interval(&self, job: IntervalJob) -> Result<()> {
        let duplicates = self
            .duplicates
            .get()
            .ok_or_else(|| PipelineError::internal("interval merged before merge start"))?;
        let header = self.header()?;
        let mut readers = Vec::with_capacity(job.runs.len());
        let mut heap = BinaryHeap::with_capacity(job.runs.len());

        for (i, run) in job.runs.iter().enumerate() {
            let block = job.lower.map_or(0, |key| run.index.seek_block(&key));
            let mut reader = RunReader::open(run, block)?;
            let mut first = reader.next_entry()?;
            while first.is_some_and(|e| job.lower.is_some_and(|key| e.group_key() < key)) {
                first = reader.next_entry()?;
            }
            if let Some(entry) = first.filter(|e| below(e, job.upper)) {
                heap.push(Reverse((entry, i)));
            }
            readers.push(reader);
        }

        let mut tallies = Tallies::default();
        let mut group: Vec<ReadEnds> = Vec::new();
        let mut groups = 0u64;
        while let Some(Reverse((entry, i))) = heap.pop() {
            if group.last().is_some_and(|last| last.group_key() != entry.group_key()) {
                self.decide(job.category, &group, duplicates, &mut tallies)?;
                group.clear();
                groups += 1;
            }
            group.push(entry);
            if let Some(next) = readers[i].next_entry()?.filter(|e| below(e, job.upper)) {
                heap.push(Reverse((next, i)));
            }
        }
        if !group.is_empty() {
            self.decide(job.category, &group, duplicates, &mut tallies)?;
            groups += 1;
        }
        debug!("Merged {groups} {:?} groups in one interval", job.category);
        self.sink.add_duplication_metrics(tallies.into_metrics(header));

        if job.round.fan_in.arrive()? {
            self.report_unmapped()?;
            debug!("Read-ends merge complete: {} duplicates", duplicates.count());
            job.round.done.set();
        }
        Ok(())
    }

    fn decide(
        &self,
        category: Category,
        group: &[ReadEnds],
        duplicates: &DuplicateSet,
        tallies: &mut Tallies,
    ) -> Result<()> {
        match category {
            Category::Fragment => mark_fragments(group, duplicates, tallies),
            Category::Pair => mark_pairs(group, duplicates, tallies),
        }
    }

    fn report_unmapped(&self) -> Result<()> {
        let header = self.header()?;
        let tallies = std::mem::take(&mut *self.unmapped.lock());
        if !tallies.0.is_empty() {
            self.sink.add_duplication_metrics(tallies.into_metrics(header));
        }
        Ok(())
    }
}

fn below(entry: &ReadEnds, upper: Option<GroupKey>) -> bool {
    upper.is_none_or(|key| entry.group_key() < key)
}

/// Interior interval boundaries for the runs of one category.
///
/// Fragments are split into one interval per worker. Pairs are fewer, so they get one interval
/// per [`PAIR_ENDS_PER_INTERVAL`] entries, capped at one per worker. Boundaries are taken at
/// evenly spaced quantiles of the index block keys.
fn interval_bounds(category: Category, runs: &[Arc<SpilledRun>], threads: usize) -> Vec<GroupKey> {
    let total: u64 = runs.iter().map(|r| r.count).sum();
    let parts = match category {
        Category::Fragment => threads,
        Category::Pair => {
            usize::try_from(total / PAIR_ENDS_PER_INTERVAL).unwrap_or(usize::MAX).clamp(1, threads)
        }
    };
    let mut samples: Vec<GroupKey> =
        runs.iter().flat_map(|r| r.index.block_keys().iter().map(ReadEnds::group_key)).collect();
    samples.sort_unstable();
    samples.dedup();
    let mut bounds: Vec<GroupKey> =
        (1..parts).filter_map(|k| samples.get(k * samples.len() / parts).copied()).collect();
    bounds.dedup();
    bounds
}

impl Dispatcher<Request> for ReadEndsCollector {
    fn dispatch(&self, request: Request, _scheduler: &Scheduler) -> Result<()> {
        match request {
            Request::FlushReadEnds(job) => self.flush_one(job),
            Request::MergeReadEnds(job) => self.merge_interval(job),
            other => Err(misrouted("read ends", &other)),
        }
    }
}
