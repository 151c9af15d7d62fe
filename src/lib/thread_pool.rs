//! Priority-ordered worker pool with dispatcher routing and panic mode.
//!
//! ```text
//!            submit(dispatcher, priority, payload)
//!                          │
//!                          ▼
//!   ┌───────────────────────────────────────────────┐
//!   │ ready queue: min-heap on (priority, sequence) │
//!   └───────────────────────────────────────────────┘
//!          │ pop                 │ pop
//!          ▼                     ▼
//!     worker 0  ...  worker N-1 ── look up dispatcher by id ──▶ dispatch(payload)
//!                                      │
//!                          Err / panic ▼
//!                                 panic mode: first error kept, ready queue abandoned,
//!                                 workers exit, every waiter on a CompletionFlag wakes
//! ```
//!
//! There is no stage affinity: any worker runs any stage's package. Lower priority values run
//! first; equal priorities run in submission order.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};
use parking_lot::{Condvar, Mutex, RwLock};
use rand::Rng;

use crate::errors::{PipelineError, Result};
use crate::sequencer::{Keyed, PendingHeap};

/// Identifier a stage registers its dispatcher under.
pub type DispatcherId = usize;

/// Upper bound on how long a rendezvous sleeps between checks.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound of one exhaustion sleep, saturating for jitter beyond `u64::MAX` microseconds.
fn jitter_bound_micros(max: Duration) -> u64 {
    u64::try_from(max.as_micros()).unwrap_or(u64::MAX)
}

/// Executes the packages addressed to one stage.
pub trait Dispatcher<P>: Send + Sync {
    /// Run one package. An `Err` is fatal and puts the pool into panic mode.
    fn dispatch(&self, payload: P, scheduler: &Scheduler<P>) -> Result<()>;
}

/// A unit of work waiting in the ready queue.
struct WorkPackage<P> {
    priority: u32,
    sequence: u64,
    dispatcher: DispatcherId,
    payload: P,
}

impl<P> Keyed for WorkPackage<P> {
    type Key = (u32, u64);

    fn key(&self) -> (u32, u64) {
        (self.priority, self.sequence)
    }
}

struct ReadyQueue<P> {
    heap: PendingHeap<WorkPackage<P>>,
    next_sequence: u64,
    shutdown: bool,
}

// ============================================================================
// Completion flags
// ============================================================================

/// One-shot flag a driver thread can block on until it is set or the pool panics.
#[derive(Debug, Default)]
pub struct CompletionFlag {
    done: Mutex<bool>,
    changed: Condvar,
}

impl CompletionFlag {
    pub fn set(&self) {
        *self.done.lock() = true;
        self.changed.notify_all();
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        *self.done.lock()
    }

    fn wake(&self) {
        let _guard = self.done.lock();
        self.changed.notify_all();
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// State shared by the workers and every stage: ready queue, dispatcher table, panic flag.
pub struct Scheduler<P> {
    num_threads: usize,
    ready: Mutex<ReadyQueue<P>>,
    work_available: Condvar,
    dispatchers: RwLock<Vec<Option<Arc<dyn Dispatcher<P>>>>>,
    next_dispatcher: AtomicUsize,
    panicked: AtomicBool,
    first_error: Mutex<Option<PipelineError>>,
    flags: Mutex<Vec<Arc<CompletionFlag>>>,
    exhaustion_jitter: Option<Duration>,
    executed: AtomicU64,
}

impl<P: Send + 'static> Scheduler<P> {
    fn new(num_threads: usize, exhaustion_jitter: Option<Duration>) -> Self {
        Self {
            num_threads,
            ready: Mutex::new(ReadyQueue {
                heap: PendingHeap::new(),
                next_sequence: 0,
                shutdown: false,
            }),
            work_available: Condvar::new(),
            dispatchers: RwLock::new(Vec::new()),
            next_dispatcher: AtomicUsize::new(0),
            panicked: AtomicBool::new(false),
            first_error: Mutex::new(None),
            flags: Mutex::new(Vec::new()),
            exhaustion_jitter,
            executed: AtomicU64::new(0),
        }
    }

    /// Number of worker threads; stages size their pools from this.
    #[must_use]
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Reserve a unique dispatcher id.
    pub fn next_dispatcher_id(&self) -> DispatcherId {
        self.next_dispatcher.fetch_add(1, Ordering::Relaxed)
    }

    /// Register the dispatcher for `id`.
    ///
    /// # Errors
    ///
    /// Returns an internal error if `id` was never reserved or is already taken.
    pub fn register(&self, id: DispatcherId, dispatcher: Arc<dyn Dispatcher<P>>) -> Result<()> {
        if id >= self.next_dispatcher.load(Ordering::Relaxed) {
            return Err(PipelineError::internal(format!("dispatcher id {id} was never reserved")));
        }
        let mut table = self.dispatchers.write();
        if table.len() <= id {
            table.resize_with(id + 1, || None);
        }
        if table[id].is_some() {
            return Err(PipelineError::internal(format!("dispatcher id {id} registered twice")));
        }
        table[id] = Some(dispatcher);
        Ok(())
    }

    /// Queue a package for `dispatcher`. Dropped silently once the pool is in panic mode.
    pub fn submit(&self, dispatcher: DispatcherId, priority: u32, payload: P) {
        {
            let mut ready = self.ready.lock();
            if self.is_panicked() {
                return;
            }
            let sequence = ready.next_sequence;
            ready.next_sequence += 1;
            ready.heap.push(WorkPackage { priority, sequence, dispatcher, payload });
        }
        self.work_available.notify_one();
    }

    /// Create a completion flag that also wakes when the pool panics.
    pub fn completion_flag(&self) -> Arc<CompletionFlag> {
        let flag = Arc::new(CompletionFlag::default());
        self.flags.lock().push(Arc::clone(&flag));
        flag
    }

    /// Block until `flag` is set.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Aborted`] if the pool enters panic mode first.
    pub fn wait(&self, flag: &CompletionFlag) -> Result<()> {
        let mut done = flag.done.lock();
        loop {
            if self.is_panicked() {
                return Err(PipelineError::Aborted);
            }
            if *done {
                return Ok(());
            }
            flag.changed.wait_for(&mut done, POLL_INTERVAL);
        }
    }

    /// Enter panic mode with `error`. Only the first error is retained.
    pub fn raise(&self, error: PipelineError) {
        {
            let mut first = self.first_error.lock();
            if first.is_none() {
                warn!("Fatal pipeline error, aborting: {error}");
                *first = Some(error);
            } else {
                warn!("Additional error after abort: {error}");
            }
        }
        self.enter_panic_mode();
    }

    fn enter_panic_mode(&self) {
        {
            let _ready = self.ready.lock();
            self.panicked.store(true, Ordering::SeqCst);
        }
        self.work_available.notify_all();
        for flag in self.flags.lock().iter() {
            flag.wake();
        }
    }

    #[must_use]
    pub fn is_panicked(&self) -> bool {
        self.panicked.load(Ordering::SeqCst)
    }

    /// Called by a stage whenever a pool it needs is exhausted. Sleeps for a random duration
    /// when exhaustion jitter is configured.
    pub fn on_exhaustion(&self) {
        if let Some(max) = self.exhaustion_jitter {
            let micros = rand::rng().random_range(0..=jitter_bound_micros(max));
            thread::sleep(Duration::from_micros(micros));
        }
    }

    /// Total packages executed so far.
    #[must_use]
    pub fn packages_executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    fn next_package(&self) -> Option<WorkPackage<P>> {
        let mut ready = self.ready.lock();
        loop {
            if self.is_panicked() {
                return None;
            }
            if let Some(package) = ready.heap.pop() {
                return Some(package);
            }
            if ready.shutdown {
                return None;
            }
            self.work_available.wait(&mut ready);
        }
    }

    fn execute(&self, package: WorkPackage<P>) {
        let dispatcher = self.dispatchers.read().get(package.dispatcher).cloned().flatten();
        let Some(dispatcher) = dispatcher else {
            self.raise(PipelineError::internal(format!(
                "no dispatcher registered for id {}",
                package.dispatcher
            )));
            return;
        };
        let payload = package.payload;
        match panic::catch_unwind(AssertUnwindSafe(|| dispatcher.dispatch(payload, self))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.raise(e),
            Err(panic_info) => self.raise(PipelineError::WorkerPanic(panic_message(panic_info))),
        }
        self.executed.fetch_add(1, Ordering::Relaxed);
    }

    fn worker_loop(&self) {
        while let Some(package) = self.next_package() {
            self.execute(package);
        }
    }
}

fn panic_message(panic_info: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ============================================================================
// ThreadPool
// ============================================================================

/// Owner of the worker threads.
///
/// Dropping a pool that was not joined aborts outstanding work and joins the workers.
pub struct ThreadPool<P: Send + 'static> {
    scheduler: Arc<Scheduler<P>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<P: Send + 'static> ThreadPool<P> {
    /// Spawn `num_threads` workers (at least one).
    ///
    /// # Errors
    ///
    /// Returns an error if a worker thread cannot be spawned.
    pub fn new(num_threads: usize, exhaustion_jitter: Option<Duration>) -> Result<Self> {
        let num_threads = num_threads.max(1);
        let scheduler = Arc::new(Scheduler::new(num_threads, exhaustion_jitter));
        let pool = Self { scheduler, handles: Mutex::new(Vec::with_capacity(num_threads)) };
        for i in 0..num_threads {
            let scheduler = Arc::clone(&pool.scheduler);
            let handle = thread::Builder::new()
                .name(format!("bamflow-worker-{i}"))
                .spawn(move || scheduler.worker_loop())
                .map_err(|e| PipelineError::internal(format!("failed to spawn worker {i}: {e}")))?;
            pool.handles.lock().push(handle);
        }
        debug!("Started {num_threads} worker threads");
        Ok(pool)
    }

    #[must_use]
    pub fn scheduler(&self) -> &Scheduler<P> {
        &self.scheduler
    }

    /// Block until `flag` is set; see [`Scheduler::wait`].
    ///
    /// # Errors
    ///
    /// Returns the error that put the pool into panic mode.
    pub fn wait(&self, flag: &CompletionFlag) -> Result<()> {
        match self.scheduler.wait(flag) {
            Ok(()) => Ok(()),
            Err(aborted) => match self.join() {
                Err(first) => Err(first),
                Ok(()) => Err(aborted),
            },
        }
    }

    /// Let the workers drain the ready queue, join them and clear the dispatcher table.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error raised while the pool ran.
    pub fn join(&self) -> Result<()> {
        {
            let mut ready = self.scheduler.ready.lock();
            ready.shutdown = true;
        }
        self.scheduler.work_available.notify_all();

        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.join().is_err() {
                self.scheduler.raise(PipelineError::WorkerPanic("worker thread died".into()));
            }
        }
        self.scheduler.dispatchers.write().clear();
        self.scheduler.flags.lock().clear();

        match self.scheduler.first_error.lock().take() {
            Some(e) => Err(e),
            None if self.scheduler.is_panicked() => Err(PipelineError::Aborted),
            None => Ok(()),
        }
    }
}

impl<P: Send + 'static> Drop for ThreadPool<P> {
    fn drop(&mut self) {
        if self.handles.lock().is_empty() {
            return;
        }
        self.scheduler.enter_panic_mode();
        let _ = self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    /// Counts down, resubmitting itself until zero, then sets a flag.
    struct Countdown {
        id: DispatcherId,
        flag: Arc<CompletionFlag>,
        seen: Mutex<Vec<u32>>,
    }

    impl Dispatcher<u32> for Countdown {
        fn dispatch(&self, n: u32, scheduler: &Scheduler<u32>) -> Result<()> {
            self.seen.lock().push(n);
            if n == 0 {
                self.flag.set();
            } else {
                scheduler.submit(self.id, 0, n - 1);
            }
            Ok(())
        }
    }

    struct Failing {
        fail_on: u32,
        panic: bool,
    }

    impl Dispatcher<u32> for Failing {
        fn dispatch(&self, n: u32, _scheduler: &Scheduler<u32>) -> Result<()> {
            if n == self.fail_on {
                if self.panic {
                    panic!("package {n} exploded");
                }
                return Err(PipelineError::Validation {
                    stream: 0,
                    record: u64::from(n),
                    reason: "injected".into(),
                });
            }
            Ok(())
        }
    }

    fn countdown(pool: &ThreadPool<u32>) -> Arc<Countdown> {
        let scheduler = pool.scheduler();
        let id = scheduler.next_dispatcher_id();
        let stage = Arc::new(Countdown {
            id,
            flag: scheduler.completion_flag(),
            seen: Mutex::new(Vec::new()),
        });
        scheduler.register(id, stage.clone()).unwrap();
        stage
    }

    #[test]
    fn test_chain_completes_and_joins() {
        let pool = ThreadPool::new(3, None).unwrap();
        let stage = countdown(&pool);
        pool.scheduler().submit(stage.id, 0, 100);
        pool.wait(&stage.flag).unwrap();
        pool.join().unwrap();
        assert_eq!(stage.seen.lock().len(), 101);
        assert_eq!(pool.scheduler().packages_executed(), 101);
    }

    #[test]
    fn test_ready_queue_orders_by_priority_then_sequence() {
        let mut heap: PendingHeap<WorkPackage<&str>> = PendingHeap::new();
        let items = [(5, 0, "e"), (1, 1, "b"), (1, 2, "c"), (0, 3, "a"), (5, 4, "f")];
        for (priority, sequence, payload) in items {
            heap.push(WorkPackage { priority, sequence, dispatcher: 0, payload });
        }
        let order: Vec<_> = std::iter::from_fn(|| heap.pop().map(|p| p.payload)).collect();
        assert_eq!(order, vec!["a", "b", "c", "e", "f"]);
    }

    #[test]
    fn test_error_enters_panic_mode() {
        let pool = ThreadPool::new(4, None).unwrap();
        let scheduler = pool.scheduler();
        let id = scheduler.next_dispatcher_id();
        scheduler.register(id, Arc::new(Failing { fail_on: 17, panic: false })).unwrap();
        let never = scheduler.completion_flag();
        for n in 0..64 {
            scheduler.submit(id, 0, n);
        }

        let start = Instant::now();
        let err = pool.wait(&never).unwrap_err();
        assert!(start.elapsed() < POLL_INTERVAL, "waiter woke on panic, not by polling");
        assert!(matches!(err, PipelineError::Validation { record: 17, .. }), "{err}");
        assert!(pool.scheduler().is_panicked());
        assert!(pool.handles.lock().is_empty(), "workers were joined");
    }

    #[test]
    fn test_rust_panic_is_captured() {
        let pool = ThreadPool::new(2, None).unwrap();
        let scheduler = pool.scheduler();
        let id = scheduler.next_dispatcher_id();
        scheduler.register(id, Arc::new(Failing { fail_on: 3, panic: true })).unwrap();
        let never = scheduler.completion_flag();
        scheduler.submit(id, 0, 3);
        match pool.wait(&never).unwrap_err() {
            PipelineError::WorkerPanic(msg) => assert!(msg.contains("package 3 exploded")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_dispatcher_is_internal_error() {
        let pool: ThreadPool<u32> = ThreadPool::new(1, None).unwrap();
        let flag = pool.scheduler().completion_flag();
        pool.scheduler().submit(42, 0, 0);
        let err = pool.wait(&flag).unwrap_err();
        assert_eq!(err.kind(), "internal");
    }

    #[test]
    fn test_register_rejects_duplicates_and_unreserved_ids() {
        let pool = ThreadPool::new(1, None).unwrap();
        let stage = countdown(&pool);
        assert!(pool.scheduler().register(stage.id, stage.clone()).is_err());
        assert!(pool.scheduler().register(99, stage.clone()).is_err());
        pool.join().unwrap();
    }

    #[test]
    fn test_jitter_bound_saturates() {
        assert_eq!(jitter_bound_micros(Duration::from_micros(50)), 50);
        assert_eq!(jitter_bound_micros(Duration::ZERO), 0);
        assert_eq!(jitter_bound_micros(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_drop_without_join_stops_workers() {
        let pool = ThreadPool::new(2, Some(Duration::from_micros(50))).unwrap();
        let stage = countdown(&pool);
        pool.scheduler().submit(stage.id, 0, 1_000_000);
        drop(pool);
    }
}
