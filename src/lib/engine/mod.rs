//! The block-sort/merge orchestration engine.
//!
//! ```text
//!  input ─▶ decode ──────────────▶ sort_control ─────────▶ writeback ─▶ temp streams
//!          read, decompress,       rewrite, base sort,     compress,
//!          parse, validate         merge runs, reorder,    write, checksum,
//!                 │                post-sort sequencing    index, sentinel
//!                 │
//!                 └──────────────▶ merge_control ────────▶ writeback ─▶ output
//!                                  k-way merge
//! ```
//!
//! Each stage owns its pools and queues and registers one dispatcher with the thread pool.
//! Stages are wired by small traits: a stage holds its downstream neighbour strongly and
//! reaches upstream (to return buffers) through an [`Upstream`] link.

pub mod decode;
pub mod merge_control;
pub mod request;
pub mod sort_control;
pub mod writeback;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use crate::errors::{PipelineError, Result};
use crate::pool::{FreeList, Lease, Recycle};
use crate::thread_pool::{self, DispatcherId};

pub use request::Request;

/// Scheduler type shared by every engine stage.
pub type Scheduler = thread_pool::Scheduler<Request>;

/// Thread pool type driving the engine.
pub type EnginePool = thread_pool::ThreadPool<Request>;

/// Queue `request` for the stage registered under `dispatcher`.
pub(crate) fn submit(scheduler: &Scheduler, dispatcher: DispatcherId, request: Request) {
    let priority = request.priority();
    scheduler.submit(dispatcher, priority, request);
}

/// Take an object from `pool` or record that the caller is waiting for one.
///
/// The stall flag is raised before a second attempt so a concurrent [`put_and_wake`] either
/// satisfies the retry or sees the flag.
pub(crate) fn get_or_stall<T: Recycle>(
    pool: &FreeList<T>,
    stalled: &AtomicBool,
) -> Option<Lease<T>> {
    if let Some(lease) = pool.get_if() {
        return Some(lease);
    }
    stalled.store(true, Ordering::SeqCst);
    let lease = pool.get_if()?;
    stalled.store(false, Ordering::SeqCst);
    Some(lease)
}

/// Return `lease` to `pool`; `true` when a producer stalled on the pool must be rescheduled.
pub(crate) fn put_and_wake<T: Recycle>(
    pool: &FreeList<T>,
    lease: Lease<T>,
    stalled: &AtomicBool,
) -> Result<bool> {
    pool.put(lease)?;
    Ok(stalled.swap(false, Ordering::SeqCst))
}

/// Late-bound, non-owning link to an upstream stage.
pub struct Upstream<T: ?Sized> {
    link: OnceLock<Weak<T>>,
}

impl<T: ?Sized> Default for Upstream<T> {
    fn default() -> Self {
        Self { link: OnceLock::new() }
    }
}

impl<T: ?Sized> Upstream<T> {
    /// Bind the link.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the link was already bound.
    pub fn connect(&self, target: Weak<T>) -> Result<()> {
        self.link.set(target).map_err(|_| PipelineError::internal("upstream link bound twice"))
    }

    /// Resolve the link.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the link was never bound or its stage is gone.
    pub fn get(&self) -> Result<Arc<T>> {
        self.link
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| PipelineError::internal("upstream stage is not connected"))
    }
}

/// Error for a request routed to the wrong stage.
pub(crate) fn misrouted(stage: &str, request: &Request) -> PipelineError {
    PipelineError::internal(format!("{stage} received a {} request", request.kind()))
}

/// Shared fixtures for the stage tests.
#[cfg(test)]
pub(crate) mod testing {
    use std::io::{self, Write};
    use std::sync::Arc;

    use parking_lot::Mutex;

    /// In-memory writer whose bytes stay readable after the writer is handed off.
    #[derive(Clone, Default)]
    pub(crate) struct SharedSink(pub(crate) Arc<Mutex<Vec<u8>>>);

    impl SharedSink {
        pub(crate) fn bytes(&self) -> Vec<u8> {
            self.0.lock().clone()
        }
    }

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
