//! Fan-in counters and serial stage gates.
//!
//! Every multi-part fan-out in the engine (validate fragments, rewrite fragments, reorder copy
//! requests, compression sub-blocks) is paired with a counter whose decrement-to-zero, taken
//! under its lock, is the only trigger for the aggregate next step.

use parking_lot::{MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard};

use crate::errors::{PipelineError, Result};

/// Counter that reports reaching zero exactly once.
#[derive(Debug)]
pub struct FanIn {
    remaining: Mutex<usize>,
}

impl FanIn {
    #[must_use]
    pub fn new(parts: usize) -> Self {
        Self { remaining: Mutex::new(parts) }
    }

    /// Record one completed part; returns `true` for the part that brought the count to zero.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the counter is already zero.
    pub fn arrive(&self) -> Result<bool> {
        let mut remaining = self.remaining.lock();
        if *remaining == 0 {
            return Err(PipelineError::internal("fan-in counter decremented below zero"));
        }
        *remaining -= 1;
        Ok(*remaining == 0)
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        *self.remaining.lock()
    }
}

/// A value shared read-only by the parts of a fan-out and handed back to whichever part
/// completes last.
pub struct FanInSlot<T> {
    value: RwLock<Option<T>>,
    fan_in: FanIn,
}

impl<T> FanInSlot<T> {
    #[must_use]
    pub fn new(value: T, parts: usize) -> Self {
        Self { value: RwLock::new(Some(value)), fan_in: FanIn::new(parts) }
    }

    /// Shared access for one part. The guard must be dropped before [`Self::arrive`].
    ///
    /// # Errors
    ///
    /// Returns an internal error if the value was already released.
    pub fn read(&self) -> Result<MappedRwLockReadGuard<'_, T>> {
        RwLockReadGuard::try_map(self.value.read(), Option::as_ref)
            .map_err(|_| PipelineError::internal("fan-in value read after release"))
    }

    /// Record one completed part; the last part receives the value.
    ///
    /// # Errors
    ///
    /// Returns an internal error on over-arrival.
    pub fn arrive(&self) -> Result<Option<T>> {
        if !self.fan_in.arrive()? {
            return Ok(None);
        }
        self.value
            .write()
            .take()
            .map(Some)
            .ok_or_else(|| PipelineError::internal("fan-in value released twice"))
    }
}

#[derive(Debug, Default)]
struct GateState {
    scheduled: bool,
    rerun: bool,
}

/// Keeps at most one package of a sequential stage queued or running.
///
/// Producers call [`Self::try_schedule`] whenever new input or capacity appears and enqueue a
/// package only when it returns `true`. The running pass calls [`Self::complete`] when it can
/// make no further progress; a request that arrived during the pass makes `complete` return
/// `true` so that no wake-up is lost.
#[derive(Debug, Default)]
pub struct SerialGate {
    state: Mutex<GateState>,
}

impl SerialGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_schedule(&self) -> bool {
        let mut state = self.state.lock();
        if state.scheduled {
            state.rerun = true;
            false
        } else {
            state.scheduled = true;
            state.rerun = false;
            true
        }
    }

    /// Finish a pass; returns `true` if the caller must enqueue another one.
    pub fn complete(&self, again: bool) -> bool {
        let mut state = self.state.lock();
        if again || state.rerun {
            state.rerun = false;
            true
        } else {
            state.scheduled = false;
            false
        }
    }
}
