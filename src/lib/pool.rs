//! Bounded object pools.
//!
//! Pools are the arbiter of buffer ownership: an object is either sitting free in its pool or
//! held by exactly one stage through a move-only [`Lease`]. Returning a lease consumes it, so a
//! double return or use-after-return does not compile.
//!
//! Two flavours exist:
//!
//! - [`FreeList`]: fixed capacity, filled at construction. Exhaustion is the engine's
//!   backpressure signal; producers call [`FreeList::get_if`] and re-queue themselves on `None`.
//! - [`GrowingFreeList`]: allocates on demand and never shrinks. Used for cheap or disk-backed
//!   state such as codec contexts and read-ends containers.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::errors::{PipelineError, Result};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

fn next_pool_id() -> u64 {
    NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed)
}

/// Objects that can be reset before going back into a [`FreeList`].
pub trait Recycle {
    /// Clear contents while keeping allocated capacity.
    fn recycle(&mut self);
}

impl Recycle for Vec<u8> {
    fn recycle(&mut self) {
        self.clear();
    }
}

// ============================================================================
// Lease
// ============================================================================

/// Exclusive, move-only handle to a pooled object.
#[derive(Debug)]
pub struct Lease<T> {
    item: T,
    pool: u64,
}

impl<T> Lease<T> {
    /// Identifier of the pool this lease must be returned to.
    #[must_use]
    pub fn pool_id(&self) -> u64 {
        self.pool
    }
}

impl<T> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.item
    }
}

impl<T> DerefMut for Lease<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.item
    }
}

// ============================================================================
// FreeList
// ============================================================================

struct FreeState<T> {
    free: Vec<T>,
    outstanding: usize,
}

/// Fixed-capacity pool.
pub struct FreeList<T> {
    id: u64,
    capacity: usize,
    state: Mutex<FreeState<T>>,
    returned: Condvar,
}

impl<T: Recycle> FreeList<T> {
    /// Build a pool holding `capacity` objects produced by `factory` (at least one).
    pub fn new(capacity: usize, mut factory: impl FnMut() -> T) -> Self {
        let capacity = capacity.max(1);
        let free = (0..capacity).map(|_| factory()).collect();
        Self {
            id: next_pool_id(),
            capacity,
            state: Mutex::new(FreeState { free, outstanding: 0 }),
            returned: Condvar::new(),
        }
    }

    /// Take an object, blocking until one is returned if the pool is empty.
    pub fn get(&self) -> Lease<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.free.pop() {
                state.outstanding += 1;
                return Lease { item, pool: self.id };
            }
            self.returned.wait(&mut state);
        }
    }

    /// Take an object if one is free, without blocking.
    pub fn get_if(&self) -> Option<Lease<T>> {
        let mut state = self.state.lock();
        let item = state.free.pop()?;
        state.outstanding += 1;
        Some(Lease { item, pool: self.id })
    }

    /// Recycle and return an object.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the lease belongs to another pool or more objects are
    /// returned than were handed out.
    pub fn put(&self, lease: Lease<T>) -> Result<()> {
        if lease.pool != self.id {
            return Err(PipelineError::internal(format!(
                "lease from pool {} returned to pool {}",
                lease.pool, self.id
            )));
        }
        let mut item = lease.item;
        item.recycle();
        {
            let mut state = self.state.lock();
            if state.outstanding == 0 {
                return Err(PipelineError::internal("free list received more puts than gets"));
            }
            state.outstanding -= 1;
            state.free.push(item);
        }
        self.returned.notify_one();
        Ok(())
    }

    /// Total number of objects owned by the pool.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of objects currently leased out.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }

    /// Number of objects currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.state.lock().free.len()
    }
}

// ============================================================================
// GrowingFreeList
// ============================================================================

/// Pool that allocates on demand and never shrinks.
///
/// Returned objects are not recycled; callers that park stateful objects here (read-ends
/// containers) get them back with their contents intact.
pub struct GrowingFreeList<T> {
    id: u64,
    free: Mutex<Vec<T>>,
    allocated: AtomicUsize,
    factory: Box<dyn Fn() -> T + Send + Sync>,
}

impl<T> GrowingFreeList<T> {
    pub fn new(factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            id: next_pool_id(),
            free: Mutex::new(Vec::new()),
            allocated: AtomicUsize::new(0),
            factory: Box::new(factory),
        }
    }

    /// Take a free object, allocating a new one when none is free.
    pub fn get(&self) -> Lease<T> {
        if let Some(lease) = self.get_if() {
            return lease;
        }
        self.allocated.fetch_add(1, Ordering::AcqRel);
        Lease { item: (self.factory)(), pool: self.id }
    }

    /// Take a free object without allocating.
    pub fn get_if(&self) -> Option<Lease<T>> {
        self.free.lock().pop().map(|item| Lease { item, pool: self.id })
    }

    /// Return an object.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the lease belongs to another pool.
    pub fn put(&self, lease: Lease<T>) -> Result<()> {
        if lease.pool != self.id {
            return Err(PipelineError::internal(format!(
                "lease from pool {} returned to growing pool {}",
                lease.pool, self.id
            )));
        }
        self.free.lock().push(lease.item);
        Ok(())
    }

    /// Remove every allocated object from the pool so no new user can obtain one.
    ///
    /// # Errors
    ///
    /// Returns an internal error if some objects are still leased out.
    pub fn take_all(&self) -> Result<Vec<Lease<T>>> {
        let items: Vec<T> = std::mem::take(&mut *self.free.lock());
        let allocated = self.allocated.load(Ordering::Acquire);
        if items.len() != allocated {
            let found = items.len();
            self.free.lock().extend(items);
            return Err(PipelineError::internal(format!(
                "{found} of {allocated} pooled objects free when all were expected"
            )));
        }
        Ok(items.into_iter().map(|item| Lease { item, pool: self.id }).collect())
    }

    /// Number of objects ever allocated by this pool.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }
}
