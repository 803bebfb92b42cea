//! # Synchronization Primitives
//!
//! [`ConcurrentFlag`] gives lock-free optimistic reads of multi-word state
//! written by an interrupt handler. The writer never waits; the reader
//! retries. Everything else is shared by ownership: one context object per
//! application, borrowed mutably by whichever context drives it.
//!
//! [`SemaphorePool`] wraps the RTOS mutual-exclusion tokens handed out to
//! application code.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::error::SemaphoreError;
use crate::hal::{SemaphoreId, SemaphoreProvider};

// ---------------------------------------------------------------------------
// Concurrent access flag
// ---------------------------------------------------------------------------

/// "Modified during read" sentinel for one interrupt-context writer and one
/// task-context reader.
///
/// The writer calls [`set`](Self::set) after every update of the protected
/// state. The reader wraps its multi-word read in
/// [`read_consistent`](Self::read_consistent), which repeats the read until
/// no update landed in the middle of it:
///
/// ```text
/// repeat:
///   reset()
///   snapshot = read(fields...)
/// until not check()
/// ```
pub struct ConcurrentFlag {
    modified: AtomicBool,
}

impl ConcurrentFlag {
    pub const fn new() -> Self {
        Self {
            modified: AtomicBool::new(false),
        }
    }

    /// Mark the protected state as changed. Interrupt context only.
    #[inline]
    pub fn set(&self) {
        self.modified.store(true, Ordering::SeqCst);
    }

    /// Clear the flag. Must immediately precede a read sequence.
    #[inline]
    pub fn reset(&self) {
        self.modified.store(false, Ordering::SeqCst);
    }

    /// Whether [`set`](Self::set) was called since the last [`reset`](Self::reset).
    #[inline]
    pub fn check(&self) -> bool {
        self.modified.load(Ordering::SeqCst)
    }

    /// Run `read` until it completes without a concurrent [`set`](Self::set).
    ///
    /// Retries are unbounded in principle; in practice a retry only happens
    /// when the writer's interrupt lands inside `read`, which is rare enough
    /// that the loop exits within a couple of iterations.
    #[inline]
    pub fn read_consistent<T>(&self, mut read: impl FnMut() -> T) -> T {
        loop {
            self.reset();
            let snapshot = read();
            if !self.check() {
                return snapshot;
            }
        }
    }
}

impl Default for ConcurrentFlag {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Semaphore pool
// ---------------------------------------------------------------------------

/// Fixed-capacity pool of RTOS binary semaphores.
///
/// Creation is expected during initialization only, from a single task.
pub struct SemaphorePool<S: SemaphoreProvider, const N: usize> {
    provider: S,
    ids: [Option<SemaphoreId>; N],
    count: usize,
}

impl<S: SemaphoreProvider, const N: usize> SemaphorePool<S, N> {
    pub const fn new(provider: S) -> Self {
        Self {
            provider,
            ids: [None; N],
            count: 0,
        }
    }

    /// Create a new unlocked semaphore.
    pub fn create(&mut self) -> Result<SemaphoreId, SemaphoreError> {
        if self.count >= N {
            log::warn!("semaphore pool exhausted ({} of {})", self.count, N);
            return Err(SemaphoreError::CapacityExceeded);
        }

        let id = self.provider.create()?;
        self.ids[self.count] = Some(id);
        self.count += 1;
        Ok(id)
    }

    /// Obtain the token, waiting if it is held elsewhere.
    pub fn obtain(&mut self, id: SemaphoreId) -> Result<(), SemaphoreError> {
        self.ensure_owned(id)?;
        self.provider.obtain(id).map_err(SemaphoreError::from)
    }

    /// Release the token.
    pub fn release(&mut self, id: SemaphoreId) -> Result<(), SemaphoreError> {
        self.ensure_owned(id)?;
        self.provider.release(id).map_err(SemaphoreError::from)
    }

    /// Number of semaphores created so far.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn ensure_owned(&self, id: SemaphoreId) -> Result<(), SemaphoreError> {
        if self.ids[..self.count].contains(&Some(id)) {
            Ok(())
        } else {
            Err(SemaphoreError::UnknownSemaphore)
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
