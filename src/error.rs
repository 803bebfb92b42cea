//! # Error Types
//!
//! One enum per concern. Every variant is `Copy` so errors can be returned
//! from interrupt-adjacent code without allocation.
//!
//! A hardware fault is absent from this list: it never returns
//! to a caller. Its only observable outcome is the death report read back
//! after the forced reset (see [`ReportError`]).

use thiserror::Error;

use crate::cyclic::RequestId;

/// Failure reported by an external collaborator (RTOS service or board port).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HalError {
    /// The RTOS refused the call; carries its raw status code.
    #[error("rtos call failed with status {0}")]
    Rtos(u32),
    /// The RTOS object pool behind the call is exhausted.
    #[error("rtos object pool exhausted")]
    CapacityExceeded,
}

/// Errors from [`CyclicDispatcher`](crate::cyclic::CyclicDispatcher).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The fixed request table is full.
    #[error("cyclic request table is full")]
    CapacityExceeded,
    /// The requested payload does not fit the fixed empty request.
    #[error("payload of {requested} bytes exceeds the {capacity}-byte request")]
    PayloadTooLarge { requested: usize, capacity: usize },
    /// A period of zero ticks cannot be scheduled.
    #[error("cyclic period rounds to zero timer ticks")]
    ZeroPeriod,
    /// The timer service could not create or arm the request's timer.
    #[error("timer service failure: {0}")]
    Timer(HalError),
    /// No request with this id was registered.
    #[error("unknown cyclic request {0:?}")]
    UnknownRequest(RequestId),
}

/// Errors from the [`ExecutionMonitor`](crate::monitor::ExecutionMonitor)
/// query interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MonitorError {
    /// The feature behind the query is compiled out or disabled.
    #[error("monitoring facility unavailable")]
    Unavailable,
    /// The interface (or its thread) is unknown.
    #[error("interface not found")]
    NotFound,
}

/// Errors raised while inspecting a death report after reboot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReportError {
    /// The stored checksum does not match the report contents.
    #[error("death report checksum mismatch (stored {stored:#06x}, computed {computed:#06x})")]
    ChecksumMismatch { stored: u16, computed: u16 },
}

/// Errors from [`SemaphorePool`](crate::sync::SemaphorePool).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SemaphoreError {
    /// The pool already holds its maximum number of semaphores.
    #[error("semaphore pool is full")]
    CapacityExceeded,
    /// The id was not handed out by this pool.
    #[error("semaphore not owned by this pool")]
    UnknownSemaphore,
    /// The RTOS refused the operation.
    #[error("semaphore operation failed: {0}")]
    Hal(HalError),
}

impl From<HalError> for SemaphoreError {
    fn from(err: HalError) -> Self {
        SemaphoreError::Hal(err)
    }
}
