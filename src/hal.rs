//! # Hardware and RTOS Abstraction
//!
//! The narrow set of services the runtime core needs from the board and from
//! the underlying preemptive multitasking substrate. Scheduling, monitoring
//! and fault logic are written once against these traits; each board
//! provides one implementation (see `board/`).
//!
//! ```text
//!  ┌──────────────────────── runtime core ────────────────────────┐
//!  │ MonotonicClock   CyclicDispatcher   ExecutionMonitor   Fault │
//!  └──────┬──────────────────┬──────────────────┬────────────┬────┘
//!         │                  │                  │            │
//!   HardwareClock     TimerService        ThreadRegistry  WatchdogTimer
//!   InterruptCtrl     MessageQueues       MessageQueues   ResetController
//! ```

use crate::error::HalError;

// ---------------------------------------------------------------------------
// Board services
// ---------------------------------------------------------------------------

/// A free-running hardware counter with a periodic reload interrupt.
pub trait HardwareClock {
    /// Configure the counter for free-running operation with the reload
    /// interrupt enabled, and start it from zero.
    fn start(&mut self);

    /// Current counter value, in `0..ticks_per_reload()`.
    fn counter(&self) -> u32;

    /// Number of counter ticks between two reload interrupts.
    fn ticks_per_reload(&self) -> u32;

    /// Frequency of the clock feeding the counter, before the prescaler.
    fn source_frequency_hz(&self) -> u64;

    /// Divider between the source clock and the counter.
    fn prescaler(&self) -> u32;
}

/// Interrupt and exception routing needed by the runtime core.
pub trait InterruptController {
    /// Unmask the interrupt raised by the [`HardwareClock`] on reload.
    fn enable_reload_interrupt(&mut self);

    /// Route MemManage, BusFault and UsageFault to their own vectors and trap
    /// integer division by zero, so every fault reaches the capture entry.
    fn enable_fault_traps(&mut self);
}

/// Independent watchdog.
pub trait WatchdogTimer {
    /// Stop the reset countdown.
    fn disable(&mut self);

    /// Reload the countdown.
    fn restart(&mut self);
}

/// Reason for the last processor reset, as reported by the reset controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    Powerup,
    Backup,
    Watchdog,
    Software,
    User,
    Unknown,
}

/// System reset controller.
pub trait ResetController {
    /// Classify the last reset.
    fn reset_reason(&self) -> ResetReason;

    /// Request a full system reset. Never returns.
    fn reset_system(&mut self) -> !;
}

// ---------------------------------------------------------------------------
// RTOS services
// ---------------------------------------------------------------------------

/// Identifier of a message queue owned by the RTOS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(pub u32);

/// Identifier of a timer owned by the RTOS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u32);

/// Identifier of a semaphore owned by the RTOS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemaphoreId(pub u32);

/// One-shot timers serviced by the RTOS timer-service context.
///
/// When a timer armed with [`fire_after`](Self::fire_after) expires, the
/// binding must call
/// [`CyclicDispatcher::on_fire`](crate::cyclic::CyclicDispatcher::on_fire)
/// with the `tag` it was armed with.
pub trait TimerService {
    /// Allocate a timer.
    fn create_timer(&mut self) -> Result<TimerId, HalError>;

    /// Arm `timer` to expire `delay_ticks` from now. A delay of zero means
    /// "at the next opportunity", never "never".
    fn fire_after(&mut self, timer: TimerId, delay_ticks: u32, tag: usize) -> Result<(), HalError>;

    /// Ticks elapsed since boot. Wraps at `u32::MAX`.
    fn ticks_since_boot(&self) -> u32;

    /// Timer tick rate.
    fn ticks_per_second(&self) -> u32;
}

/// The destination queue is full; the message was not enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull;

/// Non-blocking access to RTOS message queues.
pub trait MessageQueues {
    /// Enqueue `payload` without blocking.
    fn try_send(&mut self, queue: QueueId, payload: &[u8]) -> Result<(), QueueFull>;

    /// Number of messages waiting in `queue`, or `None` if the queue is
    /// unknown to the RTOS.
    fn pending(&self, queue: QueueId) -> Option<u32>;
}

/// Blocking delay of the calling task.
pub trait TaskDelay {
    /// Suspend the calling task for `ticks` scheduler ticks.
    fn sleep_ticks(&mut self, ticks: u32) -> bool;

    /// Scheduler tick rate.
    fn ticks_per_second(&self) -> u32;
}

/// Binary semaphores used as mutual-exclusion tokens.
pub trait SemaphoreProvider {
    /// Create an unlocked binary semaphore.
    fn create(&mut self) -> Result<SemaphoreId, HalError>;

    /// Obtain the token, waiting as long as necessary.
    fn obtain(&mut self, id: SemaphoreId) -> Result<(), HalError>;

    /// Release the token.
    fn release(&mut self, id: SemaphoreId) -> Result<(), HalError>;
}

// ---------------------------------------------------------------------------
// Thread introspection
// ---------------------------------------------------------------------------

/// Direction in which a stack grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackGrowth {
    /// Towards lower addresses (ARM, most targets).
    Downward,
    /// Towards higher addresses.
    Upward,
}

/// A thread's complete stack area, lowest address first.
#[derive(Debug, Clone, Copy)]
pub struct StackRegion<'a> {
    pub words: &'a [u32],
    pub growth: StackGrowth,
}

/// Result of looking up a thread's stack.
#[derive(Debug, Clone, Copy)]
pub enum StackLookup<'a> {
    /// The thread exists and its stack was painted at creation.
    Painted(StackRegion<'a>),
    /// The thread exists but stack painting is disabled.
    Unpainted,
    /// No thread serves this interface.
    Missing,
}

/// Read-only view over the RTOS threads that serve interfaces.
pub trait ThreadRegistry {
    /// CPU time consumed by the idle thread since the last usage reset.
    fn idle_cpu_time_ns(&self) -> Option<u64>;

    /// Stack area of the thread serving `interface`.
    fn thread_stack(&self, interface: usize) -> StackLookup<'_>;

    /// Request queue of `interface`, if it has one.
    fn queue_of(&self, interface: usize) -> Option<QueueId>;
}
