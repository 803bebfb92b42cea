//! # Runtime
//!
//! The context object that ties the time base, the cyclic dispatcher and the
//! execution monitor together. There are no hidden singletons: the
//! application owns one [`Runtime`] and every operation goes through it.
//! The only `static` state is the [`ReloadCounter`] the reload interrupt
//! writes, and the runtime merely borrows it.
//!
//! ## Startup Sequence
//!
//! ```text
//! reset (cortex-m-rt)
//!   └─► main()
//!         ├─► DeathReportReader::inspect()   ← previous run's fault, if any
//!         ├─► fault::arm()                   ← faults reach the capture entry
//!         ├─► Runtime::init()                ← start clock, unmask reload IRQ
//!         ├─► Runtime::register_cyclic()     ← arm periodic requests (×N)
//!         └─► loop
//!               ├─► Runtime::on_timer()      ← timer-service context
//!               ├─► Runtime::process_request()
//!               └─► Runtime::monitoring_tick()
//! ```

use crate::clock::{MonotonicClock, ReloadCounter, TimeSource};
use crate::config::{ACTIVATION_LOG_CAPACITY, MAX_CYCLIC_REQUESTS, MAX_INTERFACES};
use crate::cyclic::{CyclicDispatcher, RequestId};
use crate::error::{DispatchError, MonitorError};
use crate::hal::{
    HardwareClock, InterruptController, MessageQueues, QueueId, TaskDelay, ThreadRegistry,
    TimerService,
};
use crate::monitor::ExecutionMonitor;

/// Runtime sized by the build-time configuration.
pub type DefaultRuntime<'a, H, T, Q> =
    Runtime<'a, H, T, Q, ACTIVATION_LOG_CAPACITY, MAX_INTERFACES, MAX_CYCLIC_REQUESTS>;

/// Time base, cyclic dispatch and monitoring for one application.
pub struct Runtime<
    'a,
    H: HardwareClock,
    T: TimerService,
    Q: MessageQueues,
    const LOG: usize,
    const IFACES: usize,
    const N: usize,
> {
    pub clock: MonotonicClock<'a, H>,
    pub dispatcher: CyclicDispatcher<T, Q, N>,
    pub monitor: ExecutionMonitor<LOG, IFACES>,
}

impl<'a, H, T, Q, const LOG: usize, const IFACES: usize, const N: usize>
    Runtime<'a, H, T, Q, LOG, IFACES, N>
where
    H: HardwareClock,
    T: TimerService,
    Q: MessageQueues,
{
    /// Start the time base and unmask its reload interrupt.
    ///
    /// `reloads` must be the counter the reload interrupt handler feeds.
    pub fn init<I: InterruptController>(
        hw: H,
        reloads: &'a ReloadCounter,
        interrupts: &mut I,
        timers: T,
        queues: Q,
    ) -> Self {
        let clock = MonotonicClock::init(hw, reloads);
        interrupts.enable_reload_interrupt();
        let monitor = ExecutionMonitor::new(&clock);

        log::info!(
            "runtime up: {} cyclic slots, {} interfaces, activation log of {}",
            N,
            IFACES,
            LOG
        );

        Self {
            clock,
            dispatcher: CyclicDispatcher::new(timers, queues),
            monitor,
        }
    }

    /// Nanoseconds since [`init`](Self::init).
    pub fn elapsed_ns(&self) -> u64 {
        self.clock.now_ns()
    }

    /// Block the calling task for at least `ns`.
    pub fn sleep_ns<D: TaskDelay>(&self, delay: &mut D, ns: u64) -> bool {
        self.clock.sleep_ns(delay, ns)
    }

    /// Send an empty request to `queue` every `period_ns`, starting
    /// `offset_ns` from now.
    pub fn register_cyclic(
        &mut self,
        period_ns: u64,
        offset_ns: u64,
        queue: QueueId,
        payload_size: usize,
    ) -> Result<RequestId, DispatchError> {
        self.dispatcher.register(period_ns, offset_ns, queue, payload_size)
    }

    /// Timer-service callback: the timer armed with `tag` expired.
    pub fn on_timer(&mut self, tag: usize) -> Result<(), DispatchError> {
        self.dispatcher.on_fire(RequestId::from_tag(tag))
    }

    /// Retry requests whose timer could not be re-armed. Returns how many
    /// remain stalled.
    pub fn rearm_stalled(&mut self) -> usize {
        self.dispatcher.rearm_stalled()
    }

    /// Handle one request of `interface`, logging and timing it.
    pub fn process_request<R>(&mut self, interface: usize, handler: impl FnOnce() -> R) -> R {
        self.monitor.measure(interface, &self.clock, handler)
    }

    /// Periodic monitoring step.
    pub fn monitoring_tick(&mut self, threads: &impl ThreadRegistry) -> Result<(), MonitorError> {
        self.monitor.tick(threads, &self.clock)
    }

    /// Requests waiting for `interface`.
    pub fn queued_items(
        &mut self,
        threads: &impl ThreadRegistry,
        interface: usize,
    ) -> Result<u32, MonitorError> {
        self.monitor.queued_items(threads, self.dispatcher.queues(), interface)
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
