//! # Cyclic Dispatcher
//!
//! Sends an empty request to a destination queue at a fixed period, starting
//! at a fixed offset from registration, without cumulative drift.
//!
//! ## Drift-free re-arming
//!
//! Every request remembers the absolute tick of its *scheduled* deadline.
//! When the timer fires, the next deadline is computed from that scheduled
//! value, not from the instant the callback actually ran:
//!
//! ```text
//! next_deadline = previous_deadline + period      (never now + period)
//! delay         = next_deadline - now
//! ```
//!
//! Callback latency therefore shortens the following delay instead of
//! pushing the whole schedule back, and the n-th dispatch stays anchored at
//! `offset + n * period`.
//!
//! ## Overruns and no catch-up
//!
//! If the dispatcher falls so far behind that `next_deadline` is already in
//! the past, the request fires once at the next opportunity (delay of zero).
//! When whole periods have been missed, the deadline jumps forward over the
//! missed grid points instead of firing once per missed cycle; the jump is
//! counted in [`RequestStats::skipped_cycles`]. The grid itself is kept: the
//! schedule never drifts, only the count of dispatches is not enforced.
//!
//! ## Lifecycle
//!
//! ```text
//!   ┌──────┐  register()  ┌───────┐  timer fires  ┌────────┐
//!   │ Idle │ ───────────► │ Armed │ ────────────► │ Firing │
//!   └──────┘              └───────┘ ◄──────────── └────────┘
//!                             ▲         re-armed       │
//!                             │                        │ re-arm refused
//!                             │  rearm_stalled() ┌─────▼───┐
//!                             └───────────────── │ Stalled │
//!                                                └─────────┘
//! ```
//!
//! A refused re-arm leaves the deadline at the last grid point that fired,
//! so a later [`CyclicDispatcher::rearm_stalled`] resumes on the same grid.
//!
//! Requests are never cancelled or removed; the table only grows up to its
//! fixed capacity.

use zerocopy::{Immutable, IntoBytes, KnownLayout};

use crate::clock::{ns_to_ticks, Rounding};
use crate::config::EMPTY_REQUEST_DATA_SIZE;
use crate::error::DispatchError;
use crate::hal::{MessageQueues, QueueId, TimerId, TimerService};

/// Handle of a registered cyclic request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub(crate) usize);

impl RequestId {
    /// Position of the request in the dispatcher table. Also the tag the
    /// request's timer is armed with.
    pub const fn index(self) -> usize {
        self.0
    }

    /// Recover a request id from a timer tag.
    pub const fn from_tag(tag: usize) -> Self {
        RequestId(tag)
    }
}

/// The request delivered to a cyclic interface on every period.
/// It carries no parameters; only its arrival matters.
///
/// Laid out as its receivers expect it: header, then the data field on a
/// 16-byte boundary, padded to a multiple of 16 bytes.
#[derive(Debug, Clone, Copy, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct EmptyRequest {
    pub sender_pid: u32,
    pub length: u32,
    reserved: [u8; 8],
    pub data: [u8; EMPTY_REQUEST_DATA_SIZE],
    tail: [u8; 16 - EMPTY_REQUEST_DATA_SIZE % 16],
}

const _: () = assert!(core::mem::offset_of!(EmptyRequest, data) == 16);
const _: () = assert!(core::mem::size_of::<EmptyRequest>() % 16 == 0);

impl EmptyRequest {
    pub const fn zeroed() -> Self {
        Self {
            sender_pid: 0,
            length: 0,
            reserved: [0; 8],
            data: [0; EMPTY_REQUEST_DATA_SIZE],
            tail: [0; 16 - EMPTY_REQUEST_DATA_SIZE % 16],
        }
    }

    /// Largest payload a cyclic request may declare.
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

/// Position of a request in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Registered, timer not armed yet.
    Idle,
    /// Timer armed for the next deadline.
    Armed,
    /// Timer expired; the dispatch is in progress.
    Firing,
    /// Re-arming failed; no timer is pending until
    /// [`CyclicDispatcher::rearm_stalled`] succeeds.
    Stalled,
}

/// Per-request dispatch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestStats {
    /// Timer expirations handled.
    pub fires: u32,
    /// Dispatches dropped because the destination queue was full.
    pub dropped: u32,
    /// Whole periods jumped over after an overrun.
    pub skipped_cycles: u32,
    /// Times the timer service refused to re-arm the request.
    pub arm_failures: u32,
}

/// Called from timer-service context whenever a cyclic send is dropped,
/// with the destination queue and the total number of drops so far.
pub type OverflowCallback = fn(QueueId, u32);

#[derive(Debug, Clone, Copy)]
struct CyclicRequest {
    timer: TimerId,
    queue: QueueId,
    period_ticks: u32,
    next_deadline_ticks: u32,
    payload_size: usize,
    state: RequestState,
    stats: RequestStats,
}

/// Fixed-capacity table of cyclic requests driven by RTOS one-shot timers.
pub struct CyclicDispatcher<T: TimerService, Q: MessageQueues, const N: usize> {
    timers: T,
    queues: Q,
    requests: [Option<CyclicRequest>; N],
    count: usize,
    payload: EmptyRequest,
    on_overflow: Option<OverflowCallback>,
}

impl<T: TimerService, Q: MessageQueues, const N: usize> CyclicDispatcher<T, Q, N> {
    pub const fn new(timers: T, queues: Q) -> Self {
        Self {
            timers,
            queues,
            requests: [None; N],
            count: 0,
            payload: EmptyRequest::zeroed(),
            on_overflow: None,
        }
    }

    /// Register a request that sends `payload_size` bytes of the empty
    /// request to `queue` every `period_ns`, first at `offset_ns` from now.
    pub fn register(
        &mut self,
        period_ns: u64,
        offset_ns: u64,
        queue: QueueId,
        payload_size: usize,
    ) -> Result<RequestId, DispatchError> {
        if payload_size > EmptyRequest::SIZE {
            return Err(DispatchError::PayloadTooLarge {
                requested: payload_size,
                capacity: EmptyRequest::SIZE,
            });
        }
        if self.count >= N {
            log::warn!("cyclic request for {:?} refused: table full ({})", queue, N);
            return Err(DispatchError::CapacityExceeded);
        }

        let rate = u64::from(self.timers.ticks_per_second());
        let period_ticks = to_u32_ticks(ns_to_ticks(period_ns, rate, Rounding::Down));
        let offset_ticks = to_u32_ticks(ns_to_ticks(offset_ns, rate, Rounding::Down));
        if period_ticks == 0 {
            return Err(DispatchError::ZeroPeriod);
        }

        let timer = self.timers.create_timer().map_err(DispatchError::Timer)?;
        let now = self.timers.ticks_since_boot();
        let id = RequestId(self.count);

        let mut request = CyclicRequest {
            timer,
            queue,
            period_ticks,
            next_deadline_ticks: now.wrapping_add(offset_ticks),
            payload_size,
            state: RequestState::Idle,
            stats: RequestStats::default(),
        };

        self.timers
            .fire_after(timer, offset_ticks, id.index())
            .map_err(DispatchError::Timer)?;
        request.state = RequestState::Armed;

        self.requests[id.index()] = Some(request);
        self.count += 1;

        log::info!(
            "cyclic request {} -> {:?}: period {} ticks, first deadline {}",
            id.index(),
            queue,
            period_ticks,
            request.next_deadline_ticks
        );
        Ok(id)
    }

    /// Handle expiry of the timer armed for `id`. Timer-service context.
    ///
    /// Sends the empty request (best effort, never blocking) and re-arms the
    /// timer for the next deadline on the schedule grid.
    pub fn on_fire(&mut self, id: RequestId) -> Result<(), DispatchError> {
        let request = self
            .requests
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or(DispatchError::UnknownRequest(id))?;

        request.state = RequestState::Firing;
        request.stats.fires = request.stats.fires.wrapping_add(1);

        let payload = &self.payload.as_bytes()[..request.payload_size];
        if self.queues.try_send(request.queue, payload).is_err() {
            request.stats.dropped = request.stats.dropped.wrapping_add(1);
            if let Some(callback) = self.on_overflow {
                callback(request.queue, request.stats.dropped);
            }
        }

        arm_next(&mut self.timers, request, id)
    }

    /// Retry arming every request whose re-arm failed. Returns how many are
    /// still stalled afterwards.
    pub fn rearm_stalled(&mut self) -> usize {
        let mut stalled = 0;
        for (index, slot) in self.requests.iter_mut().enumerate() {
            let Some(request) = slot.as_mut() else { continue };
            if request.state == RequestState::Stalled
                && arm_next(&mut self.timers, request, RequestId(index)).is_err()
            {
                stalled += 1;
            }
        }
        stalled
    }

    /// Install the callback notified about dropped dispatches.
    pub fn set_overflow_callback(&mut self, callback: OverflowCallback) {
        self.on_overflow = Some(callback);
    }

    /// Absolute tick of the request's next scheduled dispatch.
    pub fn next_deadline(&self, id: RequestId) -> Result<u32, DispatchError> {
        self.request(id).map(|r| r.next_deadline_ticks)
    }

    /// Period of the request in timer ticks.
    pub fn period_ticks(&self, id: RequestId) -> Result<u32, DispatchError> {
        self.request(id).map(|r| r.period_ticks)
    }

    pub fn state(&self, id: RequestId) -> Result<RequestState, DispatchError> {
        self.request(id).map(|r| r.state)
    }

    pub fn request_stats(&self, id: RequestId) -> Result<RequestStats, DispatchError> {
        self.request(id).map(|r| r.stats)
    }

    /// Number of registered requests.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn timer_service(&self) -> &T {
        &self.timers
    }

    pub fn timer_service_mut(&mut self) -> &mut T {
        &mut self.timers
    }

    pub fn queues(&self) -> &Q {
        &self.queues
    }

    pub fn queues_mut(&mut self) -> &mut Q {
        &mut self.queues
    }

    fn request(&self, id: RequestId) -> Result<&CyclicRequest, DispatchError> {
        self.requests
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or(DispatchError::UnknownRequest(id))
    }
}

/// Arm `request` for its next grid point after the deadline it last fired
/// for. The deadline and skip count only change once the timer is armed;
/// on failure the request is left `Stalled`.
fn arm_next<T: TimerService>(
    timers: &mut T,
    request: &mut CyclicRequest,
    id: RequestId,
) -> Result<(), DispatchError> {
    let now = timers.ticks_since_boot();
    let mut next = request.next_deadline_ticks.wrapping_add(request.period_ticks);
    let mut missed = 0;

    // Ticks wrap at u32::MAX; a signed difference tells past from future.
    let late_by = now.wrapping_sub(next) as i32;
    if late_by > 0 {
        missed = late_by as u32 / request.period_ticks;
        next = next.wrapping_add(missed.wrapping_mul(request.period_ticks));
    }

    let delay = (next.wrapping_sub(now) as i32).max(0) as u32;
    if let Err(err) = timers.fire_after(request.timer, delay, id.index()) {
        request.state = RequestState::Stalled;
        request.stats.arm_failures = request.stats.arm_failures.wrapping_add(1);
        return Err(DispatchError::Timer(err));
    }

    request.next_deadline_ticks = next;
    request.stats.skipped_cycles = request.stats.skipped_cycles.wrapping_add(missed);
    request.state = RequestState::Armed;
    Ok(())
}

fn to_u32_ticks(ticks: u64) -> u32 {
    u32::try_from(ticks).unwrap_or(u32::MAX)
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HalError;
    use crate::hal::QueueFull;
    use core::sync::atomic::{AtomicU32, Ordering};
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    struct FakeTimers {
        now: u32,
        rate: u32,
        created: u32,
        /// (timer, delay, tag) for every arm request, oldest first.
        armed: Vec<(TimerId, u32, usize)>,
        refuse_create: bool,
        refuse_arm: bool,
    }

    impl FakeTimers {
        fn at_rate(rate: u32) -> Self {
            Self {
                now: 0,
                rate,
                created: 0,
                armed: Vec::new(),
                refuse_create: false,
                refuse_arm: false,
            }
        }

        fn last_delay(&self) -> u32 {
            self.armed.last().map(|a| a.1).unwrap()
        }
    }

    impl TimerService for FakeTimers {
        fn create_timer(&mut self) -> Result<TimerId, HalError> {
            if self.refuse_create {
                return Err(HalError::CapacityExceeded);
            }
            self.created += 1;
            Ok(TimerId(self.created))
        }

        fn fire_after(&mut self, timer: TimerId, delay: u32, tag: usize) -> Result<(), HalError> {
            if self.refuse_arm {
                return Err(HalError::Rtos(5));
            }
            self.armed.push((timer, delay, tag));
            Ok(())
        }

        fn ticks_since_boot(&self) -> u32 {
            self.now
        }

        fn ticks_per_second(&self) -> u32 {
            self.rate
        }
    }

    struct FakeQueues {
        depth_limit: u32,
        depth: u32,
        sent: Vec<(QueueId, usize)>,
    }

    impl FakeQueues {
        fn unbounded() -> Self {
            Self {
                depth_limit: u32::MAX,
                depth: 0,
                sent: Vec::new(),
            }
        }
    }

    impl MessageQueues for FakeQueues {
        fn try_send(&mut self, queue: QueueId, payload: &[u8]) -> Result<(), QueueFull> {
            if self.depth >= self.depth_limit {
                return Err(QueueFull);
            }
            self.depth += 1;
            self.sent.push((queue, payload.len()));
            Ok(())
        }

        fn pending(&self, _queue: QueueId) -> Option<u32> {
            Some(self.depth)
        }
    }

    type Dispatcher = CyclicDispatcher<FakeTimers, FakeQueues, 4>;

    fn dispatcher(rate: u32) -> Dispatcher {
        CyclicDispatcher::new(FakeTimers::at_rate(rate), FakeQueues::unbounded())
    }

    #[test]
    fn test_register_arms_first_deadline_at_offset() {
        let mut d = dispatcher(1_000);
        d.timer_service_mut().now = 500;

        let id = d.register(10_000_000, 3_000_000, QueueId(7), 0).unwrap();
        assert_eq!(id.index(), 0);
        assert_eq!(d.next_deadline(id), Ok(503));
        assert_eq!(d.period_ticks(id), Ok(10));
        assert_eq!(d.state(id), Ok(RequestState::Armed));
        assert_eq!(d.timer_service().armed, vec![(TimerId(1), 3, 0)]);
    }

    #[test]
    fn test_register_capacity_exceeded() {
        let mut d = dispatcher(1_000);
        for _ in 0..4 {
            d.register(1_000_000, 0, QueueId(1), 0).unwrap();
        }
        assert_eq!(d.len(), 4);
        assert_eq!(
            d.register(1_000_000, 0, QueueId(1), 0),
            Err(DispatchError::CapacityExceeded)
        );
    }

    #[test]
    fn test_register_rejects_bad_requests() {
        let mut d = dispatcher(1_000);
        assert_eq!(
            d.register(1_000_000, 0, QueueId(1), EmptyRequest::SIZE + 1),
            Err(DispatchError::PayloadTooLarge {
                requested: EmptyRequest::SIZE + 1,
                capacity: EmptyRequest::SIZE,
            })
        );
        assert_eq!(d.register(999_999, 0, QueueId(1), 0), Err(DispatchError::ZeroPeriod));

        d.timer_service_mut().refuse_create = true;
        assert_eq!(
            d.register(1_000_000, 0, QueueId(1), 0),
            Err(DispatchError::Timer(HalError::CapacityExceeded))
        );
        assert!(d.is_empty());
    }

    #[test]
    fn test_unknown_request() {
        let mut d = dispatcher(1_000);
        let ghost = RequestId::from_tag(3);
        assert_eq!(d.on_fire(ghost), Err(DispatchError::UnknownRequest(ghost)));
        assert_eq!(d.next_deadline(ghost), Err(DispatchError::UnknownRequest(ghost)));
    }

    #[test]
    fn test_fire_sends_payload_and_rearms() {
        let mut d = dispatcher(1_000);
        let id = d.register(10_000_000, 0, QueueId(2), 8).unwrap();

        d.timer_service_mut().now = 1;
        d.on_fire(id).unwrap();

        assert_eq!(d.queues().sent, vec![(QueueId(2), 8)]);
        assert_eq!(d.next_deadline(id), Ok(10));
        assert_eq!(d.timer_service().last_delay(), 9);
        assert_eq!(d.state(id), Ok(RequestState::Armed));
        assert_eq!(d.request_stats(id).unwrap().fires, 1);
    }

    /// 10 ms period on a counter running at the monotonic clock's rate
    /// (150 MHz / 8). Five fires with up to 2 ms of callback jitter each must
    /// leave the schedule exactly at 5 * 10 ms.
    #[test]
    fn test_jittered_fires_do_not_drift() {
        const RATE: u32 = 18_750_000;
        let period = ns_to_ticks(10_000_000, RATE as u64, Rounding::Down) as u32;
        let max_jitter = ns_to_ticks(2_000_000, RATE as u64, Rounding::Down) as u32;

        let mut rng = SmallRng::seed_from_u64(42);
        let mut d = dispatcher(RATE);
        let id = d.register(10_000_000, 0, QueueId(1), 0).unwrap();

        for _ in 0..5 {
            let deadline = d.next_deadline(id).unwrap();
            d.timer_service_mut().now = deadline + rng.gen_range(0..=max_jitter);
            d.on_fire(id).unwrap();
        }

        let expected = ns_to_ticks(5 * 10_000_000, RATE as u64, Rounding::Down) as u32;
        let fifth = d.next_deadline(id).unwrap();
        assert!(fifth.abs_diff(expected) <= 1, "{fifth} vs {expected}");
        assert_eq!(fifth, 5 * period);
        assert_eq!(d.request_stats(id).unwrap().skipped_cycles, 0);
    }

    #[test]
    fn test_deadlines_stay_on_grid_for_any_latency_up_to_period() {
        let mut rng = SmallRng::seed_from_u64(7);

        for _ in 0..200 {
            let period_ms: u64 = rng.gen_range(1..500);
            let offset_ms: u64 = rng.gen_range(0..1_000);
            let start: u32 = rng.gen();

            let mut d = dispatcher(1_000);
            d.timer_service_mut().now = start;
            let id = d
                .register(period_ms * 1_000_000, offset_ms * 1_000_000, QueueId(1), 0)
                .unwrap();

            for n in 1..=20u32 {
                let deadline = d.next_deadline(id).unwrap();
                let latency = rng.gen_range(0..=period_ms as u32);
                d.timer_service_mut().now = deadline.wrapping_add(latency);
                d.on_fire(id).unwrap();

                let expected = start
                    .wrapping_add(offset_ms as u32)
                    .wrapping_add(n.wrapping_mul(period_ms as u32));
                assert_eq!(d.next_deadline(id).unwrap(), expected);
                assert_eq!(
                    d.timer_service().last_delay(),
                    expected.wrapping_sub(d.timer_service().now)
                );
            }
        }
    }

    #[test]
    fn test_overrun_fires_once_then_realigns() {
        let mut d = dispatcher(1_000);
        let id = d.register(10_000_000, 10_000_000, QueueId(1), 0).unwrap();
        assert_eq!(d.next_deadline(id), Ok(10));

        // The deadline at 10 is serviced 35 ticks late: the grid points 20 and
        // 30 are gone, 40 is overdue and fires immediately.
        d.timer_service_mut().now = 45;
        d.on_fire(id).unwrap();
        assert_eq!(d.next_deadline(id), Ok(40));
        assert_eq!(d.timer_service().last_delay(), 0);
        assert_eq!(d.request_stats(id).unwrap().skipped_cycles, 2);

        // The immediate fire lands back on the grid; no burst follows.
        d.on_fire(id).unwrap();
        assert_eq!(d.next_deadline(id), Ok(50));
        assert_eq!(d.timer_service().last_delay(), 5);
        assert_eq!(d.request_stats(id).unwrap().fires, 2);
    }

    #[test]
    fn test_latency_of_exactly_one_period_fires_immediately() {
        let mut d = dispatcher(1_000);
        let id = d.register(10_000_000, 0, QueueId(1), 0).unwrap();

        d.timer_service_mut().now = 10;
        d.on_fire(id).unwrap();
        assert_eq!(d.next_deadline(id), Ok(10));
        assert_eq!(d.timer_service().last_delay(), 0);
        assert_eq!(d.request_stats(id).unwrap().skipped_cycles, 0);
    }

    #[test]
    fn test_tick_counter_wraparound() {
        let mut d = dispatcher(1_000);
        d.timer_service_mut().now = u32::MAX - 4;
        let id = d.register(10_000_000, 0, QueueId(1), 0).unwrap();

        d.timer_service_mut().now = u32::MAX - 3;
        d.on_fire(id).unwrap();
        assert_eq!(d.next_deadline(id), Ok(5));
        assert_eq!(d.timer_service().last_delay(), 9);
    }

    static LAST_DROPPED: AtomicU32 = AtomicU32::new(0);

    fn record_drop(queue: QueueId, dropped: u32) {
        assert_eq!(queue, QueueId(9));
        LAST_DROPPED.store(dropped, Ordering::SeqCst);
    }

    #[test]
    fn test_full_queue_drops_and_keeps_schedule() {
        let mut d = CyclicDispatcher::<_, _, 2>::new(
            FakeTimers::at_rate(1_000),
            FakeQueues {
                depth_limit: 1,
                depth: 0,
                sent: Vec::new(),
            },
        );
        d.set_overflow_callback(record_drop);
        let id = d.register(10_000_000, 0, QueueId(9), 0).unwrap();

        for n in 0..3u32 {
            d.timer_service_mut().now = n * 10;
            d.on_fire(id).unwrap();
        }

        let stats = d.request_stats(id).unwrap();
        assert_eq!(stats.fires, 3);
        assert_eq!(stats.dropped, 2);
        assert_eq!(LAST_DROPPED.load(Ordering::SeqCst), 2);
        assert_eq!(d.queues().sent.len(), 1);
        assert_eq!(d.next_deadline(id), Ok(30));
    }

    #[test]
    fn test_refused_rearm_stalls_then_recovers() {
        let mut d = dispatcher(1_000);
        let id = d.register(10_000_000, 0, QueueId(2), 0).unwrap();

        d.timer_service_mut().refuse_arm = true;
        d.timer_service_mut().now = 1;
        assert_eq!(
            d.on_fire(id),
            Err(DispatchError::Timer(HalError::Rtos(5)))
        );
        assert_eq!(d.state(id), Ok(RequestState::Stalled));
        assert_eq!(d.next_deadline(id), Ok(0));
        assert_eq!(d.timer_service().armed.len(), 1);
        let stats = d.request_stats(id).unwrap();
        assert_eq!(stats.fires, 1);
        assert_eq!(stats.arm_failures, 1);

        // Still refused: stays stalled.
        assert_eq!(d.rearm_stalled(), 1);
        assert_eq!(d.request_stats(id).unwrap().arm_failures, 2);

        d.timer_service_mut().refuse_arm = false;
        d.timer_service_mut().now = 3;
        assert_eq!(d.rearm_stalled(), 0);
        assert_eq!(d.state(id), Ok(RequestState::Armed));
        assert_eq!(d.next_deadline(id), Ok(10));
        assert_eq!(d.timer_service().last_delay(), 7);

        // Armed requests are left alone.
        assert_eq!(d.rearm_stalled(), 0);
        assert_eq!(d.timer_service().armed.len(), 2);
    }
}
