//! # Execution Monitor
//!
//! Observes the runtime without influencing it:
//!
//! - **Activation log**: bounded ring of interface activation/deactivation
//!   events, timestamped on the monotonic time base.
//! - **Execution statistics**: per-interface min/max/mean handler duration.
//! - **Idle CPU usage**: min/max/mean share of time spent in the idle thread,
//!   sampled once per monitoring tick.
//! - **Stack high-water mark**: deepest stack use, inferred from how much of
//!   the paint pattern written at thread creation has been overwritten.
//! - **Queue depth**: current and maximum number of queued requests.
//!
//! ## Activation log indexing
//!
//! A single counter counts every entry ever written. Positions are always
//! derived from it, never stored:
//!
//! ```text
//! write slot   = counter % LOG
//! latest index = (counter - 1) % LOG          (counter > 0)
//! size         = min(counter, LOG)
//! ```
//!
//! The log starts frozen. While frozen, appends are dropped and the counter
//! does not move. A zero-capacity log is the "activation logging compiled
//! out" build: every log query answers [`MonitorError::Unavailable`].
//!
//! ## Running statistics
//!
//! Means are updated incrementally (`mean += (x - mean) / n`), so no sample
//! history is kept.

use crate::clock::TimeSource;
use crate::config::STACK_PAINT_PATTERN;
use crate::error::MonitorError;
use crate::hal::{MessageQueues, StackGrowth, StackLookup, StackRegion, ThreadRegistry};

// ---------------------------------------------------------------------------
// Activation log entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Activation,
    Deactivation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivationEntry {
    pub interface: usize,
    pub entry_type: EntryType,
    pub timestamp_ns: u64,
}

impl ActivationEntry {
    const EMPTY: Self = Self {
        interface: 0,
        entry_type: EntryType::Activation,
        timestamp_ns: 0,
    };
}

/// Borrowed view of the activation log.
#[derive(Debug, Clone, Copy)]
pub struct ActivationLog<'a> {
    /// The whole backing ring; only `count` slots are meaningful.
    pub entries: &'a [ActivationEntry],
    /// Slot written most recently.
    pub latest_index: usize,
    /// Number of valid entries.
    pub count: usize,
}

impl<'a> ActivationLog<'a> {
    /// Valid entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &'a ActivationEntry> + 'a {
        let entries = self.entries;
        let capacity = entries.len();
        let oldest = if self.count < capacity {
            0
        } else {
            (self.latest_index + 1) % capacity.max(1)
        };
        (0..self.count).map(move |i| &entries[(oldest + i) % capacity])
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Min/max/running mean over a stream of samples.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Running {
    min: f64,
    max: f64,
    mean: f64,
    samples: u32,
}

impl Running {
    const EMPTY: Self = Self {
        min: 0.0,
        max: 0.0,
        mean: 0.0,
        samples: 0,
    };

    fn add(&mut self, x: f64) {
        if self.samples == 0 {
            self.min = x;
            self.max = x;
        } else {
            self.min = self.min.min(x);
            self.max = self.max.max(x);
        }
        self.samples = self.samples.saturating_add(1);
        self.mean += (x - self.mean) / f64::from(self.samples);
    }
}

/// Handler execution time statistics of one interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionStats {
    pub min_ns: u64,
    pub max_ns: u64,
    pub mean_ns: u64,
    pub samples: u32,
}

/// Share of time the idle thread had the CPU, in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CpuUsage {
    pub min_percent: f32,
    pub max_percent: f32,
    pub mean_percent: f32,
    pub samples: u32,
}

// ---------------------------------------------------------------------------
// Stack scan
// ---------------------------------------------------------------------------

/// Bytes of `region` that have ever been used, judged by the paint pattern.
///
/// The scan starts at the end farthest from where the stack starts growing
/// and stops at the first word that no longer holds the pattern. A fully
/// painted stack reports zero. Live data that happens to equal the pattern
/// makes this an underestimate.
pub fn stack_high_water(region: &StackRegion<'_>) -> u32 {
    let words = region.words;
    let used_words = match region.growth {
        StackGrowth::Downward => words
            .iter()
            .position(|&w| w != STACK_PAINT_PATTERN)
            .map_or(0, |i| words.len() - i),
        StackGrowth::Upward => words
            .iter()
            .rposition(|&w| w != STACK_PAINT_PATTERN)
            .map_or(0, |i| i + 1),
    };
    (used_words * 4) as u32
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// Monitoring context for `IFACES` interfaces with an activation log of
/// `LOG` entries.
pub struct ExecutionMonitor<const LOG: usize, const IFACES: usize> {
    log: [ActivationEntry; LOG],
    counter: u64,
    frozen: bool,
    usage: [Running; IFACES],
    idle: Running,
    uptime_at_reset_ns: u64,
    max_queued: [u32; IFACES],
}

impl<const LOG: usize, const IFACES: usize> ExecutionMonitor<LOG, IFACES> {
    /// Empty monitor with a frozen activation log. CPU usage is measured
    /// from `clock`'s current time on.
    pub fn new(clock: &impl TimeSource) -> Self {
        Self {
            log: [ActivationEntry::EMPTY; LOG],
            counter: 0,
            frozen: true,
            usage: [Running::EMPTY; IFACES],
            idle: Running::EMPTY,
            uptime_at_reset_ns: clock.now_ns(),
            max_queued: [0; IFACES],
        }
    }

    // -- activation log ----------------------------------------------------

    /// Log that `interface` started handling a request. Returns `false` when
    /// the log is frozen or compiled out.
    pub fn indicate_activated(&mut self, interface: usize, clock: &impl TimeSource) -> bool {
        self.append(interface, EntryType::Activation, clock)
    }

    /// Log that `interface` finished handling a request.
    pub fn indicate_deactivated(&mut self, interface: usize, clock: &impl TimeSource) -> bool {
        self.append(interface, EntryType::Deactivation, clock)
    }

    fn append(&mut self, interface: usize, entry_type: EntryType, clock: &impl TimeSource) -> bool {
        if LOG == 0 || self.frozen {
            return false;
        }
        let slot = (self.counter % LOG as u64) as usize;
        self.log[slot] = ActivationEntry {
            interface,
            entry_type,
            timestamp_ns: clock.now_ns(),
        };
        self.counter += 1;
        true
    }

    pub fn get_activation_log(&self) -> Result<ActivationLog<'_>, MonitorError> {
        self.log_enabled()?;
        let (latest_index, count) = match self.counter {
            0 => (0, 0),
            n => (((n - 1) % LOG as u64) as usize, n.min(LOG as u64) as usize),
        };
        Ok(ActivationLog {
            entries: &self.log,
            latest_index,
            count,
        })
    }

    /// Stop appending to the activation log.
    pub fn freeze(&mut self) -> Result<(), MonitorError> {
        self.log_enabled()?;
        self.frozen = true;
        log::debug!("activation log frozen at {} entries", self.counter);
        Ok(())
    }

    /// Resume appending after the latest entry.
    pub fn unfreeze(&mut self) -> Result<(), MonitorError> {
        self.log_enabled()?;
        self.frozen = false;
        log::debug!("activation log unfrozen");
        Ok(())
    }

    /// Forget every logged entry.
    pub fn clear(&mut self) -> Result<(), MonitorError> {
        self.log_enabled()?;
        self.counter = 0;
        log::debug!("activation log cleared");
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    fn log_enabled(&self) -> Result<(), MonitorError> {
        if LOG == 0 {
            Err(MonitorError::Unavailable)
        } else {
            Ok(())
        }
    }

    // -- execution statistics ----------------------------------------------

    /// Account one handler run of `interface`.
    pub fn record_execution(
        &mut self,
        interface: usize,
        duration_ns: u64,
    ) -> Result<(), MonitorError> {
        let usage = self.usage.get_mut(interface).ok_or(MonitorError::NotFound)?;
        usage.add(duration_ns as f64);
        Ok(())
    }

    pub fn get_usage(&self, interface: usize) -> Result<ExecutionStats, MonitorError> {
        let usage = self.usage.get(interface).ok_or(MonitorError::NotFound)?;
        Ok(ExecutionStats {
            min_ns: usage.min as u64,
            max_ns: usage.max as u64,
            mean_ns: usage.mean as u64,
            samples: usage.samples,
        })
    }

    /// Run `handler` as one activation of `interface`: log activation, time
    /// the handler, account the duration, log deactivation.
    pub fn measure<R>(
        &mut self,
        interface: usize,
        clock: &impl TimeSource,
        handler: impl FnOnce() -> R,
    ) -> R {
        self.indicate_activated(interface, clock);
        let before = clock.now_ns();
        let result = handler();
        let after = clock.now_ns();
        // An unknown interface still runs its handler; it just is not accounted.
        let _ = self.record_execution(interface, after.saturating_sub(before));
        self.indicate_deactivated(interface, clock);
        result
    }

    // -- CPU usage ---------------------------------------------------------

    /// Sample the idle thread's share of CPU time since the monitor started.
    /// Call once per monitoring period.
    pub fn tick(
        &mut self,
        threads: &impl ThreadRegistry,
        clock: &impl TimeSource,
    ) -> Result<(), MonitorError> {
        let idle_ns = threads.idle_cpu_time_ns().ok_or(MonitorError::Unavailable)?;
        let total_ns = clock.now_ns().saturating_sub(self.uptime_at_reset_ns);
        if total_ns == 0 {
            return Ok(());
        }
        self.idle.add(idle_ns as f64 * 100.0 / total_ns as f64);
        Ok(())
    }

    pub fn get_idle_cpu_usage(&self) -> CpuUsage {
        CpuUsage {
            min_percent: self.idle.min as f32,
            max_percent: self.idle.max as f32,
            mean_percent: self.idle.mean as f32,
            samples: self.idle.samples,
        }
    }

    // -- stacks and queues -------------------------------------------------

    /// Deepest stack use of the thread serving `interface`, in bytes.
    pub fn max_stack_usage(
        &self,
        threads: &impl ThreadRegistry,
        interface: usize,
    ) -> Result<u32, MonitorError> {
        match threads.thread_stack(interface) {
            StackLookup::Painted(region) => Ok(stack_high_water(&region)),
            StackLookup::Unpainted => Err(MonitorError::Unavailable),
            StackLookup::Missing => Err(MonitorError::NotFound),
        }
    }

    /// Requests waiting in `interface`'s queue. Also tracks the maximum.
    pub fn queued_items(
        &mut self,
        threads: &impl ThreadRegistry,
        queues: &impl MessageQueues,
        interface: usize,
    ) -> Result<u32, MonitorError> {
        let max = self.max_queued.get_mut(interface).ok_or(MonitorError::NotFound)?;
        let queue = threads.queue_of(interface).ok_or(MonitorError::Unavailable)?;
        let pending = queues.pending(queue).ok_or(MonitorError::Unavailable)?;
        *max = (*max).max(pending);
        Ok(pending)
    }

    /// Highest queue depth seen by [`queued_items`](Self::queued_items).
    pub fn maximum_queued_items(&self, interface: usize) -> Result<u32, MonitorError> {
        self.max_queued.get(interface).copied().ok_or(MonitorError::NotFound)
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{QueueFull, QueueId};
    use core::cell::Cell;

    /// Advances by 10 ns on every read.
    struct SteppingClock(Cell<u64>);

    impl TimeSource for SteppingClock {
        fn now_ns(&self) -> u64 {
            let now = self.0.get() + 10;
            self.0.set(now);
            now
        }
    }

    struct FixedClock(u64);

    impl TimeSource for FixedClock {
        fn now_ns(&self) -> u64 {
            self.0
        }
    }

    fn clock() -> SteppingClock {
        SteppingClock(Cell::new(0))
    }

    #[test]
    fn test_log_starts_frozen() {
        let c = clock();
        let mut m: ExecutionMonitor<4, 2> = ExecutionMonitor::new(&c);
        assert!(m.is_frozen());
        assert!(!m.indicate_activated(0, &c));
        assert_eq!(m.get_activation_log().unwrap().count, 0);
    }

    #[test]
    fn test_ring_full_then_wraps() {
        let c = clock();
        let mut m: ExecutionMonitor<4, 2> = ExecutionMonitor::new(&c);
        m.unfreeze().unwrap();

        for i in 0..4 {
            assert!(m.indicate_activated(i % 2, &c));
        }
        let log = m.get_activation_log().unwrap();
        assert_eq!(log.count, 4);
        assert_eq!(log.latest_index, 3);

        for k in 1..4 {
            m.indicate_deactivated(0, &c);
            let log = m.get_activation_log().unwrap();
            assert_eq!(log.count, 4);
            assert_eq!(log.latest_index, (3 + k) % 4);
            assert_eq!(log.entries[log.latest_index].entry_type, EntryType::Deactivation);
        }
    }

    #[test]
    fn test_log_iterates_in_time_order() {
        let c = clock();
        let mut m: ExecutionMonitor<3, 1> = ExecutionMonitor::new(&c);
        m.unfreeze().unwrap();
        for _ in 0..5 {
            m.indicate_activated(0, &c);
        }

        let stamps: Vec<u64> = m
            .get_activation_log()
            .unwrap()
            .iter()
            .map(|e| e.timestamp_ns)
            .collect();
        assert_eq!(stamps.len(), 3);
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*stamps.last().unwrap(), c.0.get());
    }

    #[test]
    fn test_freeze_drops_entries_and_keeps_position() {
        let c = clock();
        let mut m: ExecutionMonitor<8, 1> = ExecutionMonitor::new(&c);
        m.unfreeze().unwrap();
        m.indicate_activated(0, &c);
        m.indicate_deactivated(0, &c);

        m.freeze().unwrap();
        assert!(!m.indicate_activated(0, &c));
        assert!(!m.indicate_deactivated(0, &c));
        let frozen = m.get_activation_log().unwrap();
        assert_eq!((frozen.count, frozen.latest_index), (2, 1));
        let first = frozen.entries[0];

        m.unfreeze().unwrap();
        assert!(m.indicate_activated(0, &c));
        let log = m.get_activation_log().unwrap();
        assert_eq!((log.count, log.latest_index), (3, 2));
        assert_eq!(log.entries[0], first);
    }

    #[test]
    fn test_clear_resets_log() {
        let c = clock();
        let mut m: ExecutionMonitor<4, 1> = ExecutionMonitor::new(&c);
        m.unfreeze().unwrap();
        m.indicate_activated(0, &c);
        m.clear().unwrap();
        let log = m.get_activation_log().unwrap();
        assert_eq!((log.count, log.latest_index), (0, 0));
    }

    #[test]
    fn test_zero_capacity_log_is_unavailable() {
        let c = clock();
        let mut m: ExecutionMonitor<0, 1> = ExecutionMonitor::new(&c);
        assert_eq!(m.unfreeze(), Err(MonitorError::Unavailable));
        assert_eq!(m.freeze(), Err(MonitorError::Unavailable));
        assert_eq!(m.clear(), Err(MonitorError::Unavailable));
        assert!(matches!(m.get_activation_log(), Err(MonitorError::Unavailable)));
        assert!(!m.indicate_activated(0, &c));
        // Statistics keep working without the log.
        m.record_execution(0, 5).unwrap();
        assert_eq!(m.get_usage(0).unwrap().samples, 1);
    }

    #[test]
    fn test_execution_statistics() {
        let c = clock();
        let mut m: ExecutionMonitor<4, 2> = ExecutionMonitor::new(&c);
        for d in [300, 100, 200] {
            m.record_execution(1, d).unwrap();
        }
        let stats = m.get_usage(1).unwrap();
        assert_eq!(
            stats,
            ExecutionStats {
                min_ns: 100,
                max_ns: 300,
                mean_ns: 200,
                samples: 3
            }
        );
        assert_eq!(m.get_usage(0).unwrap(), ExecutionStats::default());
        assert_eq!(m.record_execution(2, 1), Err(MonitorError::NotFound));
        assert_eq!(m.get_usage(2), Err(MonitorError::NotFound));
    }

    #[test]
    fn test_measure_logs_and_times_handler() {
        let c = clock();
        let mut m: ExecutionMonitor<4, 1> = ExecutionMonitor::new(&c);
        m.unfreeze().unwrap();

        let out = m.measure(0, &c, || 42);
        assert_eq!(out, 42);

        // activation stamp, before, after, deactivation stamp: 10 ns apart.
        assert_eq!(m.get_usage(0).unwrap().max_ns, 10);
        let kinds: Vec<EntryType> = m
            .get_activation_log()
            .unwrap()
            .iter()
            .map(|e| e.entry_type)
            .collect();
        assert_eq!(kinds, [EntryType::Activation, EntryType::Deactivation]);
    }

    struct FakeThreads<'a> {
        idle_ns: Option<u64>,
        stack: StackLookup<'a>,
        queue: Option<QueueId>,
    }

    impl ThreadRegistry for FakeThreads<'_> {
        fn idle_cpu_time_ns(&self) -> Option<u64> {
            self.idle_ns
        }

        fn thread_stack(&self, _interface: usize) -> StackLookup<'_> {
            self.stack
        }

        fn queue_of(&self, _interface: usize) -> Option<QueueId> {
            self.queue
        }
    }

    #[test]
    fn test_idle_cpu_usage() {
        let mut m: ExecutionMonitor<0, 1> = ExecutionMonitor::new(&FixedClock(1_000));
        let mut threads = FakeThreads {
            idle_ns: Some(500),
            stack: StackLookup::Missing,
            queue: None,
        };

        // 500 ns idle out of 1000 ns elapsed, then 1800 of 2000.
        m.tick(&threads, &FixedClock(2_000)).unwrap();
        threads.idle_ns = Some(1_800);
        m.tick(&threads, &FixedClock(3_000)).unwrap();

        let usage = m.get_idle_cpu_usage();
        assert_eq!(usage.samples, 2);
        assert!((usage.min_percent - 50.0).abs() < 1e-3);
        assert!((usage.max_percent - 90.0).abs() < 1e-3);
        assert!((usage.mean_percent - 70.0).abs() < 1e-3);

        threads.idle_ns = None;
        assert_eq!(m.tick(&threads, &FixedClock(4_000)), Err(MonitorError::Unavailable));
    }

    #[test]
    fn test_stack_scan_counts_live_end() {
        let mut words = [STACK_PAINT_PATTERN; 64];
        words[60..].copy_from_slice(&[1, 2, 3, 4]);
        let down = StackRegion {
            words: &words,
            growth: StackGrowth::Downward,
        };
        assert_eq!(stack_high_water(&down), 16);

        let mut words = [STACK_PAINT_PATTERN; 64];
        words[..4].copy_from_slice(&[1, 2, 3, 4]);
        let up = StackRegion {
            words: &words,
            growth: StackGrowth::Upward,
        };
        assert_eq!(stack_high_water(&up), 16);

        let untouched = StackRegion {
            words: &[STACK_PAINT_PATTERN; 8],
            growth: StackGrowth::Downward,
        };
        assert_eq!(stack_high_water(&untouched), 0);
    }

    #[test]
    fn test_max_stack_usage_lookup() {
        let c = clock();
        let m: ExecutionMonitor<0, 1> = ExecutionMonitor::new(&c);
        let mut words = [STACK_PAINT_PATTERN; 16];
        words[15] = 0;

        let mut threads = FakeThreads {
            idle_ns: None,
            stack: StackLookup::Painted(StackRegion {
                words: &words,
                growth: StackGrowth::Downward,
            }),
            queue: None,
        };
        assert_eq!(m.max_stack_usage(&threads, 0), Ok(4));

        threads.stack = StackLookup::Unpainted;
        assert_eq!(m.max_stack_usage(&threads, 0), Err(MonitorError::Unavailable));
        threads.stack = StackLookup::Missing;
        assert_eq!(m.max_stack_usage(&threads, 0), Err(MonitorError::NotFound));
    }

    struct FakeQueues(Cell<u32>);

    impl MessageQueues for FakeQueues {
        fn try_send(&mut self, _queue: QueueId, _payload: &[u8]) -> Result<(), QueueFull> {
            Ok(())
        }

        fn pending(&self, queue: QueueId) -> Option<u32> {
            (queue == QueueId(1)).then(|| self.0.get())
        }
    }

    #[test]
    fn test_queued_items_tracks_maximum() {
        let c = clock();
        let mut m: ExecutionMonitor<0, 2> = ExecutionMonitor::new(&c);
        let mut threads = FakeThreads {
            idle_ns: None,
            stack: StackLookup::Missing,
            queue: Some(QueueId(1)),
        };
        let queues = FakeQueues(Cell::new(3));

        assert_eq!(m.queued_items(&threads, &queues, 0), Ok(3));
        queues.0.set(1);
        assert_eq!(m.queued_items(&threads, &queues, 0), Ok(1));
        assert_eq!(m.maximum_queued_items(0), Ok(3));
        assert_eq!(m.maximum_queued_items(1), Ok(0));

        threads.queue = None;
        assert_eq!(m.queued_items(&threads, &queues, 0), Err(MonitorError::Unavailable));
        threads.queue = Some(QueueId(2));
        assert_eq!(m.queued_items(&threads, &queues, 0), Err(MonitorError::Unavailable));
        assert_eq!(m.queued_items(&threads, &queues, 5), Err(MonitorError::NotFound));
    }
}
