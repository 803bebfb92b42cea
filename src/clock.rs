//! # Monotonic Clock
//!
//! Widens a free-running hardware counter into a 64-bit nanosecond time base.
//!
//! The counter itself is only `ticks_per_reload` ticks wide. Every time it
//! reloads, an interrupt bumps a 32-bit reload count; elapsed time is then
//!
//! ```text
//! total_ticks = reload_count * ticks_per_reload + counter
//! elapsed_ns  = total_ticks * 1e9 / (source_frequency / prescaler)
//! ```
//!
//! ## Torn reads
//!
//! `reload_count` and `counter` are two separate words. If the reload
//! interrupt lands between reading one and the other, the pair describes an
//! instant that never existed (old reload count, freshly wrapped counter) and
//! time appears to jump backwards by a whole reload period. The interrupt
//! therefore raises a [`ConcurrentFlag`] after every increment and the reader
//! repeats the pair read until it completes undisturbed.
//!
//! The reload count is assumed not to wrap within the mission lifetime.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::config::NANOS_PER_SECOND;
use crate::hal::{HardwareClock, TaskDelay};
use crate::sync::ConcurrentFlag;

/// Anything that can timestamp an event on the runtime's time base.
pub trait TimeSource {
    /// Nanoseconds elapsed since the time base was initialized.
    fn now_ns(&self) -> u64;
}

/// The interrupt-written half of the clock state.
///
/// Lives in a `static` so the reload interrupt handler can reach it; the
/// [`MonotonicClock`] borrows it.
pub struct ReloadCounter {
    reloads: AtomicU32,
    modified: ConcurrentFlag,
}

impl ReloadCounter {
    pub const fn new() -> Self {
        Self {
            reloads: AtomicU32::new(0),
            modified: ConcurrentFlag::new(),
        }
    }

    /// Count one counter reload. Call from the reload interrupt only.
    #[inline]
    pub fn on_reload_interrupt(&self) {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        self.modified.set();
    }

    /// Number of reloads since the clock was initialized.
    pub fn reloads(&self) -> u32 {
        self.reloads.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.reloads.store(0, Ordering::SeqCst);
        self.modified.set();
    }
}

impl Default for ReloadCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Rounding applied when converting a duration to whole ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    Down,
    Up,
}

/// Convert `ns` to ticks of a `ticks_per_second` clock without overflowing
/// for any realistic tick rate.
pub fn ns_to_ticks(ns: u64, ticks_per_second: u64, rounding: Rounding) -> u64 {
    let whole = (ns / NANOS_PER_SECOND) * ticks_per_second;
    let scaled = (ns % NANOS_PER_SECOND) * ticks_per_second;
    let fraction = match rounding {
        Rounding::Down => scaled / NANOS_PER_SECOND,
        Rounding::Up => scaled.div_ceil(NANOS_PER_SECOND),
    };
    whole + fraction
}

/// Convert ticks of a `ticks_per_second` clock to nanoseconds, rounding down.
///
/// Integer part first, then the remainder, so `ticks * 1e9` is never formed.
pub fn ticks_to_ns(ticks: u64, ticks_per_second: u64) -> u64 {
    let whole = ticks / ticks_per_second;
    let rest = ticks % ticks_per_second;
    whole * NANOS_PER_SECOND + rest * NANOS_PER_SECOND / ticks_per_second
}

/// Highest counting frequency [`ticks_to_ns`] handles without overflow.
const MAX_FREQUENCY_HZ: u64 = u64::MAX / NANOS_PER_SECOND;

/// 64-bit nanosecond time base over a [`HardwareClock`].
pub struct MonotonicClock<'a, H: HardwareClock> {
    hw: H,
    reloads: &'a ReloadCounter,
    ticks_per_reload: u32,
    frequency_hz: u64,
}

impl<'a, H: HardwareClock> MonotonicClock<'a, H> {
    /// Zero the reload count, derive the counting frequency and start the
    /// hardware counter.
    ///
    /// The reload interrupt must be routed to
    /// [`ReloadCounter::on_reload_interrupt`] on `reloads` before the counter
    /// first wraps.
    pub fn init(mut hw: H, reloads: &'a ReloadCounter) -> Self {
        reloads.clear();

        let ticks_per_reload = hw.ticks_per_reload();
        let divided_hz = hw.source_frequency_hz() / u64::from(hw.prescaler().max(1));
        // ticks_to_ns divides by the frequency and multiplies a sub-second
        // remainder by 1e9; both need it inside [1, u64::MAX / 1e9].
        let frequency_hz = divided_hz.clamp(1, MAX_FREQUENCY_HZ);
        if frequency_hz != divided_hz {
            log::warn!(
                "counter frequency {} Hz out of range, using {} Hz",
                divided_hz,
                frequency_hz
            );
        }

        hw.start();
        log::info!(
            "monotonic clock started: {} Hz, {} ticks per reload",
            frequency_hz,
            ticks_per_reload
        );

        Self {
            hw,
            reloads,
            ticks_per_reload,
            frequency_hz,
        }
    }

    /// Counting frequency after the prescaler.
    pub fn frequency_hz(&self) -> u64 {
        self.frequency_hz
    }

    /// Hardware ticks elapsed since [`init`](Self::init).
    pub fn elapsed_ticks(&self) -> u64 {
        let (reloads, ticks) = self
            .reloads
            .modified
            .read_consistent(|| (self.reloads.reloads(), self.hw.counter()));

        u64::from(reloads) * u64::from(self.ticks_per_reload) + u64::from(ticks)
    }

    /// Nanoseconds elapsed since [`init`](Self::init). Never decreases.
    pub fn elapsed_ns(&self) -> u64 {
        ticks_to_ns(self.elapsed_ticks(), self.frequency_hz)
    }

    /// Block the calling task for at least `ns`, rounded up to the
    /// scheduler's tick granularity.
    pub fn sleep_ns<D: TaskDelay>(&self, delay: &mut D, ns: u64) -> bool {
        let ticks = ns_to_ticks(ns, u64::from(delay.ticks_per_second()), Rounding::Up);
        delay.sleep_ticks(u32::try_from(ticks).unwrap_or(u32::MAX))
    }

    /// Access the underlying hardware counter.
    pub fn hardware(&self) -> &H {
        &self.hw
    }
}

impl<H: HardwareClock> TimeSource for MonotonicClock<'_, H> {
    fn now_ns(&self) -> u64 {
        self.elapsed_ns()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
