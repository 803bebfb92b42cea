//! # Kairos SAMV71 Demonstration Firmware
//!
//! Runs the runtime core on a SAMV71 without a full RTOS underneath. The
//! RTOS services are stood in for by SysTick:
//!
//! | Service | Stand-in |
//! |---------|----------|
//! | Timer service | SysTick at 1 kHz + polled one-shot slots |
//! | Message queues | Counting queues drained by the main loop |
//! | Idle thread | Time spent in `wfi`, measured on the monotonic clock |
//!
//! One cyclic request drives a housekeeping interface at 10 Hz. Every
//! second the monitor is sampled and a summary goes out over semihosting.
//!
//! On boot the death report left by a previous fault, if any, is decoded,
//! logged and acknowledged.

#![no_std]
#![no_main]

use core::sync::atomic::{AtomicU32, Ordering};

use cortex_m::peripheral::syst::SystClkSource;
use cortex_m_rt::{entry, exception};
use cortex_m_semihosting::hprintln;
use panic_halt as _;

use kairos::board::samv71::{
    Samv71Interrupts, Samv71Reset, Samv71Watchdog, Tc0Clock, TC0_CHANNEL0_IRQ,
};
use kairos::clock::ReloadCounter;
use kairos::config::RTOS_TICKS_PER_SECOND;
use kairos::cyclic::RequestId;
use kairos::death_report::DeathReportReader;
use kairos::error::HalError;
use kairos::fault;
use kairos::hal::{
    MessageQueues, QueueFull, QueueId, ResetController, StackLookup, ThreadRegistry, TimerId,
    TimerService, WatchdogTimer,
};
use kairos::kernel::DefaultRuntime;

/// Core clock after the PLL set up by the boot ROM configuration.
const CORE_HZ: u32 = 300_000_000;

/// Master clock feeding the peripherals (core / 2).
const MCK_HZ: u64 = 150_000_000;

const HOUSEKEEPING_INTERFACE: usize = 0;
const HOUSEKEEPING_QUEUE: QueueId = QueueId(0);
const HOUSEKEEPING_PERIOD_NS: u64 = 100_000_000;
const HOUSEKEEPING_OFFSET_NS: u64 = 10_000_000;

const REPORT_PERIOD_NS: u64 = 1_000_000_000;

// ---------------------------------------------------------------------------
// Interrupt-written state
// ---------------------------------------------------------------------------

static RELOADS: ReloadCounter = ReloadCounter::new();
static RTOS_TICKS: AtomicU32 = AtomicU32::new(0);

#[exception]
fn SysTick() {
    RTOS_TICKS.fetch_add(1, Ordering::Relaxed);
}

#[exception]
unsafe fn DefaultHandler(irqn: i16) {
    if irqn == TC0_CHANNEL0_IRQ as i16 {
        Tc0Clock::acknowledge();
        RELOADS.on_reload_interrupt();
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

struct SemihostingLogger;

impl log::Log for SemihostingLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::Level::Info
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            hprintln!("[{} {}] {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: SemihostingLogger = SemihostingLogger;

// ---------------------------------------------------------------------------
// RTOS stand-ins
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
struct Armed {
    deadline: u32,
    tag: usize,
}

/// One-shot timers on the SysTick count, expired by polling.
struct SysTickTimers {
    slots: [Option<Armed>; 4],
    created: usize,
}

impl SysTickTimers {
    const fn new() -> Self {
        Self {
            slots: [None; 4],
            created: 0,
        }
    }

    /// Disarm and return the tag of one expired timer.
    fn take_expired(&mut self) -> Option<usize> {
        let now = self.ticks_since_boot();
        self.slots[..self.created].iter_mut().find_map(|slot| match *slot {
            Some(armed) if now.wrapping_sub(armed.deadline) as i32 >= 0 => {
                *slot = None;
                Some(armed.tag)
            }
            _ => None,
        })
    }
}

impl TimerService for SysTickTimers {
    fn create_timer(&mut self) -> Result<TimerId, HalError> {
        if self.created == self.slots.len() {
            return Err(HalError::CapacityExceeded);
        }
        self.created += 1;
        Ok(TimerId(self.created as u32 - 1))
    }

    fn fire_after(&mut self, timer: TimerId, delay_ticks: u32, tag: usize) -> Result<(), HalError> {
        let deadline = self.ticks_since_boot().wrapping_add(delay_ticks);
        let slot = self.slots.get_mut(timer.0 as usize).ok_or(HalError::Rtos(timer.0))?;
        *slot = Some(Armed { deadline, tag });
        Ok(())
    }

    fn ticks_since_boot(&self) -> u32 {
        RTOS_TICKS.load(Ordering::Relaxed)
    }

    fn ticks_per_second(&self) -> u32 {
        RTOS_TICKS_PER_SECOND
    }
}

const QUEUE_DEPTH: u32 = 4;

/// Queues that only count their messages; the empty request carries no data.
struct CountingQueues {
    pending: [u32; 1],
}

impl CountingQueues {
    fn take(&mut self, queue: QueueId) -> bool {
        match self.pending.get_mut(queue.0 as usize) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

impl MessageQueues for CountingQueues {
    fn try_send(&mut self, queue: QueueId, _payload: &[u8]) -> Result<(), QueueFull> {
        match self.pending.get_mut(queue.0 as usize) {
            Some(n) if *n < QUEUE_DEPTH => {
                *n += 1;
                Ok(())
            }
            _ => Err(QueueFull),
        }
    }

    fn pending(&self, queue: QueueId) -> Option<u32> {
        self.pending.get(queue.0 as usize).copied()
    }
}

#[derive(Default)]
struct MainLoopThreads {
    idle_ns: u64,
}

impl ThreadRegistry for MainLoopThreads {
    fn idle_cpu_time_ns(&self) -> Option<u64> {
        Some(self.idle_ns)
    }

    // Everything runs on the main stack, which is not painted.
    fn thread_stack(&self, interface: usize) -> StackLookup<'_> {
        match interface {
            HOUSEKEEPING_INTERFACE => StackLookup::Unpainted,
            _ => StackLookup::Missing,
        }
    }

    fn queue_of(&self, interface: usize) -> Option<QueueId> {
        (interface == HOUSEKEEPING_INTERFACE).then_some(HOUSEKEEPING_QUEUE)
    }
}

type App = DefaultRuntime<'static, Tc0Clock, SysTickTimers, CountingQueues>;

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

fn housekeeping() -> u32 {
    let mut acc: u32 = 0;
    for i in 0..20_000u32 {
        acc = acc.rotate_left(5) ^ i;
    }
    acc
}

fn report(rt: &mut App, threads: &MainLoopThreads, request: RequestId) {
    if let Err(err) = rt.monitoring_tick(threads) {
        log::warn!("monitoring tick: {}", err);
    }

    let idle = rt.monitor.get_idle_cpu_usage();
    log::info!(
        "idle cpu {:.1}% (min {:.1}%, max {:.1}%)",
        idle.mean_percent,
        idle.min_percent,
        idle.max_percent
    );

    if let Ok(usage) = rt.monitor.get_usage(HOUSEKEEPING_INTERFACE) {
        log::info!(
            "housekeeping: {} runs, {}..{} ns, mean {} ns",
            usage.samples,
            usage.min_ns,
            usage.max_ns,
            usage.mean_ns
        );
    }

    let queued = rt.queued_items(threads, HOUSEKEEPING_INTERFACE).unwrap_or(0);
    let max_queued = rt.monitor.maximum_queued_items(HOUSEKEEPING_INTERFACE).unwrap_or(0);
    log::info!("housekeeping queue: {} waiting, {} max", queued, max_queued);

    if let Ok(stats) = rt.dispatcher.request_stats(request) {
        log::info!(
            "cyclic: {} fires, {} dropped, {} skipped, {} re-arm failures",
            stats.fires,
            stats.dropped,
            stats.skipped_cycles,
            stats.arm_failures
        );
    }
}

/// Firmware entry point. Does not return.
#[entry]
fn main() -> ! {
    let _ = log::set_logger(&LOGGER).map(|()| log::set_max_level(log::LevelFilter::Info));

    let Some(mut cp) = cortex_m::Peripherals::take() else {
        panic!("core peripherals taken twice");
    };

    Samv71Watchdog.disable();
    log::info!("boot: last reset {:?}", Samv71Reset.reset_reason());

    {
        // SAFETY: no task or interrupt that could fault has started, and the
        // reader is dropped before one does.
        let mut reader = unsafe { DeathReportReader::retained() };
        if let Ok(Some(_)) = reader.inspect() {
            reader.acknowledge();
        }
    }

    let mut interrupts = Samv71Interrupts::new(cp.NVIC, cp.SCB);
    fault::arm(&mut interrupts);

    cp.SYST.set_clock_source(SystClkSource::Core);
    cp.SYST.set_reload(CORE_HZ / RTOS_TICKS_PER_SECOND - 1);
    cp.SYST.clear_current();
    cp.SYST.enable_interrupt();
    cp.SYST.enable_counter();

    // SAFETY: nothing else in this image touches TC0.
    let hw = unsafe { Tc0Clock::new(MCK_HZ) };
    let mut rt: App = App::init(
        hw,
        &RELOADS,
        &mut interrupts,
        SysTickTimers::new(),
        CountingQueues { pending: [0] },
    );

    let request = match rt.register_cyclic(
        HOUSEKEEPING_PERIOD_NS,
        HOUSEKEEPING_OFFSET_NS,
        HOUSEKEEPING_QUEUE,
        0,
    ) {
        Ok(id) => id,
        Err(err) => panic!("housekeeping registration failed: {}", err),
    };
    let _ = rt.monitor.unfreeze();

    let mut threads = MainLoopThreads::default();
    let mut next_report_ns = REPORT_PERIOD_NS;

    loop {
        while let Some(tag) = rt.dispatcher.timer_service_mut().take_expired() {
            if let Err(err) = rt.on_timer(tag) {
                log::warn!("cyclic dispatch: {}", err);
            }
        }
        rt.rearm_stalled();

        if rt.dispatcher.queues_mut().take(HOUSEKEEPING_QUEUE) {
            rt.process_request(HOUSEKEEPING_INTERFACE, housekeeping);
            continue;
        }

        if rt.elapsed_ns() >= next_report_ns {
            next_report_ns += REPORT_PERIOD_NS;
            report(&mut rt, &threads, request);
        }

        let before = rt.elapsed_ns();
        cortex_m::asm::wfi();
        threads.idle_ns += rt.elapsed_ns().saturating_sub(before);
    }
}
