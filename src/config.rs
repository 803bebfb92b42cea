//! # Kairos Configuration
//!
//! Compile-time constants governing table capacities, the time base and the
//! retained death-report layout. All limits are fixed at build time; no
//! dynamic allocation happens after initialization.

/// Maximum number of cyclic requests the dispatcher table can hold.
/// Registration beyond this fails with `CapacityExceeded`.
pub const MAX_CYCLIC_REQUESTS: usize = 8;

/// Number of interfaces (threads) known to the execution monitor.
/// Interface ids index the per-interface statistics tables directly.
pub const MAX_INTERFACES: usize = 8;

/// Capacity of the activation log ring buffer, in entries.
/// Zero compiles activation logging out: every log operation then reports
/// `MonitorError::Unavailable`.
pub const ACTIVATION_LOG_CAPACITY: usize = 256;

/// Maximum number of RTOS semaphores the runtime may create.
pub const MAX_SEMAPHORES: usize = 8;

/// Number of hardware counter ticks between two reload interrupts.
pub const TICKS_PER_RELOAD: u32 = 65_535;

/// Divider between the peripheral clock and the free-running counter.
pub const CLOCK_PRESCALER: u32 = 8;

/// RTOS timer-service tick rate (1 ms per tick).
pub const RTOS_TICKS_PER_SECOND: u32 = 1_000;

/// Size of the data area of the empty request sent by cyclic dispatch.
pub const EMPTY_REQUEST_DATA_SIZE: usize = 8;

/// Byte offset of the death report inside the retained boot-report area.
pub const DEATH_REPORT_OFFSET: usize = 352;

/// Capacity of the death-report stack trace, in 32-bit words.
pub const STACK_TRACE_WORDS: usize = 128;

/// Pattern written over every task stack at creation time. The stack
/// high-water scan looks for the first word that no longer matches it.
pub const STACK_PAINT_PATTERN: u32 = 0xA5A5_A5A5;

/// Nanoseconds per second.
pub const NANOS_PER_SECOND: u64 = 1_000_000_000;

// ---------------------------------------------------------------------------
// Memory map (SAMV71, must agree with memory.x)
// ---------------------------------------------------------------------------

/// First address of on-chip SRAM.
pub const RAM_START: usize = 0x2040_0000;

/// One past the last address usable by the program. The retained
/// boot-report area starts here and is never touched by startup code.
pub const RAM_END: usize = BOOT_REPORT_BASE;

/// Start of the retained boot-report area.
pub const BOOT_REPORT_BASE: usize = 0x2045_F968;

/// Size of the retained boot-report area, in bytes.
pub const BOOT_REPORT_SIZE: usize = 0x698;

/// Watchdog control register (WDT_CR).
pub const WATCHDOG_CONTROL_ADDRESS: usize = 0x400E_1850;

/// WDT_CR write that restarts the watchdog countdown (KEY = 0xA5, WDRSTT).
pub const WATCHDOG_RESTART_KEY: u32 = 0xA500_0001;
