//! # SAMV71 Board Port
//!
//! ```text
//!  MCK ──► /8 ──► TC0 channel 0 (waveform, UP_RC) ──► RC compare ──► IRQ 23
//!                     counter: 0 ..= RC, then back to 0
//! ```
//!
//! The counter clears itself on RC compare, so one reload period is exactly
//! `RC + 1` ticks and `counter()` always lies in `0..ticks_per_reload()`.
//! The reload handler must call [`Tc0Clock::acknowledge`] (reading TC_SR
//! clears the compare flag) before bumping the
//! [`ReloadCounter`](crate::clock::ReloadCounter).

use cortex_m::interrupt::InterruptNumber;
use cortex_m::peripheral::{NVIC, SCB};

use crate::arch::cortex_m7;
use crate::config::{
    CLOCK_PRESCALER, TICKS_PER_RELOAD, WATCHDOG_CONTROL_ADDRESS, WATCHDOG_RESTART_KEY,
};
use crate::hal::{
    HardwareClock, InterruptController, ResetController, ResetReason, WatchdogTimer,
};

// ---------------------------------------------------------------------------
// Register map
// ---------------------------------------------------------------------------

/// PMC peripheral clock enable register 0.
const PMC_PCER0: *mut u32 = 0x400E_0610 as *mut u32;

const TC0_BASE: usize = 0x4000_C000;
const TC_CCR: *mut u32 = TC0_BASE as *mut u32;
const TC_CMR: *mut u32 = (TC0_BASE + 0x04) as *mut u32;
const TC_CV: *const u32 = (TC0_BASE + 0x10) as *const u32;
const TC_RC: *mut u32 = (TC0_BASE + 0x1C) as *mut u32;
const TC_SR: *const u32 = (TC0_BASE + 0x20) as *const u32;
const TC_IER: *mut u32 = (TC0_BASE + 0x24) as *mut u32;
const TC_IDR: *mut u32 = (TC0_BASE + 0x28) as *mut u32;

const TC_CCR_CLKEN: u32 = 1 << 0;
const TC_CCR_CLKDIS: u32 = 1 << 1;
const TC_CCR_SWTRG: u32 = 1 << 2;
/// TIMER_CLOCK2: MCK / 8.
const TC_CMR_TCCLKS_MCK_DIV_8: u32 = 1;
const TC_CMR_WAVSEL_UP_RC: u32 = 2 << 13;
const TC_CMR_WAVE: u32 = 1 << 15;
const TC_INT_CPCS: u32 = 1 << 4;

const RSTC_CR: *mut u32 = 0x400E_1800 as *mut u32;
const RSTC_SR: *const u32 = 0x400E_1804 as *const u32;
/// KEY = 0xA5, PROCRST, EXTRST.
const RSTC_CR_RESET_ALL: u32 = 0xA500_0000 | (1 << 0) | (1 << 3);

const WDT_CR: *mut u32 = WATCHDOG_CONTROL_ADDRESS as *mut u32;
const WDT_MR: *mut u32 = (WATCHDOG_CONTROL_ADDRESS + 0x04) as *mut u32;
const WDT_MR_WDDIS: u32 = 1 << 15;
/// Counter and delta at their maximum, as after reset.
const WDT_MR_DEFAULT_VALUES: u32 = 0x0FFF | (0x0FFF << 16);

/// Peripheral id and NVIC line of TC0 channel 0.
pub const TC0_CHANNEL0_IRQ: u16 = 23;

#[derive(Debug, Clone, Copy)]
struct Tc0Channel0;

// SAFETY: 23 is a valid SAMV71 interrupt line.
unsafe impl InterruptNumber for Tc0Channel0 {
    fn number(self) -> u16 {
        TC0_CHANNEL0_IRQ
    }
}

// ---------------------------------------------------------------------------
// Time base
// ---------------------------------------------------------------------------

/// TC0 channel 0 as the free-running counter behind the monotonic clock.
pub struct Tc0Clock {
    mck_hz: u64,
}

impl Tc0Clock {
    /// `mck_hz` is the master clock feeding the timer counter block.
    ///
    /// # Safety
    /// The caller hands TC0 channel 0 over to this driver exclusively.
    pub const unsafe fn new(mck_hz: u64) -> Self {
        Self { mck_hz }
    }

    /// Clear the pending compare flag. Call at the top of the reload handler.
    #[inline]
    pub fn acknowledge() {
        // SAFETY: reading TC_SR only clears status flags.
        unsafe {
            let _ = core::ptr::read_volatile(TC_SR);
        }
    }
}

impl HardwareClock for Tc0Clock {
    fn start(&mut self) {
        // SAFETY: exclusive owner of TC0 channel 0 per `new`.
        unsafe {
            core::ptr::write_volatile(PMC_PCER0, 1 << TC0_CHANNEL0_IRQ);
            core::ptr::write_volatile(TC_CCR, TC_CCR_CLKDIS);
            core::ptr::write_volatile(TC_IDR, u32::MAX);
            let _ = core::ptr::read_volatile(TC_SR);
            core::ptr::write_volatile(
                TC_CMR,
                TC_CMR_TCCLKS_MCK_DIV_8 | TC_CMR_WAVE | TC_CMR_WAVSEL_UP_RC,
            );
            core::ptr::write_volatile(TC_RC, TICKS_PER_RELOAD - 1);
            core::ptr::write_volatile(TC_IER, TC_INT_CPCS);
            core::ptr::write_volatile(TC_CCR, TC_CCR_CLKEN | TC_CCR_SWTRG);
        }
    }

    fn counter(&self) -> u32 {
        // SAFETY: read-only counter value register.
        unsafe { core::ptr::read_volatile(TC_CV) & 0xFFFF }
    }

    fn ticks_per_reload(&self) -> u32 {
        TICKS_PER_RELOAD
    }

    fn source_frequency_hz(&self) -> u64 {
        self.mck_hz
    }

    fn prescaler(&self) -> u32 {
        CLOCK_PRESCALER
    }
}

// ---------------------------------------------------------------------------
// Interrupts, watchdog, reset
// ---------------------------------------------------------------------------

/// NVIC and SCB access for the runtime.
pub struct Samv71Interrupts {
    scb: SCB,
}

impl Samv71Interrupts {
    pub fn new(_nvic: NVIC, scb: SCB) -> Self {
        Self { scb }
    }
}

impl InterruptController for Samv71Interrupts {
    fn enable_reload_interrupt(&mut self) {
        NVIC::unpend(Tc0Channel0);
        // SAFETY: the handler for line 23 only touches the reload counter.
        unsafe { NVIC::unmask(Tc0Channel0) };
    }

    fn enable_fault_traps(&mut self) {
        cortex_m7::enable_fault_traps(&mut self.scb);
    }
}

/// The SAMV71 WDT.
pub struct Samv71Watchdog;

impl WatchdogTimer for Samv71Watchdog {
    fn disable(&mut self) {
        // WDT_MR is write-once after reset; this write locks it disabled.
        // SAFETY: write to the watchdog mode register.
        unsafe { core::ptr::write_volatile(WDT_MR, WDT_MR_DEFAULT_VALUES | WDT_MR_WDDIS) };
    }

    fn restart(&mut self) {
        // SAFETY: keyed restart command.
        unsafe { core::ptr::write_volatile(WDT_CR, WATCHDOG_RESTART_KEY) };
    }
}

/// The SAMV71 reset controller.
pub struct Samv71Reset;

impl ResetController for Samv71Reset {
    fn reset_reason(&self) -> ResetReason {
        // SAFETY: read-only status register.
        let sr = unsafe { core::ptr::read_volatile(RSTC_SR) };
        match (sr >> 8) & 0b111 {
            0 => ResetReason::Powerup,
            1 => ResetReason::Backup,
            2 => ResetReason::Watchdog,
            3 => ResetReason::Software,
            4 => ResetReason::User,
            _ => ResetReason::Unknown,
        }
    }

    fn reset_system(&mut self) -> ! {
        cortex_m::asm::dsb();
        // SAFETY: keyed reset request.
        unsafe { core::ptr::write_volatile(RSTC_CR, RSTC_CR_RESET_ALL) };
        loop {
            cortex_m::asm::nop();
        }
    }
}
