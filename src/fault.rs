//! # Fault Capture
//!
//! Last-resort diagnostics for unrecoverable processor faults.
//!
//! ```text
//!  ┌───────┐ fault vector ┌─────────┐ report sealed ┌──────────┐ reset ┌───────────┐
//!  │ Armed │ ───────────► │ Trapped │ ────────────► │ Captured │ ────► │ Resetting │
//!  └───────┘              └─────────┘               └──────────┘       └───────────┘
//! ```
//!
//! ## Two halves
//!
//! 1. **Raw entry** (`arch::cortex_m7`): hand-written assembly installed on
//!    the HardFault, MemoryManagement, BusFault and UsageFault vectors. It
//!    runs with interrupts masked, picks the stack pointer that was active
//!    at the fault before any general-purpose register is clobbered, restarts
//!    the watchdog and stores every live register plus the fault status
//!    block straight into the retained [`DeathReport`]. No stack frame is
//!    built until all of that is saved.
//! 2. **Tail** (ordinary Rust, no return): takes over the report as a
//!    [`FaultCapture`] in the `Trapped` state, copies a bounded window of
//!    the faulting stack, seals the report with its checksum and resets the
//!    system.
//!
//! [`arm`] is the `Armed` step: it routes every configurable fault to its
//! own vector so all of them reach the raw entry.
//!
//! If the faulting stack pointer is not a plausible RAM address, the stack
//! trace is left empty. There is no secondary fallback: a fault inside the
//! capture ends in the same reset.

use crate::config::{RAM_END, RAM_START, STACK_TRACE_WORDS};
use crate::death_report::DeathReport;
use crate::hal::{InterruptController, ResetController, WatchdogTimer};

/// Where a [`FaultCapture`] is in its one-way lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// Fault vector entered, live registers saved.
    Trapped,
    /// Stack trace and checksum written.
    Captured,
    /// Reset requested. Terminal.
    Resetting,
}

/// Route MemManage, BusFault and UsageFault to their own vectors and trap
/// division by zero, so every fault reaches the capture entry.
pub fn arm<I: InterruptController>(interrupts: &mut I) {
    interrupts.enable_fault_traps();
    log::info!("fault capture armed");
}

/// Number of stack words that can be copied from `sp` without leaving
/// program RAM, capped at the trace capacity. Zero for an implausible `sp`.
pub fn stack_window_words(sp: u32) -> usize {
    let sp = sp as usize;
    if sp % 4 != 0 || !(RAM_START..RAM_END).contains(&sp) {
        return 0;
    }
    ((RAM_END - sp) / 4).min(STACK_TRACE_WORDS)
}

/// Copy the stack window into the report and seal it. The window is
/// truncated to the trace capacity.
pub fn finish_report(report: &mut DeathReport, window: &[u32]) {
    let len = window.len().min(STACK_TRACE_WORDS);
    report.stack_trace[..len].copy_from_slice(&window[..len]);
    report.stack_trace[len..].fill(0);
    report.stack_trace_length = len as u32;
    report.seal();
}

/// The tail of the capture, over a report the raw entry has filled in.
pub struct FaultCapture<'a, W: WatchdogTimer, R: ResetController> {
    report: &'a mut DeathReport,
    watchdog: W,
    reset: R,
    state: CaptureState,
}

impl<'a, W: WatchdogTimer, R: ResetController> FaultCapture<'a, W, R> {
    /// Take over `report` after the raw entry saved the registers. Restarts
    /// the watchdog so the rest of the capture runs on a full countdown.
    pub fn trapped(report: &'a mut DeathReport, mut watchdog: W, reset: R) -> Self {
        watchdog.restart();
        Self {
            report,
            watchdog,
            reset,
            state: CaptureState::Trapped,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn report(&self) -> &DeathReport {
        self.report
    }

    /// Stack pointer that was active when the fault was taken.
    pub fn stack_pointer(&self) -> u32 {
        self.report.stack_trace_pointer
    }

    /// Copy the stack window and seal the report.
    pub fn seal(&mut self, window: &[u32]) {
        debug_assert_eq!(self.state, CaptureState::Trapped);
        self.watchdog.restart();
        finish_report(self.report, window);
        self.state = CaptureState::Captured;
    }

    /// Request the system reset. Never returns.
    pub fn reset(mut self) -> ! {
        self.state = CaptureState::Resetting;
        self.reset.reset_system()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
