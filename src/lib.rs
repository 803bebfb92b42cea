//! # Kairos
//!
//! Runtime services for bare-metal ARM Cortex-M flight software running on
//! top of a preemptive RTOS: a drift-free monotonic time base, cyclic
//! request dispatch, per-interface execution monitoring and post-mortem
//! fault capture.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                 Application interfaces                  │
//! ├────────────────────────────────────────────────────────┤
//! │                Runtime (kernel.rs)                      │
//! │   init() · register_cyclic() · process_request() · tick │
//! ├──────────────┬──────────────────┬──────────────────────┤
//! │  Clock       │  Cyclic dispatch │  Execution monitor   │
//! │  clock.rs    │  cyclic.rs       │  monitor.rs          │
//! │  ─ now_ns()  │  ─ register()    │  ─ activation log    │
//! │  ─ sleep_ns()│  ─ on_fire()     │  ─ usage / idle CPU  │
//! ├──────────────┴──────────────────┴──────────────────────┤
//! │  Fault capture (fault.rs) ──► Death report (death_report.rs,│
//! │                                  crc.rs, retained RAM) │
//! ├────────────────────────────────────────────────────────┤
//! │  hal.rs traits · sync.rs primitives · config.rs limits │
//! ├──────────────────────────┬─────────────────────────────┤
//! │ Arch port (arch/)        │ Board port (board/)         │
//! │ fault entry, fault traps │ TC0, WDT, RSTC, NVIC        │
//! ├──────────────────────────┴─────────────────────────────┤
//! │             ARM Cortex-M7 (SAMV71) hardware             │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Memory Model
//!
//! - **No heap**: every table is sized by a const generic or by `config.rs`
//! - **No singletons**: one [`kernel::Runtime`] owns the state; only the
//!   interrupt-written [`clock::ReloadCounter`] is a `static`
//! - **Retained RAM**: the death report lives in a region startup code
//!   never initializes, so it survives the reset that follows a fault
//! - **Interrupt sharing**: atomics plus a retry flag, no interrupt masking

#![cfg_attr(not(test), no_std)]

pub mod clock;
pub mod config;
pub mod crc;
pub mod cyclic;
pub mod death_report;
pub mod error;
pub mod fault;
pub mod hal;
pub mod kernel;
pub mod monitor;
pub mod sync;

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod arch;

#[cfg(all(feature = "samv71", target_arch = "arm", target_os = "none"))]
pub mod board;
