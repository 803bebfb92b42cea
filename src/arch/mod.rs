//! # Architecture Abstraction Layer
//!
//! Processor-specific code. Only the Cortex-M7 port exists; the rest of the
//! crate reaches the processor through the `hal` traits.

pub mod cortex_m7;
