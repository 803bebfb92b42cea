//! # Board Ports
//!
//! Register-level implementations of the [`hal`](crate::hal) board traits.
//! One submodule per supported board, each behind its own cargo feature.

#[cfg(feature = "samv71")]
pub mod samv71;
