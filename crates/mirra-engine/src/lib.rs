//! Mirra engine crate.
//!
//! This crate owns the buffer-synchronization core used by higher layers:
//! device allocations with alignment-corrected transfers, and host mirrors
//! that batch field edits into one deferred upload per turn.

pub mod buffer;
pub mod device;
pub mod logging;
