//! Device buffers and their host mirrors.
//!
//! This module is responsible for:
//! - sized, typed device allocations with aligned partial reads and writes
//! - growth on whole-content replacement
//! - host-mirrored buffers with field-level access
//! - coalescing a turn's mirror edits into one deferred device write

mod align;
mod device_buffer;
mod dirty;
mod element;
mod error;
mod mirrored;
mod scheduler;
mod strategy;

pub use align::{align_down, round_up, AlignedSpan};
pub use device_buffer::{BufferDesc, BufferSource, DeviceBuffer};
pub use dirty::DirtyRange;
pub use element::{Element, Field};
pub use error::BufferError;
pub use mirrored::{FlushState, MirroredBuffer};
pub use scheduler::FlushScheduler;
pub use strategy::{ReadStrategy, WriteStrategy};
