//! Device access.
//!
//! This module is responsible for:
//! - the `BufferDevice` facade the buffer layer issues all device work through
//! - a wgpu implementation of it, plus headless adapter/device bring-up
//! - a host-memory implementation for tests and CPU-only runs

mod facade;
mod gpu;
mod host;
mod wgpu_device;

pub use facade::BufferDevice;
pub use gpu::{Gpu, GpuInit};
pub use host::{DeviceOp, HostBuffer, HostDevice};
pub use wgpu_device::WgpuDevice;
