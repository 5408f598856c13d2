use std::future::Future;

use crate::buffer::BufferError;

/// Narrow device interface consumed by [`DeviceBuffer`](crate::buffer::DeviceBuffer).
///
/// Offsets and sizes arriving here are already aligned by the buffer layer.
/// Implementations reject misaligned or out-of-bounds requests the way wgpu
/// validation does rather than adjusting them.
///
/// Mapping is exposed as one scoped operation (map, copy, unmap) so a mapping
/// cannot outlive the call that requested it.
pub trait BufferDevice: Clone {
    /// Allocation handle. Cloning a handle does not duplicate the allocation.
    type Buffer: Clone;

    /// Largest allocation the device accepts, in bytes.
    fn max_buffer_size(&self) -> u64;

    /// Creates a zero-initialized allocation of `size` bytes.
    fn create_buffer(
        &self,
        label: &str,
        usage: wgpu::BufferUsages,
        size: u64,
    ) -> Result<Self::Buffer, BufferError>;

    /// Creates an allocation holding `contents`, written through a
    /// creation-time mapping. `contents.len()` is a multiple of 4.
    fn create_buffer_init(
        &self,
        label: &str,
        usage: wgpu::BufferUsages,
        contents: &[u8],
    ) -> Result<Self::Buffer, BufferError>;

    /// Maps `[offset, offset + size)` for writing, copies `src` into the
    /// mapping starting `at` bytes in, then unmaps. `label` names the buffer in
    /// a [`BufferError::Map`] failure.
    fn map_write(
        &self,
        label: &str,
        buffer: &Self::Buffer,
        offset: u64,
        size: u64,
        src: &[u8],
        at: usize,
    ) -> impl Future<Output = Result<(), BufferError>>;

    /// Maps `[offset, offset + size)` for reading, fills `dst` from the
    /// mapping starting `at` bytes in, then unmaps.
    fn map_read(
        &self,
        label: &str,
        buffer: &Self::Buffer,
        offset: u64,
        size: u64,
        dst: &mut [u8],
        at: usize,
    ) -> impl Future<Output = Result<(), BufferError>>;

    /// Schedules `bytes` to be written at `offset` on the device queue.
    fn queue_write(&self, buffer: &Self::Buffer, offset: u64, bytes: &[u8])
    -> Result<(), BufferError>;

    /// Records and submits one buffer-to-buffer copy.
    fn submit_copy(
        &self,
        src: &Self::Buffer,
        src_offset: u64,
        dst: &Self::Buffer,
        dst_offset: u64,
        size: u64,
    ) -> Result<(), BufferError>;

    /// Releases the allocation. Further use of the handle is invalid.
    fn destroy_buffer(&self, buffer: &Self::Buffer);
}
