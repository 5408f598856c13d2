use std::sync::mpsc;

use wgpu::util::DeviceExt;

use super::BufferDevice;
use crate::buffer::BufferError;

/// [`BufferDevice`] backed by a wgpu device/queue pair.
///
/// Map requests are driven to completion by polling the device, so on native
/// targets the returned futures resolve on their first poll.
#[derive(Clone)]
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
}

impl WgpuDevice {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self { device, queue }
    }

    /// Returns a reference to the logical device.
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    /// Returns a reference to the command queue.
    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    async fn map(
        &self,
        label: &str,
        buffer: &wgpu::Buffer,
        offset: u64,
        size: u64,
        mode: wgpu::MapMode,
    ) -> Result<(), BufferError> {
        let (tx, rx) = mpsc::channel();
        buffer
            .slice(offset..offset + size)
            .map_async(mode, move |result| {
                // The receiver is dropped only if polling failed below.
                let _ = tx.send(result);
            });

        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|err| BufferError::Device(format!("device poll failed: {err}")))?;

        let map_error = |reason: String| BufferError::Map {
            label: label.to_owned(),
            reason,
        };
        rx.recv()
            .map_err(|_| map_error("map callback dropped without firing".to_owned()))?
            .map_err(|err| map_error(err.to_string()))
    }
}

impl BufferDevice for WgpuDevice {
    type Buffer = wgpu::Buffer;

    fn max_buffer_size(&self) -> u64 {
        self.device.limits().max_buffer_size
    }

    fn create_buffer(
        &self,
        label: &str,
        usage: wgpu::BufferUsages,
        size: u64,
    ) -> Result<wgpu::Buffer, BufferError> {
        Ok(self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage,
            mapped_at_creation: false,
        }))
    }

    fn create_buffer_init(
        &self,
        label: &str,
        usage: wgpu::BufferUsages,
        contents: &[u8],
    ) -> Result<wgpu::Buffer, BufferError> {
        // `create_buffer_init` writes through `mapped_at_creation`.
        Ok(self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents,
                usage,
            }))
    }

    async fn map_write(
        &self,
        label: &str,
        buffer: &wgpu::Buffer,
        offset: u64,
        size: u64,
        src: &[u8],
        at: usize,
    ) -> Result<(), BufferError> {
        self.map(label, buffer, offset, size, wgpu::MapMode::Write).await?;
        {
            let slice = buffer.slice(offset..offset + size);
            let mut view = slice.get_mapped_range_mut();
            view[at..at + src.len()].copy_from_slice(src);
        }
        buffer.unmap();
        Ok(())
    }

    async fn map_read(
        &self,
        label: &str,
        buffer: &wgpu::Buffer,
        offset: u64,
        size: u64,
        dst: &mut [u8],
        at: usize,
    ) -> Result<(), BufferError> {
        self.map(label, buffer, offset, size, wgpu::MapMode::Read).await?;
        {
            let slice = buffer.slice(offset..offset + size);
            let view = slice.get_mapped_range();
            dst.copy_from_slice(&view[at..at + dst.len()]);
        }
        buffer.unmap();
        Ok(())
    }

    fn queue_write(
        &self,
        buffer: &wgpu::Buffer,
        offset: u64,
        bytes: &[u8],
    ) -> Result<(), BufferError> {
        self.queue.write_buffer(buffer, offset, bytes);
        // Staged writes only reach the device with the next submission; an empty
        // one keeps later map requests ordered after this write.
        self.queue.submit(std::iter::empty());
        Ok(())
    }

    fn submit_copy(
        &self,
        src: &wgpu::Buffer,
        src_offset: u64,
        dst: &wgpu::Buffer,
        dst_offset: u64,
        size: u64,
    ) -> Result<(), BufferError> {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("mirra copy encoder"),
            });
        encoder.copy_buffer_to_buffer(src, src_offset, dst, dst_offset, size);
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn destroy_buffer(&self, buffer: &wgpu::Buffer) {
        buffer.destroy();
    }
}
