//! Transfer paths between host memory and a device allocation.
//!
//! A buffer picks one write path and one read path from its usage flags when it
//! is created and keeps them for its lifetime.

use std::borrow::Cow;

use super::align::AlignedSpan;
use super::device_buffer::{BufferDesc, DeviceBuffer, Transfer};
use super::BufferError;
use crate::device::BufferDevice;

/// How bytes travel from host memory into a device buffer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WriteStrategy {
    /// Map the covering range for writing and copy into it (`MAP_WRITE`).
    DirectMap,
    /// Hand the covering range to the device queue (`COPY_DST`).
    Queue,
}

/// How bytes travel from a device buffer back into host memory.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReadStrategy {
    /// Map the covering range for reading (`MAP_READ`).
    DirectMap,
    /// Copy through a temporary mappable buffer (`COPY_SRC`).
    Staging,
}

impl WriteStrategy {
    pub fn for_usage(usage: wgpu::BufferUsages) -> Self {
        if usage.contains(wgpu::BufferUsages::MAP_WRITE) {
            Self::DirectMap
        } else {
            Self::Queue
        }
    }

    /// Alignment of the device offsets this path issues.
    pub const fn alignment(self) -> u64 {
        match self {
            Self::DirectMap => wgpu::MAP_ALIGNMENT,
            Self::Queue => wgpu::COPY_BUFFER_ALIGNMENT,
        }
    }

    /// Device span this path touches for a write of `size` bytes at `offset`.
    pub const fn span(self, offset: u64, size: u64) -> AlignedSpan {
        AlignedSpan::new(offset, size, self.alignment())
    }

    pub(crate) async fn write<D: BufferDevice>(
        self,
        t: &Transfer<D>,
        buffer_offset: u64,
        data: &[u8],
        data_offset: usize,
        size: usize,
    ) -> Result<(), BufferError> {
        let span = self.span(buffer_offset, size as u64);
        match self {
            Self::DirectMap => {
                log::trace!("{}: map write {}..{}", t.label, span.offset, span.end());
                t.device
                    .map_write(
                        &t.label,
                        &t.buffer,
                        span.offset,
                        span.size,
                        &data[data_offset..data_offset + size],
                        span.correction as usize,
                    )
                    .await
            }
            Self::Queue => {
                t.require(wgpu::BufferUsages::COPY_DST)?;
                let window = queue_window(t, span, data, data_offset).await?;
                log::trace!("{}: queue write {}..{}", t.label, span.offset, span.end());
                t.device.queue_write(&t.buffer, span.offset, &window)
            }
        }
    }
}

impl ReadStrategy {
    pub fn for_usage(usage: wgpu::BufferUsages) -> Self {
        if usage.contains(wgpu::BufferUsages::MAP_READ) {
            Self::DirectMap
        } else {
            Self::Staging
        }
    }

    /// Alignment of the device offsets this path issues against the buffer itself.
    pub const fn alignment(self) -> u64 {
        match self {
            Self::DirectMap => wgpu::MAP_ALIGNMENT,
            Self::Staging => wgpu::COPY_BUFFER_ALIGNMENT,
        }
    }

    /// Device span this path touches for a read of `size` bytes at `offset`.
    pub const fn span(self, offset: u64, size: u64) -> AlignedSpan {
        AlignedSpan::new(offset, size, self.alignment())
    }

    pub(crate) async fn read<D: BufferDevice>(
        self,
        t: &Transfer<D>,
        buffer_offset: u64,
        data: &mut [u8],
        data_offset: usize,
        size: usize,
    ) -> Result<(), BufferError> {
        let dst = &mut data[data_offset..data_offset + size];
        match self {
            Self::DirectMap => map_read(t, buffer_offset, dst).await,
            Self::Staging => {
                t.require(wgpu::BufferUsages::COPY_SRC)?;
                let span = self.span(buffer_offset, size as u64);

                let label = format!("{} staging", t.label);
                // Dropping the staging buffer releases it, on success and on every error path.
                let staging = DeviceBuffer::new(
                    t.device.clone(),
                    &BufferDesc::blank(
                        &label,
                        wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
                        span.size,
                    ),
                )?;
                let temp = staging.transfer()?;

                log::trace!("{}: staged read {}..{}", t.label, span.offset, span.end());
                t.device
                    .submit_copy(&t.buffer, span.offset, &temp.buffer, 0, span.size)?;
                map_read(&temp, span.correction, dst).await
            }
        }
    }
}

/// Reads `dst.len()` bytes at `buffer_offset` through an 8-aligned read mapping.
async fn map_read<D: BufferDevice>(
    t: &Transfer<D>,
    buffer_offset: u64,
    dst: &mut [u8],
) -> Result<(), BufferError> {
    t.require(wgpu::BufferUsages::MAP_READ)?;
    let span = AlignedSpan::new(buffer_offset, dst.len() as u64, wgpu::MAP_ALIGNMENT);
    t.device
        .map_read(
            &t.label,
            &t.buffer,
            span.offset,
            span.size,
            dst,
            span.correction as usize,
        )
        .await
}

/// Source bytes for a queue write covering `span`.
///
/// The window starts `span.correction` bytes before `data_offset`. When `data`
/// cannot supply all of it, bytes inside the buffer's logical length are read
/// back first so the write leaves them unchanged; bytes past the logical length
/// are zero-filled.
async fn queue_window<'a, D: BufferDevice>(
    t: &Transfer<D>,
    span: AlignedSpan,
    data: &'a [u8],
    data_offset: usize,
) -> Result<Cow<'a, [u8]>, BufferError> {
    let correction = span.correction as usize;
    let len = span.size as usize;

    if let Some(start) = data_offset.checked_sub(correction) {
        if start + len <= data.len() {
            return Ok(Cow::Borrowed(&data[start..start + len]));
        }
    }

    let lead = correction.saturating_sub(data_offset);
    let src_start = data_offset + lead - correction;
    let copied = (len - lead).min(data.len() - src_start);
    let uncovered_tail = span.offset + (lead + copied) as u64;

    let mut window = vec![0u8; len];
    if lead > 0 || uncovered_tail < t.len {
        t.read.read(t, span.offset, &mut window, 0, len).await?;
    }
    window[lead..lead + copied].copy_from_slice(&data[src_start..src_start + copied]);
    Ok(Cow::Owned(window))
}
