use std::sync::Arc;

use super::align::{round_up, AlignedSpan};
use super::strategy::{ReadStrategy, WriteStrategy};
use super::BufferError;
use crate::device::BufferDevice;

/// Initial contents of a new buffer.
#[derive(Debug, Copy, Clone)]
pub enum BufferSource<'a> {
    /// Upload these bytes; the logical size is their length.
    Data(&'a [u8]),
    /// Zero-filled buffer with this logical size.
    Blank(u64),
}

/// Creation parameters for [`DeviceBuffer`] and [`MirroredBuffer`](super::MirroredBuffer).
#[derive(Debug, Copy, Clone)]
pub struct BufferDesc<'a> {
    pub label: &'a str,
    pub usage: wgpu::BufferUsages,
    pub source: BufferSource<'a>,
    /// Bytes per element for array-like contents; 0 when not applicable.
    pub stride: u64,
}

impl<'a> BufferDesc<'a> {
    pub fn with_data(label: &'a str, usage: wgpu::BufferUsages, data: &'a [u8]) -> Self {
        Self {
            label,
            usage,
            source: BufferSource::Data(data),
            stride: 0,
        }
    }

    pub fn blank(label: &'a str, usage: wgpu::BufferUsages, size: u64) -> Self {
        Self {
            label,
            usage,
            source: BufferSource::Blank(size),
            stride: 0,
        }
    }

    pub fn stride(mut self, stride: u64) -> Self {
        self.stride = stride;
        self
    }
}

/// One device allocation with alignment-correct transfer operations.
///
/// Capacity is always a multiple of 4 and at least the logical length. Write and
/// read paths are chosen from the usage flags at creation:
/// - `MAP_WRITE` buffers are written through 8-aligned mappings, others through
///   4-aligned queue writes
/// - `MAP_READ` buffers are read through 8-aligned mappings, others through a
///   temporary staging buffer
///
/// Offsets passed in need no alignment; each path widens the device-side span
/// as required and places the payload at the matching correction.
///
/// After [`destroy`](Self::destroy) every operation returns
/// [`BufferError::UseAfterDestroy`]. Dropping a live buffer releases it as well.
pub struct DeviceBuffer<D: BufferDevice> {
    device: D,
    label: Arc<str>,
    usage: wgpu::BufferUsages,
    stride: u64,
    write: WriteStrategy,
    read: ReadStrategy,
    allocation: Option<Allocation<D::Buffer>>,
    generation: u64,
}

struct Allocation<B> {
    buffer: B,
    capacity: u64,
    len: u64,
}

impl<D: BufferDevice> DeviceBuffer<D> {
    pub fn new(device: D, desc: &BufferDesc<'_>) -> Result<Self, BufferError> {
        let allocation = allocate(&device, desc.label, desc.usage, desc.source)?;
        log::trace!(
            "{}: created {} bytes (capacity {}, usage {:?})",
            desc.label,
            allocation.len,
            allocation.capacity,
            desc.usage
        );

        Ok(Self {
            device,
            label: desc.label.into(),
            usage: desc.usage,
            stride: desc.stride,
            write: WriteStrategy::for_usage(desc.usage),
            read: ReadStrategy::for_usage(desc.usage),
            allocation: Some(allocation),
            generation: 0,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn usage(&self) -> wgpu::BufferUsages {
        self.usage
    }

    pub fn write_strategy(&self) -> WriteStrategy {
        self.write
    }

    pub fn read_strategy(&self) -> ReadStrategy {
        self.read
    }

    /// Allocated bytes; 0 once destroyed.
    pub fn capacity(&self) -> u64 {
        self.allocation.as_ref().map_or(0, |a| a.capacity)
    }

    /// Logical size in bytes; 0 once destroyed.
    pub fn len(&self) -> u64 {
        self.allocation.as_ref().map_or(0, |a| a.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }

    /// Number of whole `stride`-sized elements, when a stride was given.
    pub fn element_count(&self) -> Option<u64> {
        (self.stride > 0).then(|| self.len() / self.stride)
    }

    /// Incremented each time growth replaces the allocation.
    ///
    /// Anything derived from the raw handle (bind groups, cached views) is stale
    /// once this changes.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_destroyed(&self) -> bool {
        self.allocation.is_none()
    }

    /// The underlying device handle.
    pub fn raw(&self) -> Result<&D::Buffer, BufferError> {
        self.live().map(|a| &a.buffer)
    }

    /// Replaces the contents with `data`; the logical size becomes `data.len()`.
    ///
    /// A payload larger than the capacity replaces the allocation (the old
    /// contents are not carried over and [`generation`](Self::generation) is
    /// bumped); otherwise it is written in place.
    pub async fn set_data(&mut self, data: &[u8]) -> Result<(), BufferError> {
        let len = data.len() as u64;
        if !self.fits(len)? {
            return self.reallocate(data);
        }

        let mut transfer = self.transfer()?;
        transfer.len = len;
        transfer.write_at(0, data, 0, data.len()).await?;
        self.set_len(len)
    }

    /// Writes `data[data_offset..data_offset + size]` at `buffer_offset`.
    ///
    /// On the queue path the write is widened to a 4-aligned window sourced
    /// from `data` around `data_offset`. Window bytes `data` cannot supply and
    /// that lie inside the logical length are read back from the device first,
    /// which needs `MAP_READ` or `COPY_SRC`; without either the write fails with
    /// [`BufferError::MissingUsage`]. Passing the whole host image (as
    /// [`MirroredBuffer`](super::MirroredBuffer) does) never needs the read-back.
    pub async fn write_at(
        &self,
        buffer_offset: u64,
        data: &[u8],
        data_offset: usize,
        size: usize,
    ) -> Result<(), BufferError> {
        self.transfer()?
            .write_at(buffer_offset, data, data_offset, size)
            .await
    }

    /// Reads `size` bytes at `buffer_offset` into `data[data_offset..]`.
    pub async fn read_at(
        &self,
        buffer_offset: u64,
        data: &mut [u8],
        data_offset: usize,
        size: usize,
    ) -> Result<(), BufferError> {
        self.transfer()?
            .read_at(buffer_offset, data, data_offset, size)
            .await
    }

    /// Copies `size` bytes from this buffer at `this_offset` into `that` at
    /// `that_offset`.
    ///
    /// Both offsets are aligned down to 4 and the copy widened to cover the
    /// range, so the two offsets must share the same position within their
    /// 4-byte words; otherwise the copy fails with
    /// [`BufferError::AlignmentMismatch`]. Copying within one buffer is
    /// refused with [`BufferError::SelfCopy`].
    pub fn copy_at(
        &self,
        this_offset: u64,
        that: &DeviceBuffer<D>,
        that_offset: u64,
        size: u64,
    ) -> Result<(), BufferError> {
        let src = self.transfer()?;
        let dst = that.transfer()?;
        if std::ptr::eq(self, that) {
            return Err(BufferError::SelfCopy {
                label: self.label.to_string(),
            });
        }

        let src_span = AlignedSpan::new(this_offset, size, wgpu::COPY_BUFFER_ALIGNMENT);
        let dst_span = AlignedSpan::new(that_offset, size, wgpu::COPY_BUFFER_ALIGNMENT);
        if src_span.correction != dst_span.correction {
            return Err(BufferError::AlignmentMismatch {
                src_correction: src_span.correction,
                dst_correction: dst_span.correction,
            });
        }

        src.check_range(this_offset, size)?;
        dst.check_range(that_offset, size)?;
        src.require(wgpu::BufferUsages::COPY_SRC)?;
        dst.require(wgpu::BufferUsages::COPY_DST)?;
        if size == 0 {
            return Ok(());
        }

        log::trace!(
            "{}: copy {}..{} -> {} at {}",
            self.label,
            src_span.offset,
            src_span.end(),
            that.label,
            dst_span.offset
        );
        self.device.submit_copy(
            &src.buffer,
            src_span.offset,
            &dst.buffer,
            dst_span.offset,
            src_span.size,
        )
    }

    /// Releases the allocation.
    pub fn destroy(&mut self) -> Result<(), BufferError> {
        let allocation = self.allocation.take().ok_or_else(|| self.destroyed())?;
        self.device.destroy_buffer(&allocation.buffer);
        log::debug!("{}: destroyed", self.label);
        Ok(())
    }

    /// Detached handles of the live allocation for running a transfer.
    pub(crate) fn transfer(&self) -> Result<Transfer<D>, BufferError> {
        let allocation = self.live()?;
        Ok(Transfer {
            device: self.device.clone(),
            buffer: allocation.buffer.clone(),
            label: Arc::clone(&self.label),
            usage: self.usage,
            len: allocation.len,
            write: self.write,
            read: self.read,
        })
    }

    /// True when `len` bytes fit the current allocation.
    pub(crate) fn fits(&self, len: u64) -> Result<bool, BufferError> {
        Ok(len <= self.live()?.capacity)
    }

    pub(crate) fn set_len(&mut self, len: u64) -> Result<(), BufferError> {
        let label = &self.label;
        let allocation = self.allocation.as_mut().ok_or_else(|| BufferError::UseAfterDestroy {
            label: label.to_string(),
        })?;
        debug_assert!(len <= allocation.capacity);
        allocation.len = len;
        Ok(())
    }

    /// Swaps in a new allocation holding exactly `data`.
    ///
    /// The new allocation is made before the old one is released, so a failed
    /// growth leaves the buffer as it was.
    pub(crate) fn reallocate(&mut self, data: &[u8]) -> Result<(), BufferError> {
        let old_capacity = self.live()?.capacity;
        let next = allocate(&self.device, &self.label, self.usage, BufferSource::Data(data))?;
        log::debug!(
            "{}: reallocated {} -> {} bytes",
            self.label,
            old_capacity,
            next.capacity
        );

        if let Some(old) = self.allocation.replace(next) {
            self.device.destroy_buffer(&old.buffer);
        }
        self.generation += 1;
        Ok(())
    }

    fn live(&self) -> Result<&Allocation<D::Buffer>, BufferError> {
        self.allocation.as_ref().ok_or_else(|| self.destroyed())
    }

    fn destroyed(&self) -> BufferError {
        BufferError::UseAfterDestroy {
            label: self.label.to_string(),
        }
    }
}

impl<D: BufferDevice> Drop for DeviceBuffer<D> {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            self.device.destroy_buffer(&allocation.buffer);
        }
    }
}

fn allocate<D: BufferDevice>(
    device: &D,
    label: &str,
    usage: wgpu::BufferUsages,
    source: BufferSource<'_>,
) -> Result<Allocation<D::Buffer>, BufferError> {
    let len = match source {
        BufferSource::Data(data) => data.len() as u64,
        BufferSource::Blank(size) => size,
    };
    let capacity = round_up(len, wgpu::COPY_BUFFER_ALIGNMENT);

    let limit = device.max_buffer_size();
    if capacity > limit {
        return Err(BufferError::AllocationFailed {
            label: label.to_owned(),
            requested: capacity,
            limit,
        });
    }

    let buffer = match source {
        BufferSource::Data(data) if data.len() as u64 == capacity => {
            device.create_buffer_init(label, usage, data)?
        }
        BufferSource::Data(data) => {
            let mut padded = Vec::with_capacity(capacity as usize);
            padded.extend_from_slice(data);
            padded.resize(capacity as usize, 0);
            device.create_buffer_init(label, usage, &padded)?
        }
        BufferSource::Blank(_) => device.create_buffer(label, usage, capacity)?,
    };

    Ok(Allocation {
        buffer,
        capacity,
        len,
    })
}

/// Handles of one live allocation, detached from the owning [`DeviceBuffer`]
/// so that a transfer can be awaited without borrowing it.
pub(crate) struct Transfer<D: BufferDevice> {
    pub(crate) device: D,
    pub(crate) buffer: D::Buffer,
    pub(crate) label: Arc<str>,
    pub(crate) usage: wgpu::BufferUsages,
    /// Logical length at the time the handles were taken.
    pub(crate) len: u64,
    pub(crate) write: WriteStrategy,
    pub(crate) read: ReadStrategy,
}

impl<D: BufferDevice> Transfer<D> {
    pub(crate) async fn write_at(
        &self,
        buffer_offset: u64,
        data: &[u8],
        data_offset: usize,
        size: usize,
    ) -> Result<(), BufferError> {
        self.check_range(buffer_offset, size as u64)?;
        self.check_slice(data.len(), data_offset, size)?;
        if size == 0 {
            return Ok(());
        }
        self.write
            .write(self, buffer_offset, data, data_offset, size)
            .await
    }

    pub(crate) async fn read_at(
        &self,
        buffer_offset: u64,
        data: &mut [u8],
        data_offset: usize,
        size: usize,
    ) -> Result<(), BufferError> {
        self.check_range(buffer_offset, size as u64)?;
        self.check_slice(data.len(), data_offset, size)?;
        if size == 0 {
            return Ok(());
        }
        self.read
            .read(self, buffer_offset, data, data_offset, size)
            .await
    }

    pub(crate) fn require(&self, usage: wgpu::BufferUsages) -> Result<(), BufferError> {
        if self.usage.contains(usage) {
            Ok(())
        } else {
            Err(BufferError::MissingUsage {
                label: self.label.to_string(),
                required: usage,
            })
        }
    }

    pub(crate) fn check_range(&self, offset: u64, size: u64) -> Result<(), BufferError> {
        match offset.checked_add(size) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(BufferError::out_of_range(&self.label, offset, size, self.len)),
        }
    }

    fn check_slice(&self, slice_len: usize, offset: usize, size: usize) -> Result<(), BufferError> {
        match offset.checked_add(size) {
            Some(end) if end <= slice_len => Ok(()),
            _ => Err(BufferError::out_of_range(
                &self.label,
                offset as u64,
                size as u64,
                slice_len as u64,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceOp, HostBuffer, HostDevice};
    use pollster::block_on;
    use wgpu::BufferUsages as U;

    fn handle(buf: &DeviceBuffer<HostDevice>) -> HostBuffer {
        *buf.raw().unwrap()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| i as u8 + 1).collect()
    }

    fn writes(dev: &HostDevice) -> Vec<DeviceOp> {
        dev.ops().into_iter().filter(DeviceOp::is_write).collect()
    }

    // ── creation ──────────────────────────────────────────────────────────

    #[test]
    fn create_from_data_rounds_capacity() {
        let dev = HostDevice::new();
        let data = pattern(10);
        let buf = DeviceBuffer::new(dev.clone(), &BufferDesc::with_data("d", U::COPY_DST, &data))
            .unwrap();

        assert_eq!(buf.capacity(), 12);
        assert_eq!(buf.len(), 10);
        assert_eq!(
            dev.ops(),
            vec![DeviceOp::Create { buffer: handle(&buf), size: 12, initialized: true }]
        );
        let bytes = dev.bytes(handle(&buf)).unwrap();
        assert_eq!(&bytes[..10], &data[..]);
        assert_eq!(&bytes[10..], &[0, 0]);
    }

    #[test]
    fn create_blank_is_zeroed() {
        let dev = HostDevice::new();
        let buf = DeviceBuffer::new(dev.clone(), &BufferDesc::blank("b", U::COPY_DST, 10)).unwrap();

        assert_eq!(buf.capacity(), 12);
        assert_eq!(buf.len(), 10);
        assert_eq!(dev.bytes(handle(&buf)).unwrap(), vec![0; 12]);
        assert!(matches!(dev.ops()[0], DeviceOp::Create { initialized: false, .. }));
    }

    #[test]
    fn create_over_limit_fails() {
        let dev = HostDevice::with_max_buffer_size(16);
        let result = DeviceBuffer::new(dev.clone(), &BufferDesc::blank("big", U::COPY_DST, 17));
        assert!(matches!(
            result,
            Err(BufferError::AllocationFailed { requested: 20, limit: 16, .. })
        ));
        assert_eq!(dev.live_buffers(), 0);
    }

    #[test]
    fn stride_gives_element_count() {
        let dev = HostDevice::new();
        let buf = DeviceBuffer::new(dev, &BufferDesc::blank("v", U::VERTEX, 48).stride(12)).unwrap();
        assert_eq!(buf.element_count(), Some(4));

        let dev = HostDevice::new();
        let raw = DeviceBuffer::new(dev, &BufferDesc::blank("r", U::VERTEX, 48)).unwrap();
        assert_eq!(raw.element_count(), None);
    }

    // ── write paths ───────────────────────────────────────────────────────

    #[test]
    fn direct_map_write_maps_eight_aligned_span() {
        let dev = HostDevice::new();
        let buf =
            DeviceBuffer::new(dev.clone(), &BufferDesc::blank("m", U::MAP_WRITE | U::COPY_SRC, 32))
                .unwrap();
        assert_eq!(buf.write_strategy(), WriteStrategy::DirectMap);

        block_on(buf.write_at(13, &[1, 2, 3, 4, 5], 0, 5)).unwrap();

        assert_eq!(
            writes(&dev),
            vec![DeviceOp::MapWrite { buffer: handle(&buf), offset: 8, size: 12 }]
        );
        let bytes = dev.bytes(handle(&buf)).unwrap();
        assert_eq!(&bytes[8..13], &[0; 5]);
        assert_eq!(&bytes[13..18], &[1, 2, 3, 4, 5]);
        assert_eq!(&bytes[18..20], &[0; 2]);
    }

    #[test]
    fn queue_write_sources_corrected_window_from_data() {
        let dev = HostDevice::new();
        let buf = DeviceBuffer::new(dev.clone(), &BufferDesc::blank("q", U::COPY_DST, 32)).unwrap();
        assert_eq!(buf.write_strategy(), WriteStrategy::Queue);

        let image = pattern(32);
        block_on(buf.write_at(13, &image, 13, 3)).unwrap();

        assert_eq!(
            writes(&dev),
            vec![DeviceOp::QueueWrite { buffer: handle(&buf), offset: 12, size: 4 }]
        );
        assert_eq!(&dev.bytes(handle(&buf)).unwrap()[12..16], &image[12..16]);
    }

    #[test]
    fn queue_write_preserves_bytes_the_source_cannot_cover() {
        let dev = HostDevice::new();
        let buf = DeviceBuffer::new(
            dev.clone(),
            &BufferDesc::with_data("q", U::COPY_DST | U::COPY_SRC, &[0xEE; 32]),
        )
        .unwrap();

        block_on(buf.write_at(13, &[1, 2, 3], 0, 3)).unwrap();

        let bytes = dev.bytes(handle(&buf)).unwrap();
        assert_eq!(&bytes[12..16], &[0xEE, 1, 2, 3]);
        assert!(matches!(
            dev.ops().last(),
            Some(DeviceOp::QueueWrite { offset: 12, size: 4, .. })
        ));
        // The staging buffer used for the read-back is gone again.
        assert_eq!(dev.live_buffers(), 1);
    }

    #[test]
    fn partial_queue_write_needs_a_read_path() {
        let dev = HostDevice::new();
        let buf = DeviceBuffer::new(dev.clone(), &BufferDesc::blank("u", U::UNIFORM | U::COPY_DST, 16))
            .unwrap();

        let err = block_on(buf.write_at(5, &[1, 2], 0, 2)).unwrap_err();
        assert!(matches!(err, BufferError::MissingUsage { required, .. } if required == U::COPY_SRC));
        assert!(writes(&dev).is_empty());

        // A source slice covering the whole window needs no read-back.
        block_on(buf.write_at(5, &[0, 1, 2, 0], 1, 2)).unwrap();
        assert_eq!(&dev.bytes(handle(&buf)).unwrap()[4..8], &[0, 1, 2, 0]);
    }

    #[test]
    fn queue_write_without_copy_dst_is_refused() {
        let dev = HostDevice::new();
        let buf = DeviceBuffer::new(dev, &BufferDesc::blank("u", U::UNIFORM, 16)).unwrap();
        let err = block_on(buf.write_at(0, &[0; 4], 0, 4)).unwrap_err();
        assert!(matches!(err, BufferError::MissingUsage { required, .. } if required == U::COPY_DST));
    }

    #[test]
    fn issued_offsets_are_aligned_and_cover_the_range() {
        for usage in [U::MAP_WRITE | U::COPY_SRC, U::COPY_DST] {
            let dev = HostDevice::new();
            let buf = DeviceBuffer::new(dev.clone(), &BufferDesc::blank("s", usage, 40)).unwrap();
            let alignment = buf.write_strategy().alignment();
            let image = pattern(40);

            for offset in 0..24u64 {
                for size in 1..9usize {
                    dev.clear_ops();
                    block_on(buf.write_at(offset, &image, offset as usize, size)).unwrap();

                    let ops = writes(&dev);
                    assert_eq!(ops.len(), 1, "usage {usage:?} offset {offset} size {size}");
                    let (issued, issued_size) = match ops[0] {
                        DeviceOp::MapWrite { offset, size, .. }
                        | DeviceOp::QueueWrite { offset, size, .. } => (offset, size),
                        ref other => panic!("unexpected {other:?}"),
                    };
                    assert_eq!(issued % alignment, 0);
                    assert!(issued <= offset);
                    assert!(issued + issued_size >= offset + size as u64);

                    let bytes = dev.bytes(handle(&buf)).unwrap();
                    let range = offset as usize..offset as usize + size;
                    assert_eq!(&bytes[range.clone()], &image[range]);
                }
            }
        }
    }

    #[test]
    fn write_past_logical_end_is_out_of_range() {
        let dev = HostDevice::new();
        let buf = DeviceBuffer::new(dev, &BufferDesc::blank("o", U::COPY_DST, 30)).unwrap();
        let err = block_on(buf.write_at(28, &[0; 4], 0, 4)).unwrap_err();
        assert!(matches!(err, BufferError::OutOfRange { offset: 28, size: 4, limit: 30, .. }));
    }

    // ── read paths ────────────────────────────────────────────────────────

    #[test]
    fn direct_map_read_maps_eight_aligned_span() {
        let dev = HostDevice::new();
        let data = pattern(24);
        let buf = DeviceBuffer::new(
            dev.clone(),
            &BufferDesc::with_data("r", U::MAP_READ | U::COPY_DST, &data),
        )
        .unwrap();
        assert_eq!(buf.read_strategy(), ReadStrategy::DirectMap);

        let mut out = [0u8; 6];
        block_on(buf.read_at(5, &mut out, 0, 6)).unwrap();

        assert_eq!(&out, &data[5..11]);
        assert!(matches!(
            dev.ops().last(),
            Some(DeviceOp::MapRead { offset: 0, size: 12, .. })
        ));
    }

    #[test]
    fn staging_read_copies_then_releases_temp() {
        let dev = HostDevice::new();
        let data = pattern(24);
        let buf = DeviceBuffer::new(dev.clone(), &BufferDesc::with_data("s", U::COPY_SRC, &data))
            .unwrap();
        assert_eq!(buf.read_strategy(), ReadStrategy::Staging);
        dev.clear_ops();

        let mut out = [0u8; 8];
        block_on(buf.read_at(6, &mut out, 2, 5)).unwrap();

        assert_eq!(&out[2..7], &data[6..11]);
        assert_eq!(&out[..2], &[0, 0]);
        assert_eq!(dev.live_buffers(), 1);

        let ops = dev.ops();
        assert_eq!(ops.len(), 4);
        let DeviceOp::Create { buffer: staging, size: 8, .. } = ops[0] else {
            panic!("expected staging allocation, got {:?}", ops[0]);
        };
        assert_eq!(
            ops[1],
            DeviceOp::Copy {
                src: handle(&buf),
                src_offset: 4,
                dst: staging,
                dst_offset: 0,
                size: 8
            }
        );
        assert!(matches!(ops[2], DeviceOp::MapRead { buffer, .. } if buffer == staging));
        assert_eq!(ops[3], DeviceOp::Destroy { buffer: staging });
    }

    #[test]
    fn read_offsets_are_aligned_and_cover_the_range() {
        for usage in [U::MAP_READ | U::COPY_DST, U::COPY_SRC] {
            let dev = HostDevice::new();
            let data = pattern(40);
            let buf = DeviceBuffer::new(dev.clone(), &BufferDesc::with_data("s", usage, &data))
                .unwrap();
            let own = handle(&buf);
            let alignment = buf.read_strategy().alignment();

            for offset in 0..24u64 {
                for size in 1..9usize {
                    dev.clear_ops();
                    let mut out = vec![0u8; size];
                    block_on(buf.read_at(offset, &mut out, 0, size)).unwrap();

                    let touched: Vec<(u64, u64)> = dev
                        .ops()
                        .into_iter()
                        .filter_map(|op| match op {
                            DeviceOp::MapRead { buffer, offset, size } if buffer == own => {
                                Some((offset, size))
                            }
                            DeviceOp::Copy { src, src_offset, size, .. } if src == own => {
                                Some((src_offset, size))
                            }
                            _ => None,
                        })
                        .collect();
                    assert_eq!(touched.len(), 1, "usage {usage:?} offset {offset} size {size}");
                    let (issued, issued_size) = touched[0];
                    assert_eq!(issued % alignment, 0);
                    assert!(issued <= offset);
                    assert!(issued + issued_size >= offset + size as u64);

                    let range = offset as usize..offset as usize + size;
                    assert_eq!(&out[..], &data[range]);
                }
            }
            assert_eq!(dev.live_buffers(), 1);
        }
    }

    #[test]
    fn staging_failure_still_releases_temp() {
        let dev = HostDevice::new();
        let buf = DeviceBuffer::new(dev.clone(), &BufferDesc::blank("s", U::COPY_SRC, 16)).unwrap();
        dev.fail_next_map("device lost");

        let mut out = [0u8; 4];
        let err = block_on(buf.read_at(0, &mut out, 0, 4)).unwrap_err();

        assert_eq!(
            err,
            BufferError::Map { label: "s staging".into(), reason: "device lost".into() }
        );
        assert_eq!(dev.live_buffers(), 1);
        assert!(matches!(dev.ops().last(), Some(DeviceOp::Destroy { .. })));
    }

    #[test]
    fn staging_read_needs_copy_src() {
        let dev = HostDevice::new();
        let buf = DeviceBuffer::new(dev.clone(), &BufferDesc::blank("w", U::COPY_DST, 16)).unwrap();
        let mut out = [0u8; 4];
        let err = block_on(buf.read_at(0, &mut out, 0, 4)).unwrap_err();
        assert!(matches!(err, BufferError::MissingUsage { required, .. } if required == U::COPY_SRC));
        assert_eq!(dev.live_buffers(), 1);
    }

    // ── copy ──────────────────────────────────────────────────────────────

    #[test]
    fn copy_with_matching_corrections() {
        let dev = HostDevice::new();
        let data = pattern(32);
        let src = DeviceBuffer::new(dev.clone(), &BufferDesc::with_data("src", U::COPY_SRC, &data))
            .unwrap();
        let dst = DeviceBuffer::new(dev.clone(), &BufferDesc::blank("dst", U::COPY_DST, 32)).unwrap();

        src.copy_at(5, &dst, 9, 6).unwrap();

        assert_eq!(
            dev.ops().last(),
            Some(&DeviceOp::Copy {
                src: handle(&src),
                src_offset: 4,
                dst: handle(&dst),
                dst_offset: 8,
                size: 8
            })
        );
        assert_eq!(&dev.bytes(handle(&dst)).unwrap()[9..15], &data[5..11]);
    }

    #[test]
    fn copy_with_mismatched_corrections_fails() {
        let dev = HostDevice::new();
        let src = DeviceBuffer::new(dev.clone(), &BufferDesc::blank("src", U::COPY_SRC, 32)).unwrap();
        let dst = DeviceBuffer::new(dev.clone(), &BufferDesc::blank("dst", U::COPY_DST, 32)).unwrap();
        dev.clear_ops();

        let err = src.copy_at(5, &dst, 6, 4).unwrap_err();

        assert_eq!(err, BufferError::AlignmentMismatch { src_correction: 1, dst_correction: 2 });
        assert!(dev.ops().is_empty());
    }

    #[test]
    fn copy_within_one_buffer_is_refused() {
        let dev = HostDevice::new();
        let buf = DeviceBuffer::new(
            dev.clone(),
            &BufferDesc::with_data("both", U::COPY_SRC | U::COPY_DST, &pattern(32)),
        )
        .unwrap();
        dev.clear_ops();

        let err = buf.copy_at(0, &buf, 16, 8).unwrap_err();

        assert_eq!(err, BufferError::SelfCopy { label: "both".into() });
        assert!(dev.ops().is_empty());
        assert_eq!(dev.bytes(handle(&buf)).unwrap(), pattern(32));
    }

    // ── growth ────────────────────────────────────────────────────────────

    #[test]
    fn set_data_that_fits_keeps_allocation() {
        let dev = HostDevice::new();
        let mut buf = DeviceBuffer::new(dev.clone(), &BufferDesc::blank("g", U::COPY_DST, 16)).unwrap();
        let before = handle(&buf);

        block_on(buf.set_data(&[9, 8, 7, 6, 5, 4])).unwrap();

        assert_eq!(handle(&buf), before);
        assert_eq!(buf.generation(), 0);
        assert_eq!(buf.len(), 6);
        assert_eq!(buf.capacity(), 16);
        assert_eq!(&dev.bytes(before).unwrap()[..6], &[9, 8, 7, 6, 5, 4]);
    }

    #[test]
    fn set_data_larger_than_capacity_reallocates() {
        let dev = HostDevice::new();
        let mut buf = DeviceBuffer::new(dev.clone(), &BufferDesc::blank("g", U::COPY_DST, 8)).unwrap();
        let before = handle(&buf);
        let payload = pattern(21);

        block_on(buf.set_data(&payload)).unwrap();

        assert_ne!(handle(&buf), before);
        assert_eq!(buf.generation(), 1);
        assert_eq!(buf.len(), 21);
        assert_eq!(buf.capacity(), 24);
        assert_eq!(dev.bytes(before), None);
        assert_eq!(dev.live_buffers(), 1);
        assert_eq!(&dev.bytes(handle(&buf)).unwrap()[..21], &payload[..]);
    }

    #[test]
    fn failed_growth_keeps_old_allocation() {
        let dev = HostDevice::with_max_buffer_size(16);
        let mut buf = DeviceBuffer::new(dev.clone(), &BufferDesc::blank("g", U::COPY_DST, 8)).unwrap();
        let before = handle(&buf);

        let err = block_on(buf.set_data(&[0; 32])).unwrap_err();

        assert!(matches!(err, BufferError::AllocationFailed { .. }));
        assert_eq!(handle(&buf), before);
        assert_eq!(buf.len(), 8);
        assert!(block_on(buf.write_at(0, &[1; 4], 0, 4)).is_ok());
    }

    // ── lifecycle ─────────────────────────────────────────────────────────

    #[test]
    fn use_after_destroy_is_reported() {
        let dev = HostDevice::new();
        let mut buf = DeviceBuffer::new(dev.clone(), &BufferDesc::blank("x", U::COPY_DST, 8)).unwrap();
        buf.destroy().unwrap();
        assert_eq!(dev.live_buffers(), 0);

        let gone = BufferError::UseAfterDestroy { label: "x".into() };
        assert_eq!(block_on(buf.write_at(0, &[0; 4], 0, 4)), Err(gone.clone()));
        let mut out = [0u8; 4];
        assert_eq!(block_on(buf.read_at(0, &mut out, 0, 4)), Err(gone.clone()));
        assert_eq!(block_on(buf.set_data(&[1])), Err(gone.clone()));
        assert_eq!(buf.set_len(4), Err(gone.clone()));
        assert_eq!(buf.destroy(), Err(gone));
    }

    #[test]
    fn drop_releases_allocation() {
        let dev = HostDevice::new();
        {
            let _buf = DeviceBuffer::new(dev.clone(), &BufferDesc::blank("t", U::COPY_DST, 8)).unwrap();
            assert_eq!(dev.live_buffers(), 1);
        }
        assert_eq!(dev.live_buffers(), 0);
    }
}
