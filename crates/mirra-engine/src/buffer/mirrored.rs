use std::cell::{Cell, RefCell};
use std::ops::Range;
use std::rc::Rc;
use std::sync::Arc;

use super::align::{align_down, round_up};
use super::device_buffer::{BufferDesc, BufferSource, DeviceBuffer};
use super::{BufferError, DirtyRange, Element, FlushScheduler};
use crate::device::BufferDevice;

/// Whether a mirror has edits not yet written to the device.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FlushState {
    Clean,
    /// One flush is queued; further edits only widen its range.
    PendingFlush,
}

/// Host byte image of a [`DeviceBuffer`] with field-level access.
///
/// Reads are served from the host image and never touch the device. Writes go
/// to the host image immediately and mark their byte range dirty; the first
/// write after a flush queues exactly one flush on the [`FlushScheduler`],
/// which later uploads the union of everything written in between as a single
/// device write.
///
/// Single-threaded: the mirror and its scheduler are `!Send`, and callers
/// serialize access themselves.
pub struct MirroredBuffer<D: BufferDevice> {
    inner: Rc<MirrorInner<D>>,
}

pub(crate) struct MirrorInner<D: BufferDevice> {
    label: Arc<str>,
    host: RefCell<Vec<u8>>,
    dirty: Cell<DirtyRange>,
    /// An entry for this mirror sits in the scheduler queue.
    queued: Cell<bool>,
    buffer: RefCell<DeviceBuffer<D>>,
    scheduler: FlushScheduler<D>,
}

impl<D: BufferDevice> MirroredBuffer<D> {
    /// Allocates the device buffer and a host image of the same logical length
    /// (a copy of the data, or zeroes).
    pub fn new(
        device: D,
        scheduler: &FlushScheduler<D>,
        desc: &BufferDesc<'_>,
    ) -> Result<Self, BufferError> {
        let buffer = DeviceBuffer::new(device, desc)?;
        let host = match desc.source {
            BufferSource::Data(data) => data.to_vec(),
            BufferSource::Blank(size) => vec![0; size as usize],
        };

        Ok(Self {
            inner: Rc::new(MirrorInner {
                label: desc.label.into(),
                host: RefCell::new(host),
                dirty: Cell::new(DirtyRange::CLEAN),
                queued: Cell::new(false),
                buffer: RefCell::new(buffer),
                scheduler: scheduler.clone(),
            }),
        })
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Logical size in bytes.
    pub fn len(&self) -> usize {
        self.inner.host.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self) -> FlushState {
        if self.inner.dirty.get().is_clean() {
            FlushState::Clean
        } else {
            FlushState::PendingFlush
        }
    }

    /// Bytes written since the last flush.
    pub fn dirty_range(&self) -> Option<Range<usize>> {
        self.inner.dirty.get().span()
    }

    /// See [`DeviceBuffer::generation`].
    pub fn generation(&self) -> u64 {
        self.inner.buffer.borrow().generation()
    }

    /// Handle of the device allocation, for binding.
    pub fn raw(&self) -> Result<D::Buffer, BufferError> {
        self.inner.buffer.borrow().raw().cloned()
    }

    /// Decodes `element` from the host image.
    pub fn get<E: Element>(&self, element: &E) -> Result<E::Value, BufferError> {
        self.inner.ensure_live()?;
        let host = self.inner.host.borrow();
        self.inner.check_element(element, host.len())?;
        Ok(element.decode(&host))
    }

    /// Encodes `value` into the host image and marks its range dirty.
    ///
    /// Queues a flush only on the transition from clean to dirty, and only
    /// when no entry for this mirror is already waiting in the scheduler.
    pub fn set<E: Element>(&self, element: &E, value: E::Value) -> Result<(), BufferError> {
        self.inner.ensure_live()?;
        {
            let mut host = self.inner.host.borrow_mut();
            self.inner.check_element(element, host.len())?;
            element.encode(&mut host, value);
        }

        let mut dirty = self.inner.dirty.get();
        let was_clean = dirty.is_clean();
        dirty.extend(element.range());
        self.inner.dirty.set(dirty);

        if was_clean && !dirty.is_clean() {
            self.inner.scheduler.schedule(&self.inner);
        }
        Ok(())
    }

    /// Writes pending edits now instead of waiting for the scheduler.
    ///
    /// Returns whether anything was written. A scheduler entry queued for this
    /// mirror stays queued; it writes nothing unless new edits arrive before
    /// the next run.
    pub async fn flush(&self) -> Result<bool, BufferError> {
        self.inner.flush().await
    }

    /// Replaces the whole contents; the logical size becomes `data.len()`.
    ///
    /// Grows the device allocation when needed (see [`DeviceBuffer::set_data`])
    /// and discards pending edits, which `data` supersedes.
    pub async fn replace(&self, data: &[u8]) -> Result<(), BufferError> {
        let len = data.len() as u64;
        let in_place = {
            let mut buffer = self.inner.buffer.borrow_mut();
            if buffer.fits(len)? {
                let mut transfer = buffer.transfer()?;
                transfer.len = len;
                Some(transfer)
            } else {
                buffer.reallocate(data)?;
                None
            }
        };

        if let Some(transfer) = in_place {
            transfer.write_at(0, data, 0, data.len()).await?;
            self.inner.buffer.borrow_mut().set_len(len)?;
        }

        *self.inner.host.borrow_mut() = data.to_vec();
        self.inner.dirty.set(DirtyRange::CLEAN);
        Ok(())
    }

    /// Reads the device copy back, for verification and debugging.
    pub async fn read_device(&self) -> Result<Vec<u8>, BufferError> {
        let transfer = self.inner.buffer.borrow().transfer()?;
        let len = transfer.len as usize;
        let mut bytes = vec![0; len];
        transfer.read_at(0, &mut bytes, 0, len).await?;
        Ok(bytes)
    }

    /// Releases the device allocation and drops pending edits.
    pub fn destroy(&self) -> Result<(), BufferError> {
        self.inner.buffer.borrow_mut().destroy()?;
        self.inner.dirty.set(DirtyRange::CLEAN);
        Ok(())
    }
}

impl<D: BufferDevice> MirrorInner<D> {
    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    /// Marks the mirror as queued; false if it already was.
    pub(crate) fn mark_queued(&self) -> bool {
        !self.queued.replace(true)
    }

    pub(crate) fn clear_queued(&self) {
        self.queued.set(false);
    }

    /// Uploads the dirty range and resets to clean.
    ///
    /// The range is reset before the write is issued, so a failed write is
    /// reported once and not retried by later runs.
    pub(crate) async fn flush(&self) -> Result<bool, BufferError> {
        let Some(range) = self.dirty.replace(DirtyRange::CLEAN).span() else {
            return Ok(false);
        };
        let transfer = self.buffer.borrow().transfer()?;

        // Snapshot wide enough for either write path's correction, so the
        // upload never needs to read back from the device.
        let start = align_down(range.start as u64, wgpu::MAP_ALIGNMENT) as usize;
        let end = round_up(range.end as u64, wgpu::COPY_BUFFER_ALIGNMENT) as usize;
        let mut window = vec![0u8; end - start];
        {
            let host = self.host.borrow();
            let available = end.min(host.len());
            window[..available - start].copy_from_slice(&host[start..available]);
        }

        log::trace!("{}: flushing {}..{}", self.label, range.start, range.end);
        transfer
            .write_at(range.start as u64, &window, range.start - start, range.len())
            .await?;
        Ok(true)
    }

    fn ensure_live(&self) -> Result<(), BufferError> {
        if self.buffer.borrow().is_destroyed() {
            return Err(BufferError::UseAfterDestroy {
                label: self.label.to_string(),
            });
        }
        Ok(())
    }

    fn check_element<E: Element>(&self, element: &E, len: usize) -> Result<(), BufferError> {
        let (offset, size) = (element.byte_offset(), element.byte_size());
        match offset.checked_add(size) {
            Some(end) if end <= len => Ok(()),
            _ => Err(BufferError::out_of_range(
                &self.label,
                offset as u64,
                size as u64,
                len as u64,
            )),
        }
    }
}
