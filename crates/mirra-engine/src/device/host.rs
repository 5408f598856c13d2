use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use super::BufferDevice;
use crate::buffer::BufferError;

/// Default allocation limit, matching `wgpu::Limits::default().max_buffer_size`.
const DEFAULT_MAX_BUFFER_SIZE: u64 = 1 << 28;

/// Handle to an allocation owned by a [`HostDevice`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct HostBuffer(u64);

/// Device-level operation recorded by [`HostDevice`], in issue order.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DeviceOp {
    Create {
        buffer: HostBuffer,
        size: u64,
        /// Contents were supplied at creation time.
        initialized: bool,
    },
    MapWrite {
        buffer: HostBuffer,
        offset: u64,
        size: u64,
    },
    MapRead {
        buffer: HostBuffer,
        offset: u64,
        size: u64,
    },
    QueueWrite {
        buffer: HostBuffer,
        offset: u64,
        size: u64,
    },
    Copy {
        src: HostBuffer,
        src_offset: u64,
        dst: HostBuffer,
        dst_offset: u64,
        size: u64,
    },
    Destroy {
        buffer: HostBuffer,
    },
}

impl DeviceOp {
    /// True for operations that change contents of an existing allocation.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            DeviceOp::MapWrite { .. } | DeviceOp::QueueWrite { .. } | DeviceOp::Copy { .. }
        )
    }
}

/// Software [`BufferDevice`] keeping every allocation in host memory.
///
/// Applies the alignment and usage rules wgpu validation enforces on mapping,
/// queue writes and copies, and records each accepted operation. Clones share
/// state, so a test can hand one clone to the buffer layer and inspect another.
///
/// Usage combinations are not restricted: `MAP_WRITE | COPY_DST` is accepted
/// even though wgpu requires `MAPPABLE_PRIMARY_BUFFERS` for it.
#[derive(Clone)]
pub struct HostDevice {
    state: Rc<RefCell<HostState>>,
}

struct HostState {
    next_id: u64,
    allocations: HashMap<HostBuffer, Allocation>,
    ops: Vec<DeviceOp>,
    max_buffer_size: u64,
    fail_next_map: Option<String>,
}

struct Allocation {
    label: String,
    usage: wgpu::BufferUsages,
    bytes: Vec<u8>,
}

impl HostDevice {
    pub fn new() -> Self {
        Self::with_max_buffer_size(DEFAULT_MAX_BUFFER_SIZE)
    }

    /// Creates a device that refuses allocations larger than `max` bytes.
    pub fn with_max_buffer_size(max: u64) -> Self {
        Self {
            state: Rc::new(RefCell::new(HostState {
                next_id: 0,
                allocations: HashMap::new(),
                ops: Vec::new(),
                max_buffer_size: max,
                fail_next_map: None,
            })),
        }
    }

    /// Operations accepted so far.
    pub fn ops(&self) -> Vec<DeviceOp> {
        self.state.borrow().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.state.borrow_mut().ops.clear();
    }

    /// Number of allocations not yet destroyed.
    pub fn live_buffers(&self) -> usize {
        self.state.borrow().allocations.len()
    }

    /// Snapshot of an allocation's bytes, or `None` once destroyed.
    pub fn bytes(&self, buffer: HostBuffer) -> Option<Vec<u8>> {
        self.state
            .borrow()
            .allocations
            .get(&buffer)
            .map(|a| a.bytes.clone())
    }

    /// Overwrites bytes directly, bypassing validation and the op log.
    pub fn poke(&self, buffer: HostBuffer, offset: usize, bytes: &[u8]) -> Result<(), BufferError> {
        let mut state = self.state.borrow_mut();
        let alloc = state.allocation_mut(buffer)?;
        let end = offset + bytes.len();
        if end > alloc.bytes.len() {
            return Err(BufferError::out_of_range(
                &alloc.label,
                offset as u64,
                bytes.len() as u64,
                alloc.bytes.len() as u64,
            ));
        }
        alloc.bytes[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Makes the next map request fail with `reason`.
    pub fn fail_next_map(&self, reason: impl Into<String>) {
        self.state.borrow_mut().fail_next_map = Some(reason.into());
    }

    fn allocate(
        &self,
        label: &str,
        usage: wgpu::BufferUsages,
        bytes: Vec<u8>,
        initialized: bool,
    ) -> Result<HostBuffer, BufferError> {
        let mut state = self.state.borrow_mut();
        let size = bytes.len() as u64;
        if size > state.max_buffer_size {
            return Err(BufferError::AllocationFailed {
                label: label.to_owned(),
                requested: size,
                limit: state.max_buffer_size,
            });
        }

        let buffer = HostBuffer(state.next_id);
        state.next_id += 1;
        state.allocations.insert(
            buffer,
            Allocation {
                label: label.to_owned(),
                usage,
                bytes,
            },
        );
        state.ops.push(DeviceOp::Create {
            buffer,
            size,
            initialized,
        });
        Ok(buffer)
    }

    /// Validates a map request and returns the mapped range as indices.
    fn check_map(
        &self,
        label: &str,
        buffer: HostBuffer,
        offset: u64,
        size: u64,
        required: wgpu::BufferUsages,
    ) -> Result<std::ops::Range<usize>, BufferError> {
        let mut state = self.state.borrow_mut();
        if let Some(reason) = state.fail_next_map.take() {
            return Err(BufferError::Map {
                label: label.to_owned(),
                reason,
            });
        }
        let alloc = state.allocation(buffer)?;
        alloc.require(required)?;
        validate(offset % wgpu::MAP_ALIGNMENT == 0, || {
            format!("map offset {offset} is not a multiple of {}", wgpu::MAP_ALIGNMENT)
        })?;
        validate(size % wgpu::COPY_BUFFER_ALIGNMENT == 0, || {
            format!("map size {size} is not a multiple of {}", wgpu::COPY_BUFFER_ALIGNMENT)
        })?;
        alloc.check_bounds(offset, size)?;
        Ok(offset as usize..(offset + size) as usize)
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HostState {
    fn allocation(&self, buffer: HostBuffer) -> Result<&Allocation, BufferError> {
        self.allocations
            .get(&buffer)
            .ok_or_else(|| BufferError::Device(format!("{buffer:?} has been destroyed")))
    }

    fn allocation_mut(&mut self, buffer: HostBuffer) -> Result<&mut Allocation, BufferError> {
        self.allocations
            .get_mut(&buffer)
            .ok_or_else(|| BufferError::Device(format!("{buffer:?} has been destroyed")))
    }
}

impl Allocation {
    fn require(&self, usage: wgpu::BufferUsages) -> Result<(), BufferError> {
        if self.usage.contains(usage) {
            Ok(())
        } else {
            Err(BufferError::MissingUsage {
                label: self.label.clone(),
                required: usage,
            })
        }
    }

    fn check_bounds(&self, offset: u64, size: u64) -> Result<(), BufferError> {
        let len = self.bytes.len() as u64;
        if offset + size > len {
            return Err(BufferError::out_of_range(&self.label, offset, size, len));
        }
        Ok(())
    }
}

fn validate(ok: bool, message: impl FnOnce() -> String) -> Result<(), BufferError> {
    if ok {
        Ok(())
    } else {
        Err(BufferError::Device(message()))
    }
}

fn check_copy_alignment(what: &str, value: u64) -> Result<(), BufferError> {
    validate(value % wgpu::COPY_BUFFER_ALIGNMENT == 0, || {
        format!("{what} {value} is not a multiple of {}", wgpu::COPY_BUFFER_ALIGNMENT)
    })
}

impl BufferDevice for HostDevice {
    type Buffer = HostBuffer;

    fn max_buffer_size(&self) -> u64 {
        self.state.borrow().max_buffer_size
    }

    fn create_buffer(
        &self,
        label: &str,
        usage: wgpu::BufferUsages,
        size: u64,
    ) -> Result<HostBuffer, BufferError> {
        let max = self.max_buffer_size();
        if size > max {
            return Err(BufferError::AllocationFailed {
                label: label.to_owned(),
                requested: size,
                limit: max,
            });
        }
        self.allocate(label, usage, vec![0; size as usize], false)
    }

    fn create_buffer_init(
        &self,
        label: &str,
        usage: wgpu::BufferUsages,
        contents: &[u8],
    ) -> Result<HostBuffer, BufferError> {
        check_copy_alignment("initial contents length", contents.len() as u64)?;
        self.allocate(label, usage, contents.to_vec(), true)
    }

    async fn map_write(
        &self,
        label: &str,
        buffer: &HostBuffer,
        offset: u64,
        size: u64,
        src: &[u8],
        at: usize,
    ) -> Result<(), BufferError> {
        let mapped = self.check_map(label, *buffer, offset, size, wgpu::BufferUsages::MAP_WRITE)?;
        validate(at + src.len() <= mapped.len(), || {
            format!("write of {} bytes at {at} overruns a {size}-byte mapping", src.len())
        })?;

        let mut state = self.state.borrow_mut();
        let start = mapped.start + at;
        state.allocation_mut(*buffer)?.bytes[start..start + src.len()].copy_from_slice(src);
        state.ops.push(DeviceOp::MapWrite {
            buffer: *buffer,
            offset,
            size,
        });
        Ok(())
    }

    async fn map_read(
        &self,
        label: &str,
        buffer: &HostBuffer,
        offset: u64,
        size: u64,
        dst: &mut [u8],
        at: usize,
    ) -> Result<(), BufferError> {
        let mapped = self.check_map(label, *buffer, offset, size, wgpu::BufferUsages::MAP_READ)?;
        validate(at + dst.len() <= mapped.len(), || {
            format!("read of {} bytes at {at} overruns a {size}-byte mapping", dst.len())
        })?;

        let mut state = self.state.borrow_mut();
        let start = mapped.start + at;
        dst.copy_from_slice(&state.allocation(*buffer)?.bytes[start..start + dst.len()]);
        state.ops.push(DeviceOp::MapRead {
            buffer: *buffer,
            offset,
            size,
        });
        Ok(())
    }

    fn queue_write(&self, buffer: &HostBuffer, offset: u64, bytes: &[u8]) -> Result<(), BufferError> {
        let mut state = self.state.borrow_mut();
        let size = bytes.len() as u64;
        {
            let alloc = state.allocation_mut(*buffer)?;
            alloc.require(wgpu::BufferUsages::COPY_DST)?;
            check_copy_alignment("queue write offset", offset)?;
            check_copy_alignment("queue write size", size)?;
            alloc.check_bounds(offset, size)?;
            let start = offset as usize;
            alloc.bytes[start..start + bytes.len()].copy_from_slice(bytes);
        }
        state.ops.push(DeviceOp::QueueWrite {
            buffer: *buffer,
            offset,
            size,
        });
        Ok(())
    }

    fn submit_copy(
        &self,
        src: &HostBuffer,
        src_offset: u64,
        dst: &HostBuffer,
        dst_offset: u64,
        size: u64,
    ) -> Result<(), BufferError> {
        validate(src != dst, || format!("copy source and destination are both {src:?}"))?;
        check_copy_alignment("copy source offset", src_offset)?;
        check_copy_alignment("copy destination offset", dst_offset)?;
        check_copy_alignment("copy size", size)?;

        let mut state = self.state.borrow_mut();
        let chunk = {
            let from = state.allocation(*src)?;
            from.require(wgpu::BufferUsages::COPY_SRC)?;
            from.check_bounds(src_offset, size)?;
            from.bytes[src_offset as usize..(src_offset + size) as usize].to_vec()
        };
        {
            let to = state.allocation_mut(*dst)?;
            to.require(wgpu::BufferUsages::COPY_DST)?;
            to.check_bounds(dst_offset, size)?;
            to.bytes[dst_offset as usize..(dst_offset + size) as usize].copy_from_slice(&chunk);
        }
        state.ops.push(DeviceOp::Copy {
            src: *src,
            src_offset,
            dst: *dst,
            dst_offset,
            size,
        });
        Ok(())
    }

    fn destroy_buffer(&self, buffer: &HostBuffer) {
        let mut state = self.state.borrow_mut();
        if state.allocations.remove(buffer).is_some() {
            state.ops.push(DeviceOp::Destroy { buffer: *buffer });
        }
    }
}
