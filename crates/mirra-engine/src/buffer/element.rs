use std::fmt;
use std::marker::PhantomData;
use std::ops::Range;

use bytemuck::Pod;

/// Accessor for one field of a structured byte layout.
///
/// Layout calculators implement this to tell a [`MirroredBuffer`](super::MirroredBuffer)
/// where a value lives and how it is encoded. `encode`/`decode` receive the
/// whole host image and must only touch `range()`.
pub trait Element {
    type Value;

    fn byte_offset(&self) -> usize;

    fn byte_size(&self) -> usize;

    fn encode(&self, bytes: &mut [u8], value: Self::Value);

    fn decode(&self, bytes: &[u8]) -> Self::Value;

    /// Half-open byte range occupied by the field.
    fn range(&self) -> Range<usize> {
        self.byte_offset()..self.byte_offset() + self.byte_size()
    }
}

/// Plain-old-data field stored at a fixed byte offset in native byte order.
///
/// Offsets need not be aligned for `T`; values are copied in and out.
pub struct Field<T> {
    offset: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Pod> Field<T> {
    pub const fn at(offset: usize) -> Self {
        Self {
            offset,
            _marker: PhantomData,
        }
    }

    /// Field of type `U` placed directly after this one.
    pub const fn next<U: Pod>(&self) -> Field<U> {
        Field::at(self.offset + size_of::<T>())
    }
}

impl<T> Clone for Field<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Field<T> {}

impl<T> fmt::Debug for Field<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field")
            .field("type", &std::any::type_name::<T>())
            .field("offset", &self.offset)
            .finish()
    }
}

impl<T: Pod> Element for Field<T> {
    type Value = T;

    fn byte_offset(&self) -> usize {
        self.offset
    }

    fn byte_size(&self) -> usize {
        size_of::<T>()
    }

    fn encode(&self, bytes: &mut [u8], value: T) {
        bytes[self.range()].copy_from_slice(bytemuck::bytes_of(&value));
    }

    fn decode(&self, bytes: &[u8]) -> T {
        bytemuck::pod_read_unaligned(&bytes[self.range()])
    }
}
