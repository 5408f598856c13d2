/// Rounds `value` up to the next multiple of `alignment` (a power of two).
#[inline]
pub const fn round_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Rounds `value` down to a multiple of `alignment` (a power of two).
#[inline]
pub const fn align_down(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    value & !(alignment - 1)
}

/// Device-side span covering a requested byte range after alignment correction.
///
/// `offset` is the requested offset rounded down to the path's alignment;
/// `correction` is how far the requested offset sits past it. `size` is widened
/// to a multiple of `COPY_BUFFER_ALIGNMENT` so that the span always covers
/// `[offset + correction, offset + correction + requested size)`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AlignedSpan {
    pub offset: u64,
    pub correction: u64,
    pub size: u64,
}

impl AlignedSpan {
    pub const fn new(offset: u64, size: u64, alignment: u64) -> Self {
        let aligned = align_down(offset, alignment);
        let correction = offset - aligned;
        Self {
            offset: aligned,
            correction,
            size: round_up(size + correction, wgpu::COPY_BUFFER_ALIGNMENT),
        }
    }

    /// Exclusive end of the span.
    #[inline]
    pub const fn end(&self) -> u64 {
        self.offset + self.size
    }
}
