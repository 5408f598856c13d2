use std::fmt;

/// Failure of a buffer operation.
///
/// Every variant is surfaced to the immediate caller; nothing is retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// Source and destination offsets of a copy fall at different positions
    /// within their 4-byte words, so no single aligned copy can serve both.
    AlignmentMismatch {
        src_correction: u64,
        dst_correction: u64,
    },

    /// A copy named the same buffer as source and destination.
    SelfCopy { label: String },

    /// Creation or growth asked for more than the device allows.
    AllocationFailed {
        label: String,
        requested: u64,
        limit: u64,
    },

    /// The buffer was destroyed before this call.
    UseAfterDestroy { label: String },

    /// `[offset, offset + size)` does not fit in `limit` bytes.
    OutOfRange {
        label: String,
        offset: u64,
        size: u64,
        limit: u64,
    },

    /// The transfer path needs a usage flag the buffer was not created with.
    MissingUsage {
        label: String,
        required: wgpu::BufferUsages,
    },

    /// A map request was refused by the device.
    Map { label: String, reason: String },

    /// Device-level failure (polling, submission, validation).
    Device(String),
}

impl BufferError {
    pub(crate) fn out_of_range(label: &str, offset: u64, size: u64, limit: u64) -> Self {
        Self::OutOfRange {
            label: label.to_owned(),
            offset,
            size,
            limit,
        }
    }
}

impl fmt::Display for BufferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlignmentMismatch {
                src_correction,
                dst_correction,
            } => write!(
                f,
                "copy offsets disagree on 4-byte alignment (source +{src_correction}, destination +{dst_correction})"
            ),
            Self::SelfCopy { label } => {
                write!(f, "buffer '{label}': cannot copy within the same buffer")
            }
            Self::AllocationFailed {
                label,
                requested,
                limit,
            } => write!(
                f,
                "buffer '{label}': cannot allocate {requested} bytes (device limit {limit})"
            ),
            Self::UseAfterDestroy { label } => write!(f, "buffer '{label}' used after destroy"),
            Self::OutOfRange {
                label,
                offset,
                size,
                limit,
            } => write!(
                f,
                "buffer '{label}': range {offset}..{} exceeds {limit} bytes",
                offset.saturating_add(*size)
            ),
            Self::MissingUsage { label, required } => {
                write!(f, "buffer '{label}' lacks required usage {required:?}")
            }
            Self::Map { label, reason } => write!(f, "buffer '{label}': map failed: {reason}"),
            Self::Device(reason) => write!(f, "device error: {reason}"),
        }
    }
}

impl std::error::Error for BufferError {}
