// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use thiserror::Error;

/// Failures reported by [`ByteBuffer`][1] and [`BufferPool`][2] operations.
///
/// # Thread safety
///
/// This type is thread-safe.
///
/// [1]: crate::ByteBuffer
/// [2]: crate::BufferPool
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The buffer does not own its storage (or the mapping is read-only), so the storage
    /// cannot be grown, shrunk or written beyond its current capacity.
    #[error("buffer storage is read-only or not resizable")]
    ReadOnly,

    /// A position or length fell outside the bounds the buffer currently allows.
    #[error("position is out of range (limit {limit})")]
    OutOfRange {
        /// The highest position that would have been accepted.
        limit: usize,
    },

    /// The buffer uses the fixed growth strategy and the write does not fit.
    #[error("fixed-capacity buffer of {capacity} bytes cannot hold {required} bytes")]
    CapacityExceeded {
        /// The current capacity.
        capacity: usize,
        /// The capacity that would have been needed.
        required: usize,
    },

    /// The requested capacity exceeds [`MAX_CAPACITY`][1].
    ///
    /// [1]: crate::MAX_CAPACITY
    #[error("requested capacity exceeds the maximum buffer capacity")]
    CapacityOverflow,

    /// The allocator could not provide the requested storage.
    #[error("out of memory while allocating {0} bytes")]
    OutOfMemory(usize),

    /// Borrowed storage must be aligned to the platform pointer size.
    #[error("borrowed storage is not aligned to the platform pointer size")]
    Misaligned,

    /// Every buffer in the pool is in use, or the pool cannot shrink below the buffers in use.
    #[error("buffer pool is busy")]
    Busy,

    /// The handle was issued by a different pool.
    #[error("buffer does not belong to this pool")]
    NotFromPool,

    /// The pool slot referenced by the handle is not in use.
    #[error("buffer was already released")]
    AlreadyReleased,

    /// Mapping a file into memory failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A specialized `Result` for buffer and pool operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Io(error) => error,
            Error::ReadOnly => Self::new(std::io::ErrorKind::PermissionDenied, value),
            Error::OutOfRange { .. } | Error::NotFromPool | Error::AlreadyReleased | Error::Misaligned => {
                Self::new(std::io::ErrorKind::InvalidInput, value)
            }
            Error::OutOfMemory(_) => Self::new(std::io::ErrorKind::OutOfMemory, value),
            Error::CapacityExceeded { .. } | Error::CapacityOverflow => Self::new(std::io::ErrorKind::StorageFull, value),
            Error::Busy => Self::new(std::io::ErrorKind::ResourceBusy, value),
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::io::ErrorKind;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, std::error::Error);

    #[test]
    fn io_error_passes_through() {
        let original = std::io::Error::new(ErrorKind::NotFound, "gone");
        let error: std::io::Error = Error::from(original).into();

        assert_eq!(error.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn buffer_errors_map_to_io_kinds() {
        assert_eq!(std::io::Error::from(Error::ReadOnly).kind(), ErrorKind::PermissionDenied);
        assert_eq!(std::io::Error::from(Error::Busy).kind(), ErrorKind::ResourceBusy);
        assert_eq!(std::io::Error::from(Error::NotFromPool).kind(), ErrorKind::InvalidInput);
        assert_eq!(std::io::Error::from(Error::CapacityOverflow).kind(), ErrorKind::StorageFull);
    }

    #[test]
    fn out_of_range_mentions_limit() {
        let message = Error::OutOfRange { limit: 10 }.to_string();

        assert!(message.contains("10"));
    }
}
