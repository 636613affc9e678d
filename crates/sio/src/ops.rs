// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io::{IoSlice, IoSliceMut, SeekFrom};

use crate::pal::RawSource;
use crate::{Error, IoFlags, OptionId, OptionValue, Result};

/// The operation table of a stream kind.
///
/// Every stream dispatches its operations through an implementation of this trait. The built-in
/// kinds provide their own implementations; [`Stream::custom()`][1] accepts any caller-supplied
/// implementation, which makes it possible to present arbitrary endpoints as streams.
///
/// Every method has a default body that reports [`ErrorCode::Unsupported`][2], so an
/// implementation only provides the operations its endpoint supports.
///
/// Methods perform a single attempt: they transfer at most once and return the number of bytes
/// moved. Looping until a request is satisfied (`IoFlags::DOALL`) is done by the stream, not by
/// the table. A read returning `Ok(0)` for a non-empty buffer signals the end of the stream.
///
/// # Thread safety
///
/// Implementations must be `Send`, as streams may move between threads.
///
/// [1]: crate::Stream::custom
/// [2]: crate::ErrorCode::Unsupported
pub trait StreamOps: Send {
    /// Reads into `buf`.
    ///
    /// # Errors
    ///
    /// Any failure of the endpoint. Non-blocking endpoints report `WouldBlock`.
    fn read(&mut self, buf: &mut [u8], flags: IoFlags) -> Result<usize> {
        let _ = (buf, flags);
        Err(Error::unsupported())
    }

    /// Writes from `buf`.
    ///
    /// # Errors
    ///
    /// Any failure of the endpoint. Non-blocking endpoints report `WouldBlock`.
    fn write(&mut self, buf: &[u8], flags: IoFlags) -> Result<usize> {
        let _ = (buf, flags);
        Err(Error::unsupported())
    }

    /// Whether [`read_vectored()`][Self::read_vectored] and
    /// [`write_vectored()`][Self::write_vectored] are implemented natively.
    ///
    /// When this returns `false`, the stream synthesizes vectored transfers from single-buffer
    /// calls.
    fn has_vectored(&self) -> bool {
        false
    }

    /// Reads into several buffers in one operation.
    ///
    /// # Errors
    ///
    /// As for [`read()`][Self::read].
    fn read_vectored(&mut self, bufs: &mut [IoSliceMut<'_>], flags: IoFlags) -> Result<usize> {
        let _ = (bufs, flags);
        Err(Error::unsupported())
    }

    /// Writes from several buffers in one operation.
    ///
    /// # Errors
    ///
    /// As for [`write()`][Self::write].
    fn write_vectored(&mut self, bufs: &[IoSlice<'_>], flags: IoFlags) -> Result<usize> {
        let _ = (bufs, flags);
        Err(Error::unsupported())
    }

    /// Moves the position and returns the new one.
    ///
    /// # Errors
    ///
    /// Unsupported for endpoints without a position.
    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let _ = pos;
        Err(Error::unsupported())
    }

    /// Returns the current position.
    ///
    /// # Errors
    ///
    /// As for [`seek()`][Self::seek].
    fn tell(&mut self) -> Result<u64> {
        self.seek(SeekFrom::Current(0))
    }

    /// Sets the size of the endpoint.
    ///
    /// # Errors
    ///
    /// Unsupported for endpoints without a size.
    fn truncate(&mut self, len: u64) -> Result<()> {
        let _ = len;
        Err(Error::unsupported())
    }

    /// Returns the size of the endpoint.
    ///
    /// # Errors
    ///
    /// Unsupported for endpoints without a size.
    fn size(&mut self) -> Result<u64> {
        Err(Error::unsupported())
    }

    /// Pushes buffered data towards its destination.
    ///
    /// # Errors
    ///
    /// Unsupported for endpoints that cannot flush.
    fn flush(&mut self) -> Result<()> {
        Err(Error::unsupported())
    }

    /// Reads a kind-specific option.
    ///
    /// # Errors
    ///
    /// Unsupported for unknown options.
    fn get_option(&mut self, id: OptionId) -> Result<OptionValue> {
        let _ = id;
        Err(Error::unsupported())
    }

    /// Changes a kind-specific option.
    ///
    /// # Errors
    ///
    /// Unsupported for unknown options.
    fn set_option(&mut self, id: OptionId, value: &OptionValue) -> Result<()> {
        let _ = (id, value);
        Err(Error::unsupported())
    }

    /// Releases the endpoint. Called at most once; the table is dropped afterwards.
    ///
    /// # Errors
    ///
    /// Any failure reported while releasing the endpoint. The endpoint counts as released
    /// regardless.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    /// The native handle a readiness backend can watch, if any.
    ///
    /// Endpoints without one are treated as always ready.
    fn raw_source(&self) -> Option<RawSource> {
        None
    }

    /// Gives up ownership of the native handle so that [`close()`][Self::close] and drop leave
    /// it open.
    fn forget_handle(&mut self) {}
}

impl<T: StreamOps + ?Sized> StreamOps for Box<T> {
    fn read(&mut self, buf: &mut [u8], flags: IoFlags) -> Result<usize> {
        (**self).read(buf, flags)
    }

    fn write(&mut self, buf: &[u8], flags: IoFlags) -> Result<usize> {
        (**self).write(buf, flags)
    }

    fn has_vectored(&self) -> bool {
        (**self).has_vectored()
    }

    fn read_vectored(&mut self, bufs: &mut [IoSliceMut<'_>], flags: IoFlags) -> Result<usize> {
        (**self).read_vectored(bufs, flags)
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>], flags: IoFlags) -> Result<usize> {
        (**self).write_vectored(bufs, flags)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        (**self).seek(pos)
    }

    fn tell(&mut self) -> Result<u64> {
        (**self).tell()
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        (**self).truncate(len)
    }

    fn size(&mut self) -> Result<u64> {
        (**self).size()
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn get_option(&mut self, id: OptionId) -> Result<OptionValue> {
        (**self).get_option(id)
    }

    fn set_option(&mut self, id: OptionId, value: &OptionValue) -> Result<()> {
        (**self).set_option(id, value)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }

    fn raw_source(&self) -> Option<RawSource> {
        (**self).raw_source()
    }

    fn forget_handle(&mut self) {
        (**self).forget_handle();
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorCode;

    struct Nothing;

    impl StreamOps for Nothing {}

    #[test]
    fn defaults_are_unsupported() {
        let mut ops = Nothing;

        assert_eq!(ops.read(&mut [0; 4], IoFlags::empty()).unwrap_err().code(), ErrorCode::Unsupported);
        assert_eq!(ops.write(b"x", IoFlags::empty()).unwrap_err().code(), ErrorCode::Unsupported);
        assert_eq!(ops.seek(SeekFrom::Start(0)).unwrap_err().code(), ErrorCode::Unsupported);
        assert_eq!(ops.tell().unwrap_err().code(), ErrorCode::Unsupported);
        assert_eq!(ops.size().unwrap_err().code(), ErrorCode::Unsupported);
        assert_eq!(ops.get_option(OptionId::TCP_NODELAY).unwrap_err().code(), ErrorCode::Unsupported);
        assert!(!ops.has_vectored());
        assert!(ops.raw_source().is_none());
        ops.close().unwrap();
    }

    #[test]
    fn boxed_tables_forward() {
        let mut boxed: Box<dyn StreamOps> = Box::new(Nothing);

        assert_eq!(boxed.flush().unwrap_err().code(), ErrorCode::Unsupported);
    }
}
