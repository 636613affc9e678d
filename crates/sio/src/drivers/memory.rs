// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io::SeekFrom;
use std::ptr::NonNull;

use crate::drivers::{Native, region_len, resolve_seek};
use crate::stream::with_default_access;
use crate::{Error, ErrorCode, IoFlags, Result, Stream, StreamFlags, StreamKind, StreamOps};

enum Region {
    Owned(Box<[u8]>),
    Raw { start: NonNull<u8>, len: usize },
}

/// A fixed region of memory with a cursor. The region never grows.
pub(crate) struct MemoryDriver {
    region: Option<Region>,
    position: usize,
}

// SAFETY: Owned regions are plain heap memory. For raw regions, the caller of
// `Stream::from_raw_memory` guarantees exclusive access for the lifetime of the stream, which
// includes access from whichever thread the stream moves to.
unsafe impl Send for MemoryDriver {}

impl MemoryDriver {
    pub(crate) fn as_slice(&self) -> Option<&[u8]> {
        match self.region.as_ref()? {
            Region::Owned(bytes) => Some(bytes),
            // SAFETY: The region is valid for reads of `len` bytes while the stream lives.
            Region::Raw { start, len } => Some(unsafe { std::slice::from_raw_parts(start.as_ptr(), *len) }),
        }
    }

    pub(crate) fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        match self.region.as_mut()? {
            Region::Owned(bytes) => Some(bytes),
            // SAFETY: The region is valid for reads and writes of `len` bytes while the stream
            // lives, and nothing else accesses it.
            Region::Raw { start, len } => Some(unsafe { std::slice::from_raw_parts_mut(start.as_ptr(), *len) }),
        }
    }

    fn len(&self) -> Result<usize> {
        self.as_slice().map(<[u8]>::len).ok_or(Error::Code(ErrorCode::BadHandle))
    }
}

impl StreamOps for MemoryDriver {
    fn read(&mut self, buf: &mut [u8], _flags: IoFlags) -> Result<usize> {
        let position = self.position;
        let region = self.as_slice().ok_or(Error::Code(ErrorCode::BadHandle))?;
        let count = region_len(region.len(), position, buf.len());

        buf[..count].copy_from_slice(&region[position..position + count]);
        self.position += count;
        Ok(count)
    }

    fn write(&mut self, buf: &[u8], _flags: IoFlags) -> Result<usize> {
        let position = self.position;
        let region = self.as_mut_slice().ok_or(Error::Code(ErrorCode::BadHandle))?;
        let count = region_len(region.len(), position, buf.len());

        region[position..position + count].copy_from_slice(&buf[..count]);
        self.position += count;
        Ok(count)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let len = u64::try_from(self.len()?).unwrap_or(u64::MAX);
        let position = u64::try_from(self.position).unwrap_or(u64::MAX);

        let target = resolve_seek(pos, position, len)?;
        self.position = usize::try_from(target).map_err(|_too_large| Error::invalid_argument())?;
        Ok(target)
    }

    fn size(&mut self) -> Result<u64> {
        Ok(u64::try_from(self.len()?).unwrap_or(u64::MAX))
    }

    fn flush(&mut self) -> Result<()> {
        self.len().map(|_| ())
    }

    fn close(&mut self) -> Result<()> {
        self.region = None;
        Ok(())
    }
}

impl Stream {
    /// Creates a stream over a fixed region of memory that the stream owns.
    ///
    /// Writes past the end of the region transfer what fits, which is nothing once the cursor is
    /// at the end. The region cannot be resized; [`Stream::mapped()`] exposes it.
    ///
    /// # Example
    ///
    /// ```
    /// use sio::{Stream, StreamFlags};
    ///
    /// let mut stream = Stream::from_memory(vec![0; 4], StreamFlags::RDWR);
    /// assert_eq!(stream.write(b"abcdef")?.len(), 4);
    /// assert_eq!(stream.mapped()?, b"abcd");
    /// # Ok::<(), sio::Error>(())
    /// ```
    #[must_use]
    pub fn from_memory(memory: impl Into<Box<[u8]>>, flags: StreamFlags) -> Self {
        Self::memory_stream(Region::Owned(memory.into()), flags)
    }

    /// Creates a stream over caller-owned memory.
    ///
    /// # Safety
    ///
    /// `start` must be valid for reads and writes of `len` bytes for the whole life of the
    /// stream, and nothing else may access that memory while the stream is open.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::InvalidArgument`] if `start` is null.
    pub unsafe fn from_raw_memory(start: *mut u8, len: usize, flags: StreamFlags) -> Result<Self> {
        let start = NonNull::new(start).ok_or_else(Error::invalid_argument)?;
        Ok(Self::memory_stream(Region::Raw { start, len }, flags))
    }

    fn memory_stream(region: Region, flags: StreamFlags) -> Self {
        let driver = MemoryDriver {
            region: Some(region),
            position: 0,
        };
        Self::from_native(StreamKind::Memory, with_default_access(flags, StreamFlags::RDWR), Native::Memory(driver))
    }

    /// The memory behind the stream, for kinds that expose it: raw-memory streams, shared memory
    /// regions, and files opened with [`StreamFlags::MMAP`].
    ///
    /// # Errors
    ///
    /// [`ErrorCode::Unsupported`] for other kinds and for empty mapped files,
    /// [`ErrorCode::BadHandle`] if the stream is closed.
    pub fn mapped(&self) -> Result<&[u8]> {
        self.native()?.mapped().ok_or_else(Error::unsupported)
    }

    /// The memory behind the stream, writable.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::PermissionDenied`] if the stream was not opened for writing, otherwise as for
    /// [`mapped()`][Self::mapped]; read-only mappings report [`ErrorCode::Unsupported`].
    pub fn mapped_mut(&mut self) -> Result<&mut [u8]> {
        if !self.flags().writable() {
            return Err(ErrorCode::PermissionDenied.into());
        }

        self.native_mut()?.mapped_mut().ok_or_else(Error::unsupported)
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_stop_at_the_end() {
        let mut stream = Stream::from_memory(vec![0; 6], StreamFlags::RDWR);

        assert_eq!(stream.write(b"abcd").unwrap().len(), 4);
        assert_eq!(stream.write(b"efgh").unwrap().len(), 2);
        assert_eq!(stream.write(b"ij").unwrap().len(), 0);
        assert_eq!(stream.mapped().unwrap(), b"abcdef");
    }

    #[test]
    fn read_to_the_end() {
        let mut stream = Stream::from_memory(b"region".to_vec(), StreamFlags::READ);
        let mut buf = [0_u8; 16];

        let transfer = stream.read_all(&mut buf).unwrap();

        assert_eq!(&buf[..transfer.len()], b"region");
        assert!(transfer.is_end_of_stream());
        assert_eq!(stream.size().unwrap(), 6);
    }

    #[test]
    fn truncate_is_unsupported() {
        let mut stream = Stream::from_memory(vec![0; 6], StreamFlags::RDWR);

        assert_eq!(stream.truncate(2).unwrap_err().code(), ErrorCode::Unsupported);
        assert_eq!(stream.seek(SeekFrom::End(-1)).unwrap(), 5);
        assert_eq!(stream.seek(SeekFrom::Start(7)).unwrap_err().code(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn raw_memory_is_written_in_place() {
        let mut backing = [0_u8; 8];
        // SAFETY: `backing` outlives the stream and is not touched while the stream is open.
        let mut stream = unsafe { Stream::from_raw_memory(backing.as_mut_ptr(), backing.len(), StreamFlags::RDWR) }.unwrap();

        stream.write(b"in place").unwrap();
        stream.close().unwrap();
        drop(stream);

        assert_eq!(&backing, b"in place");
    }

    #[test]
    fn null_raw_memory_is_rejected() {
        // SAFETY: A null pointer is rejected before use.
        let error = unsafe { Stream::from_raw_memory(std::ptr::null_mut(), 4, StreamFlags::RDWR) }.unwrap_err();

        assert_eq!(error.code(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn mapped_access_rules() {
        let mut read_only = Stream::from_memory(vec![1, 2], StreamFlags::READ);
        assert_eq!(read_only.mapped_mut().unwrap_err().code(), ErrorCode::PermissionDenied);

        let (reader, _writer) = Stream::pipe(StreamFlags::empty()).unwrap();
        assert_eq!(reader.mapped().unwrap_err().code(), ErrorCode::Unsupported);

        let mut closed = Stream::from_memory(vec![1, 2], StreamFlags::RDWR);
        closed.close().unwrap();
        assert_eq!(closed.mapped().unwrap_err().code(), ErrorCode::BadHandle);
    }
}
