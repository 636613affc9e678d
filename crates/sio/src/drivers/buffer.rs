// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io::SeekFrom;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buf::ByteBuffer;
use crate::drivers::Native;
use crate::stream::with_default_access;
use crate::{Error, ErrorCode, IoFlags, Result, Stream, StreamFlags, StreamKind, StreamOps};

enum Store {
    Owned(ByteBuffer),
    Shared(Arc<Mutex<ByteBuffer>>),
}

/// A stream over a [`ByteBuffer`], either owned by the stream or shared with other holders.
pub(crate) struct BufferDriver {
    store: Option<Store>,
}

impl BufferDriver {
    fn with<R>(&mut self, action: impl FnOnce(&mut ByteBuffer) -> R) -> Result<R> {
        match self.store.as_mut() {
            Some(Store::Owned(buffer)) => Ok(action(buffer)),
            Some(Store::Shared(buffer)) => Ok(action(&mut buffer.lock())),
            None => Err(Error::Code(ErrorCode::BadHandle)),
        }
    }
}

impl StreamOps for BufferDriver {
    fn read(&mut self, buf: &mut [u8], _flags: IoFlags) -> Result<usize> {
        self.with(|buffer| buffer.read(buf).len())
    }

    fn write(&mut self, buf: &[u8], _flags: IoFlags) -> Result<usize> {
        Ok(self.with(|buffer| buffer.write(buf))??)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let position = self.with(|buffer| buffer.seek(pos))??;
        Ok(u64::try_from(position).unwrap_or(u64::MAX))
    }

    fn tell(&mut self) -> Result<u64> {
        let position = self.with(|buffer| buffer.tell())?;
        Ok(u64::try_from(position).unwrap_or(u64::MAX))
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        let len = usize::try_from(len).map_err(|_too_large| Error::Code(ErrorCode::TooLarge))?;
        Ok(self.with(|buffer| buffer.set_len(len))??)
    }

    fn size(&mut self) -> Result<u64> {
        let len = self.with(|buffer| buffer.len())?;
        Ok(u64::try_from(len).unwrap_or(u64::MAX))
    }

    fn flush(&mut self) -> Result<()> {
        Ok(self.with(|buffer| buffer.flush())??)
    }

    fn close(&mut self) -> Result<()> {
        drop(self.store.take());
        Ok(())
    }
}

impl Stream {
    /// Creates a stream that owns `buffer`.
    ///
    /// Reads and writes move the buffer's cursor; the stream reaches its end when the cursor
    /// reaches the end of the data. Writes grow the buffer according to its growth strategy.
    /// [`into_buffer()`][Self::into_buffer] gives the buffer back.
    ///
    /// # Example
    ///
    /// ```
    /// use sio::buf::ByteBuffer;
    /// use sio::{Stream, StreamFlags};
    ///
    /// let mut stream = Stream::from_buffer(ByteBuffer::new(16)?, StreamFlags::RDWR);
    /// stream.write(b"in memory")?;
    ///
    /// let buffer = stream.into_buffer()?;
    /// assert_eq!(buffer.as_slice(), b"in memory");
    /// # Ok::<(), sio::Error>(())
    /// ```
    #[must_use]
    pub fn from_buffer(buffer: ByteBuffer, flags: StreamFlags) -> Self {
        Self::buffer_stream(Store::Owned(buffer), flags)
    }

    /// Creates a stream over a buffer that other holders can reach through `buffer`.
    ///
    /// The lock is held only for the duration of each operation.
    #[must_use]
    pub fn from_shared_buffer(buffer: Arc<Mutex<ByteBuffer>>, flags: StreamFlags) -> Self {
        Self::buffer_stream(Store::Shared(buffer), flags)
    }

    fn buffer_stream(store: Store, flags: StreamFlags) -> Self {
        let driver = BufferDriver { store: Some(store) };
        Self::from_native(StreamKind::Buffer, with_default_access(flags, StreamFlags::RDWR), Native::Buffer(driver))
    }

    /// Closes the stream and returns the buffer it owned.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::InvalidArgument`] for streams that do not own a buffer, including streams
    /// over a shared buffer. [`ErrorCode::Busy`] if the stream is registered with a context.
    pub fn into_buffer(mut self) -> Result<ByteBuffer> {
        if !matches!(self.native()?, Native::Buffer(BufferDriver { store: Some(Store::Owned(_)) })) {
            return Err(Error::invalid_argument());
        }

        match self.take_native()? {
            Native::Buffer(BufferDriver {
                store: Some(Store::Owned(buffer)),
            }) => Ok(buffer),
            _ => Err(Error::invalid_argument()),
        }
    }
}
