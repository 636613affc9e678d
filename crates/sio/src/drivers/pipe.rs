// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io::{IoSlice, IoSliceMut};

use tracing::{Level, event};

use crate::drivers::Native;
use crate::pal::RawSource;
use crate::{Error, ErrorCode, IoFlags, Result, Stream, StreamFlags, StreamKind, StreamOps};

/// A stream over a descriptor that supports nothing but reading and writing: a pipe end, or any
/// adopted descriptor whose kind has no richer driver.
#[cfg(unix)]
pub(crate) struct PipeDriver {
    fd: Option<std::os::fd::OwnedFd>,
}

#[cfg(unix)]
impl PipeDriver {
    pub(crate) fn new(fd: std::os::fd::OwnedFd) -> Self {
        Self { fd: Some(fd) }
    }

    pub(crate) fn take_fd(&mut self) -> Option<std::os::fd::OwnedFd> {
        self.fd.take()
    }

    fn fd(&self) -> Result<std::os::fd::BorrowedFd<'_>> {
        use std::os::fd::AsFd;

        self.fd.as_ref().map(AsFd::as_fd).ok_or(Error::Code(ErrorCode::BadHandle))
    }
}

#[cfg(unix)]
impl StreamOps for PipeDriver {
    fn read(&mut self, buf: &mut [u8], _flags: IoFlags) -> Result<usize> {
        Ok(crate::pal::unix::read(self.fd()?, buf)?)
    }

    fn write(&mut self, buf: &[u8], _flags: IoFlags) -> Result<usize> {
        Ok(crate::pal::unix::write_no_sigpipe(self.fd()?, buf)?)
    }

    fn has_vectored(&self) -> bool {
        true
    }

    fn read_vectored(&mut self, bufs: &mut [IoSliceMut<'_>], _flags: IoFlags) -> Result<usize> {
        Ok(crate::pal::unix::readv(self.fd()?, bufs)?)
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>], _flags: IoFlags) -> Result<usize> {
        Ok(crate::pal::unix::writev_no_sigpipe(self.fd()?, bufs)?)
    }

    fn close(&mut self) -> Result<()> {
        use std::os::fd::IntoRawFd;

        if let Some(fd) = self.fd.take() {
            // SAFETY: The descriptor was just released from its owner and is closed exactly once.
            crate::pal::unix::check(unsafe { libc::close(fd.into_raw_fd()) })?;
        }
        Ok(())
    }

    fn raw_source(&self) -> Option<RawSource> {
        use std::os::fd::AsRawFd;

        self.fd.as_ref().map(|fd| RawSource::Fd(fd.as_raw_fd()))
    }

    fn forget_handle(&mut self) {
        use std::os::fd::IntoRawFd;

        if let Some(fd) = self.fd.take() {
            let _fd = fd.into_raw_fd();
        }
    }
}

/// A stream over an anonymous pipe handle or any adopted handle whose kind has no richer driver.
#[cfg(windows)]
pub(crate) struct PipeDriver {
    file: Option<std::fs::File>,
}

#[cfg(windows)]
impl PipeDriver {
    pub(crate) fn new(handle: std::os::windows::io::OwnedHandle) -> Self {
        Self {
            file: Some(std::fs::File::from(handle)),
        }
    }

    pub(crate) fn take_handle(&mut self) -> Option<std::os::windows::io::OwnedHandle> {
        self.file.take().map(Into::into)
    }

    fn file(&mut self) -> Result<&mut std::fs::File> {
        self.file.as_mut().ok_or(Error::Code(ErrorCode::BadHandle))
    }
}

#[cfg(windows)]
impl StreamOps for PipeDriver {
    fn read(&mut self, buf: &mut [u8], _flags: IoFlags) -> Result<usize> {
        use std::io::Read;

        use windows_sys::Win32::Foundation::ERROR_BROKEN_PIPE;

        match self.file()?.read(buf) {
            // The writer went away, which is the end of the stream.
            Err(error) if error.raw_os_error() == Some(ERROR_BROKEN_PIPE.cast_signed()) => Ok(0),
            other => Ok(other?),
        }
    }

    fn write(&mut self, buf: &[u8], _flags: IoFlags) -> Result<usize> {
        use std::io::Write;

        Ok(self.file()?.write(buf)?)
    }

    fn close(&mut self) -> Result<()> {
        drop(self.file.take());
        Ok(())
    }

    fn raw_source(&self) -> Option<RawSource> {
        use std::os::windows::io::AsRawHandle;

        self.file.as_ref().map(|file| RawSource::Handle(file.as_raw_handle() as isize))
    }

    fn forget_handle(&mut self) {
        use std::os::windows::io::IntoRawHandle;

        if let Some(file) = self.file.take() {
            let _handle = file.into_raw_handle();
        }
    }
}

impl Stream {
    /// Creates an anonymous pipe and returns its reading and writing ends.
    ///
    /// Access bits in `flags` are ignored; the first stream reads and the second writes. Reading
    /// after every writer has closed reaches the end of the stream. Writing after every reader
    /// has closed fails with [`ErrorCode::BrokenPipe`] and never raises `SIGPIPE`.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::LimitReached`] if the process is out of descriptors. On Windows,
    /// [`ErrorCode::Unsupported`] for [`StreamFlags::NONBLOCK`].
    ///
    /// # Example
    ///
    /// ```
    /// use sio::{Stream, StreamFlags};
    ///
    /// let (mut reader, mut writer) = Stream::pipe(StreamFlags::empty())?;
    /// writer.write(b"through")?;
    /// writer.close()?;
    ///
    /// let mut buf = [0_u8; 16];
    /// let transfer = reader.read_all(&mut buf)?;
    /// assert_eq!(&buf[..transfer.len()], b"through");
    /// assert!(transfer.is_end_of_stream());
    /// # Ok::<(), sio::Error>(())
    /// ```
    pub fn pipe(flags: StreamFlags) -> Result<(Self, Self)> {
        let (reader, writer) = create_pipe(flags.nonblocking())?;
        let flags = flags - StreamFlags::RDWR - StreamFlags::SERVER;

        let reader = Self::from_native(StreamKind::Pipe, flags | StreamFlags::READ, Native::Pipe(reader));
        let writer = Self::from_native(StreamKind::Pipe, flags | StreamFlags::WRITE, Native::Pipe(writer));
        event!(Level::TRACE, message = "created pipe", reader = %reader.id(), writer = %writer.id());

        Ok((reader, writer))
    }
}

#[cfg(unix)]
fn create_pipe(nonblocking: bool) -> Result<(PipeDriver, PipeDriver)> {
    let (reader, writer) = crate::pal::unix::pipe(nonblocking)?;
    Ok((PipeDriver::new(reader), PipeDriver::new(writer)))
}

#[cfg(windows)]
fn create_pipe(nonblocking: bool) -> Result<(PipeDriver, PipeDriver)> {
    use std::os::windows::io::{FromRawHandle, OwnedHandle};

    use windows_sys::Win32::System::Pipes::CreatePipe;

    if nonblocking {
        return Err(Error::unsupported());
    }

    let mut reader = std::ptr::null_mut();
    let mut writer = std::ptr::null_mut();

    // SAFETY: Both out-pointers are valid for writes; default security and buffer size.
    crate::pal::windows::check_bool(unsafe { CreatePipe(&raw mut reader, &raw mut writer, std::ptr::null(), 0) })?;

    // SAFETY: `CreatePipe` returned a fresh handle that nothing else owns.
    let reader = unsafe { OwnedHandle::from_raw_handle(reader) };
    // SAFETY: As above.
    let writer = unsafe { OwnedHandle::from_raw_handle(writer) };
    Ok((PipeDriver::new(reader), PipeDriver::new(writer)))
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::OptionId;

    #[test]
    fn ends_have_one_direction() {
        let (mut reader, mut writer) = Stream::pipe(StreamFlags::RDWR).unwrap();

        assert_eq!(reader.kind(), StreamKind::Pipe);
        assert!(reader.flags().readable() && !reader.flags().writable());
        assert_eq!(reader.write(b"x").unwrap_err().code(), ErrorCode::PermissionDenied);
        assert_eq!(writer.read(&mut [0; 1]).unwrap_err().code(), ErrorCode::PermissionDenied);
    }

    #[test]
    fn end_of_stream_after_writer_closes() {
        let (mut reader, mut writer) = Stream::pipe(StreamFlags::empty()).unwrap();

        writer.write(b"abc").unwrap();
        drop(writer);

        let mut buf = [0_u8; 8];
        assert_eq!(reader.read(&mut buf).unwrap().len(), 3);
        let transfer = reader.read(&mut buf).unwrap();
        assert!(transfer.is_end_of_stream());
        assert!(reader.is_eof());
    }

    #[test]
    fn broken_pipe_without_reader() {
        let (reader, mut writer) = Stream::pipe(StreamFlags::empty()).unwrap();
        drop(reader);

        let error = writer.write(b"lost").unwrap_err();

        assert_eq!(error.code(), ErrorCode::BrokenPipe);
        assert_eq!(writer.last_error(), Some(ErrorCode::BrokenPipe));
    }

    #[test]
    fn seek_is_unsupported() {
        let (mut reader, _writer) = Stream::pipe(StreamFlags::empty()).unwrap();

        assert_eq!(reader.tell().unwrap_err().code(), ErrorCode::Unsupported);
        assert_eq!(reader.get_option(OptionId::SEEKABLE).unwrap(), crate::OptionValue::Bool(false));
    }

    #[cfg(unix)]
    #[test]
    fn nonblocking_read_would_block() {
        let (mut reader, _writer) = Stream::pipe(StreamFlags::NONBLOCK).unwrap();

        assert_eq!(reader.read(&mut [0; 4]).unwrap_err().code(), ErrorCode::WouldBlock);
        assert_eq!(reader.get_option(OptionId::BLOCKING).unwrap(), crate::OptionValue::Bool(false));
    }

    #[cfg(unix)]
    #[test]
    fn doall_waits_for_readiness_until_timeout() {
        let (mut reader, mut writer) = Stream::pipe(StreamFlags::NONBLOCK).unwrap();
        reader.set_timeout(Some(std::time::Duration::from_millis(20)));
        writer.write(b"ab").unwrap();

        let mut buf = [0_u8; 4];
        let transfer = reader.read_all(&mut buf).unwrap();
        assert_eq!(transfer.len(), 2);
        assert!(!transfer.is_end_of_stream());

        let error = reader.read_all(&mut buf).unwrap_err();
        assert_eq!(error.code(), ErrorCode::Timeout);
    }

    #[cfg(unix)]
    #[test]
    fn native_vectored_transfers() {
        let (mut reader, mut writer) = Stream::pipe(StreamFlags::empty()).unwrap();

        let transfer = writer
            .write_vectored(&[IoSlice::new(b"head"), IoSlice::new(b"tail")], IoFlags::empty())
            .unwrap();
        assert_eq!(transfer.len(), 8);

        let mut head = [0_u8; 4];
        let mut tail = [0_u8; 4];
        reader
            .read_vectored(&mut [IoSliceMut::new(&mut head), IoSliceMut::new(&mut tail)], IoFlags::empty())
            .unwrap();
        assert_eq!(&head, b"head");
        assert_eq!(&tail, b"tail");
    }
}
