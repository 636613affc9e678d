// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::io::{IoSlice, IoSliceMut, SeekFrom};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tracing::{Level, event};

use crate::buf::Transfer;
use crate::drivers::Native;
use crate::pal::{self, Direction, RawSource};
use crate::{Error, ErrorCode, IoFlags, OptionId, OptionValue, Result, StreamFlags, StreamKind, StreamOps};

/// Default transfer size hint of a new stream.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a stream for its whole lifetime. Identifiers are never reused within a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

impl StreamId {
    fn next() -> Self {
        Self(NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The numeric value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A readable and/or writable endpoint of any kind: a file, a socket, a pipe, a timer, a signal
/// set, a message queue, a shared memory region, a byte buffer, a region of memory, a terminal or
/// a caller-defined endpoint.
///
/// Streams are created by the kind-specific constructors (such as [`Stream::open_file()`],
/// [`Stream::tcp_connect()`] or [`Stream::pipe()`]) and released by [`Stream::close()`] or drop.
/// All operations go through the same surface regardless of kind; operations a kind does not
/// support fail with [`ErrorCode::Unsupported`].
///
/// # Transfers
///
/// [`read()`][Self::read] and [`write()`][Self::write] attempt a single transfer and report it as
/// a [`Transfer`]. With [`IoFlags::DOALL`], the stream keeps transferring until the request is
/// satisfied, a read reaches the end of the stream or an error occurs. On a non-blocking stream,
/// a would-block during such a loop waits for readiness (bounded by the stream timeout) before
/// continuing; [`IoFlags::DOALL_NONBLOCK`] instead returns what was transferred so far. An error
/// is only reported if nothing was transferred.
///
/// # Ownership
///
/// A stream exclusively owns its native handle. Closing a stream that is still registered with a
/// [`Context`][1] or has operations pending there fails with [`ErrorCode::Busy`].
///
/// # Thread safety
///
/// This type is `Send` but not `Sync`.
///
/// [1]: crate::Context
pub struct Stream {
    id: StreamId,
    kind: StreamKind,
    flags: StreamFlags,
    native: Option<Native>,
    timeout: Option<Duration>,
    buffer_size: usize,
    autoclose: bool,
    eof: bool,
    last_error: Option<ErrorCode>,
    in_use: Arc<AtomicUsize>,
}

impl Stream {
    pub(crate) fn from_native(kind: StreamKind, flags: StreamFlags, native: Native) -> Self {
        let stream = Self {
            id: StreamId::next(),
            kind,
            flags,
            native: Some(native),
            timeout: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            autoclose: true,
            eof: false,
            last_error: None,
            in_use: Arc::new(AtomicUsize::new(0)),
        };

        event!(Level::DEBUG, message = "opened stream", id = %stream.id, kind = %kind, flags = ?flags);
        stream
    }

    /// The identity of this stream.
    #[must_use]
    pub const fn id(&self) -> StreamId {
        self.id
    }

    /// The kind of endpoint.
    #[must_use]
    pub const fn kind(&self) -> StreamKind {
        self.kind
    }

    /// The flags the stream was opened with, as updated by [`OptionId::BLOCKING`].
    #[must_use]
    pub const fn flags(&self) -> StreamFlags {
        self.flags
    }

    /// Whether [`close()`][Self::close] has run.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.native.is_none()
    }

    /// Whether the last read reached the end of the stream.
    #[must_use]
    pub const fn is_eof(&self) -> bool {
        self.eof
    }

    /// The code of the most recent failed operation.
    #[must_use]
    pub const fn last_error(&self) -> Option<ErrorCode> {
        self.last_error
    }

    /// The timeout applied while waiting for readiness during looping transfers.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Sets the timeout applied while waiting for readiness during looping transfers.
    pub const fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// The native handle a readiness backend can watch, if the stream has one.
    #[must_use]
    pub fn raw_source(&self) -> Option<RawSource> {
        self.native.as_ref()?.raw_source()
    }

    /// Reads once into `buf`.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::BadHandle`] if the stream is closed, [`ErrorCode::PermissionDenied`] if it
    /// was not opened for reading, otherwise any failure of the endpoint.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<Transfer> {
        self.read_with(buf, IoFlags::empty())
    }

    /// Reads into `buf` with per-call flags.
    ///
    /// # Errors
    ///
    /// As for [`read()`][Self::read]. With [`IoFlags::DOALL`], errors are only reported if no
    /// bytes were read.
    pub fn read_with(&mut self, buf: &mut [u8], flags: IoFlags) -> Result<Transfer> {
        let result = self.read_inner(buf, flags);
        self.record(result)
    }

    /// Reads everything into `buf`; shorthand for [`IoFlags::DOALL`].
    ///
    /// # Errors
    ///
    /// As for [`read_with()`][Self::read_with].
    pub fn read_all(&mut self, buf: &mut [u8]) -> Result<Transfer> {
        self.read_with(buf, IoFlags::DOALL)
    }

    /// Writes once from `buf`.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::BadHandle`] if the stream is closed, [`ErrorCode::PermissionDenied`] if it
    /// was not opened for writing, otherwise any failure of the endpoint.
    pub fn write(&mut self, buf: &[u8]) -> Result<Transfer> {
        self.write_with(buf, IoFlags::empty())
    }

    /// Writes from `buf` with per-call flags.
    ///
    /// # Errors
    ///
    /// As for [`write()`][Self::write]. With [`IoFlags::DOALL`], errors are only reported if no
    /// bytes were written.
    pub fn write_with(&mut self, buf: &[u8], flags: IoFlags) -> Result<Transfer> {
        let result = self.write_inner(buf, flags);
        self.record(result)
    }

    /// Writes everything from `buf`; shorthand for [`IoFlags::DOALL`].
    ///
    /// # Errors
    ///
    /// As for [`write_with()`][Self::write_with].
    pub fn write_all(&mut self, buf: &[u8]) -> Result<Transfer> {
        self.write_with(buf, IoFlags::DOALL)
    }

    /// Reads into several buffers, natively where the kind supports it and segment by segment
    /// otherwise. The segment-by-segment form stops at the first short transfer.
    ///
    /// # Errors
    ///
    /// As for [`read_with()`][Self::read_with].
    pub fn read_vectored(&mut self, bufs: &mut [IoSliceMut<'_>], flags: IoFlags) -> Result<Transfer> {
        let result = self.read_vectored_inner(bufs, flags);
        self.record(result)
    }

    /// Writes from several buffers, natively where the kind supports it and segment by segment
    /// otherwise. The segment-by-segment form stops at the first short transfer.
    ///
    /// # Errors
    ///
    /// As for [`write_with()`][Self::write_with].
    pub fn write_vectored(&mut self, bufs: &[IoSlice<'_>], flags: IoFlags) -> Result<Transfer> {
        let result = self.write_vectored_inner(bufs, flags);
        self.record(result)
    }

    /// Moves the position.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::Unsupported`] for kinds without a position.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let result = self.native_mut().and_then(|native| native.seek(pos));
        if result.is_ok() {
            self.eof = false;
        }
        self.record(result)
    }

    /// The current position.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::Unsupported`] for kinds without a position.
    pub fn tell(&mut self) -> Result<u64> {
        let result = self.native_mut().and_then(StreamOps::tell);
        self.record(result)
    }

    /// Sets the size of the endpoint, clamping the position if it shrinks below it.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::Unsupported`] for kinds without a size.
    pub fn truncate(&mut self, len: u64) -> Result<()> {
        let result = self.native_mut().and_then(|native| native.truncate(len));
        self.record(result)
    }

    /// The size of the endpoint.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::Unsupported`] for kinds without a size.
    pub fn size(&mut self) -> Result<u64> {
        let result = self.native_mut().and_then(StreamOps::size);
        self.record(result)
    }

    /// Pushes buffered data towards its destination.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::Unsupported`] for kinds that cannot flush.
    pub fn flush(&mut self) -> Result<()> {
        let result = self.native_mut().and_then(StreamOps::flush);
        self.record(result)
    }

    /// Reads an option.
    ///
    /// Generic and information options are answered for every kind; kind-specific options are
    /// forwarded to the kind.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::Unsupported`] for options the kind does not know.
    pub fn get_option(&mut self, id: OptionId) -> Result<OptionValue> {
        let result = self.get_option_inner(id);
        self.record(result)
    }

    /// Reads an option into `target` in its native byte representation (see
    /// [`OptionValue::encode()`]) and returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// As for [`get_option()`][Self::get_option], plus [`ErrorCode::BufferTooSmall`] if `target`
    /// cannot hold the value.
    pub fn get_option_into(&mut self, id: OptionId, target: &mut [u8]) -> Result<usize> {
        self.get_option(id)?.encode(target)
    }

    /// Changes an option.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::Unsupported`] for unknown options and for information options, which are
    /// read-only. [`ErrorCode::InvalidArgument`] for values of the wrong shape.
    pub fn set_option(&mut self, id: OptionId, value: impl Into<OptionValue>) -> Result<()> {
        let result = self.set_option_inner(id, &value.into());
        self.record(result)
    }

    /// Releases the stream and its native handle.
    ///
    /// Closing an already closed stream succeeds and does nothing. If the stream was configured
    /// with autoclose disabled, the native handle stays open.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::Busy`] if the stream is registered with a context or has operations pending
    /// there; the stream stays open in that case. Otherwise any failure reported while releasing
    /// the handle, after which the stream counts as closed regardless.
    pub fn close(&mut self) -> Result<()> {
        if self.native.is_none() {
            return Ok(());
        }

        if self.in_use.load(Ordering::Acquire) > 0 {
            return Err(ErrorCode::Busy.into());
        }

        self.release()
    }

    pub(crate) fn native_mut(&mut self) -> Result<&mut Native> {
        self.native.as_mut().ok_or(Error::Code(ErrorCode::BadHandle))
    }

    pub(crate) fn native(&self) -> Result<&Native> {
        self.native.as_ref().ok_or(Error::Code(ErrorCode::BadHandle))
    }

    /// Takes the native state out of the stream, leaving it closed without running the close
    /// operation.
    pub(crate) fn take_native(&mut self) -> Result<Native> {
        if self.in_use.load(Ordering::Acquire) > 0 {
            return Err(ErrorCode::Busy.into());
        }

        self.native.take().ok_or(Error::Code(ErrorCode::BadHandle))
    }

    pub(crate) fn usage(&self) -> &Arc<AtomicUsize> {
        &self.in_use
    }

    fn release(&mut self) -> Result<()> {
        let Some(mut native) = self.native.take() else {
            return Ok(());
        };

        if !self.autoclose {
            native.forget_handle();
        }

        let result = native.close();
        drop(native);

        event!(Level::DEBUG, message = "closed stream", id = %self.id, kind = %self.kind);
        result
    }

    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(error) = &result {
            self.last_error = Some(error.code());
        }
        result
    }

    fn check_access(&self, required: StreamFlags) -> Result<()> {
        if self.flags.contains(required) {
            Ok(())
        } else {
            Err(ErrorCode::PermissionDenied.into())
        }
    }

    fn read_inner(&mut self, buf: &mut [u8], flags: IoFlags) -> Result<Transfer> {
        self.native()?;
        self.check_access(StreamFlags::READ)?;

        let requested = buf.len();
        let message_flags = flags.message_bits();

        if !flags.loops() {
            let count = self.native_mut()?.read(buf, message_flags)?;
            return Ok(self.finish_read(count, requested));
        }

        let mut total = 0;
        while total < requested {
            match self.native_mut()?.read(&mut buf[total..], message_flags) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(Transfer::end_of_stream(total, requested));
                }
                Ok(count) => {
                    self.eof = false;
                    total += count;
                    if self.kind.is_record_oriented() {
                        break;
                    }
                }
                Err(error) => match self.resume_after(&error, flags, Direction::Read) {
                    Ok(true) => {}
                    Ok(false) => return partial(total, requested, error),
                    Err(wait_error) => return partial(total, requested, wait_error),
                },
            }
        }

        Ok(Transfer::new(total, requested))
    }

    fn write_inner(&mut self, buf: &[u8], flags: IoFlags) -> Result<Transfer> {
        self.native()?;
        self.check_access(StreamFlags::WRITE)?;

        let requested = buf.len();
        let message_flags = flags.message_bits();

        if !flags.loops() {
            let count = self.native_mut()?.write(buf, message_flags)?;
            return Ok(Transfer::new(count, requested));
        }

        let mut total = 0;
        while total < requested {
            match self.native_mut()?.write(&buf[total..], message_flags) {
                // No progress is possible, so the short count is the answer.
                Ok(0) => break,
                Ok(count) => total += count,
                Err(error) => match self.resume_after(&error, flags, Direction::Write) {
                    Ok(true) => {}
                    Ok(false) => return partial(total, requested, error),
                    Err(wait_error) => return partial(total, requested, wait_error),
                },
            }
        }

        Ok(Transfer::new(total, requested))
    }

    /// Decides whether a looping transfer continues after `error`. Waits for readiness when the
    /// error is a would-block on a `DOALL` transfer.
    fn resume_after(&self, error: &Error, flags: IoFlags, direction: Direction) -> Result<bool> {
        if !error.is_would_block() || flags.contains(IoFlags::DOALL_NONBLOCK) {
            return Ok(false);
        }

        let Some(source) = self.raw_source() else {
            return Ok(false);
        };

        if pal::wait_ready(source, direction, self.timeout)? {
            Ok(true)
        } else {
            Err(ErrorCode::Timeout.into())
        }
    }

    fn finish_read(&mut self, count: usize, requested: usize) -> Transfer {
        if count == 0 && requested > 0 {
            self.eof = true;
            Transfer::end_of_stream(0, requested)
        } else {
            self.eof = false;
            Transfer::new(count, requested)
        }
    }

    fn read_vectored_inner(&mut self, bufs: &mut [IoSliceMut<'_>], flags: IoFlags) -> Result<Transfer> {
        self.native()?;
        self.check_access(StreamFlags::READ)?;

        let requested = bufs.iter().map(|buf| buf.len()).sum();
        if !flags.loops() && self.native()?.has_vectored() {
            let count = self.native_mut()?.read_vectored(bufs, flags.message_bits())?;
            return Ok(self.finish_read(count, requested));
        }

        let mut total = Transfer::new(0, 0);
        for buf in bufs.iter_mut() {
            match self.read_inner(buf, flags) {
                Ok(transfer) => {
                    total = total.chain(transfer);
                    if transfer.is_short() {
                        break;
                    }
                }
                Err(error) if total.is_empty() => return Err(error),
                Err(_) => break,
            }
        }

        Ok(widen(total, requested))
    }

    fn write_vectored_inner(&mut self, bufs: &[IoSlice<'_>], flags: IoFlags) -> Result<Transfer> {
        self.native()?;
        self.check_access(StreamFlags::WRITE)?;

        let requested = bufs.iter().map(|buf| buf.len()).sum();
        if !flags.loops() && self.native()?.has_vectored() {
            let count = self.native_mut()?.write_vectored(bufs, flags.message_bits())?;
            return Ok(Transfer::new(count, requested));
        }

        let mut total = Transfer::new(0, 0);
        for buf in bufs {
            match self.write_inner(buf, flags) {
                Ok(transfer) => {
                    total = total.chain(transfer);
                    if transfer.is_short() {
                        break;
                    }
                }
                Err(error) if total.is_empty() => return Err(error),
                Err(_) => break,
            }
        }

        Ok(widen(total, requested))
    }

    fn get_option_inner(&mut self, id: OptionId) -> Result<OptionValue> {
        self.native()?;

        let value = match id {
            OptionId::TIMEOUT => OptionValue::Duration(self.timeout),
            OptionId::BUFFER_SIZE | OptionId::BUFFER_SIZE_INFO => self.buffer_size.into(),
            OptionId::AUTOCLOSE => OptionValue::Bool(self.autoclose),
            OptionId::BLOCKING => OptionValue::Bool(!self.flags.nonblocking()),
            OptionId::CLOEXEC => OptionValue::Bool(self.cloexec()?),
            OptionId::TYPE => OptionValue::Int(self.kind.as_raw().into()),
            OptionId::FLAGS => OptionValue::Int(self.flags.bits().into()),
            OptionId::POSITION => OptionValue::Int(to_i64(self.native_mut()?.tell()?)),
            OptionId::SIZE => OptionValue::Int(to_i64(self.native_mut()?.size()?)),
            OptionId::READABLE => OptionValue::Bool(self.flags.readable()),
            OptionId::WRITABLE => OptionValue::Bool(self.flags.writable()),
            OptionId::SEEKABLE => OptionValue::Bool(self.kind.is_seekable()),
            OptionId::EOF => OptionValue::Bool(self.eof),
            OptionId::LAST_ERROR => OptionValue::Int(self.last_error.map_or(0, |code| code.as_raw().into())),
            OptionId::NATIVE_HANDLE => OptionValue::Int(self.raw_source().map_or(-1, RawSource::as_raw_value)),
            id if id.is_info() => return Err(Error::unsupported()),
            id => return self.native_mut()?.get_option(id),
        };

        Ok(value)
    }

    fn set_option_inner(&mut self, id: OptionId, value: &OptionValue) -> Result<()> {
        self.native()?;

        match id {
            OptionId::TIMEOUT => self.timeout = value.as_duration()?,
            OptionId::BUFFER_SIZE => self.buffer_size = value.as_usize()?,
            OptionId::AUTOCLOSE => self.autoclose = value.as_bool()?,
            OptionId::BLOCKING => self.set_blocking(value.as_bool()?)?,
            OptionId::CLOEXEC => self.set_cloexec(value.as_bool()?)?,
            id if id.is_info() => return Err(Error::unsupported()),
            id => self.native_mut()?.set_option(id, value)?,
        }

        Ok(())
    }

    fn set_blocking(&mut self, blocking: bool) -> Result<()> {
        match self.native_mut()?.set_option(OptionId::BLOCKING, &OptionValue::Bool(blocking)) {
            Ok(()) => {}
            Err(error) if error.code() == ErrorCode::Unsupported => {
                let source = self.raw_source().ok_or_else(Error::unsupported)?;
                set_source_nonblocking(source, !blocking)?;
            }
            Err(error) => return Err(error),
        }

        self.flags.set(StreamFlags::NONBLOCK, !blocking);
        Ok(())
    }

    fn cloexec(&self) -> Result<bool> {
        match self.raw_source() {
            #[cfg(unix)]
            Some(RawSource::Fd(fd)) => Ok(pal::unix::is_cloexec(fd)?),
            #[cfg(windows)]
            Some(source) => Ok(!pal::windows::is_inheritable(source)?),
            None => Err(Error::unsupported()),
        }
    }

    fn set_cloexec(&self, cloexec: bool) -> Result<()> {
        match self.raw_source() {
            #[cfg(unix)]
            Some(RawSource::Fd(fd)) => Ok(pal::unix::set_cloexec(fd, cloexec)?),
            #[cfg(windows)]
            Some(source) => Ok(pal::windows::set_inheritable(source, !cloexec)?),
            None => Err(Error::unsupported()),
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if self.native.is_none() {
            return;
        }

        // A context may still watch the handle or have operations in flight on it. Leaking the
        // handle keeps it from being recycled underneath the context.
        if self.in_use.load(Ordering::Acquire) > 0 {
            event!(
                Level::WARN,
                message = "stream dropped while in use by a context, leaking its handle",
                id = %self.id,
                kind = %self.kind
            );
            self.autoclose = false;
        }

        if let Err(error) = self.release() {
            event!(Level::WARN, message = "closing stream failed", id = %self.id, error = %error);
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("flags", &self.flags)
            .field("closed", &self.is_closed())
            .field("eof", &self.eof)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

/// Fills in the access bits a kind uses when the caller specified none.
pub(crate) fn with_default_access(flags: StreamFlags, default: StreamFlags) -> StreamFlags {
    if flags.intersects(StreamFlags::RDWR) {
        flags
    } else {
        flags | default
    }
}

fn set_source_nonblocking(source: RawSource, nonblocking: bool) -> Result<()> {
    match source {
        #[cfg(unix)]
        RawSource::Fd(fd) => Ok(pal::unix::set_nonblocking(fd, nonblocking)?),
        #[cfg(windows)]
        RawSource::Socket(_) | RawSource::Handle(_) => {
            let _ = nonblocking;
            Err(Error::unsupported())
        }
    }
}

fn partial(total: usize, requested: usize, error: Error) -> Result<Transfer> {
    if total == 0 { Err(error) } else { Ok(Transfer::new(total, requested)) }
}

fn widen(total: Transfer, requested: usize) -> Transfer {
    if total.is_end_of_stream() {
        Transfer::end_of_stream(total.len(), requested)
    } else {
        Transfer::new(total.len(), requested)
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
