// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::io::SeekFrom;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::buf::ByteBuffer;
use crate::pal::RawSource;
use crate::{Context, Error, ErrorCode, Result, Stream, StreamId};

static NEXT_OP_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a submitted operation. Identifiers are never reused within a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(u64);

impl OpId {
    pub(crate) fn next() -> Self {
        Self(NEXT_OP_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) const fn from_u64(value: u64) -> Self {
        Self(value)
    }

    /// The numeric value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// The direction of an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Data flows from the stream into the buffer.
    Read,
    /// Data flows from the buffer into the stream.
    Write,
}

/// The state of an operation.
///
/// Every operation reaches exactly one terminal state, and its callback sees that state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpStatus {
    /// Not finished yet.
    Pending,
    /// Finished successfully, possibly transferring fewer bytes than requested.
    Complete,
    /// Failed; [`CompletedOp::error()`] has the details.
    Error,
    /// Abandoned through [`Context::cancel()`] or [`Context::cancel_stream()`].
    Cancelled,
    /// Abandoned because its deadline passed.
    Timeout,
}

impl OpStatus {
    /// Whether the operation has finished.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A finished operation, handed to its callback.
///
/// The buffer comes back to the caller here. For reads, the received bytes were placed at the
/// cursor the buffer had at submission and the cursor now follows them; for writes, the cursor
/// advanced past the bytes sent.
#[derive(Debug)]
pub struct CompletedOp {
    id: OpId,
    kind: OpKind,
    stream: StreamId,
    status: OpStatus,
    bytes: usize,
    error: Option<Error>,
    buffer: ByteBuffer,
    user_data: u64,
}

impl CompletedOp {
    /// The identity of the operation.
    #[must_use]
    pub const fn id(&self) -> OpId {
        self.id
    }

    /// Whether the operation read or wrote.
    #[must_use]
    pub const fn kind(&self) -> OpKind {
        self.kind
    }

    /// The stream the operation ran on.
    #[must_use]
    pub const fn stream(&self) -> StreamId {
        self.stream
    }

    /// The terminal state.
    #[must_use]
    pub const fn status(&self) -> OpStatus {
        self.status
    }

    /// Number of bytes transferred. A completed read of zero bytes means the end of the stream.
    #[must_use]
    pub const fn bytes(&self) -> usize {
        self.bytes
    }

    /// The failure, for [`OpStatus::Error`].
    #[must_use]
    pub const fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// The value given to [`OpBuilder::with_user_data()`].
    #[must_use]
    pub const fn user_data(&self) -> u64 {
        self.user_data
    }

    /// The buffer of the operation.
    #[must_use]
    pub const fn buffer(&self) -> &ByteBuffer {
        &self.buffer
    }

    /// Takes back ownership of the buffer.
    #[must_use]
    pub fn into_buffer(self) -> ByteBuffer {
        self.buffer
    }
}

/// Prepares an operation started by [`Context::read()`] or [`Context::write()`].
///
/// Nothing happens until [`submit()`][Self::submit] is called.
#[derive(Debug)]
#[must_use = "operations only start when submitted"]
pub struct OpBuilder<'a> {
    context: &'a mut Context,
    stream: &'a Stream,
    kind: OpKind,
    buffer: ByteBuffer,
    len: usize,
    offset: Option<u64>,
    timeout: Option<Duration>,
    user_data: u64,
}

impl<'a> OpBuilder<'a> {
    pub(crate) fn new(context: &'a mut Context, stream: &'a Stream, kind: OpKind, buffer: ByteBuffer, len: usize) -> Self {
        Self {
            context,
            stream,
            kind,
            buffer,
            len,
            offset: None,
            timeout: None,
            user_data: 0,
        }
    }

    /// Transfers at an absolute position of the stream instead of its current position. Only
    /// meaningful for seekable streams.
    pub const fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Abandons the operation with [`OpStatus::Timeout`] if it has not finished within
    /// `timeout`.
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attaches a value that is handed back in the [`CompletedOp`].
    pub const fn with_user_data(mut self, user_data: u64) -> Self {
        self.user_data = user_data;
        self
    }

    /// Starts the operation. `callback` runs exactly once, inside a later
    /// [`wait()`][Context::wait], once the operation reached a terminal state.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::BadHandle`] if the stream is closed, [`ErrorCode::PermissionDenied`] if it
    /// lacks the access the operation needs, [`ErrorCode::Unsupported`] if the stream has no
    /// handle the context can drive, and any failure of the buffer or the backend. The buffer is
    /// dropped when submission fails.
    pub fn submit(self, callback: impl FnOnce(CompletedOp) + Send + 'static) -> Result<OpId> {
        let Self {
            context,
            stream,
            kind,
            buffer,
            len,
            offset,
            timeout,
            user_data,
        } = self;

        let op = PendingOp::prepare(stream, kind, buffer, len)?;
        let op = PendingOp {
            offset,
            user_data,
            deadline: timeout.and_then(|timeout| Instant::now().checked_add(timeout)),
            callback: Some(Box::new(callback)),
            ..op
        };

        context.submit(op)
    }
}

pub(crate) type OpCallback = Box<dyn FnOnce(CompletedOp) + Send>;

/// How an operation ended, kept until its callback runs.
#[derive(Debug)]
pub(crate) struct Outcome {
    pub(crate) status: OpStatus,
    pub(crate) result: Result<usize>,
}

/// An operation owned by a context.
pub(crate) struct PendingOp {
    pub(crate) id: OpId,
    pub(crate) kind: OpKind,
    pub(crate) stream: StreamId,
    pub(crate) source: RawSource,
    pub(crate) buffer: ByteBuffer,
    /// Bytes to transfer.
    pub(crate) requested: usize,
    pub(crate) offset: Option<u64>,
    /// Cursor of the buffer at submission.
    start: usize,
    /// Size of the buffer at submission.
    old_size: usize,
    pub(crate) deadline: Option<Instant>,
    pub(crate) user_data: u64,
    callback: Option<OpCallback>,
    pub(crate) native: bool,
    /// The reason a native cancellation was requested.
    pub(crate) cancelling: Option<OpStatus>,
    pub(crate) outcome: Option<Outcome>,
    usage: Arc<AtomicUsize>,
}

impl PendingOp {
    /// Validates the stream and readies the buffer. Reads extend the buffer so the requested
    /// bytes fit after the cursor.
    pub(crate) fn prepare(stream: &Stream, kind: OpKind, mut buffer: ByteBuffer, len: usize) -> Result<Self> {
        stream.native()?;

        let (required, requested) = match kind {
            OpKind::Read => (stream.flags().readable(), len),
            OpKind::Write => (stream.flags().writable(), buffer.remaining()),
        };
        if !required {
            return Err(ErrorCode::PermissionDenied.into());
        }

        let source = stream.raw_source().ok_or(Error::Code(ErrorCode::Unsupported))?;
        let start = buffer.tell();
        let old_size = buffer.len();

        if kind == OpKind::Read {
            let end = start.checked_add(len).ok_or(Error::Code(ErrorCode::InvalidArgument))?;
            buffer.set_len(old_size.max(end))?;
            // Make sure the storage accepts writes before handing it out.
            buffer.as_mut_slice()?;
        }

        Ok(Self {
            id: OpId::next(),
            kind,
            stream: stream.id(),
            source,
            buffer,
            requested,
            offset: None,
            start,
            old_size,
            deadline: None,
            user_data: 0,
            callback: None,
            native: false,
            cancelling: None,
            outcome: None,
            usage: Arc::clone(stream.usage()),
        })
    }

    /// The memory the transfer reads from or writes into.
    pub(crate) fn region(&mut self) -> Result<(*mut u8, usize)> {
        match self.kind {
            OpKind::Read => {
                let range = self.start..self.start + self.requested;
                let slice = &mut self.buffer.as_mut_slice()?[range];
                Ok((slice.as_mut_ptr(), slice.len()))
            }
            OpKind::Write => {
                let data = self.buffer.current();
                Ok((data.as_ptr().cast_mut(), data.len()))
            }
        }
    }

    /// Performs one non-blocking attempt of an emulated transfer.
    ///
    /// # Safety
    ///
    /// The source must still be open, which holds while the op keeps its stream in use.
    pub(crate) unsafe fn attempt(&mut self) -> std::io::Result<usize> {
        let source = self.source;
        let offset = self.offset;

        match self.kind {
            OpKind::Read => {
                let range = self.start..self.start + self.requested;
                let slice = &mut self.buffer.as_mut_slice().map_err(std::io::Error::from)?[range];
                // SAFETY: Forwarding the guarantee of the caller.
                unsafe { crate::pal::read_source(source, slice, offset) }
            }
            // SAFETY: Forwarding the guarantee of the caller.
            OpKind::Write => unsafe { crate::pal::write_source(source, self.buffer.current(), offset) },
        }
    }

    /// Records how the operation ended. Later outcomes are ignored.
    pub(crate) fn finish(&mut self, status: OpStatus, result: Result<usize>) {
        if self.outcome.is_none() {
            self.outcome = Some(Outcome { status, result });
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    pub(crate) fn take_callback(&mut self) -> Option<OpCallback> {
        self.callback.take()
    }

    /// Settles the buffer according to the outcome and produces the completion record. Releases
    /// the stream.
    pub(crate) fn complete(mut self) -> CompletedOp {
        let Outcome { status, result } = self.outcome.take().unwrap_or(Outcome {
            status: OpStatus::Cancelled,
            result: Ok(0),
        });

        let (bytes, error) = match result {
            Ok(bytes) => (bytes.min(self.requested), None),
            Err(error) => (0, Some(error)),
        };

        match self.kind {
            OpKind::Read => {
                let end = self.start + bytes;
                self.buffer.truncate(self.old_size.max(end));
                // The data covers `end`, so the seek cannot fail.
                let _ = self.buffer.seek(SeekFrom::Start(end as u64));
            }
            OpKind::Write => {
                let _ = self.buffer.seek(SeekFrom::Start((self.start + bytes) as u64));
            }
        }

        self.usage.fetch_sub(1, Ordering::AcqRel);

        CompletedOp {
            id: self.id,
            kind: self.kind,
            stream: self.stream,
            status,
            bytes,
            error,
            buffer: self.buffer,
            user_data: self.user_data,
        }
    }

    /// Gives up on an operation the operating system may still write into. The buffer is leaked
    /// and the stream stays in use, so its handle is never released.
    pub(crate) fn abandon(self) {
        std::mem::forget(self.buffer);
    }

    /// Drops an operation that never reached the operating system.
    pub(crate) fn discard(self) {
        self.usage.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn mark_in_use(&self) {
        self.usage.fetch_add(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for PendingOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOp")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stream", &self.stream)
            .field("requested", &self.requested)
            .field("native", &self.native)
            .field("outcome", &self.outcome)
            .finish_non_exhaustive()
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::StreamFlags;

    fn pipe_reader() -> (Stream, Stream) {
        Stream::pipe(StreamFlags::empty()).unwrap()
    }

    #[test]
    fn ids_are_unique_and_displayed() {
        let first = OpId::next();
        let second = OpId::next();

        assert!(second > first);
        assert_eq!(format!("{first}"), format!("op#{}", first.as_u64()));
    }

    #[test]
    fn read_lands_at_the_cursor() {
        let (reader, _writer) = pipe_reader();
        let mut buffer = ByteBuffer::from_slice(b"head").unwrap();
        buffer.seek(SeekFrom::Start(2)).unwrap();

        let mut op = PendingOp::prepare(&reader, OpKind::Read, buffer, 8).unwrap();
        op.mark_in_use();
        assert_eq!(op.buffer.len(), 10);

        op.buffer.as_mut_slice().unwrap()[2..5].copy_from_slice(b"xyz");
        op.finish(OpStatus::Complete, Ok(3));
        let completed = op.complete();

        assert_eq!(completed.bytes(), 3);
        assert_eq!(completed.buffer().as_slice(), b"hexyz");
        assert_eq!(completed.buffer().tell(), 5);
        assert_eq!(reader.usage().load(Ordering::Acquire), 0);
    }

    #[test]
    fn failed_read_restores_the_buffer() {
        let (reader, _writer) = pipe_reader();
        let buffer = ByteBuffer::from_slice(b"abc").unwrap();

        let mut op = PendingOp::prepare(&reader, OpKind::Read, buffer, 16).unwrap();
        op.mark_in_use();
        op.finish(OpStatus::Error, Err(ErrorCode::BrokenPipe.into()));
        op.finish(OpStatus::Complete, Ok(16));
        let completed = op.complete();

        assert_eq!(completed.status(), OpStatus::Error);
        assert_eq!(completed.bytes(), 0);
        assert_eq!(completed.error().unwrap().code(), ErrorCode::BrokenPipe);
        assert_eq!(completed.into_buffer().as_slice(), b"abc");
    }

    #[test]
    fn write_advances_the_cursor() {
        let (_reader, writer) = pipe_reader();
        let buffer = ByteBuffer::from_slice(b"payload").unwrap();

        let mut op = PendingOp::prepare(&writer, OpKind::Write, buffer, 0).unwrap();
        op.mark_in_use();
        assert_eq!(op.requested, 7);
        assert_eq!(op.region().unwrap().1, 7);

        op.finish(OpStatus::Complete, Ok(4));
        let completed = op.complete();

        assert_eq!(completed.kind(), OpKind::Write);
        assert_eq!(completed.buffer().current(), b"oad");
        assert_eq!(writer.usage().load(Ordering::Acquire), 0);
    }

    #[test]
    fn access_is_checked() {
        let (reader, writer) = pipe_reader();

        let error = PendingOp::prepare(&reader, OpKind::Write, ByteBuffer::new(4).unwrap(), 0).unwrap_err();
        assert_eq!(error.code(), ErrorCode::PermissionDenied);

        let error = PendingOp::prepare(&writer, OpKind::Read, ByteBuffer::new(4).unwrap(), 4).unwrap_err();
        assert_eq!(error.code(), ErrorCode::PermissionDenied);
    }

    #[test]
    fn memory_streams_are_not_driven() {
        let stream = Stream::from_memory(vec![0; 4], StreamFlags::RDWR);

        let error = PendingOp::prepare(&stream, OpKind::Read, ByteBuffer::new(4).unwrap(), 4).unwrap_err();

        assert_eq!(error.code(), ErrorCode::Unsupported);
    }

    #[test]
    fn terminal_states() {
        assert!(!OpStatus::Pending.is_terminal());
        assert!(OpStatus::Complete.is_terminal());
        assert!(OpStatus::Timeout.is_terminal());
    }
}
