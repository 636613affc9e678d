// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Streams over native handles the caller already owns.

use tracing::{Level, event};

use crate::{Error, Result, Stream, StreamFlags, StreamKind};

/// Whether a handle of `kind` can be adopted. Kinds with state beyond the handle itself cannot.
fn adoptable(kind: StreamKind) -> Result<()> {
    match kind {
        StreamKind::File | StreamKind::Socket | StreamKind::Datagram | StreamKind::Pipe | StreamKind::Terminal => Ok(()),
        _ => Err(Error::invalid_argument()),
    }
}

#[cfg(unix)]
impl Stream {
    /// Adopts an owned file descriptor as a stream of `kind`.
    ///
    /// Files, sockets, datagram sockets, pipes and terminals can be adopted; sockets must match
    /// the kind. Without access bits in `flags`, the access mode of the descriptor is used. The
    /// non-blocking state of the descriptor is reflected in [`StreamFlags::NONBLOCK`].
    ///
    /// # Errors
    ///
    /// [`ErrorCode::InvalidArgument`][crate::ErrorCode::InvalidArgument] for kinds that cannot
    /// be adopted, in which case `fd` is closed, and any failure querying the descriptor.
    ///
    /// # Example
    ///
    /// ```
    /// use std::os::fd::OwnedFd;
    ///
    /// use sio::{Stream, StreamFlags, StreamKind};
    ///
    /// let file = tempfile::tempfile()?;
    /// let mut stream = Stream::from_owned_fd(StreamKind::File, OwnedFd::from(file), StreamFlags::empty())?;
    /// stream.write(b"adopted")?;
    /// assert_eq!(stream.size()?, 7);
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn from_owned_fd(kind: StreamKind, fd: std::os::fd::OwnedFd, flags: StreamFlags) -> Result<Self> {
        use std::os::fd::AsRawFd;

        use crate::drivers::{Native, PipeDriver};
        use crate::pal::unix;

        adoptable(kind)?;

        let raw = fd.as_raw_fd();
        let mut flags = if flags.intersects(StreamFlags::RDWR) {
            flags
        } else {
            flags | access_mode(raw)?
        };
        flags.set(StreamFlags::NONBLOCK, unix::is_nonblocking(raw)?);

        let stream = match kind {
            StreamKind::File => Self::from_file(std::fs::File::from(fd), flags),
            StreamKind::Socket | StreamKind::Datagram => Self::from_socket(socket2::Socket::from(fd), kind, flags),
            StreamKind::Terminal => Self::terminal_from(Self::from_native(StreamKind::Pipe, flags, Native::Pipe(PipeDriver::new(fd))))?,
            _ => Self::from_native(StreamKind::Pipe, flags, Native::Pipe(PipeDriver::new(fd))),
        };

        event!(Level::DEBUG, message = "adopted descriptor", fd = raw, id = %stream.id(), kind = %kind);
        Ok(stream)
    }

    /// Adopts a raw file descriptor as a stream of `kind`.
    ///
    /// Behaves like [`from_owned_fd()`][Self::from_owned_fd].
    ///
    /// # Safety
    ///
    /// `fd` must be an open descriptor that nothing else owns. Ownership passes to the returned
    /// stream, or the descriptor is closed if adoption fails.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::BadHandle`][crate::ErrorCode::BadHandle] for a negative descriptor, otherwise
    /// as for [`from_owned_fd()`][Self::from_owned_fd].
    pub unsafe fn from_raw_fd(kind: StreamKind, fd: std::os::fd::RawFd, flags: StreamFlags) -> Result<Self> {
        use std::os::fd::{FromRawFd, OwnedFd};

        if fd < 0 {
            return Err(crate::ErrorCode::BadHandle.into());
        }

        // SAFETY: The caller guarantees the descriptor is open and unowned.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Self::from_owned_fd(kind, fd, flags)
    }
}

#[cfg(unix)]
fn access_mode(fd: std::os::fd::RawFd) -> Result<StreamFlags> {
    // SAFETY: `F_GETFL` only reads descriptor state.
    let status = crate::pal::unix::check(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;

    Ok(match status & libc::O_ACCMODE {
        libc::O_WRONLY => StreamFlags::WRITE,
        libc::O_RDWR => StreamFlags::RDWR,
        _ => StreamFlags::READ,
    })
}

#[cfg(windows)]
impl Stream {
    /// Adopts an owned handle as a stream of `kind`.
    ///
    /// Files, pipes and terminals can be adopted this way; sockets go through
    /// [`from_raw_socket()`][Self::from_raw_socket]. Without access bits in `flags`, the stream
    /// is readable and writable.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::InvalidArgument`][crate::ErrorCode::InvalidArgument] for kinds that cannot
    /// be adopted from a handle, in which case `handle` is closed.
    pub fn from_owned_handle(kind: StreamKind, handle: std::os::windows::io::OwnedHandle, flags: StreamFlags) -> Result<Self> {
        use crate::drivers::{Native, PipeDriver};
        use crate::stream::with_default_access;

        adoptable(kind)?;
        let flags = with_default_access(flags, StreamFlags::RDWR);

        let stream = match kind {
            StreamKind::File => Self::from_file(std::fs::File::from(handle), flags),
            StreamKind::Pipe => Self::from_native(StreamKind::Pipe, flags, Native::Pipe(PipeDriver::new(handle))),
            StreamKind::Terminal => Self::terminal_from(Self::from_native(StreamKind::Pipe, flags, Native::Pipe(PipeDriver::new(handle))))?,
            _ => return Err(Error::invalid_argument()),
        };

        event!(Level::DEBUG, message = "adopted handle", id = %stream.id(), kind = %kind);
        Ok(stream)
    }

    /// Adopts a raw handle as a stream of `kind`.
    ///
    /// # Safety
    ///
    /// `handle` must be an open handle that nothing else owns. Ownership passes to the returned
    /// stream, or the handle is closed if adoption fails.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::BadHandle`][crate::ErrorCode::BadHandle] for a null handle, otherwise as for
    /// [`from_owned_handle()`][Self::from_owned_handle].
    pub unsafe fn from_raw_handle(kind: StreamKind, handle: std::os::windows::io::RawHandle, flags: StreamFlags) -> Result<Self> {
        use std::os::windows::io::{FromRawHandle, OwnedHandle};

        if handle.is_null() {
            return Err(crate::ErrorCode::BadHandle.into());
        }

        // SAFETY: The caller guarantees the handle is open and unowned.
        let handle = unsafe { OwnedHandle::from_raw_handle(handle) };
        Self::from_owned_handle(kind, handle, flags)
    }

    /// Adopts a raw socket as a stream or datagram socket.
    ///
    /// # Safety
    ///
    /// `socket` must be an open socket that nothing else owns. Ownership passes to the returned
    /// stream, or the socket is closed if adoption fails.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::InvalidArgument`][crate::ErrorCode::InvalidArgument] for kinds other than
    /// [`StreamKind::Socket`] and [`StreamKind::Datagram`].
    pub unsafe fn from_raw_socket(kind: StreamKind, socket: std::os::windows::io::RawSocket, flags: StreamFlags) -> Result<Self> {
        use std::os::windows::io::FromRawSocket;

        // SAFETY: The caller guarantees the socket is open and unowned.
        let socket = unsafe { socket2::Socket::from_raw_socket(socket) };
        if !matches!(kind, StreamKind::Socket | StreamKind::Datagram) {
            return Err(Error::invalid_argument());
        }

        let stream = Self::from_socket(socket, kind, flags);
        event!(Level::DEBUG, message = "adopted socket", id = %stream.id(), kind = %kind);
        Ok(stream)
    }
}
