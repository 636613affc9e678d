// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Windows helpers shared by drivers and the completion port backend.

use std::io;
use std::time::Duration;

use windows_sys::Win32::Foundation::{
    ERROR_ACCESS_DENIED, ERROR_ALREADY_EXISTS, ERROR_BROKEN_PIPE, ERROR_BUFFER_OVERFLOW, ERROR_BUSY,
    ERROR_DIRECTORY, ERROR_DISK_FULL, ERROR_FILE_EXISTS, ERROR_FILE_NOT_FOUND, ERROR_FILE_TOO_LARGE,
    ERROR_HANDLE_EOF, ERROR_INSUFFICIENT_BUFFER, ERROR_INVALID_HANDLE, ERROR_INVALID_PARAMETER, ERROR_IO_PENDING,
    ERROR_LOCK_VIOLATION, ERROR_MORE_DATA, ERROR_NO_DATA, ERROR_NOT_ENOUGH_MEMORY, ERROR_NOT_SUPPORTED,
    ERROR_OPERATION_ABORTED, ERROR_OUTOFMEMORY, ERROR_PATH_NOT_FOUND, ERROR_PIPE_NOT_CONNECTED, ERROR_SEM_TIMEOUT,
    ERROR_SHARING_VIOLATION, ERROR_TIMEOUT, ERROR_TOO_MANY_OPEN_FILES, ERROR_WRITE_PROTECT, HANDLE, WAIT_OBJECT_0,
    WAIT_TIMEOUT,
};
use windows_sys::Win32::Networking::WinSock::{
    POLLRDNORM, POLLWRNORM, SOCKET, WSAEACCES, WSAEADDRINUSE, WSAEADDRNOTAVAIL, WSAECONNABORTED, WSAECONNREFUSED,
    WSAECONNRESET, WSAEHOSTUNREACH, WSAEINPROGRESS, WSAEINTR, WSAEINVAL, WSAEISCONN, WSAEMSGSIZE, WSAENETDOWN,
    WSAENETUNREACH, WSAENOBUFS, WSAENOTCONN, WSAENOTSOCK, WSAETIMEDOUT, WSAEWOULDBLOCK, WSANOTINITIALISED,
    SOCKET_ERROR, WSAGetLastError, WSAPOLLFD, WSAPoll, recv, send,
};
use windows_sys::Win32::Foundation::{GetHandleInformation, HANDLE_FLAG_INHERIT, SetHandleInformation};
use windows_sys::Win32::Storage::FileSystem::{ReadFile, WriteFile};
use windows_sys::Win32::System::IO::OVERLAPPED;
use windows_sys::Win32::System::Pipes::PeekNamedPipe;
use windows_sys::Win32::System::Threading::{INFINITE, WaitForSingleObject};

use crate::pal::{Direction, RawSource, timeout_millis};
use crate::{ErrorCode, Result};

/// Translates a Win32 or Winsock error number into a stable code.
#[must_use]
pub fn win32_to_code(error: u32) -> ErrorCode {
    #[expect(clippy::cast_sign_loss, reason = "Winsock error constants are small positive numbers")]
    let wsa = |code: i32| code as u32;

    match error {
        ERROR_INVALID_PARAMETER => ErrorCode::InvalidArgument,
        ERROR_NOT_ENOUGH_MEMORY | ERROR_OUTOFMEMORY => ErrorCode::OutOfMemory,
        ERROR_FILE_NOT_FOUND | ERROR_PATH_NOT_FOUND => ErrorCode::NotFound,
        ERROR_ALREADY_EXISTS | ERROR_FILE_EXISTS => ErrorCode::AlreadyExists,
        ERROR_ACCESS_DENIED => ErrorCode::PermissionDenied,
        ERROR_NOT_SUPPORTED => ErrorCode::Unsupported,
        ERROR_BUSY | ERROR_SHARING_VIOLATION => ErrorCode::Busy,
        ERROR_TIMEOUT | ERROR_SEM_TIMEOUT => ErrorCode::Timeout,
        ERROR_INSUFFICIENT_BUFFER | ERROR_MORE_DATA | ERROR_BUFFER_OVERFLOW => ErrorCode::BufferTooSmall,
        ERROR_TOO_MANY_OPEN_FILES => ErrorCode::LimitReached,
        ERROR_OPERATION_ABORTED => ErrorCode::Cancelled,
        ERROR_HANDLE_EOF => ErrorCode::EndOfStream,
        ERROR_DIRECTORY => ErrorCode::NotDirectory,
        ERROR_WRITE_PROTECT => ErrorCode::ReadOnly,
        ERROR_FILE_TOO_LARGE => ErrorCode::TooLarge,
        ERROR_DISK_FULL => ErrorCode::NoSpace,
        ERROR_INVALID_HANDLE => ErrorCode::BadHandle,
        ERROR_BROKEN_PIPE | ERROR_NO_DATA | ERROR_PIPE_NOT_CONNECTED => ErrorCode::BrokenPipe,
        ERROR_LOCK_VIOLATION => ErrorCode::Locked,
        ERROR_IO_PENDING => ErrorCode::InProgress,
        code if code == wsa(WSAEINVAL) => ErrorCode::InvalidArgument,
        code if code == wsa(WSAENOBUFS) => ErrorCode::OutOfMemory,
        code if code == wsa(WSAEACCES) => ErrorCode::PermissionDenied,
        code if code == wsa(WSAEINTR) => ErrorCode::Interrupted,
        code if code == wsa(WSAEWOULDBLOCK) => ErrorCode::WouldBlock,
        code if code == wsa(WSAETIMEDOUT) => ErrorCode::Timeout,
        code if code == wsa(WSANOTINITIALISED) => ErrorCode::NotInitialized,
        code if code == wsa(WSAECONNREFUSED) => ErrorCode::ConnectionRefused,
        code if code == wsa(WSAECONNRESET) => ErrorCode::ConnectionReset,
        code if code == wsa(WSAECONNABORTED) => ErrorCode::ConnectionAborted,
        code if code == wsa(WSAENETUNREACH) || code == wsa(WSAENETDOWN) => ErrorCode::NetworkUnreachable,
        code if code == wsa(WSAEHOSTUNREACH) => ErrorCode::HostUnreachable,
        code if code == wsa(WSAEADDRINUSE) => ErrorCode::AddressInUse,
        code if code == wsa(WSAEADDRNOTAVAIL) => ErrorCode::AddressNotAvailable,
        code if code == wsa(WSAEINPROGRESS) => ErrorCode::InProgress,
        code if code == wsa(WSAENOTCONN) => ErrorCode::NotConnected,
        code if code == wsa(WSAEISCONN) => ErrorCode::AlreadyConnected,
        code if code == wsa(WSAEMSGSIZE) => ErrorCode::MessageTooLarge,
        code if code == wsa(WSAENOTSOCK) => ErrorCode::Network,
        _ => ErrorCode::System,
    }
}

/// Blocks until `source` is ready or `timeout` elapses.
///
/// Sockets are probed with `WSAPoll`; other handles with `WaitForSingleObject`, which only
/// distinguishes signaled from not signaled.
pub(crate) fn wait_ready(source: RawSource, direction: Direction, timeout: Option<Duration>) -> Result<bool> {
    match source {
        RawSource::Socket(socket) => {
            let events = match direction {
                Direction::Read => POLLRDNORM,
                Direction::Write => POLLWRNORM,
            };
            let mut pollfd = WSAPOLLFD {
                fd: socket as SOCKET,
                events,
                revents: 0,
            };

            // SAFETY: `pollfd` is a valid array of one element.
            let ret = unsafe { WSAPoll(&raw mut pollfd, 1, timeout_millis(timeout)) };
            match ret {
                0 => Ok(false),
                ret if ret > 0 => Ok(true),
                _ => Err(io::Error::last_os_error().into()),
            }
        }
        RawSource::Handle(handle) => {
            let millis = timeout.map_or(INFINITE, |_| timeout_millis(timeout).cast_unsigned());

            // SAFETY: The handle value came from a live stream.
            match unsafe { WaitForSingleObject(handle as HANDLE, millis) } {
                WAIT_OBJECT_0 => Ok(true),
                WAIT_TIMEOUT => Ok(false),
                _ => Err(io::Error::last_os_error().into()),
            }
        }
    }
}

fn source_handle(source: RawSource) -> HANDLE {
    match source {
        RawSource::Socket(socket) => socket as HANDLE,
        RawSource::Handle(handle) => handle as HANDLE,
    }
}

/// Whether child processes inherit the handle.
pub(crate) fn is_inheritable(source: RawSource) -> io::Result<bool> {
    let mut flags = 0;

    // SAFETY: `flags` is valid for writes and the handle came from a live stream.
    check_bool(unsafe { GetHandleInformation(source_handle(source), &raw mut flags) })?;
    Ok(flags & HANDLE_FLAG_INHERIT != 0)
}

/// Controls whether child processes inherit the handle.
pub(crate) fn set_inheritable(source: RawSource, inheritable: bool) -> io::Result<()> {
    let value = if inheritable { HANDLE_FLAG_INHERIT } else { 0 };

    // SAFETY: The handle came from a live stream; only its inheritance flag changes.
    check_bool(unsafe { SetHandleInformation(source_handle(source), HANDLE_FLAG_INHERIT, value) })
}

/// Whether `source` can make progress in `direction` right now.
///
/// Pipes report readability through the bytes waiting in them, with a broken pipe counting as
/// readable so the end of the stream can be observed. Other handles fall back to their signaled
/// state and are always writable.
pub(crate) fn probe_ready(source: RawSource, direction: Direction) -> Result<bool> {
    let RawSource::Handle(handle) = source else {
        return wait_ready(source, direction, Some(Duration::ZERO));
    };

    if direction == Direction::Write {
        return Ok(true);
    }

    let mut available = 0_u32;
    // SAFETY: Only the byte count is requested and `available` is valid for writes.
    let ret = unsafe {
        PeekNamedPipe(
            handle as HANDLE,
            std::ptr::null_mut(),
            0,
            std::ptr::null_mut(),
            &raw mut available,
            std::ptr::null_mut(),
        )
    };

    match check_bool(ret) {
        Ok(()) => Ok(available > 0),
        Err(error) if error.raw_os_error() == Some(ERROR_BROKEN_PIPE.cast_signed()) => Ok(true),
        Err(_not_a_pipe) => wait_ready(source, direction, Some(Duration::ZERO)),
    }
}

/// Reads once from a socket or handle.
///
/// # Safety
///
/// `source` must stay open for the duration of the call.
pub(crate) unsafe fn read_source(source: RawSource, buf: &mut [u8], offset: Option<u64>) -> io::Result<usize> {
    let len = u32::try_from(buf.len()).unwrap_or(u32::MAX);

    match source {
        RawSource::Socket(socket) => {
            let len = i32::try_from(len).unwrap_or(i32::MAX);
            // SAFETY: `buf` is valid for writes of `len` bytes and the caller keeps the socket open.
            let ret = unsafe { recv(socket as SOCKET, buf.as_mut_ptr(), len, 0) };
            socket_len(ret)
        }
        RawSource::Handle(handle) => {
            let mut overlapped = positioned(offset);
            let overlapped_ptr = overlapped.as_mut().map_or(std::ptr::null_mut(), |overlapped| &raw mut *overlapped);
            let mut count = 0_u32;

            // SAFETY: `buf` is valid for writes of `len` bytes, the handle is synchronous so the
            // optional `OVERLAPPED` only carries the offset, and the caller keeps the handle open.
            let ret = unsafe { ReadFile(handle as HANDLE, buf.as_mut_ptr(), len, &raw mut count, overlapped_ptr) };
            match check_bool(ret) {
                Ok(()) => Ok(count as usize),
                Err(error) if is_end_of_data(&error) => Ok(0),
                Err(error) => Err(error),
            }
        }
    }
}

/// Writes once to a socket or handle.
///
/// # Safety
///
/// `source` must stay open for the duration of the call.
pub(crate) unsafe fn write_source(source: RawSource, buf: &[u8], offset: Option<u64>) -> io::Result<usize> {
    let len = u32::try_from(buf.len()).unwrap_or(u32::MAX);

    match source {
        RawSource::Socket(socket) => {
            let len = i32::try_from(len).unwrap_or(i32::MAX);
            // SAFETY: `buf` is valid for reads of `len` bytes and the caller keeps the socket open.
            let ret = unsafe { send(socket as SOCKET, buf.as_ptr(), len, 0) };
            socket_len(ret)
        }
        RawSource::Handle(handle) => {
            let mut overlapped = positioned(offset);
            let overlapped_ptr = overlapped.as_mut().map_or(std::ptr::null_mut(), |overlapped| &raw mut *overlapped);
            let mut count = 0_u32;

            // SAFETY: As in `read_source()`, with `buf` valid for reads.
            let ret = unsafe { WriteFile(handle as HANDLE, buf.as_ptr(), len, &raw mut count, overlapped_ptr) };
            check_bool(ret)?;
            Ok(count as usize)
        }
    }
}

/// An `OVERLAPPED` carrying only a file offset, for positioned transfers on synchronous handles.
pub(crate) fn positioned(offset: Option<u64>) -> Option<OVERLAPPED> {
    offset.map(|offset| {
        // SAFETY: `OVERLAPPED` is a plain C structure for which all-zero bytes are a valid value.
        let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
        #[expect(clippy::cast_possible_truncation, reason = "splitting into 32-bit halves")]
        {
            overlapped.Anonymous.Anonymous.Offset = offset as u32;
            overlapped.Anonymous.Anonymous.OffsetHigh = (offset >> 32) as u32;
        }
        overlapped
    })
}

/// Whether a failed read means the writer went away.
pub(crate) fn is_end_of_data(error: &io::Error) -> bool {
    matches!(error.raw_os_error().map(i32::cast_unsigned), Some(ERROR_BROKEN_PIPE | ERROR_HANDLE_EOF))
}

fn socket_len(ret: i32) -> io::Result<usize> {
    if ret == SOCKET_ERROR {
        // SAFETY: No pointers are involved.
        Err(io::Error::from_raw_os_error(unsafe { WSAGetLastError() }))
    } else {
        Ok(ret.cast_unsigned() as usize)
    }
}

/// Converts a `BOOL`-style return value into a result.
pub(crate) fn check_bool(ret: i32) -> io::Result<()> {
    if ret == 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
}
