// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Platform abstraction layer: error translation, readiness probing and the wake primitive used
//! by event contexts. Only this module, the drivers and the backends touch raw handles.

use std::time::Duration;

use crate::{ErrorCode, Result};

#[cfg(unix)]
pub mod unix;
#[cfg(windows)]
pub mod windows;

/// A native handle that a readiness backend can watch.
///
/// Values are plain numbers; holding one does not keep the handle open.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum RawSource {
    /// A POSIX file descriptor.
    #[cfg(unix)]
    Fd(std::os::fd::RawFd),
    /// A Windows socket.
    #[cfg(windows)]
    Socket(std::os::windows::io::RawSocket),
    /// A waitable Windows handle, stored as its numeric value.
    #[cfg(windows)]
    Handle(isize),
}

impl RawSource {
    /// The numeric value of the handle, for diagnostics and the `NATIVE_HANDLE` option.
    #[must_use]
    pub fn as_raw_value(self) -> i64 {
        match self {
            #[cfg(unix)]
            Self::Fd(fd) => i64::from(fd),
            #[cfg(windows)]
            Self::Socket(socket) => i64::try_from(socket).unwrap_or(-1),
            #[cfg(windows)]
            Self::Handle(handle) => handle as i64,
        }
    }
}

/// Translates a raw operating system error number into a stable code.
#[must_use]
pub fn os_error_to_code(raw: i32) -> ErrorCode {
    #[cfg(unix)]
    {
        unix::errno_to_code(raw)
    }
    #[cfg(windows)]
    {
        windows::win32_to_code(raw.cast_unsigned())
    }
}

/// Which direction of readiness to wait for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Direction {
    Read,
    Write,
}

/// Blocks until `source` is ready in `direction` or `timeout` elapses.
///
/// Returns `Ok(false)` on timeout.
pub(crate) fn wait_ready(source: RawSource, direction: Direction, timeout: Option<Duration>) -> Result<bool> {
    #[cfg(unix)]
    {
        unix::wait_ready(source, direction, timeout)
    }
    #[cfg(windows)]
    {
        windows::wait_ready(source, direction, timeout)
    }
}

/// Reads once from `source` at `offset`, or at the position of the handle with `None`.
///
/// # Safety
///
/// `source` must stay open for the duration of the call.
pub(crate) unsafe fn read_source(source: RawSource, buf: &mut [u8], offset: Option<u64>) -> std::io::Result<usize> {
    #[cfg(unix)]
    {
        let RawSource::Fd(fd) = source;
        // SAFETY: The caller keeps the descriptor open.
        let fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
        match offset {
            Some(offset) => unix::read_at(fd, buf, offset),
            None => unix::read(fd, buf),
        }
    }
    #[cfg(windows)]
    {
        // SAFETY: Forwarding the safety requirements of the caller.
        unsafe { windows::read_source(source, buf, offset) }
    }
}

/// Writes once to `source` at `offset`, or at the position of the handle with `None`. A
/// closed peer is reported as an error rather than a signal.
///
/// # Safety
///
/// `source` must stay open for the duration of the call.
pub(crate) unsafe fn write_source(source: RawSource, buf: &[u8], offset: Option<u64>) -> std::io::Result<usize> {
    #[cfg(unix)]
    {
        let RawSource::Fd(fd) = source;
        // SAFETY: The caller keeps the descriptor open.
        let fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
        match offset {
            Some(offset) => unix::write_at(fd, buf, offset),
            None => unix::write_no_sigpipe(fd, buf),
        }
    }
    #[cfg(windows)]
    {
        // SAFETY: Forwarding the safety requirements of the caller.
        unsafe { windows::write_source(source, buf, offset) }
    }
}

/// Converts a timeout to whole milliseconds for poll-style APIs, rounding up so short timeouts
/// never become busy loops. `None` maps to `-1`.
pub(crate) fn timeout_millis(timeout: Option<Duration>) -> i32 {
    timeout.map_or(-1, |timeout| {
        let millis = timeout.as_nanos().div_ceil(1_000_000);
        i32::try_from(millis).unwrap_or(i32::MAX)
    })
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_rounds_up() {
        assert_eq!(timeout_millis(None), -1);
        assert_eq!(timeout_millis(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_millis(Some(Duration::from_micros(1))), 1);
        assert_eq!(timeout_millis(Some(Duration::from_millis(1500))), 1500);
        assert_eq!(timeout_millis(Some(Duration::from_secs(u64::MAX))), i32::MAX);
    }
}
