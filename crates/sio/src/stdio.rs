// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Process-wide streams over the standard handles.

use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::{OptionId, Stream, StreamFlags};

static STDIN: OnceLock<Mutex<Stream>> = OnceLock::new();
static STDOUT: OnceLock<Mutex<Stream>> = OnceLock::new();
static STDERR: OnceLock<Mutex<Stream>> = OnceLock::new();

/// The standard input of the process as a file stream.
///
/// Created on first use and shared by every caller. Auto-close is disabled, so closing the
/// stream leaves the process handle open.
pub fn stdin() -> &'static Mutex<Stream> {
    STDIN.get_or_init(|| Mutex::new(standard(Handle::Input, StreamFlags::READ)))
}

/// The standard output of the process as a file stream.
///
/// Writes bypass the buffering of [`std::io::stdout()`]; mixing both may interleave output.
///
/// # Example
///
/// ```
/// sio::stdout().lock().write(b"hello\n")?;
/// # Ok::<(), sio::Error>(())
/// ```
pub fn stdout() -> &'static Mutex<Stream> {
    STDOUT.get_or_init(|| Mutex::new(standard(Handle::Output, StreamFlags::WRITE)))
}

/// The standard error of the process as a file stream.
pub fn stderr() -> &'static Mutex<Stream> {
    STDERR.get_or_init(|| Mutex::new(standard(Handle::Error, StreamFlags::WRITE)))
}

#[derive(Clone, Copy)]
enum Handle {
    Input,
    Output,
    Error,
}

fn standard(handle: Handle, flags: StreamFlags) -> Stream {
    let mut stream = adopt(handle, flags);

    // Generic options are answered by the stream itself and cannot fail on an open stream.
    let _ = stream.set_option(OptionId::AUTOCLOSE, false);
    stream
}

#[cfg(unix)]
fn adopt(handle: Handle, flags: StreamFlags) -> Stream {
    use std::fs::File;
    use std::os::fd::FromRawFd;

    let fd = match handle {
        Handle::Input => libc::STDIN_FILENO,
        Handle::Output => libc::STDOUT_FILENO,
        Handle::Error => libc::STDERR_FILENO,
    };

    // SAFETY: The standard descriptors belong to the process for its whole life. The stream
    // never closes them because auto-close is disabled before anyone can reach it.
    let file = unsafe { File::from_raw_fd(fd) };
    Stream::from_file(file, flags)
}

#[cfg(windows)]
fn adopt(handle: Handle, flags: StreamFlags) -> Stream {
    use std::fs::File;
    use std::os::windows::io::{AsRawHandle, FromRawHandle};

    use crate::StreamKind;
    use crate::drivers::{FileDriver, Native};

    let raw = match handle {
        Handle::Input => std::io::stdin().as_raw_handle(),
        Handle::Output => std::io::stdout().as_raw_handle(),
        Handle::Error => std::io::stderr().as_raw_handle(),
    };

    if raw.is_null() {
        return Stream::from_native(StreamKind::File, flags, Native::File(FileDriver::detached(flags)));
    }

    // SAFETY: The standard handles belong to the process for its whole life. The stream never
    // closes them because auto-close is disabled before anyone can reach it.
    let file = unsafe { File::from_raw_handle(raw) };
    Stream::from_file(file, flags)
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OptionValue, StreamKind};

    #[test]
    fn standard_streams_are_shared_files() {
        let first = stdout().lock().id();
        let second = stdout().lock().id();

        assert_eq!(first, second);
        assert_eq!(stdout().lock().kind(), StreamKind::File);
        assert!(stdin().lock().flags().readable());
        assert!(stderr().lock().flags().writable());
    }

    #[test]
    fn autoclose_is_disabled() {
        let mut stream = stderr().lock();

        assert_eq!(stream.get_option(OptionId::AUTOCLOSE).unwrap(), OptionValue::Bool(false));
    }
}
