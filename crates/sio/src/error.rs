// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::io;

use thiserror::Error;

/// Stable numeric error codes reported by every `sio` operation.
///
/// Codes are negative and grouped into ranges: general failures from -1 to -19, file and I/O
/// failures from -20 to -39, network failures from -40 to -59, threading from -60 to -69,
/// security from -70 to -79, process management from -80 to -89 and system failures from -90
/// to -99. Success is not an error and has no variant; its raw value is 0.
///
/// The numeric values are part of the public contract and never change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
#[non_exhaustive]
pub enum ErrorCode {
    /// An error that fits no other code.
    Unknown = -1,
    /// An argument was invalid.
    InvalidArgument = -2,
    /// Memory could not be allocated.
    OutOfMemory = -3,
    /// The target does not exist.
    NotFound = -4,
    /// The target already exists.
    AlreadyExists = -5,
    /// The caller lacks permission.
    PermissionDenied = -6,
    /// The operation is not supported by this stream kind or platform.
    Unsupported = -7,
    /// The resource is in use.
    Busy = -8,
    /// The operation did not finish in time.
    Timeout = -9,
    /// The operation was interrupted.
    Interrupted = -10,
    /// A non-blocking operation could not make progress.
    WouldBlock = -11,
    /// A caller-supplied buffer was too small.
    BufferTooSmall = -12,
    /// A resource limit was reached.
    LimitReached = -13,
    /// The object is not in a state that allows the operation.
    InvalidState = -14,
    /// The operation was cancelled.
    Cancelled = -15,
    /// The library was not initialized.
    NotInitialized = -16,

    /// A generic input/output failure.
    Io = -20,
    /// The end of the stream was reached.
    EndOfStream = -21,
    /// The path refers to a directory.
    IsDirectory = -22,
    /// A path component is not a directory.
    NotDirectory = -23,
    /// The target is read-only.
    ReadOnly = -24,
    /// The file or value is too large.
    TooLarge = -25,
    /// The device has no space left.
    NoSpace = -26,
    /// A name exceeds the platform limit.
    NameTooLong = -27,
    /// The handle is closed or invalid.
    BadHandle = -28,
    /// The stream does not support seeking.
    NotSeekable = -29,
    /// The other end of a pipe or connection is gone.
    BrokenPipe = -30,
    /// The region is locked by another owner.
    Locked = -31,

    /// A generic network failure.
    Network = -40,
    /// The peer refused the connection.
    ConnectionRefused = -41,
    /// The peer reset the connection.
    ConnectionReset = -42,
    /// The connection was aborted locally.
    ConnectionAborted = -43,
    /// The network is unreachable.
    NetworkUnreachable = -44,
    /// The host is unreachable.
    HostUnreachable = -45,
    /// The address is already in use.
    AddressInUse = -46,
    /// The address is not available on this host.
    AddressNotAvailable = -47,
    /// A connection attempt is in progress.
    InProgress = -48,
    /// The socket is not connected.
    NotConnected = -49,
    /// The socket is already connected.
    AlreadyConnected = -50,
    /// The message exceeds the transport limit.
    MessageTooLarge = -51,

    /// A generic threading failure.
    Thread = -60,
    /// Waiting would deadlock.
    Deadlock = -61,

    /// A generic security failure.
    Security = -70,

    /// A generic process failure.
    Process = -80,
    /// The target process does not exist.
    NoSuchProcess = -81,

    /// A generic operating system failure.
    System = -90,
}

const ALL_CODES: [ErrorCode; 46] = [
    ErrorCode::Unknown,
    ErrorCode::InvalidArgument,
    ErrorCode::OutOfMemory,
    ErrorCode::NotFound,
    ErrorCode::AlreadyExists,
    ErrorCode::PermissionDenied,
    ErrorCode::Unsupported,
    ErrorCode::Busy,
    ErrorCode::Timeout,
    ErrorCode::Interrupted,
    ErrorCode::WouldBlock,
    ErrorCode::BufferTooSmall,
    ErrorCode::LimitReached,
    ErrorCode::InvalidState,
    ErrorCode::Cancelled,
    ErrorCode::NotInitialized,
    ErrorCode::Io,
    ErrorCode::EndOfStream,
    ErrorCode::IsDirectory,
    ErrorCode::NotDirectory,
    ErrorCode::ReadOnly,
    ErrorCode::TooLarge,
    ErrorCode::NoSpace,
    ErrorCode::NameTooLong,
    ErrorCode::BadHandle,
    ErrorCode::NotSeekable,
    ErrorCode::BrokenPipe,
    ErrorCode::Locked,
    ErrorCode::Network,
    ErrorCode::ConnectionRefused,
    ErrorCode::ConnectionReset,
    ErrorCode::ConnectionAborted,
    ErrorCode::NetworkUnreachable,
    ErrorCode::HostUnreachable,
    ErrorCode::AddressInUse,
    ErrorCode::AddressNotAvailable,
    ErrorCode::InProgress,
    ErrorCode::NotConnected,
    ErrorCode::AlreadyConnected,
    ErrorCode::MessageTooLarge,
    ErrorCode::Thread,
    ErrorCode::Deadlock,
    ErrorCode::Security,
    ErrorCode::Process,
    ErrorCode::NoSuchProcess,
    ErrorCode::System,
];

impl ErrorCode {
    /// The stable numeric value.
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        self as i32
    }

    /// Looks up the code with the given numeric value.
    #[must_use]
    pub fn from_raw(raw: i32) -> Option<Self> {
        ALL_CODES.into_iter().find(|code| code.as_raw() == raw)
    }

    /// A short human-readable description.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Unknown => "unknown error",
            Self::InvalidArgument => "invalid argument",
            Self::OutOfMemory => "out of memory",
            Self::NotFound => "not found",
            Self::AlreadyExists => "already exists",
            Self::PermissionDenied => "permission denied",
            Self::Unsupported => "operation not supported",
            Self::Busy => "resource busy",
            Self::Timeout => "operation timed out",
            Self::Interrupted => "operation interrupted",
            Self::WouldBlock => "operation would block",
            Self::BufferTooSmall => "buffer too small",
            Self::LimitReached => "limit reached",
            Self::InvalidState => "invalid state",
            Self::Cancelled => "operation cancelled",
            Self::NotInitialized => "library not initialized",
            Self::Io => "input/output error",
            Self::EndOfStream => "end of stream",
            Self::IsDirectory => "is a directory",
            Self::NotDirectory => "not a directory",
            Self::ReadOnly => "read-only",
            Self::TooLarge => "too large",
            Self::NoSpace => "no space left on device",
            Self::NameTooLong => "name too long",
            Self::BadHandle => "bad handle",
            Self::NotSeekable => "stream is not seekable",
            Self::BrokenPipe => "broken pipe",
            Self::Locked => "resource locked",
            Self::Network => "network error",
            Self::ConnectionRefused => "connection refused",
            Self::ConnectionReset => "connection reset",
            Self::ConnectionAborted => "connection aborted",
            Self::NetworkUnreachable => "network unreachable",
            Self::HostUnreachable => "host unreachable",
            Self::AddressInUse => "address in use",
            Self::AddressNotAvailable => "address not available",
            Self::InProgress => "operation in progress",
            Self::NotConnected => "not connected",
            Self::AlreadyConnected => "already connected",
            Self::MessageTooLarge => "message too large",
            Self::Thread => "thread error",
            Self::Deadlock => "deadlock would occur",
            Self::Security => "security error",
            Self::Process => "process error",
            Self::NoSuchProcess => "no such process",
            Self::System => "system error",
        }
    }

    /// The closest standard library error kind.
    #[must_use]
    pub const fn io_kind(self) -> io::ErrorKind {
        match self {
            Self::InvalidArgument | Self::BufferTooSmall => io::ErrorKind::InvalidInput,
            Self::OutOfMemory => io::ErrorKind::OutOfMemory,
            Self::NotFound | Self::NoSuchProcess => io::ErrorKind::NotFound,
            Self::AlreadyExists => io::ErrorKind::AlreadyExists,
            Self::PermissionDenied | Self::Security => io::ErrorKind::PermissionDenied,
            Self::Unsupported | Self::NotSeekable => io::ErrorKind::Unsupported,
            Self::Busy | Self::Locked => io::ErrorKind::ResourceBusy,
            Self::Timeout => io::ErrorKind::TimedOut,
            Self::Interrupted => io::ErrorKind::Interrupted,
            Self::WouldBlock | Self::InProgress => io::ErrorKind::WouldBlock,
            Self::EndOfStream => io::ErrorKind::UnexpectedEof,
            Self::IsDirectory => io::ErrorKind::IsADirectory,
            Self::NotDirectory => io::ErrorKind::NotADirectory,
            Self::ReadOnly => io::ErrorKind::ReadOnlyFilesystem,
            Self::TooLarge => io::ErrorKind::FileTooLarge,
            Self::NoSpace => io::ErrorKind::StorageFull,
            Self::NameTooLong => io::ErrorKind::InvalidFilename,
            Self::BrokenPipe => io::ErrorKind::BrokenPipe,
            Self::ConnectionRefused => io::ErrorKind::ConnectionRefused,
            Self::ConnectionReset => io::ErrorKind::ConnectionReset,
            Self::ConnectionAborted => io::ErrorKind::ConnectionAborted,
            Self::NetworkUnreachable => io::ErrorKind::NetworkUnreachable,
            Self::HostUnreachable => io::ErrorKind::HostUnreachable,
            Self::AddressInUse => io::ErrorKind::AddrInUse,
            Self::AddressNotAvailable => io::ErrorKind::AddrNotAvailable,
            Self::NotConnected => io::ErrorKind::NotConnected,
            Self::Deadlock => io::ErrorKind::Deadlock,
            _ => io::ErrorKind::Other,
        }
    }

    fn from_io_kind(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused,
            io::ErrorKind::ConnectionReset => Self::ConnectionReset,
            io::ErrorKind::HostUnreachable => Self::HostUnreachable,
            io::ErrorKind::NetworkUnreachable => Self::NetworkUnreachable,
            io::ErrorKind::ConnectionAborted => Self::ConnectionAborted,
            io::ErrorKind::NotConnected => Self::NotConnected,
            io::ErrorKind::AddrInUse => Self::AddressInUse,
            io::ErrorKind::AddrNotAvailable => Self::AddressNotAvailable,
            io::ErrorKind::BrokenPipe => Self::BrokenPipe,
            io::ErrorKind::AlreadyExists => Self::AlreadyExists,
            io::ErrorKind::WouldBlock => Self::WouldBlock,
            io::ErrorKind::NotADirectory => Self::NotDirectory,
            io::ErrorKind::IsADirectory => Self::IsDirectory,
            io::ErrorKind::ReadOnlyFilesystem => Self::ReadOnly,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => Self::InvalidArgument,
            io::ErrorKind::TimedOut => Self::Timeout,
            io::ErrorKind::StorageFull => Self::NoSpace,
            io::ErrorKind::FileTooLarge => Self::TooLarge,
            io::ErrorKind::ResourceBusy => Self::Busy,
            io::ErrorKind::Deadlock => Self::Deadlock,
            io::ErrorKind::InvalidFilename => Self::NameTooLong,
            io::ErrorKind::Interrupted => Self::Interrupted,
            io::ErrorKind::Unsupported => Self::Unsupported,
            io::ErrorKind::UnexpectedEof => Self::EndOfStream,
            io::ErrorKind::OutOfMemory => Self::OutOfMemory,
            _ => Self::Io,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl From<ErrorCode> for i32 {
    fn from(value: ErrorCode) -> Self {
        value.as_raw()
    }
}

/// An error returned by a `sio` operation.
///
/// Every error carries a stable [`ErrorCode`], available via [`Error::code()`]. Errors that
/// originate from the operating system also keep the original `std::io::Error` as their source.
///
/// # Thread safety
///
/// This type is thread-safe.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A failure detected by the library itself.
    #[error("{0}")]
    Code(ErrorCode),

    /// A failure reported by the operating system.
    #[error("{code}: {source}")]
    Os {
        /// The translated code.
        code: ErrorCode,
        /// The original error.
        #[source]
        source: io::Error,
    },

    /// A failure reported by a byte buffer or buffer pool.
    #[error(transparent)]
    Buffer(#[from] sio_buf::Error),
}

/// A specialized `Result` for `sio` operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The stable code of this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Code(code) | Self::Os { code, .. } => *code,
            Self::Buffer(error) => buffer_error_code(error),
        }
    }

    /// The raw platform error number, if the error came from the operating system.
    #[must_use]
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Os { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    /// Whether a non-blocking operation could not make progress.
    #[must_use]
    pub fn is_would_block(&self) -> bool {
        self.code() == ErrorCode::WouldBlock
    }

    /// Builds an error from the calling thread's last operating system error.
    #[must_use]
    pub fn last_os_error() -> Self {
        io::Error::last_os_error().into()
    }

    pub(crate) const fn unsupported() -> Self {
        Self::Code(ErrorCode::Unsupported)
    }

    pub(crate) const fn invalid_argument() -> Self {
        Self::Code(ErrorCode::InvalidArgument)
    }
}

impl From<ErrorCode> for Error {
    fn from(value: ErrorCode) -> Self {
        Self::Code(value)
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        let code = value
            .raw_os_error()
            .map_or_else(|| ErrorCode::from_io_kind(value.kind()), crate::pal::os_error_to_code);

        Self::Os { code, source: value }
    }
}

/// Represents a `sio` error as a standard I/O error, for interoperability with code that
/// expects standard I/O errors.
impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Os { source, .. } => source,
            Error::Buffer(sio_buf::Error::Io(error)) => error,
            other => Self::new(other.code().io_kind(), other),
        }
    }
}

fn buffer_error_code(error: &sio_buf::Error) -> ErrorCode {
    match error {
        sio_buf::Error::ReadOnly => ErrorCode::ReadOnly,
        sio_buf::Error::CapacityExceeded { .. } => ErrorCode::LimitReached,
        sio_buf::Error::CapacityOverflow => ErrorCode::TooLarge,
        sio_buf::Error::OutOfMemory(_) => ErrorCode::OutOfMemory,
        sio_buf::Error::Busy => ErrorCode::Busy,
        sio_buf::Error::Io(error) => error
            .raw_os_error()
            .map_or_else(|| ErrorCode::from_io_kind(error.kind()), crate::pal::os_error_to_code),
        _ => ErrorCode::InvalidArgument,
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, std::error::Error);
    assert_impl_all!(ErrorCode: Send, Sync, Copy);

    #[test]
    fn codes_are_stable() {
        assert_eq!(ErrorCode::Unknown.as_raw(), -1);
        assert_eq!(ErrorCode::NotInitialized.as_raw(), -16);
        assert_eq!(ErrorCode::Io.as_raw(), -20);
        assert_eq!(ErrorCode::Locked.as_raw(), -31);
        assert_eq!(ErrorCode::Network.as_raw(), -40);
        assert_eq!(ErrorCode::MessageTooLarge.as_raw(), -51);
        assert_eq!(ErrorCode::Thread.as_raw(), -60);
        assert_eq!(ErrorCode::Security.as_raw(), -70);
        assert_eq!(ErrorCode::Process.as_raw(), -80);
        assert_eq!(ErrorCode::System.as_raw(), -90);
    }

    #[test]
    fn from_raw_round_trips_every_code() {
        for code in ALL_CODES {
            assert_eq!(ErrorCode::from_raw(code.as_raw()), Some(code));
            assert!(!code.description().is_empty());
        }

        assert_eq!(ErrorCode::from_raw(0), None);
        assert_eq!(ErrorCode::from_raw(-100), None);
    }

    #[test]
    fn codes_fall_in_their_ranges() {
        for code in ALL_CODES {
            assert!((-99..=-1).contains(&code.as_raw()), "{code:?}");
        }
    }

    #[test]
    fn display_uses_description() {
        assert_eq!(Error::from(ErrorCode::WouldBlock).to_string(), "operation would block");
    }

    #[test]
    fn io_error_without_os_code_uses_kind() {
        let error = Error::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));

        assert_eq!(error.code(), ErrorCode::BrokenPipe);
        assert_eq!(error.raw_os_error(), None);
    }

    #[test]
    fn os_error_keeps_source() {
        #[cfg(unix)]
        let raw = libc::ENOENT;
        #[cfg(windows)]
        let raw = 2; // ERROR_FILE_NOT_FOUND

        let error = Error::from(io::Error::from_raw_os_error(raw));

        assert_eq!(error.code(), ErrorCode::NotFound);
        assert_eq!(error.raw_os_error(), Some(raw));

        let back: io::Error = error.into();
        assert_eq!(back.raw_os_error(), Some(raw));
    }

    #[test]
    fn buffer_errors_translate() {
        assert_eq!(Error::from(sio_buf::Error::ReadOnly).code(), ErrorCode::ReadOnly);
        assert_eq!(Error::from(sio_buf::Error::Busy).code(), ErrorCode::Busy);
        assert_eq!(Error::from(sio_buf::Error::NotFromPool).code(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn code_errors_become_io_errors_of_matching_kind() {
        let error: io::Error = Error::from(ErrorCode::Timeout).into();

        assert_eq!(error.kind(), io::ErrorKind::TimedOut);
    }
}
