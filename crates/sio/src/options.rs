// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::{Error, ErrorCode, Result};

/// Identifies a stream option.
///
/// Identifiers are grouped into numeric families:
///
/// | Range     | Family                                        |
/// |-----------|-----------------------------------------------|
/// | 0-99      | generic options understood by every stream    |
/// | 100-199   | file options                                  |
/// | 200-299   | socket options                                |
/// | 300-349   | timer options                                 |
/// | 400-449   | terminal options                              |
/// | 450-499   | message queue options                         |
/// | 1000+     | read-only information about the stream        |
///
/// The numeric values are part of the public contract and never change.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OptionId(u32);

impl OptionId {
    /// Blocking-operation timeout applied by the library ([`OptionValue::Duration`]).
    pub const TIMEOUT: Self = Self(1);
    /// Preferred transfer size hint ([`OptionValue::Int`]).
    pub const BUFFER_SIZE: Self = Self(2);
    /// Whether operations block ([`OptionValue::Bool`]).
    pub const BLOCKING: Self = Self(3);
    /// Whether the handle is closed in child processes ([`OptionValue::Bool`]).
    pub const CLOEXEC: Self = Self(4);
    /// Whether the handle is released when the stream closes ([`OptionValue::Bool`]).
    pub const AUTOCLOSE: Self = Self(5);

    /// Whether the file was opened for appending.
    pub const FILE_APPEND: Self = Self(100);
    /// Whether flushing syncs data only (`true`) or data and metadata (`false`).
    pub const FILE_SYNC: Self = Self(101);
    /// The path the file was opened with ([`OptionValue::Path`]).
    pub const FILE_PATH: Self = Self(102);

    /// `TCP_NODELAY`.
    pub const TCP_NODELAY: Self = Self(200);
    /// `SO_KEEPALIVE`.
    pub const SO_KEEPALIVE: Self = Self(201);
    /// `SO_REUSEADDR`.
    pub const SO_REUSEADDR: Self = Self(202);
    /// `SO_BROADCAST`.
    pub const SO_BROADCAST: Self = Self(203);
    /// `SO_RCVBUF`.
    pub const SO_RCVBUF: Self = Self(204);
    /// `SO_SNDBUF`.
    pub const SO_SNDBUF: Self = Self(205);
    /// `SO_LINGER` ([`OptionValue::Duration`], `None` disables lingering).
    pub const SO_LINGER: Self = Self(206);
    /// `SO_OOBINLINE`.
    pub const SO_OOBINLINE: Self = Self(207);
    /// `SO_DONTROUTE`.
    pub const SO_DONTROUTE: Self = Self(208);
    /// `SO_RCVTIMEO`.
    pub const SO_RCVTIMEO: Self = Self(209);
    /// `SO_SNDTIMEO`.
    pub const SO_SNDTIMEO: Self = Self(210);
    /// `SO_RCVLOWAT`.
    pub const SO_RCVLOWAT: Self = Self(211);
    /// `SO_SNDLOWAT`.
    pub const SO_SNDLOWAT: Self = Self(212);
    /// `SO_ERROR`; reading it clears the pending error.
    pub const SOCKET_ERROR: Self = Self(213);
    /// The local address ([`OptionValue::Addr`]).
    pub const LOCAL_ADDR: Self = Self(214);
    /// The local port.
    pub const LOCAL_PORT: Self = Self(215);
    /// The peer address ([`OptionValue::Addr`]).
    pub const PEER_ADDR: Self = Self(216);
    /// The peer port.
    pub const PEER_PORT: Self = Self(217);

    /// The timer period ([`OptionValue::Duration`]).
    pub const TIMER_INTERVAL: Self = Self(300);
    /// The delay until the first expiration ([`OptionValue::Duration`]).
    pub const TIMER_INITIAL: Self = Self(301);

    /// Raw input mode.
    pub const TERMINAL_RAW: Self = Self(400);
    /// Line-buffered input mode.
    pub const TERMINAL_CANONICAL: Self = Self(401);
    /// Local echo of input.
    pub const TERMINAL_ECHO: Self = Self(402);
    /// Whether color escape sequences are interpreted.
    pub const TERMINAL_COLOR: Self = Self(403);
    /// Number of rows.
    pub const TERMINAL_ROWS: Self = Self(404);
    /// Number of columns.
    pub const TERMINAL_COLUMNS: Self = Self(405);
    /// Whether the handle refers to a terminal.
    pub const TERMINAL_IS_TTY: Self = Self(406);

    /// Maximum number of queued messages.
    pub const MSGQ_MAX_MESSAGES: Self = Self(450);
    /// Maximum size of one message.
    pub const MSGQ_MESSAGE_SIZE: Self = Self(451);
    /// Number of messages currently queued.
    pub const MSGQ_CURRENT_MESSAGES: Self = Self(452);
    /// Priority attached to sent messages.
    pub const MSGQ_PRIORITY: Self = Self(453);

    /// The [`StreamKind`][1] as its numeric value.
    ///
    /// [1]: crate::StreamKind
    pub const TYPE: Self = Self(1000);
    /// The [`StreamFlags`][1] bits.
    ///
    /// [1]: crate::StreamFlags
    pub const FLAGS: Self = Self(1001);
    /// The current position.
    pub const POSITION: Self = Self(1002);
    /// The current size.
    pub const SIZE: Self = Self(1003);
    /// Whether reads are permitted.
    pub const READABLE: Self = Self(1004);
    /// Whether writes are permitted.
    pub const WRITABLE: Self = Self(1005);
    /// Whether the stream supports seeking.
    pub const SEEKABLE: Self = Self(1006);
    /// Whether a read reached the end of the stream.
    pub const EOF: Self = Self(1007);
    /// The code of the last failed operation, or 0.
    pub const LAST_ERROR: Self = Self(1008);
    /// The native descriptor or handle value, or -1.
    pub const NATIVE_HANDLE: Self = Self(1009);
    /// The preferred transfer size hint.
    pub const BUFFER_SIZE_INFO: Self = Self(1010);

    /// Wraps a numeric option identifier.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The stable numeric value.
    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Whether this is a generic option understood by every stream.
    #[must_use]
    pub const fn is_generic(self) -> bool {
        self.0 < 100
    }

    /// Whether this is a read-only information option.
    #[must_use]
    pub const fn is_info(self) -> bool {
        self.0 >= 1000
    }
}

impl fmt::Debug for OptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OptionId({})", self.0)
    }
}

/// The value of a stream option.
///
/// Setters are lenient about representation: a boolean option accepts [`OptionValue::Int`]
/// (non-zero is `true`) and an integer option accepts [`OptionValue::Bool`].
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum OptionValue {
    /// A flag.
    Bool(bool),
    /// An integer of any platform width, widened to 64 bits.
    Int(i64),
    /// A duration; `None` means "none" or "infinite" depending on the option.
    Duration(Option<Duration>),
    /// A socket address.
    Addr(SocketAddr),
    /// A file system path.
    Path(PathBuf),
}

impl OptionValue {
    /// Interprets the value as a flag.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::InvalidArgument`] for values that are neither flags nor integers.
    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Self::Bool(value) => Ok(*value),
            Self::Int(value) => Ok(*value != 0),
            _ => Err(Error::invalid_argument()),
        }
    }

    /// Interprets the value as an integer.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::InvalidArgument`] for values that are neither flags nor integers.
    pub fn as_int(&self) -> Result<i64> {
        match self {
            Self::Int(value) => Ok(*value),
            Self::Bool(value) => Ok(i64::from(*value)),
            _ => Err(Error::invalid_argument()),
        }
    }

    /// Interprets the value as an unsigned size.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::InvalidArgument`] for negative or non-integer values.
    pub fn as_usize(&self) -> Result<usize> {
        usize::try_from(self.as_int()?).map_err(|_negative| Error::invalid_argument())
    }

    /// Interprets the value as a duration. Integers are taken as milliseconds, with 0 meaning
    /// `None`.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::InvalidArgument`] for negative or non-duration values.
    pub fn as_duration(&self) -> Result<Option<Duration>> {
        match self {
            Self::Duration(value) => Ok(*value),
            Self::Int(0) => Ok(None),
            Self::Int(millis) => u64::try_from(*millis)
                .map(|millis| Some(Duration::from_millis(millis)))
                .map_err(|_negative| Error::invalid_argument()),
            _ => Err(Error::invalid_argument()),
        }
    }

    /// Encodes the value into `target` in its native byte representation and returns the
    /// number of bytes written.
    ///
    /// Flags are written as a native-endian `i32`, integers as `i64`, durations as `u64`
    /// milliseconds (0 for `None`), and addresses and paths as their UTF-8 text.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::BufferTooSmall`] if `target` cannot hold the encoding.
    pub fn encode(&self, target: &mut [u8]) -> Result<usize> {
        let text;
        let bytes: &[u8] = match self {
            Self::Bool(value) => &i32::from(*value).to_ne_bytes(),
            Self::Int(value) => &value.to_ne_bytes(),
            Self::Duration(value) => {
                let millis = value.map_or(0, |duration| u64::try_from(duration.as_millis()).unwrap_or(u64::MAX));
                &millis.to_ne_bytes()
            }
            Self::Addr(addr) => {
                text = addr.to_string();
                text.as_bytes()
            }
            Self::Path(path) => {
                text = path.to_string_lossy().into_owned();
                text.as_bytes()
            }
        };

        let destination = target.get_mut(..bytes.len()).ok_or(ErrorCode::BufferTooSmall)?;
        destination.copy_from_slice(bytes);
        Ok(bytes.len())
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for OptionValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<usize> for OptionValue {
    fn from(value: usize) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<Duration> for OptionValue {
    fn from(value: Duration) -> Self {
        Self::Duration(Some(value))
    }
}

impl From<Option<Duration>> for OptionValue {
    fn from(value: Option<Duration>) -> Self {
        Self::Duration(value)
    }
}

impl From<SocketAddr> for OptionValue {
    fn from(value: SocketAddr) -> Self {
        Self::Addr(value)
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn families() {
        assert!(OptionId::TIMEOUT.is_generic());
        assert!(!OptionId::TCP_NODELAY.is_generic());
        assert!(OptionId::TYPE.is_info());
        assert!(OptionId::BUFFER_SIZE_INFO.is_info());
        assert!(!OptionId::MSGQ_PRIORITY.is_info());
    }

    #[test]
    fn identifiers_are_stable() {
        assert_eq!(OptionId::TIMEOUT.as_raw(), 1);
        assert_eq!(OptionId::FILE_APPEND.as_raw(), 100);
        assert_eq!(OptionId::TCP_NODELAY.as_raw(), 200);
        assert_eq!(OptionId::TIMER_INTERVAL.as_raw(), 300);
        assert_eq!(OptionId::TERMINAL_RAW.as_raw(), 400);
        assert_eq!(OptionId::MSGQ_MAX_MESSAGES.as_raw(), 450);
        assert_eq!(OptionId::TYPE.as_raw(), 1000);
        assert_eq!(OptionId::from_raw(215), OptionId::LOCAL_PORT);
    }

    #[test]
    fn bool_and_int_are_interchangeable() {
        assert!(OptionValue::Int(5).as_bool().unwrap());
        assert!(!OptionValue::Int(0).as_bool().unwrap());
        assert_eq!(OptionValue::Bool(true).as_int().unwrap(), 1);
        OptionValue::Addr("127.0.0.1:1".parse().unwrap()).as_bool().unwrap_err();
    }

    #[test]
    fn durations_from_millis() {
        assert_eq!(OptionValue::Int(250).as_duration().unwrap(), Some(Duration::from_millis(250)));
        assert_eq!(OptionValue::Int(0).as_duration().unwrap(), None);
        OptionValue::Int(-1).as_duration().unwrap_err();
        OptionValue::Int(-1).as_usize().unwrap_err();
    }

    #[test]
    fn encode_widths() {
        let mut target = [0_u8; 16];

        assert_eq!(OptionValue::Bool(true).encode(&mut target).unwrap(), 4);
        assert_eq!(&target[..4], &1_i32.to_ne_bytes());

        assert_eq!(OptionValue::Int(-2).encode(&mut target).unwrap(), 8);
        assert_eq!(&target[..8], &(-2_i64).to_ne_bytes());

        assert_eq!(OptionValue::Duration(Some(Duration::from_secs(2))).encode(&mut target).unwrap(), 8);
        assert_eq!(&target[..8], &2000_u64.to_ne_bytes());
    }

    #[test]
    fn encode_reports_short_target() {
        let mut target = [0_u8; 3];

        let error = OptionValue::Bool(true).encode(&mut target).unwrap_err();

        assert_eq!(error.code(), ErrorCode::BufferTooSmall);
    }

    #[test]
    fn encode_address_as_text() {
        let mut target = [0_u8; 32];
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();

        let len = OptionValue::Addr(addr).encode(&mut target).unwrap();

        assert_eq!(&target[..len], b"127.0.0.1:8080");
    }
}
