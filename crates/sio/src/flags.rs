// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;

use bitflags::bitflags;

bitflags! {
    /// Properties of a stream, fixed when it is opened.
    ///
    /// The bit positions are part of the public contract and never change.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct StreamFlags: u32 {
        /// The stream can be read from.
        const READ = 1 << 0;
        /// The stream can be written to.
        const WRITE = 1 << 1;
        /// The stream can be read from and written to.
        const RDWR = Self::READ.bits() | Self::WRITE.bits();
        /// Create the target if it does not exist.
        const CREATE = 1 << 2;
        /// With `CREATE`, fail if the target already exists.
        const EXCL = 1 << 3;
        /// Discard existing contents when opening.
        const TRUNC = 1 << 4;
        /// Every write appends to the end.
        const APPEND = 1 << 5;
        /// Operations return `WouldBlock` instead of waiting.
        const NONBLOCK = 1 << 6;
        /// The stream is intended for use with completion-based I/O.
        const ASYNC = 1 << 7;
        /// Bypass user-space buffering.
        const UNBUFFERED = 1 << 8;
        /// Every write reaches stable storage before returning.
        const SYNC = 1 << 9;
        /// The target is temporary and disappears when the stream closes.
        const TEMP = 1 << 10;
        /// No newline translation (the default everywhere except legacy text modes).
        const BINARY = 1 << 11;
        /// Access the file through a memory mapping.
        const MMAP = 1 << 12;
        /// Bypass the operating system cache.
        const DIRECT = 1 << 13;
        /// The endpoint listens or binds instead of connecting.
        const SERVER = 1 << 14;
    }
}

bitflags! {
    /// Per-call modifiers for reads and writes.
    ///
    /// The bit positions are part of the public contract and never change.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct IoFlags: u32 {
        /// Keep transferring until the request is satisfied, the source ends or an error occurs.
        const DOALL = 1 << 0;
        /// Like `DOALL`, but give up at the first would-block.
        const DOALL_NONBLOCK = 1 << 1;
        /// Confirm the link layer is reachable (`MSG_CONFIRM`).
        const CONFIRM = 1 << 8;
        /// Bypass routing (`MSG_DONTROUTE`).
        const DONTROUTE = 1 << 9;
        /// Do not block for this call only (`MSG_DONTWAIT`).
        const DONTWAIT = 1 << 10;
        /// Terminate a record (`MSG_EOR`).
        const EOR = 1 << 11;
        /// More data follows (`MSG_MORE`).
        const MORE = 1 << 12;
        /// Do not raise `SIGPIPE` (`MSG_NOSIGNAL`).
        const NOSIGNAL = 1 << 13;
        /// Out-of-band data (`MSG_OOB`).
        const OOB = 1 << 14;
        /// Send data with the connection request (`MSG_FASTOPEN`).
        const FASTOPEN = 1 << 15;
    }
}

impl StreamFlags {
    /// Whether reads are permitted.
    #[must_use]
    pub const fn readable(self) -> bool {
        self.contains(Self::READ)
    }

    /// Whether writes are permitted.
    #[must_use]
    pub const fn writable(self) -> bool {
        self.contains(Self::WRITE)
    }

    /// Whether operations must not block.
    #[must_use]
    pub const fn nonblocking(self) -> bool {
        self.contains(Self::NONBLOCK)
    }
}

impl IoFlags {
    /// Whether the call should loop until the request is satisfied.
    #[must_use]
    pub const fn loops(self) -> bool {
        self.intersects(Self::DOALL.union(Self::DOALL_NONBLOCK))
    }

    /// The message bits only, without the looping modifiers.
    #[must_use]
    pub const fn message_bits(self) -> Self {
        self.difference(Self::DOALL.union(Self::DOALL_NONBLOCK))
    }
}

/// The kind of endpoint a stream represents.
///
/// The numeric values are part of the public contract and never change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
#[non_exhaustive]
pub enum StreamKind {
    /// A file system file.
    File = 0,
    /// A connection-oriented socket.
    Socket = 1,
    /// A datagram socket with a stored peer.
    Datagram = 2,
    /// One end of an anonymous pipe.
    Pipe = 3,
    /// A periodic or one-shot timer.
    Timer = 4,
    /// A set of signals delivered as records.
    Signal = 5,
    /// A named message queue.
    MsgQueue = 6,
    /// A named shared memory region.
    Shmem = 7,
    /// A [`ByteBuffer`][1], owned or shared.
    ///
    /// [1]: crate::buf::ByteBuffer
    Buffer = 8,
    /// A fixed region of memory.
    Memory = 9,
    /// A terminal device.
    Terminal = 10,
    /// A caller-supplied operation table.
    Custom = 11,
}

impl StreamKind {
    /// The stable numeric value.
    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self as u32
    }

    /// Looks up the kind with the given numeric value.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::File,
            1 => Self::Socket,
            2 => Self::Datagram,
            3 => Self::Pipe,
            4 => Self::Timer,
            5 => Self::Signal,
            6 => Self::MsgQueue,
            7 => Self::Shmem,
            8 => Self::Buffer,
            9 => Self::Memory,
            10 => Self::Terminal,
            11 => Self::Custom,
            _ => return None,
        })
    }

    /// Whether streams of this kind have a position that can be moved.
    #[must_use]
    pub const fn is_seekable(self) -> bool {
        matches!(self, Self::File | Self::Shmem | Self::Buffer | Self::Memory)
    }

    /// Whether each read yields one whole record. A looping read of such a stream returns after
    /// the first record instead of waiting for more.
    #[must_use]
    pub const fn is_record_oriented(self) -> bool {
        matches!(self, Self::Datagram | Self::Timer | Self::Signal | Self::MsgQueue)
    }

    /// A lowercase name for diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Socket => "socket",
            Self::Datagram => "datagram",
            Self::Pipe => "pipe",
            Self::Timer => "timer",
            Self::Signal => "signal",
            Self::MsgQueue => "msgqueue",
            Self::Shmem => "shmem",
            Self::Buffer => "buffer",
            Self::Memory => "memory",
            Self::Terminal => "terminal",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_flag_bits_are_stable() {
        assert_eq!(StreamFlags::READ.bits(), 1);
        assert_eq!(StreamFlags::WRITE.bits(), 2);
        assert_eq!(StreamFlags::RDWR.bits(), 3);
        assert_eq!(StreamFlags::APPEND.bits(), 1 << 5);
        assert_eq!(StreamFlags::NONBLOCK.bits(), 1 << 6);
        assert_eq!(StreamFlags::SERVER.bits(), 1 << 14);
    }

    #[test]
    fn io_flag_bits_are_stable() {
        assert_eq!(IoFlags::DOALL.bits(), 1);
        assert_eq!(IoFlags::DOALL_NONBLOCK.bits(), 2);
        assert_eq!(IoFlags::CONFIRM.bits(), 1 << 8);
        assert_eq!(IoFlags::FASTOPEN.bits(), 1 << 15);
    }

    #[test]
    fn io_flags_split_looping_and_message_bits() {
        let flags = IoFlags::DOALL | IoFlags::NOSIGNAL;

        assert!(flags.loops());
        assert_eq!(flags.message_bits(), IoFlags::NOSIGNAL);
        assert!(!IoFlags::OOB.loops());
    }

    #[test]
    fn access_helpers() {
        assert!(StreamFlags::RDWR.readable());
        assert!(StreamFlags::RDWR.writable());
        assert!(!StreamFlags::READ.writable());
        assert!((StreamFlags::READ | StreamFlags::NONBLOCK).nonblocking());
    }

    #[test]
    fn kinds_round_trip() {
        for raw in 0..12 {
            let kind = StreamKind::from_raw(raw).unwrap();
            assert_eq!(kind.as_raw(), raw);
        }

        assert_eq!(StreamKind::from_raw(12), None);
        assert_eq!(StreamKind::Terminal.to_string(), "terminal");
    }

    #[test]
    fn seekable_kinds() {
        assert!(StreamKind::File.is_seekable());
        assert!(StreamKind::Buffer.is_seekable());
        assert!(!StreamKind::Socket.is_seekable());
        assert!(!StreamKind::Pipe.is_seekable());
        assert!(StreamKind::Timer.is_record_oriented());
        assert!(StreamKind::MsgQueue.is_record_oriented());
        assert!(!StreamKind::Socket.is_record_oriented());
        assert!(!StreamKind::File.is_record_oriented());
    }
}
