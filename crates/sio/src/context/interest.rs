// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use bitflags::bitflags;

bitflags! {
    /// Events a registration asks for, and the events delivered to its callback.
    ///
    /// The bit positions are part of the public contract and never change.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Interest: u32 {
        /// Data can be read without blocking, or the peer closed its side.
        const READABLE = 1 << 0;
        /// Data can be written without blocking.
        const WRITABLE = 1 << 1;
        /// A listening socket has a connection to accept.
        const ACCEPT = 1 << 2;
        /// A connecting socket finished connecting, successfully or not.
        const CONNECT = 1 << 3;
        /// The peer hung up.
        const CLOSE = 1 << 4;
        /// The endpoint reported an error condition.
        const ERROR = 1 << 5;
        /// Nothing happened on the stream for its registration timeout.
        const TIMEOUT = 1 << 6;
        /// A [`Notifier`][crate::Notifier] targeted the registration.
        const CUSTOM = 1 << 7;
    }
}

impl Interest {
    /// Whether the operating system has to watch for read readiness.
    pub(crate) const fn wants_read(self) -> bool {
        self.intersects(Self::READABLE.union(Self::ACCEPT))
    }

    /// Whether the operating system has to watch for write readiness.
    pub(crate) const fn wants_write(self) -> bool {
        self.intersects(Self::WRITABLE.union(Self::CONNECT))
    }

    /// Extends raw readiness reported by a backend with the events it implies: readability
    /// means a connection may be accepted, writability means a connect finished and a hangup
    /// leaves the end of the stream to be read.
    pub(crate) const fn expand(self) -> Self {
        let mut events = self;
        if self.contains(Self::READABLE) {
            events = events.union(Self::ACCEPT);
        }
        if self.contains(Self::WRITABLE) {
            events = events.union(Self::CONNECT);
        }
        if self.contains(Self::CLOSE) {
            events = events.union(Self::READABLE).union(Self::ACCEPT);
        }
        events
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_are_stable() {
        assert_eq!(Interest::READABLE.bits(), 1);
        assert_eq!(Interest::WRITABLE.bits(), 2);
        assert_eq!(Interest::ACCEPT.bits(), 4);
        assert_eq!(Interest::CONNECT.bits(), 8);
        assert_eq!(Interest::CLOSE.bits(), 16);
        assert_eq!(Interest::ERROR.bits(), 32);
        assert_eq!(Interest::TIMEOUT.bits(), 64);
        assert_eq!(Interest::CUSTOM.bits(), 128);
    }

    #[test]
    fn readiness_expansion() {
        assert_eq!(Interest::READABLE.expand(), Interest::READABLE | Interest::ACCEPT);
        assert_eq!(Interest::WRITABLE.expand(), Interest::WRITABLE | Interest::CONNECT);
        assert!(Interest::CLOSE.expand().contains(Interest::READABLE));
        assert_eq!(Interest::ERROR.expand(), Interest::ERROR);
    }

    #[test]
    fn watch_directions() {
        assert!(Interest::ACCEPT.wants_read());
        assert!(!Interest::ACCEPT.wants_write());
        assert!(Interest::CONNECT.wants_write());
        assert!(!(Interest::TIMEOUT | Interest::CUSTOM).wants_read());
    }
}
