// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The multiplexing engines behind a context.
//!
//! Readiness engines (`epoll`, `kqueue`, `poll`, `select`) report that a source can make progress
//! and the context performs the transfer itself. Completion engines (`io_uring`, IOCP) also
//! accept operations and report their results.

use std::fmt;
use std::io;
use std::time::Duration;

use crate::context::Interest;
use crate::context::notifier::WakeSignal;
use crate::pal::RawSource;
use crate::{Backend, ContextConfig, Error, Result};

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) mod epoll;
#[cfg(windows)]
pub(crate) mod iocp;
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
pub(crate) mod kqueue;
#[cfg(unix)]
pub(crate) mod poll;
#[cfg(unix)]
pub(crate) mod select;
#[cfg(all(target_os = "linux", feature = "io-uring"))]
pub(crate) mod uring;

/// Something a selector observed during one [`Selector::select()`] call.
#[derive(Debug)]
pub(crate) enum SelectorEvent {
    /// The source registered under `token` is ready. Only `READABLE`, `WRITABLE`, `CLOSE` and
    /// `ERROR` are reported.
    Ready { token: u64, ready: Interest },
    /// The native operation `op` finished.
    Completed { op: u64, result: io::Result<usize> },
}

/// How a [`Selector::select()`] call ended, apart from the events it collected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Selected {
    /// A wake signal was consumed.
    pub(crate) woken: bool,
    /// A signal interrupted the wait.
    pub(crate) interrupted: bool,
}

/// Whether a selector can watch a source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Registered {
    Watched,
    /// The engine cannot watch the source, which never blocks (regular files under `epoll`).
    AlwaysReady,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum NativeKind {
    Read,
    Write,
}

/// A transfer handed to a completion engine.
#[derive(Clone, Copy, Debug)]
pub(crate) struct NativeRequest {
    pub(crate) kind: NativeKind,
    pub(crate) ptr: *mut u8,
    pub(crate) len: usize,
    /// `None` uses and advances the position of the handle.
    pub(crate) offset: Option<u64>,
}

#[derive(Debug)]
pub(crate) enum Submitted {
    /// The result arrives as a [`SelectorEvent::Completed`].
    Pending,
    /// The operation finished during submission and no event will follow.
    Done(io::Result<usize>),
}

/// A multiplexing engine.
///
/// Tokens and operation keys are chosen by the caller and never reused while registered or in
/// flight.
pub(crate) trait Selector: fmt::Debug {
    /// Starts watching `source` for the `READABLE` and `WRITABLE` bits of `interest`.
    fn register(&mut self, source: RawSource, token: u64, interest: Interest) -> Result<Registered>;

    /// Replaces the interest of a watched source.
    fn reregister(&mut self, source: RawSource, token: u64, interest: Interest) -> Result<()>;

    /// Stops watching a source.
    fn deregister(&mut self, source: RawSource, token: u64) -> Result<()>;

    /// Collects up to `max_events` events into `events`, blocking for up to `timeout` (forever
    /// with `None`) when nothing is pending.
    fn select(&mut self, events: &mut Vec<SelectorEvent>, max_events: usize, timeout: Option<Duration>) -> Result<Selected>;

    /// The signal that interrupts [`select()`][Self::select] from other threads.
    fn wake_signal(&self) -> WakeSignal;

    /// Whether transfers on `source` can be handed to the engine.
    fn supports_native(&self, source: RawSource) -> bool {
        let _ = source;
        false
    }

    /// Starts a native transfer.
    ///
    /// # Safety
    ///
    /// The memory described by `request` must stay valid, and must not be accessed by anyone
    /// else, until the operation is reported as completed.
    unsafe fn submit(&mut self, op: u64, source: RawSource, request: NativeRequest) -> Result<Submitted> {
        let _ = (op, source, request);
        Err(Error::unsupported())
    }

    /// Asks the engine to abandon a native transfer. Its completion is still reported.
    fn cancel(&mut self, op: u64) -> Result<()> {
        let _ = op;
        Ok(())
    }

    /// Pushes batched submissions to the operating system.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// The engine a context runs on.
#[derive(Debug)]
pub(crate) enum SelectorFacade {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Epoll(epoll::Epoll),
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    Kqueue(kqueue::Kqueue),
    #[cfg(unix)]
    Poll(poll::Poll),
    #[cfg(unix)]
    Select(select::Select),
    #[cfg(all(target_os = "linux", feature = "io-uring"))]
    Uring(uring::Uring),
    #[cfg(windows)]
    Iocp(iocp::Iocp),
    #[cfg(all(test, unix))]
    Mock(MockSelector),
}

impl SelectorFacade {
    /// Creates the engine for a resolved backend.
    pub(crate) fn new(backend: Backend, config: &ContextConfig) -> Result<Self> {
        let _ = config;
        match backend {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Epoll => Ok(Self::Epoll(epoll::Epoll::new()?)),
            #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
            Backend::Kqueue => Ok(Self::Kqueue(kqueue::Kqueue::new()?)),
            #[cfg(unix)]
            Backend::Poll => Ok(Self::Poll(poll::Poll::new()?)),
            #[cfg(unix)]
            Backend::Select => Ok(Self::Select(select::Select::new()?)),
            #[cfg(all(target_os = "linux", feature = "io-uring"))]
            Backend::IoUring => Ok(Self::Uring(uring::Uring::new(config.uring_depth())?)),
            #[cfg(windows)]
            Backend::Iocp => Ok(Self::Iocp(iocp::Iocp::new()?)),
            _ => Err(Error::unsupported()),
        }
    }
}

#[cfg(all(test, unix))]
impl From<MockSelector> for SelectorFacade {
    #[cfg_attr(test, mutants::skip)] // Low-impact layer, waste of time to mutate.
    fn from(mock: MockSelector) -> Self {
        Self::Mock(mock)
    }
}

#[cfg(all(test, unix))]
mockall::mock! {
    #[derive(Debug)]
    pub(crate) Selector {}

    impl Selector for Selector {
        fn register(&mut self, source: RawSource, token: u64, interest: Interest) -> Result<Registered>;
        fn reregister(&mut self, source: RawSource, token: u64, interest: Interest) -> Result<()>;
        fn deregister(&mut self, source: RawSource, token: u64) -> Result<()>;
        fn select(&mut self, events: &mut Vec<SelectorEvent>, max_events: usize, timeout: Option<Duration>) -> Result<Selected>;
        fn wake_signal(&self) -> WakeSignal;
        fn supports_native(&self, source: RawSource) -> bool;
        unsafe fn submit(&mut self, op: u64, source: RawSource, request: NativeRequest) -> Result<Submitted>;
        fn cancel(&mut self, op: u64) -> Result<()>;
        fn flush(&mut self) -> Result<()>;
    }
}

macro_rules! dispatch {
    ($facade:expr, $selector:ident => $body:expr) => {
        match $facade {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            SelectorFacade::Epoll($selector) => $body,
            #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
            SelectorFacade::Kqueue($selector) => $body,
            #[cfg(unix)]
            SelectorFacade::Poll($selector) => $body,
            #[cfg(unix)]
            SelectorFacade::Select($selector) => $body,
            #[cfg(all(target_os = "linux", feature = "io-uring"))]
            SelectorFacade::Uring($selector) => $body,
            #[cfg(windows)]
            SelectorFacade::Iocp($selector) => $body,
            #[cfg(all(test, unix))]
            SelectorFacade::Mock($selector) => $body,
        }
    };
}

impl Selector for SelectorFacade {
    #[cfg_attr(test, mutants::skip)] // Low-impact layer, waste of time to mutate.
    fn register(&mut self, source: RawSource, token: u64, interest: Interest) -> Result<Registered> {
        dispatch!(self, selector => selector.register(source, token, interest))
    }

    #[cfg_attr(test, mutants::skip)] // Low-impact layer, waste of time to mutate.
    fn reregister(&mut self, source: RawSource, token: u64, interest: Interest) -> Result<()> {
        dispatch!(self, selector => selector.reregister(source, token, interest))
    }

    #[cfg_attr(test, mutants::skip)] // Low-impact layer, waste of time to mutate.
    fn deregister(&mut self, source: RawSource, token: u64) -> Result<()> {
        dispatch!(self, selector => selector.deregister(source, token))
    }

    #[cfg_attr(test, mutants::skip)] // Low-impact layer, waste of time to mutate.
    fn select(&mut self, events: &mut Vec<SelectorEvent>, max_events: usize, timeout: Option<Duration>) -> Result<Selected> {
        dispatch!(self, selector => selector.select(events, max_events, timeout))
    }

    #[cfg_attr(test, mutants::skip)] // Low-impact layer, waste of time to mutate.
    fn wake_signal(&self) -> WakeSignal {
        dispatch!(self, selector => selector.wake_signal())
    }

    #[cfg_attr(test, mutants::skip)] // Low-impact layer, waste of time to mutate.
    fn supports_native(&self, source: RawSource) -> bool {
        dispatch!(self, selector => selector.supports_native(source))
    }

    #[cfg_attr(test, mutants::skip)] // Low-impact layer, waste of time to mutate.
    unsafe fn submit(&mut self, op: u64, source: RawSource, request: NativeRequest) -> Result<Submitted> {
        // SAFETY: Forwarding the safety requirements of the caller.
        dispatch!(self, selector => unsafe { selector.submit(op, source, request) })
    }

    #[cfg_attr(test, mutants::skip)] // Low-impact layer, waste of time to mutate.
    fn cancel(&mut self, op: u64) -> Result<()> {
        dispatch!(self, selector => selector.cancel(op))
    }

    #[cfg_attr(test, mutants::skip)] // Low-impact layer, waste of time to mutate.
    fn flush(&mut self) -> Result<()> {
        dispatch!(self, selector => selector.flush())
    }
}

/// Narrows an interest to the directions an engine watches.
pub(crate) fn directions(interest: Interest) -> Interest {
    let mut watched = Interest::empty();
    watched.set(Interest::READABLE, interest.wants_read() || interest.contains(Interest::CLOSE));
    watched.set(Interest::WRITABLE, interest.wants_write());
    watched
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(all(test, unix))]
mod tests {
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn directions_cover_derived_events() {
        assert_eq!(directions(Interest::ACCEPT), Interest::READABLE);
        assert_eq!(directions(Interest::CLOSE), Interest::READABLE);
        assert_eq!(directions(Interest::CONNECT), Interest::WRITABLE);
        assert!(directions(Interest::TIMEOUT | Interest::CUSTOM).is_empty());
    }

    /// Exercises one engine through the facade with a socket pair.
    fn exercise(backend: Backend) {
        let mut selector = SelectorFacade::new(backend, &ContextConfig::new()).unwrap();
        let (mut left, right) = UnixStream::pair().unwrap();
        let source = RawSource::Fd(right.as_raw_fd());
        let mut events = Vec::new();

        assert_eq!(selector.register(source, 7, Interest::READABLE).unwrap(), Registered::Watched);
        let selected = selector.select(&mut events, 16, Some(Duration::ZERO)).unwrap();
        assert_eq!(selected, Selected::default());
        assert!(events.is_empty());

        left.write_all(b"ping").unwrap();
        selector.select(&mut events, 16, Some(Duration::from_secs(5))).unwrap();
        assert!(matches!(events.as_slice(), [SelectorEvent::Ready { token: 7, ready }] if ready.contains(Interest::READABLE)));

        events.clear();
        selector.reregister(source, 7, Interest::WRITABLE).unwrap();
        selector.select(&mut events, 16, Some(Duration::from_secs(5))).unwrap();
        assert!(matches!(events.as_slice(), [SelectorEvent::Ready { token: 7, ready }] if ready.contains(Interest::WRITABLE)));

        events.clear();
        selector.wake_signal_for_test();
        let selected = selector.select(&mut events, 16, Some(Duration::from_secs(5))).unwrap();
        assert!(selected.woken);

        events.clear();
        selector.deregister(source, 7).unwrap();
        let selected = selector.select(&mut events, 16, Some(Duration::ZERO)).unwrap();
        assert!(events.is_empty());
        assert!(!selected.woken);
    }

    impl SelectorFacade {
        fn wake_signal_for_test(&self) {
            match self.wake_signal() {
                WakeSignal::Fd(fd) => fd.wake().unwrap(),
            }
        }
    }

    #[test]
    fn poll_engine() {
        exercise(Backend::Poll);
    }

    #[test]
    fn select_engine() {
        exercise(Backend::Select);
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn epoll_engine() {
        exercise(Backend::Epoll);
    }

    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    #[test]
    fn kqueue_engine() {
        exercise(Backend::Kqueue);
    }

    #[cfg(all(target_os = "linux", feature = "io-uring"))]
    #[test]
    fn uring_engine() {
        if uring::probe() {
            exercise(Backend::IoUring);
        }
    }

    #[test]
    fn unavailable_engine_is_unsupported() {
        let error = SelectorFacade::new(Backend::Auto, &ContextConfig::new()).unwrap_err();

        assert_eq!(error.code(), crate::ErrorCode::Unsupported);
    }
}
