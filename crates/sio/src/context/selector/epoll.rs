// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use tracing::{Level, event};

use super::{Registered, Selected, Selector, SelectorEvent};
use crate::context::Interest;
use crate::context::notifier::WakeSignal;
use crate::pal::unix::{WakeFd, check};
use crate::pal::{RawSource, timeout_millis};
use crate::Result;

const WAKE_TOKEN: u64 = u64::MAX;

/// Level-triggered `epoll`.
#[derive(Debug)]
pub(crate) struct Epoll {
    epoll: OwnedFd,
    wake: Arc<WakeFd>,
    buffer: Vec<libc::epoll_event>,
}

impl Epoll {
    pub(crate) fn new() -> Result<Self> {
        // SAFETY: No pointers are involved.
        let fd = check(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        // SAFETY: `epoll_create1` returned a fresh descriptor that nothing else owns.
        let epoll = unsafe { OwnedFd::from_raw_fd(fd) };

        let selector = Self {
            epoll,
            wake: Arc::new(WakeFd::new()?),
            buffer: Vec::new(),
        };

        let RawSource::Fd(wake) = selector.wake.source();
        selector.control(libc::EPOLL_CTL_ADD, wake, WAKE_TOKEN, Interest::READABLE)?;

        event!(Level::TRACE, message = "created epoll instance", fd = fd);
        Ok(selector)
    }

    fn control(&self, op: libc::c_int, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        let mut request = libc::epoll_event {
            events: mask(interest),
            u64: token,
        };

        // SAFETY: `request` is valid for reads for the duration of the call.
        check(unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &raw mut request) })?;
        Ok(())
    }
}

impl Selector for Epoll {
    fn register(&mut self, source: RawSource, token: u64, interest: Interest) -> Result<Registered> {
        let RawSource::Fd(fd) = source;

        match self.control(libc::EPOLL_CTL_ADD, fd, token, interest) {
            Ok(()) => Ok(Registered::Watched),
            // Regular files and directories never block and cannot be watched.
            Err(error) if error.raw_os_error() == Some(libc::EPERM) => Ok(Registered::AlwaysReady),
            Err(error) => Err(error.into()),
        }
    }

    fn reregister(&mut self, source: RawSource, token: u64, interest: Interest) -> Result<()> {
        let RawSource::Fd(fd) = source;
        Ok(self.control(libc::EPOLL_CTL_MOD, fd, token, interest)?)
    }

    fn deregister(&mut self, source: RawSource, token: u64) -> Result<()> {
        let RawSource::Fd(fd) = source;

        match self.control(libc::EPOLL_CTL_DEL, fd, token, Interest::empty()) {
            Err(error) if error.raw_os_error() != Some(libc::ENOENT) => Err(error.into()),
            _ => Ok(()),
        }
    }

    fn select(&mut self, events: &mut Vec<SelectorEvent>, max_events: usize, timeout: Option<Duration>) -> Result<Selected> {
        let capacity = max_events.clamp(1, i32::MAX as usize);
        self.buffer.clear();
        self.buffer.resize(capacity, libc::epoll_event { events: 0, u64: 0 });

        let max = libc::c_int::try_from(capacity).unwrap_or(libc::c_int::MAX);
        // SAFETY: `buffer` is valid for writes of `max` entries.
        let ret = unsafe { libc::epoll_wait(self.epoll.as_raw_fd(), self.buffer.as_mut_ptr(), max, timeout_millis(timeout)) };

        let count = match check(ret) {
            Ok(count) => count.unsigned_abs() as usize,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {
                return Ok(Selected {
                    woken: false,
                    interrupted: true,
                });
            }
            Err(error) => return Err(error.into()),
        };

        let mut selected = Selected::default();
        for entry in &self.buffer[..count] {
            let token = entry.u64;
            if token == WAKE_TOKEN {
                self.wake.drain();
                selected.woken = true;
                continue;
            }

            events.push(SelectorEvent::Ready {
                token,
                ready: readiness(entry.events),
            });
        }

        Ok(selected)
    }

    fn wake_signal(&self) -> WakeSignal {
        WakeSignal::Fd(Arc::clone(&self.wake))
    }
}

fn mask(interest: Interest) -> u32 {
    let mut events = 0;
    if interest.contains(Interest::READABLE) {
        events |= libc::EPOLLIN | libc::EPOLLRDHUP;
    }
    if interest.contains(Interest::WRITABLE) {
        events |= libc::EPOLLOUT;
    }
    events.cast_unsigned()
}

fn readiness(events: u32) -> Interest {
    let events = events.cast_signed();
    let mut ready = Interest::empty();

    ready.set(Interest::READABLE, events & (libc::EPOLLIN | libc::EPOLLPRI) != 0);
    ready.set(Interest::WRITABLE, events & libc::EPOLLOUT != 0);
    ready.set(Interest::CLOSE, events & (libc::EPOLLHUP | libc::EPOLLRDHUP) != 0);
    ready.set(Interest::ERROR, events & libc::EPOLLERR != 0);
    ready
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn translates_flags() {
        assert_eq!(readiness((libc::EPOLLIN | libc::EPOLLOUT).cast_unsigned()), Interest::READABLE | Interest::WRITABLE);
        assert_eq!(readiness(libc::EPOLLHUP.cast_unsigned()), Interest::CLOSE);
        assert_eq!(readiness(libc::EPOLLERR.cast_unsigned()), Interest::ERROR);
        assert_eq!(mask(Interest::WRITABLE), libc::EPOLLOUT.cast_unsigned());
    }

    #[test]
    fn regular_files_are_always_ready() {
        let file: File = tempfile::tempfile().unwrap();
        let mut epoll = Epoll::new().unwrap();

        let registered = epoll.register(RawSource::Fd(file.as_raw_fd()), 1, Interest::READABLE).unwrap();

        assert_eq!(registered, Registered::AlwaysReady);
    }

    #[test]
    fn hangup_is_reported() {
        let (left, right) = UnixStream::pair().unwrap();
        let mut epoll = Epoll::new().unwrap();
        let mut events = Vec::new();
        epoll.register(RawSource::Fd(right.as_raw_fd()), 3, Interest::READABLE).unwrap();

        drop(left);
        epoll.select(&mut events, 8, Some(Duration::from_secs(5))).unwrap();

        assert!(matches!(events.as_slice(), [SelectorEvent::Ready { token: 3, ready }] if ready.contains(Interest::CLOSE)));
    }

    #[test]
    fn unknown_source_deregisters_quietly() {
        let (left, _right) = UnixStream::pair().unwrap();
        let mut epoll = Epoll::new().unwrap();

        epoll.deregister(RawSource::Fd(left.as_raw_fd()), 9).unwrap();
    }
}
