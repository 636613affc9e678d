// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use super::{Registered, Selected, Selector, SelectorEvent};
use crate::context::Interest;
use crate::context::notifier::WakeSignal;
use crate::pal::RawSource;
use crate::pal::unix::{WakeFd, check, set_cloexec, timespec};
use crate::{Error, ErrorCode, Result};

const WAKE_TOKEN: u64 = u64::MAX;

/// BSD `kqueue` with separate read and write filters per source.
#[derive(Debug)]
pub(crate) struct Kqueue {
    kqueue: OwnedFd,
    wake: Arc<WakeFd>,
    watched: HashMap<u64, Interest>,
    buffer: Vec<libc::kevent>,
}

// SAFETY: The event buffer only holds copies of kernel records whose `udata` carries tokens,
// never pointers that are dereferenced.
unsafe impl Send for Kqueue {}

impl Kqueue {
    pub(crate) fn new() -> Result<Self> {
        // SAFETY: No pointers are involved.
        let fd = check(unsafe { libc::kqueue() })?;
        // SAFETY: `kqueue` returned a fresh descriptor that nothing else owns.
        let kqueue = unsafe { OwnedFd::from_raw_fd(fd) };
        set_cloexec(fd, true)?;

        let selector = Self {
            kqueue,
            wake: Arc::new(WakeFd::new()?),
            watched: HashMap::new(),
            buffer: Vec::new(),
        };

        let RawSource::Fd(wake) = selector.wake.source();
        selector.change(wake, libc::EVFILT_READ, libc::EV_ADD | libc::EV_ENABLE, WAKE_TOKEN)?;

        Ok(selector)
    }

    fn change(&self, fd: RawFd, filter: i16, flags: u16, token: u64) -> io::Result<()> {
        let change = kevent(fd, filter, flags, token);

        // SAFETY: `change` is valid for reads and no events are requested back.
        let ret = unsafe {
            libc::kevent(
                self.kqueue.as_raw_fd(),
                &raw const change,
                1,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        check(ret)?;
        Ok(())
    }

    /// Applies the filter changes between two interests.
    fn apply(&self, fd: RawFd, token: u64, previous: Interest, next: Interest) -> io::Result<()> {
        for (direction, filter) in [(Interest::READABLE, libc::EVFILT_READ), (Interest::WRITABLE, libc::EVFILT_WRITE)] {
            match (previous.contains(direction), next.contains(direction)) {
                (false, true) => self.change(fd, filter, libc::EV_ADD | libc::EV_ENABLE, token)?,
                (true, false) => match self.change(fd, filter, libc::EV_DELETE, token) {
                    Err(error) if error.raw_os_error() != Some(libc::ENOENT) => return Err(error),
                    _ => {}
                },
                _ => {}
            }
        }
        Ok(())
    }
}

impl Selector for Kqueue {
    fn register(&mut self, source: RawSource, token: u64, interest: Interest) -> Result<Registered> {
        let RawSource::Fd(fd) = source;

        if self.watched.contains_key(&token) {
            return Err(ErrorCode::AlreadyExists.into());
        }

        self.apply(fd, token, Interest::empty(), interest)?;
        self.watched.insert(token, interest);
        Ok(Registered::Watched)
    }

    fn reregister(&mut self, source: RawSource, token: u64, interest: Interest) -> Result<()> {
        let RawSource::Fd(fd) = source;

        let previous = *self.watched.get(&token).ok_or(Error::Code(ErrorCode::NotFound))?;
        self.apply(fd, token, previous, interest)?;
        self.watched.insert(token, interest);
        Ok(())
    }

    fn deregister(&mut self, source: RawSource, token: u64) -> Result<()> {
        let RawSource::Fd(fd) = source;

        if let Some(previous) = self.watched.remove(&token) {
            self.apply(fd, token, previous, Interest::empty())?;
        }
        Ok(())
    }

    fn select(&mut self, events: &mut Vec<SelectorEvent>, max_events: usize, timeout: Option<Duration>) -> Result<Selected> {
        let capacity = max_events.clamp(1, i32::MAX as usize);
        self.buffer.clear();
        self.buffer.resize(capacity, kevent(0, 0, 0, 0));

        let limit = timeout.map(timespec);
        let limit_ptr = limit.as_ref().map_or(std::ptr::null(), |limit| &raw const *limit);
        let max = libc::c_int::try_from(capacity).unwrap_or(libc::c_int::MAX);

        // SAFETY: `buffer` is valid for writes of `max` entries and `limit_ptr` is null or points
        // to a live `timespec`.
        let ret = unsafe {
            libc::kevent(
                self.kqueue.as_raw_fd(),
                std::ptr::null(),
                0,
                self.buffer.as_mut_ptr(),
                max,
                limit_ptr,
            )
        };

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
            let token = entry.udata.addr() as u64;
            if token == WAKE_TOKEN {
                self.wake.drain();
                selected.woken = true;
                continue;
            }

            events.push(SelectorEvent::Ready {
                token,
                ready: readiness(entry),
            });
        }

        Ok(selected)
    }

    fn wake_signal(&self) -> WakeSignal {
        WakeSignal::Fd(Arc::clone(&self.wake))
    }
}

fn kevent(fd: RawFd, filter: i16, flags: u16, token: u64) -> libc::kevent {
    // SAFETY: `kevent` is a plain C structure for which all-zero bytes are valid.
    let mut change: libc::kevent = unsafe { std::mem::zeroed() };
    change.ident = fd.unsigned_abs() as libc::uintptr_t;
    change.filter = filter;
    change.flags = flags;
    #[expect(clippy::cast_possible_truncation, reason = "tokens are stream identifiers, far below the pointer range")]
    {
        change.udata = std::ptr::without_provenance_mut(token as usize);
    }
    change
}

fn readiness(entry: &libc::kevent) -> Interest {
    let mut ready = Interest::empty();

    match entry.filter {
        libc::EVFILT_READ => ready |= Interest::READABLE,
        libc::EVFILT_WRITE => ready |= Interest::WRITABLE,
        _ => {}
    }
    ready.set(Interest::CLOSE, entry.flags & libc::EV_EOF != 0);
    ready.set(Interest::ERROR, entry.flags & libc::EV_ERROR != 0);
    ready
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn tokens_survive_the_round_trip() {
        let change = kevent(4, libc::EVFILT_READ, libc::EV_ADD, 42);

        assert_eq!(change.udata.addr(), 42);
        assert_eq!(readiness(&change), Interest::READABLE);
    }

    #[test]
    fn hangup_is_reported() {
        let (left, right) = UnixStream::pair().unwrap();
        let mut kqueue = Kqueue::new().unwrap();
        let mut events = Vec::new();
        kqueue.register(RawSource::Fd(right.as_raw_fd()), 3, Interest::READABLE).unwrap();

        drop(left);
        kqueue.select(&mut events, 8, Some(Duration::from_secs(5))).unwrap();

        assert!(matches!(events.as_slice(), [SelectorEvent::Ready { token: 3, ready }] if ready.contains(Interest::CLOSE)));
    }

    #[test]
    fn removing_an_absent_filter_is_quiet() {
        let (left, _right) = UnixStream::pair().unwrap();
        let mut kqueue = Kqueue::new().unwrap();
        let source = RawSource::Fd(left.as_raw_fd());

        kqueue.register(source, 5, Interest::WRITABLE).unwrap();
        kqueue.reregister(source, 5, Interest::READABLE).unwrap();
        kqueue.deregister(source, 5).unwrap();
        kqueue.deregister(source, 5).unwrap();
    }
}
