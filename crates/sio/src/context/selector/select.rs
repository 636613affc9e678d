// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashMap;
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use super::{Registered, Selected, Selector, SelectorEvent};
use crate::context::Interest;
use crate::context::notifier::WakeSignal;
use crate::pal::RawSource;
use crate::pal::unix::{WakeFd, check};
use crate::{Error, ErrorCode, Result};

/// POSIX `select`. Descriptors at or above `FD_SETSIZE` cannot be watched.
#[derive(Debug)]
pub(crate) struct Select {
    wake: Arc<WakeFd>,
    sources: HashMap<u64, (RawFd, Interest)>,
}

impl Select {
    pub(crate) fn new() -> Result<Self> {
        let wake = Arc::new(WakeFd::new()?);
        let RawSource::Fd(fd) = wake.source();
        fits(fd)?;

        Ok(Self {
            wake,
            sources: HashMap::new(),
        })
    }
}

fn fits(fd: RawFd) -> Result<()> {
    match usize::try_from(fd) {
        Ok(fd) if fd < libc::FD_SETSIZE as usize => Ok(()),
        _ => Err(ErrorCode::LimitReached.into()),
    }
}

impl Selector for Select {
    fn register(&mut self, source: RawSource, token: u64, interest: Interest) -> Result<Registered> {
        let RawSource::Fd(fd) = source;
        fits(fd)?;

        if self.sources.insert(token, (fd, interest)).is_some() {
            return Err(ErrorCode::AlreadyExists.into());
        }
        Ok(Registered::Watched)
    }

    fn reregister(&mut self, source: RawSource, token: u64, interest: Interest) -> Result<()> {
        let RawSource::Fd(fd) = source;

        let entry = self.sources.get_mut(&token).ok_or(Error::Code(ErrorCode::NotFound))?;
        *entry = (fd, interest);
        Ok(())
    }

    fn deregister(&mut self, _source: RawSource, token: u64) -> Result<()> {
        self.sources.remove(&token);
        Ok(())
    }

    fn select(&mut self, events: &mut Vec<SelectorEvent>, max_events: usize, timeout: Option<Duration>) -> Result<Selected> {
        let RawSource::Fd(wake) = self.wake.source();
        let mut readers = FdSet::new();
        let mut writers = FdSet::new();

        readers.insert(wake);
        let mut highest = wake;
        for &(fd, interest) in self.sources.values() {
            if interest.contains(Interest::READABLE) {
                readers.insert(fd);
            }
            if interest.contains(Interest::WRITABLE) {
                writers.insert(fd);
            }
            highest = highest.max(fd);
        }

        let mut limit = timeout.map(|timeout| libc::timeval {
            tv_sec: libc::time_t::try_from(timeout.as_secs()).unwrap_or(libc::time_t::MAX),
            tv_usec: libc::suseconds_t::try_from(timeout.subsec_micros()).unwrap_or_default(),
        });
        let limit_ptr = limit.as_mut().map_or(std::ptr::null_mut(), |limit| &raw mut *limit);

        // SAFETY: Both sets were initialized by `FD_ZERO` and only hold descriptors below
        // `FD_SETSIZE`; `limit_ptr` is null or points to a live `timeval`.
        let ret = unsafe { libc::select(highest + 1, readers.as_mut_ptr(), writers.as_mut_ptr(), std::ptr::null_mut(), limit_ptr) };

        match check(ret) {
            Ok(_) => {}
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {
                return Ok(Selected {
                    woken: false,
                    interrupted: true,
                });
            }
            Err(error) => return Err(error.into()),
        }

        let mut selected = Selected::default();
        if readers.contains(wake) {
            self.wake.drain();
            selected.woken = true;
        }

        for (&token, &(fd, interest)) in &self.sources {
            if events.len() >= max_events {
                break;
            }

            let mut ready = Interest::empty();
            ready.set(Interest::READABLE, interest.contains(Interest::READABLE) && readers.contains(fd));
            ready.set(Interest::WRITABLE, interest.contains(Interest::WRITABLE) && writers.contains(fd));
            if !ready.is_empty() {
                events.push(SelectorEvent::Ready { token, ready });
            }
        }

        Ok(selected)
    }

    fn wake_signal(&self) -> WakeSignal {
        WakeSignal::Fd(Arc::clone(&self.wake))
    }
}

struct FdSet(libc::fd_set);

impl FdSet {
    fn new() -> Self {
        let mut set = MaybeUninit::<libc::fd_set>::uninit();
        // SAFETY: `FD_ZERO` initializes the whole set.
        unsafe { libc::FD_ZERO(set.as_mut_ptr()) };
        // SAFETY: Initialized above.
        Self(unsafe { set.assume_init() })
    }

    fn insert(&mut self, fd: RawFd) {
        // SAFETY: Callers only insert descriptors checked by `fits()`.
        unsafe { libc::FD_SET(fd, &raw mut self.0) };
    }

    fn contains(&self, fd: RawFd) -> bool {
        // SAFETY: As for `insert()`.
        unsafe { libc::FD_ISSET(fd, &raw const self.0) }
    }

    fn as_mut_ptr(&mut self) -> *mut libc::fd_set {
        &raw mut self.0
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn large_descriptors_are_refused() {
        let mut select = Select::new().unwrap();
        let too_large = RawFd::try_from(libc::FD_SETSIZE).unwrap_or(RawFd::MAX);

        let error = select.register(RawSource::Fd(too_large), 1, Interest::READABLE).unwrap_err();

        assert_eq!(error.code(), ErrorCode::LimitReached);
        assert_eq!(fits(-1).unwrap_err().code(), ErrorCode::LimitReached);
    }

    #[test]
    fn sets_track_membership() {
        let mut set = FdSet::new();

        set.insert(3);

        assert!(set.contains(3));
        assert!(!set.contains(4));
    }
}
