// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use super::{Registered, Selected, Selector, SelectorEvent};
use crate::context::Interest;
use crate::context::notifier::WakeSignal;
use crate::pal::unix::{WakeFd, check};
use crate::pal::{RawSource, timeout_millis};
use crate::{Error, ErrorCode, Result};

/// POSIX `poll`. The descriptor array is rebuilt for every call.
#[derive(Debug)]
pub(crate) struct Poll {
    wake: Arc<WakeFd>,
    sources: HashMap<u64, (RawFd, Interest)>,
    fds: Vec<libc::pollfd>,
    tokens: Vec<u64>,
}

impl Poll {
    pub(crate) fn new() -> Result<Self> {
        Ok(Self {
            wake: Arc::new(WakeFd::new()?),
            sources: HashMap::new(),
            fds: Vec::new(),
            tokens: Vec::new(),
        })
    }
}

impl Selector for Poll {
    fn register(&mut self, source: RawSource, token: u64, interest: Interest) -> Result<Registered> {
        let RawSource::Fd(fd) = source;

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

        self.fds.clear();
        self.tokens.clear();
        self.fds.push(libc::pollfd {
            fd: wake,
            events: libc::POLLIN,
            revents: 0,
        });

        for (&token, &(fd, interest)) in &self.sources {
            self.fds.push(libc::pollfd {
                fd,
                events: mask(interest),
                revents: 0,
            });
            self.tokens.push(token);
        }

        let count = libc::nfds_t::try_from(self.fds.len()).unwrap_or(libc::nfds_t::MAX);
        // SAFETY: `fds` is valid for reads and writes of `count` entries.
        let ret = unsafe { libc::poll(self.fds.as_mut_ptr(), count, timeout_millis(timeout)) };

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
        if self.fds[0].revents != 0 {
            self.wake.drain();
            selected.woken = true;
        }

        let mut delivered = 0;
        for (entry, &token) in self.fds[1..].iter().zip(&self.tokens) {
            if entry.revents == 0 {
                continue;
            }
            if delivered == max_events {
                break;
            }

            events.push(SelectorEvent::Ready {
                token,
                ready: readiness(entry.revents),
            });
            delivered += 1;
        }

        Ok(selected)
    }

    fn wake_signal(&self) -> WakeSignal {
        WakeSignal::Fd(Arc::clone(&self.wake))
    }
}

fn mask(interest: Interest) -> libc::c_short {
    let mut events = 0;
    if interest.contains(Interest::READABLE) {
        events |= libc::POLLIN;
    }
    if interest.contains(Interest::WRITABLE) {
        events |= libc::POLLOUT;
    }
    events
}

fn readiness(revents: libc::c_short) -> Interest {
    let mut ready = Interest::empty();

    ready.set(Interest::READABLE, revents & (libc::POLLIN | libc::POLLPRI) != 0);
    ready.set(Interest::WRITABLE, revents & libc::POLLOUT != 0);
    ready.set(Interest::CLOSE, revents & libc::POLLHUP != 0);
    ready.set(Interest::ERROR, revents & (libc::POLLERR | libc::POLLNVAL) != 0);
    ready
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn translates_flags() {
        assert_eq!(readiness(libc::POLLIN | libc::POLLHUP), Interest::READABLE | Interest::CLOSE);
        assert_eq!(readiness(libc::POLLNVAL), Interest::ERROR);
        assert_eq!(mask(Interest::READABLE | Interest::WRITABLE), libc::POLLIN | libc::POLLOUT);
    }

    #[test]
    fn tokens_are_unique() {
        let mut poll = Poll::new().unwrap();

        poll.register(RawSource::Fd(0), 1, Interest::READABLE).unwrap();
        let error = poll.register(RawSource::Fd(0), 1, Interest::READABLE).unwrap_err();

        assert_eq!(error.code(), ErrorCode::AlreadyExists);
        assert_eq!(poll.reregister(RawSource::Fd(0), 2, Interest::READABLE).unwrap_err().code(), ErrorCode::NotFound);
    }

    #[test]
    fn event_limit_is_honored() {
        let (first, _first_peer) = UnixStream::pair().unwrap();
        let (second, _second_peer) = UnixStream::pair().unwrap();
        let mut poll = Poll::new().unwrap();
        let mut events = Vec::new();

        for (token, socket) in [(1, &first), (2, &second)] {
            poll.register(RawSource::Fd(socket.as_raw_fd()), token, Interest::WRITABLE).unwrap();
        }
        poll.select(&mut events, 1, Some(Duration::ZERO)).unwrap();

        assert_eq!(events.len(), 1);
    }
}
