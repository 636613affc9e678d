// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Linux submission and completion queues.
//!
//! Readiness is watched with one-shot poll requests that are re-armed after every event, which
//! gives the same level-triggered behavior as the other engines. Transfers are native.
//!
//! Every request carries a tag in the low bits of its user data that says what its completion
//! belongs to.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use io_uring::{IoUring, opcode, squeue, types};
use tracing::{Level, event};

use super::{NativeKind, NativeRequest, Registered, Selected, Selector, SelectorEvent, Submitted};
use crate::context::Interest;
use crate::context::notifier::WakeSignal;
use crate::pal::RawSource;
use crate::pal::unix::WakeFd;
use crate::{ErrorCode, Result};

const TAG_BITS: u32 = 2;
const TAG_MASK: u64 = (1 << TAG_BITS) - 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Tag {
    Op = 0,
    Poll = 1,
    Wake = 2,
    Internal = 3,
}

fn encode(value: u64, tag: Tag) -> u64 {
    (value << TAG_BITS) | tag as u64
}

fn decode(user_data: u64) -> (u64, Tag) {
    let tag = match user_data & TAG_MASK {
        0 => Tag::Op,
        1 => Tag::Poll,
        2 => Tag::Wake,
        _ => Tag::Internal,
    };
    (user_data >> TAG_BITS, tag)
}

/// Whether the running kernel offers what this engine needs: a ring, and timed waits.
pub(crate) fn probe() -> bool {
    static AVAILABLE: OnceLock<bool> = OnceLock::new();

    *AVAILABLE.get_or_init(|| match IoUring::new(2) {
        Ok(ring) => ring.params().is_feature_ext_arg(),
        Err(error) => {
            event!(Level::DEBUG, message = "io_uring unavailable", error = %error);
            false
        }
    })
}

#[derive(Debug)]
struct Watch {
    fd: RawFd,
    interest: Interest,
    /// The generation of the poll request in flight, if any.
    armed: Option<u64>,
}

pub(crate) struct Uring {
    ring: IoUring,
    wake: Arc<WakeFd>,
    watches: HashMap<u64, Watch>,
    /// Poll generations in flight, mapped to their tokens.
    generations: HashMap<u64, u64>,
    next_generation: u64,
}

impl Uring {
    pub(crate) fn new(entries: u32) -> Result<Self> {
        let ring = IoUring::new(entries)?;
        if !ring.params().is_feature_ext_arg() {
            return Err(ErrorCode::Unsupported.into());
        }

        let mut selector = Self {
            ring,
            wake: Arc::new(WakeFd::new()?),
            watches: HashMap::new(),
            generations: HashMap::new(),
            next_generation: 0,
        };
        selector.arm_wake()?;

        event!(Level::TRACE, message = "created io_uring instance", entries = entries);
        Ok(selector)
    }

    /// Queues a request, submitting queued requests to make room when the ring is full.
    ///
    /// # Safety
    ///
    /// Memory referenced by `entry` must stay valid until its completion is reaped.
    unsafe fn push(&mut self, entry: &squeue::Entry) -> Result<()> {
        for _ in 0..2 {
            // SAFETY: Forwarding the safety requirements of the caller.
            if unsafe { self.ring.submission().push(entry) }.is_ok() {
                return Ok(());
            }
            self.ring.submit()?;
        }

        Err(ErrorCode::LimitReached.into())
    }

    fn arm_wake(&mut self) -> Result<()> {
        let RawSource::Fd(fd) = self.wake.source();
        let entry = opcode::PollAdd::new(types::Fd(fd), poll_mask(Interest::READABLE))
            .build()
            .user_data(encode(0, Tag::Wake));

        // SAFETY: Poll requests reference no memory.
        unsafe { self.push(&entry) }
    }

    fn arm(&mut self, token: u64) -> Result<()> {
        let Some(watch) = self.watches.get_mut(&token) else {
            return Ok(());
        };
        if watch.armed.is_some() || watch.interest.is_empty() {
            return Ok(());
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        watch.armed = Some(generation);
        self.generations.insert(generation, token);

        let entry = opcode::PollAdd::new(types::Fd(watch.fd), poll_mask(watch.interest))
            .build()
            .user_data(encode(generation, Tag::Poll));

        // SAFETY: Poll requests reference no memory.
        unsafe { self.push(&entry) }
    }

    fn disarm(&mut self, generation: u64) -> Result<()> {
        self.generations.remove(&generation);
        let entry = opcode::PollRemove::new(encode(generation, Tag::Poll))
            .build()
            .user_data(encode(0, Tag::Internal));

        // SAFETY: Removal requests reference no memory.
        unsafe { self.push(&entry) }
    }

    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        let result = match timeout {
            Some(timeout) => {
                let limit = types::Timespec::new().sec(timeout.as_secs()).nsec(timeout.subsec_nanos());
                let args = types::SubmitArgs::new().timespec(&limit);
                self.ring.submitter().submit_with_args(1, &args)
            }
            None => self.ring.submit_and_wait(1),
        };

        match result {
            Ok(_) => Ok(()),
            // Completions are pending in an overflowing completion queue, or the wait ran out.
            Err(error) if matches!(error.raw_os_error(), Some(libc::EBUSY | libc::ETIME)) => Ok(()),
            Err(error) => Err(error),
        }
    }
}

impl std::fmt::Debug for Uring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uring")
            .field("watches", &self.watches.len())
            .field("generations", &self.generations.len())
            .finish_non_exhaustive()
    }
}

impl Selector for Uring {
    fn register(&mut self, source: RawSource, token: u64, interest: Interest) -> Result<Registered> {
        let RawSource::Fd(fd) = source;

        if self.watches.contains_key(&token) {
            return Err(ErrorCode::AlreadyExists.into());
        }

        self.watches.insert(token, Watch { fd, interest, armed: None });
        self.arm(token)?;
        Ok(Registered::Watched)
    }

    fn reregister(&mut self, source: RawSource, token: u64, interest: Interest) -> Result<()> {
        let RawSource::Fd(fd) = source;

        let watch = self.watches.get_mut(&token).ok_or(crate::Error::Code(ErrorCode::NotFound))?;
        watch.fd = fd;
        watch.interest = interest;
        if let Some(generation) = watch.armed.take() {
            self.disarm(generation)?;
        }
        self.arm(token)
    }

    fn deregister(&mut self, _source: RawSource, token: u64) -> Result<()> {
        if let Some(generation) = self.watches.remove(&token).and_then(|watch| watch.armed) {
            self.disarm(generation)?;
        }
        Ok(())
    }

    fn select(&mut self, events: &mut Vec<SelectorEvent>, _max_events: usize, timeout: Option<Duration>) -> Result<Selected> {
        let mut selected = Selected::default();

        if let Err(error) = self.wait(timeout) {
            if error.kind() == io::ErrorKind::Interrupted {
                selected.interrupted = true;
                return Ok(selected);
            }
            return Err(error.into());
        }

        let mut rearm = Vec::new();
        let mut wake = false;
        for entry in self.ring.completion() {
            let result = entry.result();
            match decode(entry.user_data()) {
                (op, Tag::Op) => events.push(SelectorEvent::Completed {
                    op,
                    result: if result < 0 {
                        Err(io::Error::from_raw_os_error(-result))
                    } else {
                        Ok(result.unsigned_abs() as usize)
                    },
                }),
                (generation, Tag::Poll) => {
                    // Stale generations belong to requests that were replaced or removed.
                    let Some(token) = self.generations.remove(&generation) else {
                        continue;
                    };
                    if let Some(watch) = self.watches.get_mut(&token) {
                        watch.armed = None;
                    }
                    rearm.push(token);

                    if result == -libc::ECANCELED {
                        continue;
                    }
                    events.push(SelectorEvent::Ready {
                        token,
                        ready: readiness(result),
                    });
                }
                (_, Tag::Wake) => wake = true,
                (_, Tag::Internal) => {}
            }
        }

        if wake {
            self.wake.drain();
            self.arm_wake()?;
            selected.woken = true;
        }
        for token in rearm {
            self.arm(token)?;
        }

        Ok(selected)
    }

    fn wake_signal(&self) -> WakeSignal {
        WakeSignal::Fd(Arc::clone(&self.wake))
    }

    fn supports_native(&self, _source: RawSource) -> bool {
        true
    }

    unsafe fn submit(&mut self, op: u64, source: RawSource, request: NativeRequest) -> Result<Submitted> {
        let RawSource::Fd(fd) = source;
        let len = u32::try_from(request.len).unwrap_or(u32::MAX);
        // All ones asks the kernel to use and advance the file position.
        let offset = request.offset.unwrap_or(u64::MAX);

        let entry = match request.kind {
            NativeKind::Read => opcode::Read::new(types::Fd(fd), request.ptr, len).offset(offset).build(),
            NativeKind::Write => opcode::Write::new(types::Fd(fd), request.ptr.cast_const(), len).offset(offset).build(),
        }
        .user_data(encode(op, Tag::Op));

        // SAFETY: The caller keeps the memory of the request valid until its completion.
        unsafe { self.push(&entry) }?;
        Ok(Submitted::Pending)
    }

    fn cancel(&mut self, op: u64) -> Result<()> {
        let entry = opcode::AsyncCancel::new(encode(op, Tag::Op))
            .build()
            .user_data(encode(0, Tag::Internal));

        // SAFETY: Cancellation requests reference no memory.
        unsafe { self.push(&entry) }
    }

    fn flush(&mut self) -> Result<()> {
        self.ring.submit()?;
        Ok(())
    }
}

fn poll_mask(interest: Interest) -> u32 {
    let mut mask = 0;
    if interest.contains(Interest::READABLE) {
        mask |= libc::POLLIN | libc::POLLRDHUP;
    }
    if interest.contains(Interest::WRITABLE) {
        mask |= libc::POLLOUT;
    }
    u32::from(mask.cast_unsigned())
}

fn readiness(result: i32) -> Interest {
    if result < 0 {
        return Interest::ERROR;
    }

    let mut ready = Interest::empty();
    let has = |bits: libc::c_short| result & i32::from(bits) != 0;

    ready.set(Interest::READABLE, has(libc::POLLIN | libc::POLLPRI));
    ready.set(Interest::WRITABLE, has(libc::POLLOUT));
    ready.set(Interest::CLOSE, has(libc::POLLHUP | libc::POLLRDHUP));
    ready.set(Interest::ERROR, has(libc::POLLERR | libc::POLLNVAL));
    ready
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;

    use super::*;

    #[test]
    fn user_data_tags() {
        assert_eq!(decode(encode(77, Tag::Op)), (77, Tag::Op));
        assert_eq!(decode(encode(5, Tag::Poll)), (5, Tag::Poll));
        assert_eq!(decode(encode(0, Tag::Wake)), (0, Tag::Wake));
        assert_eq!(decode(encode(0, Tag::Internal)), (0, Tag::Internal));
    }

    #[test]
    fn poll_results_translate() {
        assert_eq!(readiness(i32::from(libc::POLLIN)), Interest::READABLE);
        assert_eq!(readiness(i32::from(libc::POLLOUT | libc::POLLHUP)), Interest::WRITABLE | Interest::CLOSE);
        assert_eq!(readiness(-libc::EBADF), Interest::ERROR);
    }

    #[test]
    fn native_read_completes() {
        if !probe() {
            return;
        }

        let mut uring = Uring::new(8).unwrap();
        let (reader, writer) = crate::pal::unix::pipe(false).unwrap();
        crate::pal::unix::write(std::os::fd::AsFd::as_fd(&writer), b"ring").unwrap();
        let mut target = [0_u8; 8];
        let request = NativeRequest {
            kind: NativeKind::Read,
            ptr: target.as_mut_ptr(),
            len: target.len(),
            offset: None,
        };

        // SAFETY: `target` outlives the completion, which is reaped below.
        let submitted = unsafe { uring.submit(11, RawSource::Fd(reader.as_raw_fd()), request) }.unwrap();
        assert!(matches!(submitted, Submitted::Pending));

        let mut events = Vec::new();
        while events.is_empty() {
            uring.select(&mut events, 8, Some(Duration::from_secs(5))).unwrap();
        }

        assert!(matches!(events.as_slice(), [SelectorEvent::Completed { op: 11, result: Ok(4) }]));
        assert_eq!(&target[..4], b"ring");
    }
}
