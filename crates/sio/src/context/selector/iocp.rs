// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Windows I/O completion ports.
//!
//! Socket transfers are native overlapped operations. Readiness has no completion port
//! equivalent, so registered sources are probed on every call, and while any are registered the
//! port is waited on in short slices.

use std::collections::{HashMap, HashSet};
use std::io;
use std::time::Duration;

use tracing::{Level, event};
use windows_sys::Win32::Foundation::{CloseHandle, ERROR_IO_PENDING, ERROR_NOT_FOUND, HANDLE, INVALID_HANDLE_VALUE, WAIT_TIMEOUT};
use windows_sys::Win32::Storage::FileSystem::{ReadFile, SetFileCompletionNotificationModes, WriteFile};
use windows_sys::Win32::System::IO::{
    CancelIoEx, CreateIoCompletionPort, GetOverlappedResult, GetQueuedCompletionStatusEx, OVERLAPPED, OVERLAPPED_ENTRY,
    PostQueuedCompletionStatus,
};
use windows_sys::Win32::System::WindowsProgramming::{FILE_SKIP_COMPLETION_PORT_ON_SUCCESS, FILE_SKIP_SET_EVENT_ON_HANDLE};

use super::{NativeKind, NativeRequest, Registered, Selected, Selector, SelectorEvent, Submitted};
use crate::context::Interest;
use crate::context::notifier::WakeSignal;
use crate::pal::windows::{check_bool, is_end_of_data, positioned, probe_ready};
use crate::pal::{Direction, RawSource, timeout_millis};
use crate::{Error, ErrorCode, Result};

/// Completion key of wake-up packets. Transfers use key zero.
const WAKE_KEY: usize = usize::MAX;

/// Longest time the port is waited on while registered sources need probing.
const PROBE_INTERVAL: Duration = Duration::from_millis(10);

/// Max number of packets dequeued in one call.
const BATCH: usize = 256;

/// An owned completion port handle, shared with notifiers.
#[derive(Debug)]
pub(crate) struct Port {
    handle: HANDLE,
}

// SAFETY: Completion ports can be used from any thread; the handle is only closed on drop.
unsafe impl Send for Port {}
// SAFETY: As above; posting and dequeuing are thread-safe operations of the port.
unsafe impl Sync for Port {}

impl Port {
    fn new() -> Result<Self> {
        // SAFETY: Creates a new port without associating any handle.
        let handle = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, std::ptr::null_mut(), 0, 1) };
        if handle.is_null() {
            return Err(Error::last_os_error());
        }

        Ok(Self { handle })
    }

    /// Queues a wake-up packet.
    pub(crate) fn post_wake(&self) -> Result<()> {
        // SAFETY: The port is open for the lifetime of `self` and the packet carries no memory.
        Ok(check_bool(unsafe { PostQueuedCompletionStatus(self.handle, 0, WAKE_KEY, std::ptr::null()) })?)
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        // SAFETY: The handle is owned by `self` and closed exactly once.
        unsafe { CloseHandle(self.handle) };
    }
}

#[derive(Debug)]
struct InFlight {
    handle: HANDLE,
    overlapped: Box<OVERLAPPED>,
}

#[derive(Debug)]
pub(crate) struct Iocp {
    port: std::sync::Arc<Port>,
    associated: HashSet<usize>,
    watches: HashMap<u64, (RawSource, Interest)>,
    in_flight: HashMap<u64, InFlight>,
    /// Maps the address of each in-flight `OVERLAPPED` to its operation.
    by_address: HashMap<usize, u64>,
    entries: Vec<OVERLAPPED_ENTRY>,
}

// SAFETY: The handles and `OVERLAPPED` structures are owned by the selector and usable from
// any thread; the kernel references them by address, which moving the selector does not change.
unsafe impl Send for Iocp {}

impl Iocp {
    pub(crate) fn new() -> Result<Self> {
        let port = Port::new()?;
        event!(Level::TRACE, message = "created completion port", port = ?port.handle);

        Ok(Self {
            port: std::sync::Arc::new(port),
            associated: HashSet::new(),
            watches: HashMap::new(),
            in_flight: HashMap::new(),
            by_address: HashMap::new(),
            entries: Vec::new(),
        })
    }

    #[cfg_attr(test, mutants::skip)] // Mutates | into ^ which is a no-op and false positive.
    fn associate(&mut self, handle: HANDLE) -> Result<()> {
        if !self.associated.insert(handle.addr()) {
            return Ok(());
        }

        // SAFETY: Both handles are open; the stream stays open while it has operations here.
        let port = unsafe { CreateIoCompletionPort(handle, self.port.handle, 0, 0) };
        if port.is_null() {
            self.associated.remove(&handle.addr());
            return Err(Error::last_os_error());
        }

        // Synchronous completions are handled inline and never produce a packet.
        #[expect(clippy::cast_possible_truncation, reason = "constant value guaranteed to fit")]
        let modes = (FILE_SKIP_SET_EVENT_ON_HANDLE | FILE_SKIP_COMPLETION_PORT_ON_SUCCESS) as u8;
        // SAFETY: Only the notification behavior of the handle changes.
        check_bool(unsafe { SetFileCompletionNotificationModes(handle, modes) })?;
        Ok(())
    }

    fn probe(&self, events: &mut Vec<SelectorEvent>, max_events: usize) -> Result<()> {
        for (&token, &(source, interest)) in &self.watches {
            if events.len() >= max_events {
                break;
            }

            let mut ready = Interest::empty();
            if interest.contains(Interest::READABLE) && probe_ready(source, Direction::Read)? {
                ready |= Interest::READABLE;
            }
            if interest.contains(Interest::WRITABLE) && probe_ready(source, Direction::Write)? {
                ready |= Interest::WRITABLE;
            }
            if !ready.is_empty() {
                events.push(SelectorEvent::Ready { token, ready });
            }
        }
        Ok(())
    }

    fn finish(&mut self, address: usize) -> Option<(u64, io::Result<usize>)> {
        let op = self.by_address.remove(&address)?;
        let in_flight = self.in_flight.remove(&op)?;
        Some((op, overlapped_result(in_flight.handle, &in_flight.overlapped)))
    }
}

fn overlapped_result(handle: HANDLE, overlapped: &OVERLAPPED) -> io::Result<usize> {
    let mut count = 0_u32;

    // SAFETY: The operation has finished, so the kernel no longer writes to `overlapped`.
    match check_bool(unsafe { GetOverlappedResult(handle, overlapped, &raw mut count, 0) }) {
        Ok(()) => Ok(count as usize),
        Err(error) if is_end_of_data(&error) => Ok(0),
        Err(error) => Err(error),
    }
}

fn handle_of(source: RawSource) -> HANDLE {
    match source {
        RawSource::Socket(socket) => socket as HANDLE,
        RawSource::Handle(handle) => handle as HANDLE,
    }
}

impl Selector for Iocp {
    fn register(&mut self, source: RawSource, token: u64, interest: Interest) -> Result<Registered> {
        if self.watches.insert(token, (source, interest)).is_some() {
            return Err(ErrorCode::AlreadyExists.into());
        }
        Ok(Registered::Watched)
    }

    fn reregister(&mut self, source: RawSource, token: u64, interest: Interest) -> Result<()> {
        let entry = self.watches.get_mut(&token).ok_or(Error::Code(ErrorCode::NotFound))?;
        *entry = (source, interest);
        Ok(())
    }

    fn deregister(&mut self, _source: RawSource, token: u64) -> Result<()> {
        self.watches.remove(&token);
        Ok(())
    }

    fn select(&mut self, events: &mut Vec<SelectorEvent>, max_events: usize, timeout: Option<Duration>) -> Result<Selected> {
        let before = events.len();
        self.probe(events, max_events)?;

        let timeout = if events.len() > before {
            Some(Duration::ZERO)
        } else if self.watches.is_empty() {
            timeout
        } else {
            Some(timeout.map_or(PROBE_INTERVAL, |timeout| timeout.min(PROBE_INTERVAL)))
        };
        let millis = timeout.map_or(u32::MAX, |_| timeout_millis(timeout).cast_unsigned());

        let capacity = max_events.clamp(1, BATCH);
        self.entries.clear();
        // SAFETY: `OVERLAPPED_ENTRY` is a plain C structure for which all-zero bytes are valid.
        self.entries.resize(capacity, unsafe { std::mem::zeroed() });
        let mut removed = 0_u32;

        // SAFETY: `entries` is valid for writes of `capacity` entries and `removed` for one count.
        let ret = unsafe {
            GetQueuedCompletionStatusEx(
                self.port.handle,
                self.entries.as_mut_ptr(),
                u32::try_from(capacity).unwrap_or(u32::MAX),
                &raw mut removed,
                millis,
                0,
            )
        };

        let mut selected = Selected::default();
        match check_bool(ret) {
            Ok(()) => {}
            Err(error) if error.raw_os_error() == Some(WAIT_TIMEOUT.cast_signed()) => return Ok(selected),
            Err(error) => return Err(error.into()),
        }

        let packets: Vec<(usize, usize)> = self.entries[..removed as usize]
            .iter()
            .map(|entry| (entry.lpCompletionKey, entry.lpOverlapped.addr()))
            .collect();

        for (key, address) in packets {
            if key == WAKE_KEY {
                selected.woken = true;
                continue;
            }

            if let Some((op, result)) = self.finish(address) {
                events.push(SelectorEvent::Completed { op, result });
            }
        }

        Ok(selected)
    }

    fn wake_signal(&self) -> WakeSignal {
        WakeSignal::Port(std::sync::Arc::clone(&self.port))
    }

    fn supports_native(&self, source: RawSource) -> bool {
        matches!(source, RawSource::Socket(_))
    }

    unsafe fn submit(&mut self, op: u64, source: RawSource, request: NativeRequest) -> Result<Submitted> {
        if !self.supports_native(source) {
            return Err(Error::unsupported());
        }

        let handle = handle_of(source);
        self.associate(handle)?;

        // SAFETY: `OVERLAPPED` is a plain C structure for which all-zero bytes are a valid value.
        let mut overlapped = Box::new(positioned(request.offset).unwrap_or_else(|| unsafe { std::mem::zeroed() }));
        let overlapped_ptr: *mut OVERLAPPED = &raw mut *overlapped;
        let len = u32::try_from(request.len).unwrap_or(u32::MAX);

        let ret = match request.kind {
            // SAFETY: The caller keeps the memory valid until completion; `overlapped` is boxed
            // and kept until the completion is dequeued.
            NativeKind::Read => unsafe { ReadFile(handle, request.ptr, len, std::ptr::null_mut(), overlapped_ptr) },
            // SAFETY: As above.
            NativeKind::Write => unsafe { WriteFile(handle, request.ptr.cast_const(), len, std::ptr::null_mut(), overlapped_ptr) },
        };

        match check_bool(ret) {
            Ok(()) => Ok(Submitted::Done(overlapped_result(handle, &overlapped))),
            Err(error) if error.raw_os_error() == Some(ERROR_IO_PENDING.cast_signed()) => {
                self.by_address.insert(overlapped_ptr.addr(), op);
                self.in_flight.insert(op, InFlight { handle, overlapped });
                Ok(Submitted::Pending)
            }
            Err(error) if is_end_of_data(&error) => Ok(Submitted::Done(Ok(0))),
            Err(error) => Ok(Submitted::Done(Err(error))),
        }
    }

    fn cancel(&mut self, op: u64) -> Result<()> {
        let Some(in_flight) = self.in_flight.get(&op) else {
            return Ok(());
        };

        // SAFETY: The `OVERLAPPED` identifies an operation issued on this handle.
        match check_bool(unsafe { CancelIoEx(in_flight.handle, &raw const *in_flight.overlapped) }) {
            Err(error) if error.raw_os_error() != Some(ERROR_NOT_FOUND.cast_signed()) => Err(error.into()),
            _ => Ok(()),
        }
    }
}

impl Drop for Iocp {
    fn drop(&mut self) {
        // The kernel may still write to the structures of operations that never completed.
        for (_, in_flight) in self.in_flight.drain() {
            Box::leak(in_flight.overlapped);
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_packets_are_reported() {
        let mut iocp = Iocp::new().unwrap();
        let mut events = Vec::new();

        iocp.port.post_wake().unwrap();
        let selected = iocp.select(&mut events, 8, Some(Duration::from_secs(5))).unwrap();

        assert!(selected.woken);
        assert!(events.is_empty());
    }

    #[test]
    fn idle_port_times_out() {
        let mut iocp = Iocp::new().unwrap();
        let mut events = Vec::new();

        let selected = iocp.select(&mut events, 8, Some(Duration::from_millis(1))).unwrap();

        assert_eq!(selected, Selected::default());
    }

    #[test]
    fn only_sockets_are_native() {
        let iocp = Iocp::new().unwrap();

        assert!(iocp.supports_native(RawSource::Socket(1)));
        assert!(!iocp.supports_native(RawSource::Handle(1)));
    }
}
