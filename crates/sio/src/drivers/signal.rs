// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use tracing::{Level, event};

use crate::drivers::Native;
use crate::pal::RawSource;
use crate::stream::with_default_access;
use crate::{Error, ErrorCode, IoFlags, Result, Stream, StreamFlags, StreamKind, StreamOps};

/// Size of one [`SignalInfo`] record.
pub const SIGNAL_INFO_LEN: usize = 16;

/// One delivered signal, as read from a signal stream.
///
/// The byte form is four native-endian 32-bit fields in declaration order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SignalInfo {
    /// The signal number.
    pub signo: i32,
    /// The platform's reason code (`si_code`), or 0 where unknown.
    pub code: i32,
    /// The sending process, or 0 where unknown.
    pub pid: i32,
    /// The real user of the sending process, or 0 where unknown.
    pub uid: u32,
}

impl SignalInfo {
    /// Encodes the record.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; SIGNAL_INFO_LEN] {
        let mut bytes = [0; SIGNAL_INFO_LEN];
        bytes[0..4].copy_from_slice(&self.signo.to_ne_bytes());
        bytes[4..8].copy_from_slice(&self.code.to_ne_bytes());
        bytes[8..12].copy_from_slice(&self.pid.to_ne_bytes());
        bytes[12..16].copy_from_slice(&self.uid.to_ne_bytes());
        bytes
    }

    /// Decodes a record, or returns `None` if `bytes` is too short.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let field = |index: usize| -> Option<[u8; 4]> { bytes.get(index * 4..index * 4 + 4)?.try_into().ok() };

        Some(Self {
            signo: i32::from_ne_bytes(field(0)?),
            code: i32::from_ne_bytes(field(1)?),
            pid: i32::from_ne_bytes(field(2)?),
            uid: u32::from_ne_bytes(field(3)?),
        })
    }
}

/// Where [`Stream::send_signal()`] delivers a signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalTarget {
    /// The calling process.
    CurrentProcess,
    /// The calling thread.
    CurrentThread,
    /// Another process, by id.
    Process(i32),
}

pub(crate) struct SignalDriver {
    signals: Option<sys::Signals>,
}

impl SignalDriver {
    fn signals(&mut self) -> Result<&mut sys::Signals> {
        self.signals.as_mut().ok_or(Error::Code(ErrorCode::BadHandle))
    }
}

impl StreamOps for SignalDriver {
    fn read(&mut self, buf: &mut [u8], _flags: IoFlags) -> Result<usize> {
        let Some(target) = buf.get_mut(..SIGNAL_INFO_LEN) else {
            return Err(ErrorCode::BufferTooSmall.into());
        };

        let info = self.signals()?.next()?;
        target.copy_from_slice(&info.to_bytes());
        Ok(SIGNAL_INFO_LEN)
    }

    fn write(&mut self, buf: &[u8], _flags: IoFlags) -> Result<usize> {
        let field = |range: std::ops::Range<usize>| buf.get(range).and_then(|bytes| bytes.try_into().ok()).map(i32::from_ne_bytes);

        let (signo, target) = match (buf.len(), field(0..4), field(4..8)) {
            (4, Some(signo), _) => (signo, SignalTarget::CurrentProcess),
            (8, Some(signo), Some(pid)) => (signo, SignalTarget::Process(pid)),
            _ => return Err(Error::invalid_argument()),
        };

        sys::send(signo, target)?;
        Ok(buf.len())
    }

    fn close(&mut self) -> Result<()> {
        drop(self.signals.take());
        Ok(())
    }

    fn raw_source(&self) -> Option<RawSource> {
        self.signals.as_ref().map(sys::Signals::source)
    }

    fn forget_handle(&mut self) {
        if let Some(signals) = self.signals.take() {
            signals.forget();
        }
    }
}

impl Stream {
    /// Creates a stream that receives the given signals.
    ///
    /// Each read (of at least [`SIGNAL_INFO_LEN`] bytes) yields one [`SignalInfo`] record. Writing
    /// a native-endian `i32` signal number sends it to the current process; writing a second
    /// `i32` sends it to that process id instead.
    ///
    /// On Linux the signals are blocked in the calling thread and read through a signalfd, so
    /// signal streams should be created before other threads are spawned. On BSD and macOS the
    /// signals are ignored while any stream watches them and reported through kqueue. On Windows
    /// the stream observes console control events, reported as `SIGINT` (2), `SIGBREAK` (21) and
    /// `SIGTERM` (15). Closing the last stream for a signal restores the previous disposition.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::InvalidArgument`] for an empty or invalid signal set.
    pub fn signal(signals: &[i32], flags: StreamFlags) -> Result<Self> {
        if signals.is_empty() {
            return Err(Error::invalid_argument());
        }

        let mut signals = signals.to_vec();
        signals.sort_unstable();
        signals.dedup();

        let flags = with_default_access(flags, StreamFlags::RDWR);
        let driver = SignalDriver {
            signals: Some(sys::Signals::new(&signals, flags.nonblocking())?),
        };

        let stream = Self::from_native(StreamKind::Signal, flags, Native::Signal(driver));
        event!(Level::TRACE, message = "watching signals", id = %stream.id(), signals = ?signals);
        Ok(stream)
    }

    /// Sends `signo` to `target`.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::InvalidArgument`] for an invalid signal, [`ErrorCode::NoSuchProcess`] for an
    /// unknown process. On Windows only the current process can be targeted.
    pub fn send_signal(signo: i32, target: SignalTarget) -> Result<()> {
        Ok(sys::send(signo, target)?)
    }
}

#[cfg(unix)]
mod posix {
    use std::io;

    use super::SignalTarget;
    use crate::pal::unix::check;

    pub(super) fn send(signo: libc::c_int, target: SignalTarget) -> io::Result<()> {
        match target {
            SignalTarget::CurrentProcess => {
                // SAFETY: No preconditions.
                let pid = unsafe { libc::getpid() };
                // SAFETY: No pointers are involved.
                check(unsafe { libc::kill(pid, signo) })?;
            }
            SignalTarget::Process(pid) => {
                // SAFETY: No pointers are involved.
                check(unsafe { libc::kill(pid, signo) })?;
            }
            SignalTarget::CurrentThread => {
                // SAFETY: No preconditions.
                let thread = unsafe { libc::pthread_self() };
                // SAFETY: `thread` is the calling thread, which is alive.
                let error = unsafe { libc::pthread_kill(thread, signo) };
                if error != 0 {
                    return Err(io::Error::from_raw_os_error(error));
                }
            }
        }
        Ok(())
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod sys {
    use std::collections::BTreeMap;
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};

    use parking_lot::Mutex;

    pub(super) use super::posix::send;
    use super::SignalInfo;
    use crate::pal::RawSource;
    use crate::pal::unix::{check, check_len, retry, signal_set};

    /// How many open streams watch each signal.
    static WATCHERS: Mutex<BTreeMap<libc::c_int, usize>> = Mutex::new(BTreeMap::new());

    pub(super) struct Signals {
        fd: OwnedFd,
        _blocked: Blocked,
    }

    impl Signals {
        pub(super) fn new(signals: &[libc::c_int], nonblocking: bool) -> io::Result<Self> {
            let set = signal_set(signals)?;
            let blocked = Blocked::acquire(signals)?;
            let flags = libc::SFD_CLOEXEC | if nonblocking { libc::SFD_NONBLOCK } else { 0 };

            // SAFETY: `set` is a valid, initialized signal set that outlives the call.
            let fd = check(unsafe { libc::signalfd(-1, &raw const set, flags) })?;

            Ok(Self {
                // SAFETY: `signalfd` returned a fresh descriptor that nothing else owns.
                fd: unsafe { OwnedFd::from_raw_fd(fd) },
                _blocked: blocked,
            })
        }

        pub(super) fn next(&mut self) -> io::Result<SignalInfo> {
            // SAFETY: `signalfd_siginfo` is a plain C structure for which all-zero bytes are valid.
            let mut raw: libc::signalfd_siginfo = unsafe { std::mem::zeroed() };

            retry(|| {
                // SAFETY: `raw` is valid for writes of its own size.
                check_len(unsafe {
                    libc::read(
                        self.fd.as_raw_fd(),
                        (&raw mut raw).cast(),
                        size_of::<libc::signalfd_siginfo>(),
                    )
                })
            })?;

            Ok(SignalInfo {
                signo: raw.ssi_signo.cast_signed(),
                code: raw.ssi_code,
                pid: raw.ssi_pid.cast_signed(),
                uid: raw.ssi_uid,
            })
        }

        pub(super) fn source(&self) -> RawSource {
            RawSource::Fd(self.fd.as_raw_fd())
        }

        pub(super) fn forget(self) {
            let Self { fd, _blocked } = self;
            let _fd = fd.into_raw_fd();
        }
    }

    /// A reference on the blocked state of a set of signals.
    struct Blocked(Vec<libc::c_int>);

    impl Blocked {
        fn acquire(signals: &[libc::c_int]) -> io::Result<Self> {
            let mut watchers = WATCHERS.lock();

            let first: Vec<_> = signals.iter().copied().filter(|signo| !watchers.contains_key(signo)).collect();
            if !first.is_empty() {
                mask(libc::SIG_BLOCK, &first)?;
            }

            for signo in signals {
                *watchers.entry(*signo).or_default() += 1;
            }

            Ok(Self(signals.to_vec()))
        }
    }

    impl Drop for Blocked {
        fn drop(&mut self) {
            let mut watchers = WATCHERS.lock();

            let mut last = Vec::new();
            for signo in &self.0 {
                if let Some(count) = watchers.get_mut(signo) {
                    *count -= 1;
                    if *count == 0 {
                        watchers.remove(signo);
                        last.push(*signo);
                    }
                }
            }

            if !last.is_empty() {
                // Pending instances would otherwise be delivered with their default action the
                // moment the mask is lifted.
                discard_pending(&last);
                if let Err(error) = mask(libc::SIG_UNBLOCK, &last) {
                    tracing::event!(tracing::Level::WARN, message = "failed to unblock signals", signals = ?last, %error);
                }
            }
        }
    }

    fn mask(how: libc::c_int, signals: &[libc::c_int]) -> io::Result<()> {
        let set = signal_set(signals)?;

        // SAFETY: `set` is a valid, initialized signal set; the previous mask is not requested.
        let error = unsafe { libc::pthread_sigmask(how, &raw const set, std::ptr::null_mut()) };
        if error == 0 { Ok(()) } else { Err(io::Error::from_raw_os_error(error)) }
    }

    fn discard_pending(signals: &[libc::c_int]) {
        let Ok(set) = signal_set(signals) else {
            return;
        };
        // SAFETY: `timespec` is a plain C structure for which all-zero bytes are valid.
        let zero: libc::timespec = unsafe { std::mem::zeroed() };

        // SAFETY: `set` and `zero` are valid for the duration of the call; no info is requested.
        while unsafe { libc::sigtimedwait(&raw const set, std::ptr::null_mut(), &raw const zero) } > 0 {}
    }
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
mod sys {
    use std::collections::BTreeMap;
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};

    use parking_lot::Mutex;

    pub(super) use super::posix::send;
    use super::SignalInfo;
    use crate::pal::RawSource;
    use crate::pal::unix::{check, retry, set_cloexec, set_nonblocking};

    /// How many open streams watch each signal, and the disposition to restore afterwards.
    static WATCHERS: Mutex<BTreeMap<libc::c_int, (usize, libc::sighandler_t)>> = Mutex::new(BTreeMap::new());

    pub(super) struct Signals {
        kq: OwnedFd,
        _ignored: Ignored,
    }

    impl Signals {
        pub(super) fn new(signals: &[libc::c_int], nonblocking: bool) -> io::Result<Self> {
            // SAFETY: No pointers are involved.
            let kq = check(unsafe { libc::kqueue() })?;
            // SAFETY: `kqueue` returned a fresh descriptor that nothing else owns.
            let kq = unsafe { OwnedFd::from_raw_fd(kq) };
            set_cloexec(kq.as_raw_fd(), true)?;
            set_nonblocking(kq.as_raw_fd(), nonblocking)?;

            let ignored = Ignored::acquire(signals)?;
            for signo in signals {
                // SAFETY: `kevent` is a plain C structure for which all-zero bytes are valid.
                let mut change: libc::kevent = unsafe { std::mem::zeroed() };
                change.ident = usize::try_from(*signo).map_err(|_negative| io::Error::from(io::ErrorKind::InvalidInput))?;
                change.filter = libc::EVFILT_SIGNAL;
                change.flags = libc::EV_ADD | libc::EV_ENABLE;

                // SAFETY: `change` is valid for one entry and no results are requested.
                check(unsafe { libc::kevent(kq.as_raw_fd(), &raw const change, 1, std::ptr::null_mut(), 0, std::ptr::null()) })?;
            }

            Ok(Self { kq, _ignored: ignored })
        }

        pub(super) fn next(&mut self) -> io::Result<SignalInfo> {
            let nonblocking = crate::pal::unix::is_nonblocking(self.kq.as_raw_fd())?;
            // SAFETY: `kevent` is a plain C structure for which all-zero bytes are valid.
            let mut event: libc::kevent = unsafe { std::mem::zeroed() };
            // SAFETY: As above.
            let zero: libc::timespec = unsafe { std::mem::zeroed() };
            let timeout = if nonblocking { &raw const zero } else { std::ptr::null() };

            let ready = retry(|| {
                // SAFETY: `event` is valid for one result and `timeout` is null or points at `zero`.
                check(unsafe { libc::kevent(self.kq.as_raw_fd(), std::ptr::null(), 0, &raw mut event, 1, timeout) })
            })?;
            if ready == 0 {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }

            Ok(SignalInfo {
                signo: i32::try_from(event.ident).unwrap_or_default(),
                ..SignalInfo::default()
            })
        }

        pub(super) fn source(&self) -> RawSource {
            RawSource::Fd(self.kq.as_raw_fd())
        }

        pub(super) fn forget(self) {
            let Self { kq, _ignored } = self;
            let _fd = kq.into_raw_fd();
        }
    }

    /// A reference on the ignored disposition of a set of signals.
    struct Ignored(Vec<libc::c_int>);

    impl Ignored {
        fn acquire(signals: &[libc::c_int]) -> io::Result<Self> {
            let mut watchers = WATCHERS.lock();

            for signo in signals {
                if let Some((count, _)) = watchers.get_mut(signo) {
                    *count += 1;
                    continue;
                }

                // SAFETY: Installs the ignore disposition, which runs no code.
                let previous = unsafe { libc::signal(*signo, libc::SIG_IGN) };
                if previous == libc::SIG_ERR {
                    return Err(io::Error::last_os_error());
                }
                watchers.insert(*signo, (1, previous));
            }

            Ok(Self(signals.to_vec()))
        }
    }

    impl Drop for Ignored {
        fn drop(&mut self) {
            let mut watchers = WATCHERS.lock();

            for signo in &self.0 {
                let Some((count, previous)) = watchers.get_mut(signo) else {
                    continue;
                };
                *count -= 1;
                if *count == 0 {
                    let previous = *previous;
                    watchers.remove(signo);
                    // SAFETY: Restores the disposition that was installed before this library
                    // took over the signal.
                    unsafe { libc::signal(*signo, previous) };
                }
            }
        }
    }
}

#[cfg(windows)]
mod sys {
    use std::collections::VecDeque;
    use std::io;
    use std::os::windows::io::{AsRawHandle, FromRawHandle, IntoRawHandle, OwnedHandle};

    use parking_lot::Mutex;
    use windows_sys::Win32::Foundation::{HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT};
    use windows_sys::core::BOOL;
    use windows_sys::Win32::System::Console::{CTRL_BREAK_EVENT, CTRL_C_EVENT, SetConsoleCtrlHandler};
    use windows_sys::Win32::System::Threading::{CreateEventW, INFINITE, ResetEvent, SetEvent, WaitForSingleObject};

    use super::{SignalInfo, SignalTarget};
    use crate::pal::RawSource;
    use crate::pal::windows::check_bool;

    const SIGINT: i32 = 2;
    const SIGTERM: i32 = 15;
    const SIGBREAK: i32 = 21;

    struct Watcher {
        id: u64,
        signals: Vec<i32>,
        pending: VecDeque<i32>,
        event: isize,
    }

    /// The process-wide console control handler and the streams it feeds.
    struct Registry {
        installed: bool,
        next_id: u64,
        watchers: Vec<Watcher>,
    }

    static REGISTRY: Mutex<Registry> = Mutex::new(Registry {
        installed: false,
        next_id: 0,
        watchers: Vec::new(),
    });

    unsafe extern "system" fn on_console_event(event: u32) -> BOOL {
        let signo = match event {
            CTRL_C_EVENT => SIGINT,
            CTRL_BREAK_EVENT => SIGBREAK,
            _ => SIGTERM,
        };

        BOOL::from(deliver(signo))
    }

    fn deliver(signo: i32) -> bool {
        let mut registry = REGISTRY.lock();
        let mut delivered = false;

        for watcher in registry.watchers.iter_mut().filter(|watcher| watcher.signals.contains(&signo)) {
            watcher.pending.push_back(signo);
            // SAFETY: The event handle stays open while its watcher is registered.
            unsafe { SetEvent(watcher.event as HANDLE) };
            delivered = true;
        }

        delivered
    }

    pub(super) fn send(signo: i32, target: SignalTarget) -> io::Result<()> {
        match target {
            SignalTarget::CurrentProcess | SignalTarget::CurrentThread => {
                deliver(signo);
                Ok(())
            }
            SignalTarget::Process(_) => Err(io::Error::from(io::ErrorKind::Unsupported)),
        }
    }

    pub(super) struct Signals {
        id: u64,
        event: Option<OwnedHandle>,
        nonblocking: bool,
    }

    impl Signals {
        pub(super) fn new(signals: &[i32], nonblocking: bool) -> io::Result<Self> {
            if signals.iter().any(|signo| ![SIGINT, SIGTERM, SIGBREAK].contains(signo)) {
                return Err(io::Error::from(io::ErrorKind::InvalidInput));
            }

            // SAFETY: Default security, manual reset, initially clear, unnamed.
            let event = unsafe { CreateEventW(std::ptr::null(), 1, 0, std::ptr::null()) };
            if event.is_null() {
                return Err(io::Error::last_os_error());
            }
            // SAFETY: `CreateEventW` returned a fresh handle that nothing else owns.
            let event = unsafe { OwnedHandle::from_raw_handle(event) };

            let mut registry = REGISTRY.lock();
            if !registry.installed {
                // SAFETY: The handler is a plain function that lives for the whole process.
                check_bool(unsafe { SetConsoleCtrlHandler(Some(on_console_event), 1) })?;
                registry.installed = true;
            }

            let id = registry.next_id;
            registry.next_id += 1;
            registry.watchers.push(Watcher {
                id,
                signals: signals.to_vec(),
                pending: VecDeque::new(),
                event: event.as_raw_handle() as isize,
            });

            Ok(Self {
                id,
                event: Some(event),
                nonblocking,
            })
        }

        pub(super) fn next(&mut self) -> io::Result<SignalInfo> {
            let event = self.event.as_ref().map_or(std::ptr::null_mut(), AsRawHandle::as_raw_handle);

            loop {
                {
                    let mut registry = REGISTRY.lock();
                    if let Some(watcher) = registry.watchers.iter_mut().find(|watcher| watcher.id == self.id) {
                        if let Some(signo) = watcher.pending.pop_front() {
                            if watcher.pending.is_empty() {
                                // SAFETY: The event handle is owned by this stream.
                                unsafe { ResetEvent(event) };
                            }
                            return Ok(SignalInfo {
                                signo,
                                ..SignalInfo::default()
                            });
                        }
                    }
                }

                let millis = if self.nonblocking { 0 } else { INFINITE };
                // SAFETY: The event handle is owned by this stream.
                match unsafe { WaitForSingleObject(event, millis) } {
                    WAIT_OBJECT_0 => {}
                    WAIT_TIMEOUT => return Err(io::Error::from(io::ErrorKind::WouldBlock)),
                    _ => return Err(io::Error::last_os_error()),
                }
            }
        }

        pub(super) fn source(&self) -> RawSource {
            RawSource::Handle(self.event.as_ref().map_or(0, |event| event.as_raw_handle() as isize))
        }

        pub(super) fn forget(mut self) {
            if let Some(event) = self.event.take() {
                let _handle = event.into_raw_handle();
            }
        }
    }

    impl Drop for Signals {
        fn drop(&mut self) {
            let mut registry = REGISTRY.lock();
            registry.watchers.retain(|watcher| watcher.id != self.id);

            if registry.watchers.is_empty() && registry.installed {
                // SAFETY: Removes the handler installed above.
                unsafe { SetConsoleCtrlHandler(Some(on_console_event), 0) };
                registry.installed = false;
            }
        }
    }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    windows
)))]
mod sys {
    use std::io;

    #[cfg(unix)]
    pub(super) use super::posix::send;
    use super::SignalInfo;
    use crate::pal::RawSource;

    pub(super) enum Signals {}

    impl Signals {
        pub(super) fn new(_signals: &[i32], _nonblocking: bool) -> io::Result<Self> {
            Err(io::Error::from(io::ErrorKind::Unsupported))
        }

        pub(super) fn next(&mut self) -> io::Result<SignalInfo> {
            match *self {}
        }

        pub(super) fn source(&self) -> RawSource {
            match *self {}
        }

        pub(super) fn forget(self) {
            match self {}
        }
    }
}
