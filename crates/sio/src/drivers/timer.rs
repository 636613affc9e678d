// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use crate::drivers::Native;
use crate::pal::RawSource;
use crate::stream::with_default_access;
use crate::{Error, ErrorCode, IoFlags, OptionId, OptionValue, Result, Stream, StreamFlags, StreamKind, StreamOps};

/// Size of the expiration count a timer read yields.
pub const TIMER_READ_LEN: usize = 8;

/// Size of the `{initial_ns, period_ns}` record a timer write accepts.
pub const TIMER_RECORD_LEN: usize = 16;

/// When a timer first expires and how often it repeats.
///
/// A zero `period` makes the timer one-shot; a zero `initial` disarms it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimerSpec {
    /// Delay until the first expiration.
    pub initial: Duration,
    /// Interval between later expirations.
    pub period: Duration,
}

impl TimerSpec {
    /// A timer that expires once after `initial`.
    #[must_use]
    pub const fn once(initial: Duration) -> Self {
        Self {
            initial,
            period: Duration::ZERO,
        }
    }

    /// A timer that expires after `initial` and then every `period`.
    #[must_use]
    pub const fn periodic(initial: Duration, period: Duration) -> Self {
        Self { initial, period }
    }

    /// Whether the timer is disarmed.
    #[must_use]
    pub const fn is_disarmed(&self) -> bool {
        self.initial.is_zero()
    }

    /// Encodes the settings as the native-endian `{initial_ns: u64, period_ns: u64}` record.
    #[must_use]
    pub fn to_record(&self) -> [u8; TIMER_RECORD_LEN] {
        let mut record = [0; TIMER_RECORD_LEN];
        record[..8].copy_from_slice(&nanos(self.initial).to_ne_bytes());
        record[8..].copy_from_slice(&nanos(self.period).to_ne_bytes());
        record
    }

    /// Decodes a record written by [`to_record()`][Self::to_record].
    ///
    /// # Errors
    ///
    /// [`ErrorCode::InvalidArgument`] if `record` is shorter than [`TIMER_RECORD_LEN`].
    pub fn from_record(record: &[u8]) -> Result<Self> {
        let (Some(initial), Some(period)) = (record.get(..8), record.get(8..16)) else {
            return Err(Error::invalid_argument());
        };

        let field = |bytes: &[u8]| {
            let mut raw = [0; 8];
            raw.copy_from_slice(bytes);
            Duration::from_nanos(u64::from_ne_bytes(raw))
        };

        Ok(Self {
            initial: field(initial),
            period: field(period),
        })
    }
}

fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

pub(crate) struct TimerDriver {
    timer: Option<sys::Timer>,
    spec: TimerSpec,
}

impl TimerDriver {
    fn new(spec: TimerSpec, nonblocking: bool) -> Result<Self> {
        let mut timer = sys::Timer::new(nonblocking)?;
        timer.arm(spec)?;

        Ok(Self {
            timer: Some(timer),
            spec,
        })
    }

    fn timer(&mut self) -> Result<&mut sys::Timer> {
        self.timer.as_mut().ok_or(Error::Code(ErrorCode::BadHandle))
    }

    fn rearm(&mut self, spec: TimerSpec) -> Result<()> {
        self.timer()?.arm(spec)?;
        self.spec = spec;
        Ok(())
    }
}

impl StreamOps for TimerDriver {
    fn read(&mut self, buf: &mut [u8], _flags: IoFlags) -> Result<usize> {
        let Some(target) = buf.get_mut(..TIMER_READ_LEN) else {
            return Err(ErrorCode::BufferTooSmall.into());
        };

        let expirations = self.timer()?.wait()?;
        target.copy_from_slice(&expirations.to_ne_bytes());
        Ok(TIMER_READ_LEN)
    }

    fn write(&mut self, buf: &[u8], _flags: IoFlags) -> Result<usize> {
        self.rearm(TimerSpec::from_record(buf)?)?;
        Ok(TIMER_RECORD_LEN)
    }

    fn get_option(&mut self, id: OptionId) -> Result<OptionValue> {
        let as_option = |duration: Duration| OptionValue::Duration((!duration.is_zero()).then_some(duration));

        match id {
            OptionId::TIMER_INTERVAL => Ok(as_option(self.spec.period)),
            OptionId::TIMER_INITIAL => Ok(as_option(self.spec.initial)),
            _ => Err(Error::unsupported()),
        }
    }

    fn set_option(&mut self, id: OptionId, value: &OptionValue) -> Result<()> {
        let duration = value.as_duration()?.unwrap_or_default();

        match id {
            OptionId::TIMER_INTERVAL => self.rearm(TimerSpec {
                period: duration,
                ..self.spec
            }),
            OptionId::TIMER_INITIAL => self.rearm(TimerSpec {
                initial: duration,
                ..self.spec
            }),
            _ => Err(Error::unsupported()),
        }
    }

    fn close(&mut self) -> Result<()> {
        drop(self.timer.take());
        Ok(())
    }

    fn raw_source(&self) -> Option<RawSource> {
        self.timer.as_ref().map(sys::Timer::source)
    }

    fn forget_handle(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.forget();
        }
    }
}

impl Stream {
    /// Creates a timer stream.
    ///
    /// Reading (at least [`TIMER_READ_LEN`] bytes) waits for the next expiration and yields the
    /// number of expirations since the previous read as a native-endian `u64`; Windows always
    /// reports 1. A non-blocking timer that has not expired reports [`ErrorCode::WouldBlock`].
    /// Writing a [`TimerSpec::to_record()`] record re-arms the timer.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::Unsupported`] on platforms without a pollable timer.
    ///
    /// # Example
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use sio::{Stream, StreamFlags, TimerSpec};
    ///
    /// let mut timer = Stream::timer(TimerSpec::once(Duration::from_millis(5)), StreamFlags::empty())?;
    /// let mut count = [0_u8; 8];
    /// timer.read(&mut count)?;
    /// assert_eq!(u64::from_ne_bytes(count), 1);
    /// # Ok::<(), sio::Error>(())
    /// ```
    pub fn timer(spec: TimerSpec, flags: StreamFlags) -> Result<Self> {
        let flags = with_default_access(flags, StreamFlags::RDWR);
        let driver = TimerDriver::new(spec, flags.nonblocking())?;

        Ok(Self::from_native(StreamKind::Timer, flags, Native::Timer(driver)))
    }

    /// Re-arms a timer stream.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::Unsupported`] for kinds that are not timers.
    pub fn set_timer(&mut self, spec: TimerSpec) -> Result<()> {
        match self.native_mut()? {
            Native::Timer(driver) => driver.rearm(spec),
            _ => Err(Error::unsupported()),
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod sys {
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};

    use super::TimerSpec;
    use crate::pal::RawSource;
    use crate::pal::unix::{check, read, timespec};

    pub(super) struct Timer {
        fd: OwnedFd,
    }

    impl Timer {
        pub(super) fn new(nonblocking: bool) -> io::Result<Self> {
            let flags = libc::TFD_CLOEXEC | if nonblocking { libc::TFD_NONBLOCK } else { 0 };

            // SAFETY: No pointers are involved.
            let fd = check(unsafe { libc::timerfd_create(libc::CLOCK_MONOTONIC, flags) })?;

            // SAFETY: `timerfd_create` returned a fresh descriptor that nothing else owns.
            Ok(Self {
                fd: unsafe { OwnedFd::from_raw_fd(fd) },
            })
        }

        pub(super) fn arm(&mut self, spec: TimerSpec) -> io::Result<()> {
            // SAFETY: `itimerspec` is a plain C structure for which all-zero bytes are valid.
            let mut value: libc::itimerspec = unsafe { std::mem::zeroed() };
            value.it_value = timespec(spec.initial);
            value.it_interval = timespec(spec.period);

            // SAFETY: `value` outlives the call; the previous value is not requested.
            check(unsafe { libc::timerfd_settime(self.fd.as_raw_fd(), 0, &raw const value, std::ptr::null_mut()) })?;
            Ok(())
        }

        pub(super) fn wait(&mut self) -> io::Result<u64> {
            use std::os::fd::AsFd;

            let mut count = [0_u8; 8];
            read(self.fd.as_fd(), &mut count)?;
            Ok(u64::from_ne_bytes(count))
        }

        pub(super) fn source(&self) -> RawSource {
            RawSource::Fd(self.fd.as_raw_fd())
        }

        pub(super) fn forget(self) {
            let _fd = self.fd.into_raw_fd();
        }
    }
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
mod sys {
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};

    use super::TimerSpec;
    use crate::pal::RawSource;
    use crate::pal::unix::{check, retry, set_cloexec};

    const IDENT: usize = 1;
    const MAX_NANOS: u64 = 1 << 62;

    /// A kqueue carrying one `EVFILT_TIMER`, which makes the queue descriptor itself pollable.
    pub(super) struct Timer {
        kq: OwnedFd,
        nonblocking: bool,
        /// Period to switch to after the first expiration, when it differs from the initial delay.
        pending_period: Option<u64>,
    }

    impl Timer {
        pub(super) fn new(nonblocking: bool) -> io::Result<Self> {
            // SAFETY: No pointers are involved.
            let kq = check(unsafe { libc::kqueue() })?;
            // SAFETY: `kqueue` returned a fresh descriptor that nothing else owns.
            let kq = unsafe { OwnedFd::from_raw_fd(kq) };
            set_cloexec(kq.as_raw_fd(), true)?;

            Ok(Self {
                kq,
                nonblocking,
                pending_period: None,
            })
        }

        pub(super) fn arm(&mut self, spec: TimerSpec) -> io::Result<()> {
            match self.change(libc::EV_DELETE, 0) {
                Err(error) if error.raw_os_error() != Some(libc::ENOENT) => return Err(error),
                _ => {}
            }
            self.pending_period = None;

            if spec.is_disarmed() {
                return Ok(());
            }

            let initial = super::nanos(spec.initial);
            let period = super::nanos(spec.period);
            if period == initial {
                self.change(libc::EV_ADD | libc::EV_ENABLE, initial)
            } else {
                self.pending_period = (period != 0).then_some(period);
                self.change(libc::EV_ADD | libc::EV_ENABLE | libc::EV_ONESHOT, initial)
            }
        }

        pub(super) fn wait(&mut self) -> io::Result<u64> {
            // SAFETY: `kevent` is a plain C structure for which all-zero bytes are valid.
            let mut event: libc::kevent = unsafe { std::mem::zeroed() };
            // SAFETY: As above.
            let zero: libc::timespec = unsafe { std::mem::zeroed() };
            let timeout = if self.nonblocking { &raw const zero } else { std::ptr::null() };

            let ready = retry(|| {
                // SAFETY: `event` is valid for one result and `timeout` is null or points at `zero`.
                check(unsafe { libc::kevent(self.kq.as_raw_fd(), std::ptr::null(), 0, &raw mut event, 1, timeout) })
            })?;
            if ready == 0 {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }

            if let Some(period) = self.pending_period.take() {
                self.change(libc::EV_ADD | libc::EV_ENABLE, period)?;
            }

            Ok(u64::try_from(event.data).unwrap_or(1).max(1))
        }

        pub(super) fn source(&self) -> RawSource {
            RawSource::Fd(self.kq.as_raw_fd())
        }

        pub(super) fn forget(self) {
            let _fd = self.kq.into_raw_fd();
        }

        fn change(&self, flags: u16, nanos: u64) -> io::Result<()> {
            // SAFETY: `kevent` is a plain C structure for which all-zero bytes are valid.
            let mut change: libc::kevent = unsafe { std::mem::zeroed() };
            change.ident = IDENT;
            change.filter = libc::EVFILT_TIMER;
            change.flags = flags;
            change.fflags = libc::NOTE_NSECONDS;
            change.data = nanos.min(MAX_NANOS).try_into().unwrap_or_default();

            // SAFETY: `change` is valid for one entry and no results are requested.
            check(unsafe { libc::kevent(self.kq.as_raw_fd(), &raw const change, 1, std::ptr::null_mut(), 0, std::ptr::null()) })?;
            Ok(())
        }
    }
}

#[cfg(windows)]
mod sys {
    use std::io;
    use std::os::windows::io::{AsRawHandle, FromRawHandle, IntoRawHandle, OwnedHandle};

    use windows_sys::Win32::Foundation::{WAIT_OBJECT_0, WAIT_TIMEOUT};
    use windows_sys::Win32::System::Threading::{
        CancelWaitableTimer, CreateWaitableTimerW, INFINITE, SetWaitableTimer, WaitForSingleObject,
    };

    use super::TimerSpec;
    use crate::pal::RawSource;
    use crate::pal::windows::check_bool;

    pub(super) struct Timer {
        handle: OwnedHandle,
        nonblocking: bool,
    }

    impl Timer {
        pub(super) fn new(nonblocking: bool) -> io::Result<Self> {
            // SAFETY: Default security, auto-reset, unnamed.
            let handle = unsafe { CreateWaitableTimerW(std::ptr::null(), 0, std::ptr::null()) };
            if handle.is_null() {
                return Err(io::Error::last_os_error());
            }

            // SAFETY: `CreateWaitableTimerW` returned a fresh handle that nothing else owns.
            Ok(Self {
                handle: unsafe { OwnedHandle::from_raw_handle(handle) },
                nonblocking,
            })
        }

        pub(super) fn arm(&mut self, spec: TimerSpec) -> io::Result<()> {
            if spec.is_disarmed() {
                // SAFETY: The handle is owned by this timer.
                return check_bool(unsafe { CancelWaitableTimer(self.handle.as_raw_handle()) });
            }

            // Negative due times are relative, in 100 ns units.
            let due = -i64::try_from(spec.initial.as_nanos().div_ceil(100)).unwrap_or(i64::MAX);
            let period = i32::try_from(spec.period.as_millis()).unwrap_or(i32::MAX);

            // SAFETY: `due` outlives the call; no completion routine is used.
            check_bool(unsafe {
                SetWaitableTimer(self.handle.as_raw_handle(), &raw const due, period, None, std::ptr::null(), 0)
            })
        }

        pub(super) fn wait(&mut self) -> io::Result<u64> {
            let millis = if self.nonblocking { 0 } else { INFINITE };

            // SAFETY: The handle is owned by this timer.
            match unsafe { WaitForSingleObject(self.handle.as_raw_handle(), millis) } {
                WAIT_OBJECT_0 => Ok(1),
                WAIT_TIMEOUT => Err(io::Error::from(io::ErrorKind::WouldBlock)),
                _ => Err(io::Error::last_os_error()),
            }
        }

        pub(super) fn source(&self) -> RawSource {
            RawSource::Handle(self.handle.as_raw_handle() as isize)
        }

        pub(super) fn forget(self) {
            let _handle = self.handle.into_raw_handle();
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

    use super::TimerSpec;
    use crate::pal::RawSource;

    pub(super) enum Timer {}

    impl Timer {
        pub(super) fn new(_nonblocking: bool) -> io::Result<Self> {
            Err(io::Error::from(io::ErrorKind::Unsupported))
        }

        pub(super) fn arm(&mut self, _spec: TimerSpec) -> io::Result<()> {
            match *self {}
        }

        pub(super) fn wait(&mut self) -> io::Result<u64> {
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

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn record_encoding() {
        let spec = TimerSpec::periodic(Duration::from_millis(3), Duration::from_millis(7));

        let decoded = TimerSpec::from_record(&spec.to_record()).unwrap();

        assert_eq!(decoded, spec);
        assert_eq!(TimerSpec::from_record(&[0; 15]).unwrap_err().code(), ErrorCode::InvalidArgument);
        assert!(TimerSpec::default().is_disarmed());
    }

    #[test]
    fn one_shot_expires_once() {
        let started = Instant::now();
        let mut timer = Stream::timer(TimerSpec::once(Duration::from_millis(20)), StreamFlags::empty()).unwrap();

        let mut count = [0_u8; 8];
        let transfer = timer.read(&mut count).unwrap();

        assert_eq!(transfer.len(), 8);
        assert_eq!(u64::from_ne_bytes(count), 1);
        assert!(started.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn looping_read_takes_one_record() {
        let mut timer = Stream::timer(TimerSpec::once(Duration::from_millis(5)), StreamFlags::empty()).unwrap();

        let mut buf = [0_u8; 16];
        let transfer = timer.read_all(&mut buf).unwrap();

        assert_eq!(transfer.len(), TIMER_READ_LEN);
        assert!(!transfer.is_end_of_stream());
        assert_eq!(u64::from_ne_bytes(buf[..TIMER_READ_LEN].try_into().unwrap()), 1);
    }

    #[test]
    fn nonblocking_read_before_expiry() {
        let mut timer = Stream::timer(TimerSpec::once(Duration::from_secs(60)), StreamFlags::NONBLOCK).unwrap();

        let error = timer.read(&mut [0; 8]).unwrap_err();

        assert_eq!(error.code(), ErrorCode::WouldBlock);
    }

    #[test]
    fn short_buffer_is_rejected() {
        let mut timer = Stream::timer(TimerSpec::once(Duration::from_secs(60)), StreamFlags::NONBLOCK).unwrap();

        assert_eq!(timer.read(&mut [0; 4]).unwrap_err().code(), ErrorCode::BufferTooSmall);
    }

    #[test]
    fn rearm_through_write() {
        let mut timer = Stream::timer(TimerSpec::once(Duration::from_secs(60)), StreamFlags::empty()).unwrap();

        let record = TimerSpec::once(Duration::from_millis(5)).to_record();
        assert_eq!(timer.write(&record).unwrap().len(), TIMER_RECORD_LEN);

        let mut count = [0_u8; 8];
        timer.read(&mut count).unwrap();
        assert_eq!(u64::from_ne_bytes(count), 1);
        assert_eq!(
            timer.get_option(OptionId::TIMER_INITIAL).unwrap(),
            OptionValue::Duration(Some(Duration::from_millis(5)))
        );
        assert_eq!(timer.get_option(OptionId::TIMER_INTERVAL).unwrap(), OptionValue::Duration(None));
    }

    #[cfg(not(windows))]
    #[test]
    fn periodic_counts_expirations() {
        let mut timer = Stream::timer(
            TimerSpec::periodic(Duration::from_millis(5), Duration::from_millis(5)),
            StreamFlags::empty(),
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(40));

        let mut count = [0_u8; 8];
        timer.read(&mut count).unwrap();

        assert!(u64::from_ne_bytes(count) >= 2);
    }

    #[test]
    fn set_timer_on_other_kinds() {
        let mut stream = Stream::from_memory(vec![0; 4], StreamFlags::RDWR);

        let error = stream.set_timer(TimerSpec::once(Duration::from_millis(1))).unwrap_err();

        assert_eq!(error.code(), ErrorCode::Unsupported);
    }
}
