// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! POSIX helpers shared by drivers and readiness backends.

use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use crate::pal::{Direction, RawSource, timeout_millis};
use crate::{ErrorCode, Result};

/// Translates an `errno` value into a stable code.
#[must_use]
pub fn errno_to_code(errno: i32) -> ErrorCode {
    match errno {
        libc::EINVAL | libc::EDOM | libc::ERANGE | libc::EFAULT | libc::EBADMSG => ErrorCode::InvalidArgument,
        libc::ENOMEM | libc::ENOBUFS => ErrorCode::OutOfMemory,
        libc::ENOENT | libc::ENXIO | libc::ENODEV => ErrorCode::NotFound,
        libc::EEXIST => ErrorCode::AlreadyExists,
        libc::EACCES | libc::EPERM => ErrorCode::PermissionDenied,
        libc::ENOSYS | libc::ENOTSUP | libc::ENOTTY | libc::EPROTONOSUPPORT | libc::EAFNOSUPPORT => {
            ErrorCode::Unsupported
        }
        libc::EBUSY | libc::ETXTBSY => ErrorCode::Busy,
        libc::ETIMEDOUT => ErrorCode::Timeout,
        libc::EINTR => ErrorCode::Interrupted,
        libc::EAGAIN => ErrorCode::WouldBlock,
        libc::EMFILE | libc::ENFILE | libc::EMLINK | libc::ETOOMANYREFS => ErrorCode::LimitReached,
        libc::EALREADY => ErrorCode::InvalidState,
        libc::ECANCELED => ErrorCode::Cancelled,
        libc::EIO => ErrorCode::Io,
        libc::EISDIR => ErrorCode::IsDirectory,
        libc::ENOTDIR => ErrorCode::NotDirectory,
        libc::EROFS => ErrorCode::ReadOnly,
        libc::EFBIG | libc::EOVERFLOW => ErrorCode::TooLarge,
        libc::ENOSPC | libc::EDQUOT => ErrorCode::NoSpace,
        libc::ENAMETOOLONG => ErrorCode::NameTooLong,
        libc::EBADF => ErrorCode::BadHandle,
        libc::ESPIPE => ErrorCode::NotSeekable,
        libc::EPIPE => ErrorCode::BrokenPipe,
        libc::ENOLCK => ErrorCode::Locked,
        libc::ECONNREFUSED => ErrorCode::ConnectionRefused,
        libc::ECONNRESET => ErrorCode::ConnectionReset,
        libc::ECONNABORTED => ErrorCode::ConnectionAborted,
        libc::ENETUNREACH | libc::ENETDOWN | libc::ENETRESET => ErrorCode::NetworkUnreachable,
        libc::EHOSTUNREACH | libc::EHOSTDOWN => ErrorCode::HostUnreachable,
        libc::EADDRINUSE => ErrorCode::AddressInUse,
        libc::EADDRNOTAVAIL => ErrorCode::AddressNotAvailable,
        libc::EINPROGRESS => ErrorCode::InProgress,
        libc::ENOTCONN | libc::EDESTADDRREQ => ErrorCode::NotConnected,
        libc::EISCONN => ErrorCode::AlreadyConnected,
        libc::EMSGSIZE => ErrorCode::MessageTooLarge,
        libc::ENOTSOCK | libc::EPROTOTYPE | libc::ENOPROTOOPT | libc::EPROTO => ErrorCode::Network,
        libc::EDEADLK => ErrorCode::Deadlock,
        libc::ESRCH => ErrorCode::NoSuchProcess,
        libc::ECHILD => ErrorCode::Process,
        _ => ErrorCode::System,
    }
}

/// Converts a `-1`-on-failure return value into a result.
pub(crate) fn check(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 { Err(io::Error::last_os_error()) } else { Ok(ret) }
}

/// Converts a `-1`-on-failure byte count into a result.
pub(crate) fn check_len(ret: libc::ssize_t) -> io::Result<usize> {
    usize::try_from(ret).map_err(|_negative| io::Error::last_os_error())
}

/// Runs `call` until it fails with something other than `EINTR`.
pub(crate) fn retry<T>(mut call: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match call() {
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            other => return other,
        }
    }
}

/// Single-shot `read(2)`, retrying on `EINTR`.
pub(crate) fn read(fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<usize> {
    retry(|| {
        // SAFETY: `buf` is valid for writes of `buf.len()` bytes and `fd` is open for the
        // lifetime of the borrow.
        check_len(unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) })
    })
}

/// Single-shot `write(2)`, retrying on `EINTR`.
pub(crate) fn write(fd: BorrowedFd<'_>, buf: &[u8]) -> io::Result<usize> {
    retry(|| {
        // SAFETY: `buf` is valid for reads of `buf.len()` bytes and `fd` is open for the
        // lifetime of the borrow.
        check_len(unsafe { libc::write(fd.as_raw_fd(), buf.as_ptr().cast(), buf.len()) })
    })
}

/// Single-shot `pread(2)`, retrying on `EINTR`.
pub(crate) fn read_at(fd: BorrowedFd<'_>, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let offset = libc::off_t::try_from(offset).map_err(|_overflow| io::Error::from_raw_os_error(libc::EINVAL))?;
    retry(|| {
        // SAFETY: As in `read()`.
        check_len(unsafe { libc::pread(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len(), offset) })
    })
}

/// Single-shot `pwrite(2)`, retrying on `EINTR`.
pub(crate) fn write_at(fd: BorrowedFd<'_>, buf: &[u8], offset: u64) -> io::Result<usize> {
    let offset = libc::off_t::try_from(offset).map_err(|_overflow| io::Error::from_raw_os_error(libc::EINVAL))?;
    retry(|| {
        // SAFETY: As in `write()`.
        check_len(unsafe { libc::pwrite(fd.as_raw_fd(), buf.as_ptr().cast(), buf.len(), offset) })
    })
}

/// Single-shot `readv(2)`, retrying on `EINTR`.
pub(crate) fn readv(fd: BorrowedFd<'_>, bufs: &mut [io::IoSliceMut<'_>]) -> io::Result<usize> {
    let count = libc::c_int::try_from(bufs.len()).unwrap_or(libc::c_int::MAX);
    retry(|| {
        // SAFETY: `IoSliceMut` is ABI-compatible with `iovec` on POSIX platforms and every slice
        // is valid for writes.
        check_len(unsafe { libc::readv(fd.as_raw_fd(), bufs.as_mut_ptr().cast(), count) })
    })
}

/// Single-shot `writev(2)`, retrying on `EINTR`.
pub(crate) fn writev(fd: BorrowedFd<'_>, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
    let count = libc::c_int::try_from(bufs.len()).unwrap_or(libc::c_int::MAX);
    retry(|| {
        // SAFETY: `IoSlice` is ABI-compatible with `iovec` on POSIX platforms and every slice is
        // valid for reads.
        check_len(unsafe { libc::writev(fd.as_raw_fd(), bufs.as_ptr().cast(), count) })
    })
}

/// Writes to a pipe-like descriptor without letting `SIGPIPE` reach the process.
///
/// The signal is blocked on the calling thread for the duration of the call and a `SIGPIPE`
/// generated by the write is consumed before the mask is restored.
pub(crate) fn write_no_sigpipe(fd: BorrowedFd<'_>, buf: &[u8]) -> io::Result<usize> {
    let _guard = SigpipeGuard::block()?;
    write(fd, buf)
}

/// Vectored variant of [`write_no_sigpipe()`].
pub(crate) fn writev_no_sigpipe(fd: BorrowedFd<'_>, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
    let _guard = SigpipeGuard::block()?;
    writev(fd, bufs)
}

struct SigpipeGuard {
    previous: libc::sigset_t,
}

impl SigpipeGuard {
    fn block() -> io::Result<Self> {
        let set = signal_set(&[libc::SIGPIPE])?;
        let mut previous = MaybeUninit::<libc::sigset_t>::uninit();

        // SAFETY: Both sets are valid for the duration of the call.
        let ret = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &raw const set, previous.as_mut_ptr()) };
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret));
        }

        // SAFETY: `pthread_sigmask` succeeded and filled in the previous mask.
        Ok(Self {
            previous: unsafe { previous.assume_init() },
        })
    }
}

impl Drop for SigpipeGuard {
    fn drop(&mut self) {
        let mut pending = MaybeUninit::<libc::sigset_t>::uninit();

        // SAFETY: `pending` is valid for writes.
        let pending_ok = unsafe { libc::sigpending(pending.as_mut_ptr()) } == 0;

        // SAFETY: Filled in by the successful `sigpending` call above, and only read in that case.
        if pending_ok && unsafe { libc::sigismember(pending.as_ptr(), libc::SIGPIPE) } == 1 {
            if let Ok(set) = signal_set(&[libc::SIGPIPE]) {
                let mut signo = 0;
                // SAFETY: SIGPIPE is pending and blocked, so `sigwait` returns immediately.
                unsafe {
                    libc::sigwait(&raw const set, &raw mut signo);
                }
            }
        }

        // SAFETY: Restores the mask captured in `block()`.
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &raw const self.previous, std::ptr::null_mut());
        }
    }
}

/// Builds a signal set containing `signals`.
pub(crate) fn signal_set(signals: &[libc::c_int]) -> io::Result<libc::sigset_t> {
    let mut set = MaybeUninit::<libc::sigset_t>::uninit();

    // SAFETY: `set` is valid for writes.
    check(unsafe { libc::sigemptyset(set.as_mut_ptr()) })?;
    for &signo in signals {
        // SAFETY: `set` was initialized by `sigemptyset`.
        check(unsafe { libc::sigaddset(set.as_mut_ptr(), signo) })?;
    }

    // SAFETY: Initialized by `sigemptyset` above.
    Ok(unsafe { set.assume_init() })
}

/// Blocks until `source` is ready or `timeout` elapses, using `poll(2)`.
pub(crate) fn wait_ready(source: RawSource, direction: Direction, timeout: Option<Duration>) -> Result<bool> {
    let RawSource::Fd(fd) = source;
    let events = match direction {
        Direction::Read => libc::POLLIN,
        Direction::Write => libc::POLLOUT,
    };
    let deadline = timeout.map(|timeout| Instant::now() + timeout);

    loop {
        let remaining = deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
        let mut pollfd = libc::pollfd { fd, events, revents: 0 };

        // SAFETY: `pollfd` is a valid array of one element.
        let ret = unsafe { libc::poll(&raw mut pollfd, 1, timeout_millis(remaining)) };
        match check(ret) {
            Ok(0) => return Ok(false),
            Ok(_) => return Ok(true),
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => return Err(error.into()),
        }
    }
}

/// Converts a duration to a `timespec`, saturating at the largest representable value.
pub(crate) fn timespec(duration: Duration) -> libc::timespec {
    // SAFETY: `timespec` is a plain C structure for which all-zero bytes are valid.
    let mut value: libc::timespec = unsafe { std::mem::zeroed() };
    value.tv_sec = libc::time_t::try_from(duration.as_secs()).unwrap_or(libc::time_t::MAX);
    value.tv_nsec = libc::c_long::try_from(duration.subsec_nanos()).unwrap_or_default();
    value
}

/// Reads the `O_NONBLOCK` status flag.
pub(crate) fn is_nonblocking(fd: RawFd) -> io::Result<bool> {
    // SAFETY: `F_GETFL` only reads descriptor state.
    let flags = check(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    Ok(flags & libc::O_NONBLOCK != 0)
}

/// Sets or clears the `O_NONBLOCK` status flag.
pub(crate) fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    // SAFETY: `F_GETFL` only reads descriptor state.
    let flags = check(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    let updated = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };

    if updated != flags {
        // SAFETY: Only the status flags of a descriptor we were handed are modified.
        check(unsafe { libc::fcntl(fd, libc::F_SETFL, updated) })?;
    }
    Ok(())
}

/// Reads the `FD_CLOEXEC` descriptor flag.
pub(crate) fn is_cloexec(fd: RawFd) -> io::Result<bool> {
    // SAFETY: `F_GETFD` only reads descriptor state.
    let flags = check(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
    Ok(flags & libc::FD_CLOEXEC != 0)
}

/// Sets or clears the `FD_CLOEXEC` descriptor flag.
pub(crate) fn set_cloexec(fd: RawFd, cloexec: bool) -> io::Result<()> {
    // SAFETY: `F_GETFD` only reads descriptor state.
    let flags = check(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
    let updated = if cloexec {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };

    // SAFETY: Only the descriptor flags of a descriptor we were handed are modified.
    check(unsafe { libc::fcntl(fd, libc::F_SETFD, updated) })?;
    Ok(())
}

/// Creates an anonymous pipe with close-on-exec set on both ends.
pub(crate) fn pipe(nonblocking: bool) -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0; 2];

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd"))]
    {
        let flags = libc::O_CLOEXEC | if nonblocking { libc::O_NONBLOCK } else { 0 };
        // SAFETY: `fds` is valid for writes of two descriptors.
        check(unsafe { libc::pipe2(fds.as_mut_ptr(), flags) })?;
    }

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd")))]
    {
        // SAFETY: `fds` is valid for writes of two descriptors.
        check(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
    }

    // SAFETY: `pipe` returned a fresh descriptor that nothing else owns.
    let reader = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    // SAFETY: As above.
    let writer = unsafe { OwnedFd::from_raw_fd(fds[1]) };

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd")))]
    for fd in [&reader, &writer] {
        set_cloexec(fd.as_raw_fd(), true)?;
        set_nonblocking(fd.as_raw_fd(), nonblocking)?;
    }

    Ok((reader, writer))
}

/// The wake primitive of a readiness backend: an `eventfd` on Linux, a non-blocking pipe
/// elsewhere. The backend watches [`WakeFd::source()`] for readability.
#[derive(Debug)]
pub(crate) struct WakeFd {
    reader: OwnedFd,
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    writer: OwnedFd,
}

impl WakeFd {
    pub(crate) fn new() -> io::Result<Self> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            // SAFETY: No pointers are involved.
            let fd = check(unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) })?;
            // SAFETY: `eventfd` returned a fresh descriptor that nothing else owns.
            Ok(Self {
                reader: unsafe { OwnedFd::from_raw_fd(fd) },
            })
        }

        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            let (reader, writer) = pipe(true)?;
            Ok(Self { reader, writer })
        }
    }

    pub(crate) fn source(&self) -> RawSource {
        RawSource::Fd(self.reader.as_raw_fd())
    }

    pub(crate) fn wake(&self) -> io::Result<()> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        let result = write(self.reader.as_fd(), &1_u64.to_ne_bytes());
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let result = write(self.writer.as_fd(), &[1]);

        match result {
            // A full counter or pipe already guarantees a pending wake-up.
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => Ok(()),
            other => other.map(|_| ()),
        }
    }

    /// Consumes all pending wake-ups.
    pub(crate) fn drain(&self) {
        let mut scratch = [0_u8; 64];
        while matches!(read(self.reader.as_fd(), &mut scratch), Ok(count) if count > 0) {}
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_errnos_translate() {
        assert_eq!(errno_to_code(libc::ENOENT), ErrorCode::NotFound);
        assert_eq!(errno_to_code(libc::EAGAIN), ErrorCode::WouldBlock);
        assert_eq!(errno_to_code(libc::EPIPE), ErrorCode::BrokenPipe);
        assert_eq!(errno_to_code(libc::ECONNREFUSED), ErrorCode::ConnectionRefused);
        assert_eq!(errno_to_code(libc::EBADF), ErrorCode::BadHandle);
        assert_eq!(errno_to_code(libc::ESPIPE), ErrorCode::NotSeekable);
        assert_eq!(errno_to_code(99_999), ErrorCode::System);
    }

    #[test]
    fn pipe_round_trip() {
        let (reader, writer) = pipe(false).unwrap();

        assert!(is_cloexec(reader.as_raw_fd()).unwrap());
        assert!(!is_nonblocking(reader.as_raw_fd()).unwrap());

        assert_eq!(write(writer.as_fd(), b"abc").unwrap(), 3);
        let mut target = [0_u8; 8];
        assert_eq!(read(reader.as_fd(), &mut target).unwrap(), 3);
        assert_eq!(&target[..3], b"abc");
    }

    #[test]
    fn nonblocking_toggle() {
        let (reader, _writer) = pipe(false).unwrap();

        set_nonblocking(reader.as_raw_fd(), true).unwrap();
        assert!(is_nonblocking(reader.as_raw_fd()).unwrap());

        let mut target = [0_u8; 1];
        let error = read(reader.as_fd(), &mut target).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn wait_ready_times_out_then_succeeds() {
        let (reader, writer) = pipe(false).unwrap();
        let source = RawSource::Fd(reader.as_raw_fd());

        assert!(!wait_ready(source, Direction::Read, Some(Duration::from_millis(10))).unwrap());

        write(writer.as_fd(), b"x").unwrap();
        assert!(wait_ready(source, Direction::Read, Some(Duration::from_millis(10))).unwrap());
    }

    #[test]
    fn write_without_reader_is_broken_pipe() {
        let (reader, writer) = pipe(false).unwrap();
        drop(reader);

        let error = write_no_sigpipe(writer.as_fd(), b"x").unwrap_err();

        assert_eq!(error.raw_os_error(), Some(libc::EPIPE));
    }

    #[test]
    fn wake_fd_signals_readiness() {
        let wake = WakeFd::new().unwrap();

        assert!(!wait_ready(wake.source(), Direction::Read, Some(Duration::ZERO)).unwrap());
        wake.wake().unwrap();
        wake.wake().unwrap();
        assert!(wait_ready(wake.source(), Direction::Read, Some(Duration::ZERO)).unwrap());

        wake.drain();
        assert!(!wait_ready(wake.source(), Direction::Read, Some(Duration::ZERO)).unwrap());
    }
}
