// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Reference-counted library initialization.

use bitflags::bitflags;
use parking_lot::Mutex;
use tracing::{Level, event};

use crate::Result;

bitflags! {
    /// Subsystems to prepare in [`init()`].
    ///
    /// The bit positions are part of the public contract and never change.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct InitFlags: u32 {
        /// Network sockets. Starts Windows Sockets 2.2 on Windows; nothing elsewhere.
        const SOCKETS = 1 << 0;
    }
}

#[derive(Debug)]
struct InitState {
    count: usize,
    sockets: bool,
}

static STATE: Mutex<InitState> = Mutex::new(InitState { count: 0, sockets: false });

/// Prepares the library for use. Every successful call must be balanced by one [`cleanup()`].
///
/// Only the first call that asks for a subsystem starts it; it is stopped by the `cleanup()`
/// that balances the last outstanding `init()`.
///
/// # Errors
///
/// Any failure of the operating system to start a subsystem. The reference count is unchanged
/// in that case.
pub fn init(flags: InitFlags) -> Result<()> {
    let mut state = STATE.lock();

    if flags.contains(InitFlags::SOCKETS) && !state.sockets {
        sockets::startup()?;
        state.sockets = true;
        event!(Level::DEBUG, message = "started socket subsystem");
    }

    state.count += 1;
    Ok(())
}

/// Balances one [`init()`]. The last one stops every subsystem that was started.
pub fn cleanup() {
    let mut state = STATE.lock();

    let Some(count) = state.count.checked_sub(1) else {
        event!(Level::WARN, message = "cleanup called without a matching init");
        return;
    };
    state.count = count;

    if count == 0 && state.sockets {
        sockets::shutdown();
        state.sockets = false;
        event!(Level::DEBUG, message = "stopped socket subsystem");
    }
}

/// Keeps the library initialized until dropped.
#[derive(Debug)]
#[must_use = "the library is cleaned up when the guard is dropped"]
pub struct InitGuard {
    _private: (),
}

impl Drop for InitGuard {
    fn drop(&mut self) {
        cleanup();
    }
}

/// Calls [`init()`] and returns a guard that calls [`cleanup()`] when dropped.
///
/// # Example
///
/// ```
/// let _guard = sio::initialize(sio::InitFlags::SOCKETS)?;
/// # Ok::<(), sio::Error>(())
/// ```
///
/// # Errors
///
/// As for [`init()`].
pub fn initialize(flags: InitFlags) -> Result<InitGuard> {
    init(flags)?;
    Ok(InitGuard { _private: () })
}

#[cfg(windows)]
mod sockets {
    use windows_sys::Win32::Networking::WinSock::{WSACleanup, WSADATA, WSAStartup};

    use crate::Result;

    #[cfg_attr(test, mutants::skip)] // Impractical to test due to global effects.
    pub(super) fn startup() -> Result<()> {
        // SAFETY: `WSADATA` is a plain C structure for which all-zero bytes are valid.
        let mut data: WSADATA = unsafe { std::mem::zeroed() };

        // SAFETY: `data` is valid for writes.
        match unsafe { WSAStartup(0x202, &raw mut data) } {
            0 => Ok(()),
            error => Err(std::io::Error::from_raw_os_error(error).into()),
        }
    }

    #[cfg_attr(test, mutants::skip)] // Impractical to test due to global effects.
    pub(super) fn shutdown() {
        // SAFETY: Balances the successful `WSAStartup()` of `startup()`.
        unsafe { WSACleanup() };
    }
}

#[cfg(not(windows))]
mod sockets {
    use crate::Result;

    pub(super) const fn startup() -> Result<()> {
        Ok(())
    }

    pub(super) const fn shutdown() {}
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_balance() {
        let outer = initialize(InitFlags::SOCKETS).unwrap();
        let inner = initialize(InitFlags::empty()).unwrap();
        let count = STATE.lock().count;
        assert!(count >= 2);

        drop(inner);
        assert_eq!(STATE.lock().count, count - 1);
        drop(outer);
        assert_eq!(STATE.lock().count, count - 2);
    }

    #[test]
    fn flag_bits_are_stable() {
        assert_eq!(InitFlags::SOCKETS.bits(), 1);
    }
}
