// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::str::FromStr;

use tracing::{Level, event};

use crate::{Error, Result};

/// Default upper bound on readiness events collected by one wait.
pub const DEFAULT_MAX_EVENTS: usize = 256;

/// Default submission queue depth of the `io_uring` backend.
pub const DEFAULT_URING_ENTRIES: u32 = 256;

const BACKEND_ENV: &str = "SIO_BACKEND";
const MAX_EVENTS_ENV: &str = "SIO_MAX_EVENTS";

/// The multiplexing engine behind a [`Context`][crate::Context].
///
/// The numeric values are part of the public contract and never change.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u32)]
#[non_exhaustive]
pub enum Backend {
    /// The best engine the platform offers.
    #[default]
    Auto = 0,
    /// Linux submission and completion queues. Requires the `io-uring` cargo feature.
    IoUring = 1,
    /// Linux `epoll`.
    Epoll = 2,
    /// BSD and macOS `kqueue`.
    Kqueue = 3,
    /// Windows I/O completion ports.
    Iocp = 4,
    /// POSIX `poll`.
    Poll = 5,
    /// POSIX `select`.
    Select = 6,
}

/// Order in which [`Backend::Auto`] tries the concrete engines.
const PREFERENCE: [Backend; 6] = [
    Backend::IoUring,
    Backend::Epoll,
    Backend::Kqueue,
    Backend::Iocp,
    Backend::Poll,
    Backend::Select,
];

impl Backend {
    /// The stable numeric value.
    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self as u32
    }

    /// Looks up the backend with the given numeric value.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Auto,
            1 => Self::IoUring,
            2 => Self::Epoll,
            3 => Self::Kqueue,
            4 => Self::Iocp,
            5 => Self::Poll,
            6 => Self::Select,
            _ => return None,
        })
    }

    /// The name accepted by `SIO_BACKEND`.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::IoUring => "io_uring",
            Self::Epoll => "epoll",
            Self::Kqueue => "kqueue",
            Self::Iocp => "iocp",
            Self::Poll => "poll",
            Self::Select => "select",
        }
    }

    /// Whether a context can be created with this backend on the running system.
    ///
    /// [`Backend::Auto`] is always available. `io_uring` is probed by creating a small ring.
    #[must_use]
    pub fn is_available(self) -> bool {
        match self {
            Self::Auto => true,
            Self::IoUring => uring_available(),
            Self::Epoll => cfg!(any(target_os = "linux", target_os = "android")),
            Self::Kqueue => cfg!(any(target_os = "macos", target_os = "ios", target_os = "freebsd")),
            Self::Iocp => cfg!(windows),
            Self::Poll | Self::Select => cfg!(unix),
        }
    }

    /// Picks the concrete backend a context uses.
    pub(crate) fn resolve(self) -> Result<Self> {
        if self != Self::Auto {
            return if self.is_available() { Ok(self) } else { Err(Error::unsupported()) };
        }

        for candidate in PREFERENCE {
            if candidate.is_available() {
                return Ok(candidate);
            }
            event!(Level::DEBUG, message = "backend unavailable, trying the next one", backend = %candidate);
        }

        Err(Error::unsupported())
    }
}

#[cfg(all(target_os = "linux", feature = "io-uring"))]
fn uring_available() -> bool {
    super::selector::uring::probe()
}

#[cfg(not(all(target_os = "linux", feature = "io-uring")))]
fn uring_available() -> bool {
    false
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim();
        [Self::Auto]
            .into_iter()
            .chain(PREFERENCE)
            .find(|backend| backend.name().eq_ignore_ascii_case(name))
            .ok_or_else(Error::invalid_argument)
    }
}

/// Settings for a new [`Context`][crate::Context].
///
/// # Example
///
/// ```
/// use sio::{Backend, Context, ContextConfig};
///
/// let config = ContextConfig::new().backend(Backend::Auto).max_events(64);
/// let context = Context::new(config)?;
/// assert_ne!(context.backend(), Backend::Auto);
/// # Ok::<(), sio::Error>(())
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContextConfig {
    backend: Backend,
    max_events: usize,
    uring_entries: u32,
}

impl ContextConfig {
    /// The default settings: automatic backend selection, [`DEFAULT_MAX_EVENTS`] and
    /// [`DEFAULT_URING_ENTRIES`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            backend: Backend::Auto,
            max_events: DEFAULT_MAX_EVENTS,
            uring_entries: DEFAULT_URING_ENTRIES,
        }
    }

    /// The default settings overridden by `SIO_BACKEND` and `SIO_MAX_EVENTS`.
    ///
    /// Values that cannot be parsed are ignored.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::new();

        if let Some(value) = lookup(BACKEND_ENV) {
            match value.parse() {
                Ok(backend) => config.backend = backend,
                Err(_unknown) => event!(Level::WARN, message = "ignoring unknown backend", variable = BACKEND_ENV, value = %value),
            }
        }

        if let Some(value) = lookup(MAX_EVENTS_ENV) {
            match value.trim().parse::<usize>() {
                Ok(max_events) if max_events > 0 => config.max_events = max_events,
                _ => event!(Level::WARN, message = "ignoring invalid event limit", variable = MAX_EVENTS_ENV, value = %value),
            }
        }

        config
    }

    /// Selects the backend.
    #[must_use]
    pub const fn backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Sets the default upper bound on events collected by one wait. Zero keeps the current
    /// value.
    #[must_use]
    pub const fn max_events(mut self, max_events: usize) -> Self {
        if max_events > 0 {
            self.max_events = max_events;
        }
        self
    }

    /// Sets the submission queue depth used by the `io_uring` backend.
    #[must_use]
    pub const fn uring_entries(mut self, entries: u32) -> Self {
        if entries > 0 {
            self.uring_entries = entries;
        }
        self
    }

    /// The requested backend.
    #[must_use]
    pub const fn requested_backend(&self) -> Backend {
        self.backend
    }

    /// The default upper bound on events collected by one wait.
    #[must_use]
    pub const fn event_limit(&self) -> usize {
        self.max_events
    }

    /// The submission queue depth of the `io_uring` backend.
    #[must_use]
    pub const fn uring_depth(&self) -> u32 {
        self.uring_entries
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tracing_test::traced_test;

    use super::*;
    use crate::ErrorCode;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn backend_values_are_stable() {
        for raw in 0..7 {
            assert_eq!(Backend::from_raw(raw).unwrap().as_raw(), raw);
        }
        assert_eq!(Backend::from_raw(7), None);
        assert_eq!(Backend::Iocp.as_raw(), 4);
    }

    #[test]
    fn backend_names_parse() {
        assert_eq!("io_uring".parse::<Backend>().unwrap(), Backend::IoUring);
        assert_eq!(" EPOLL ".parse::<Backend>().unwrap(), Backend::Epoll);
        assert_eq!("auto".parse::<Backend>().unwrap(), Backend::Auto);
        assert_eq!("devpoll".parse::<Backend>().unwrap_err().code(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn auto_resolves_to_an_available_backend() {
        let backend = Backend::Auto.resolve().unwrap();

        assert_ne!(backend, Backend::Auto);
        assert!(backend.is_available());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn linux_backends() {
        assert!(Backend::Epoll.is_available());
        assert!(Backend::Poll.is_available());
        assert!(!Backend::Kqueue.is_available());
        assert!(!Backend::Iocp.is_available());
        assert_eq!(Backend::Iocp.resolve().unwrap_err().code(), ErrorCode::Unsupported);
    }

    #[test]
    fn environment_overrides() {
        let config = ContextConfig::from_lookup(lookup(&[(BACKEND_ENV, "poll"), (MAX_EVENTS_ENV, "32")]));

        assert_eq!(config.requested_backend(), Backend::Poll);
        assert_eq!(config.event_limit(), 32);
    }

    #[test]
    #[traced_test]
    fn invalid_environment_is_ignored() {
        let config = ContextConfig::from_lookup(lookup(&[(BACKEND_ENV, "nope"), (MAX_EVENTS_ENV, "0")]));

        assert_eq!(config, ContextConfig::default());
        assert!(logs_contain("ignoring unknown backend"));
        assert!(logs_contain("ignoring invalid event limit"));
    }

    #[test]
    fn builder_ignores_zero() {
        let config = ContextConfig::new().max_events(0).uring_entries(0);

        assert_eq!(config.event_limit(), DEFAULT_MAX_EVENTS);
        assert_eq!(config.uring_depth(), DEFAULT_URING_ENTRIES);
    }
}
