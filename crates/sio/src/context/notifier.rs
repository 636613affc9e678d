// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{Result, StreamId};

/// Interrupts the backend of one context from any thread.
#[derive(Clone, Debug)]
pub(crate) enum WakeSignal {
    #[cfg(unix)]
    Fd(Arc<crate::pal::unix::WakeFd>),
    #[cfg(windows)]
    Port(Arc<super::selector::iocp::Port>),
}

impl WakeSignal {
    fn raise(&self) -> Result<()> {
        match self {
            #[cfg(unix)]
            Self::Fd(fd) => Ok(fd.wake()?),
            #[cfg(windows)]
            Self::Port(port) => port.post_wake(),
        }
    }
}

pub(crate) struct NotifierState {
    signal: WakeSignal,
    notified: Mutex<Vec<StreamId>>,
}

impl NotifierState {
    pub(crate) fn new(signal: WakeSignal) -> Self {
        Self {
            signal,
            notified: Mutex::new(Vec::new()),
        }
    }

    /// Takes the streams notified since the last call.
    pub(crate) fn take_notified(&self) -> Vec<StreamId> {
        std::mem::take(&mut *self.notified.lock())
    }
}

/// Wakes a [`Context`][crate::Context] that is blocked in [`wait()`][crate::Context::wait], or
/// queues a [`Interest::CUSTOM`][crate::Interest::CUSTOM] event for one of its registrations.
///
/// Obtained from [`Context::notifier()`][crate::Context::notifier]. A notifier outlives its
/// context harmlessly: notifications sent after the context is gone are lost.
///
/// # Thread safety
///
/// This type is thread-safe. Clones share the same target context.
#[derive(Clone)]
pub struct Notifier {
    state: Arc<NotifierState>,
}

impl Notifier {
    pub(crate) fn new(state: Arc<NotifierState>) -> Self {
        Self { state }
    }

    /// Makes the current or next [`wait()`][crate::Context::wait] return promptly.
    ///
    /// # Errors
    ///
    /// Any failure of the operating system signaling the backend.
    pub fn wake(&self) -> Result<()> {
        self.state.signal.raise()
    }

    /// Queues a [`Interest::CUSTOM`][crate::Interest::CUSTOM] event for the registration of
    /// `stream` and wakes the context. The event is delivered by the next wait if the stream is
    /// still registered with an interest in it; otherwise it is dropped.
    ///
    /// # Errors
    ///
    /// As for [`wake()`][Self::wake].
    pub fn notify(&self, stream: StreamId) -> Result<()> {
        self.state.notified.lock().push(stream);
        self.wake()
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier").field("signal", &self.state.signal).finish_non_exhaustive()
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(all(test, unix))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::pal::unix::WakeFd;
    use crate::pal::{Direction, wait_ready};

    assert_impl_all!(Notifier: Send, Sync, Clone, fmt::Debug);

    #[test]
    fn notify_queues_and_wakes() {
        let fd = Arc::new(WakeFd::new().unwrap());
        let state = Arc::new(NotifierState::new(WakeSignal::Fd(Arc::clone(&fd))));
        let notifier = Notifier::new(Arc::clone(&state));
        let id = crate::Stream::from_memory(vec![0; 1], crate::StreamFlags::READ).id();

        notifier.clone().notify(id).unwrap();

        assert!(wait_ready(fd.source(), Direction::Read, Some(std::time::Duration::ZERO)).unwrap());
        assert_eq!(state.take_notified(), vec![id]);
        assert!(state.take_notified().is_empty());
    }
}
