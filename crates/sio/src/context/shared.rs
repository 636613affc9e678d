// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use super::{Context, ContextConfig, Notifier, WaitStatus};
use crate::Result;

/// A [`Context`] that can be used from many threads.
///
/// The whole context is guarded by one lock. A thread blocked in [`wait()`][Self::wait] holds
/// the lock, so other threads should [`wake()`][Self::wake] it before locking, which the
/// notifier can do without the lock.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use sio::{ContextConfig, SharedContext, WaitStatus};
///
/// let shared = SharedContext::new(ContextConfig::default())?;
/// let waker = shared.clone();
///
/// std::thread::spawn(move || waker.wake()).join().unwrap()?;
/// assert_eq!(shared.wait(Some(Duration::from_secs(5)), 0)?, WaitStatus::Interrupted);
/// # Ok::<(), sio::Error>(())
/// ```
///
/// # Thread safety
///
/// This type is thread-safe. Clones share the same context.
#[derive(Clone, Debug)]
pub struct SharedContext {
    context: Arc<Mutex<Context>>,
    notifier: Notifier,
}

impl SharedContext {
    /// Creates a context and wraps it.
    ///
    /// # Errors
    ///
    /// As for [`Context::new()`].
    pub fn new(config: ContextConfig) -> Result<Self> {
        Ok(Self::from(Context::new(config)?))
    }

    /// Locks the context, blocking until it is available.
    pub fn lock(&self) -> MutexGuard<'_, Context> {
        self.context.lock()
    }

    /// Locks the context if no other thread holds it.
    #[must_use]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, Context>> {
        self.context.try_lock()
    }

    /// Runs [`Context::wait()`] under the lock.
    ///
    /// # Errors
    ///
    /// As for [`Context::wait()`].
    pub fn wait(&self, timeout: Option<Duration>, max_events: usize) -> Result<WaitStatus> {
        self.lock().wait(timeout, max_events)
    }

    /// Interrupts a thread blocked in [`wait()`][Self::wait] without taking the lock.
    ///
    /// # Errors
    ///
    /// As for [`Notifier::wake()`].
    pub fn wake(&self) -> Result<()> {
        self.notifier.wake()
    }

    /// A notifier of the wrapped context.
    #[must_use]
    pub fn notifier(&self) -> Notifier {
        self.notifier.clone()
    }
}

impl From<Context> for SharedContext {
    fn from(context: Context) -> Self {
        let notifier = context.notifier();
        Self {
            context: Arc::new(Mutex::new(context)),
            notifier,
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(all(test, unix))]
mod tests {
    use std::ops::ControlFlow;
    use std::sync::mpsc;

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::{Interest, Stream, StreamFlags};

    assert_impl_all!(SharedContext: Send, Sync, Clone);

    #[test]
    fn registrations_cross_threads() {
        let (reader, mut writer) = Stream::pipe(StreamFlags::empty()).unwrap();
        let shared = SharedContext::new(ContextConfig::default()).unwrap();
        let (sender, received) = mpsc::channel();

        let registrar = shared.clone();
        let reader = std::thread::spawn(move || {
            registrar
                .lock()
                .register(&reader, Interest::READABLE, 5, move |event| {
                    sender.send(event.user_data()).unwrap();
                    ControlFlow::Break(())
                })
                .unwrap();
            reader
        })
        .join()
        .unwrap();

        writer.write(b"go").unwrap();
        assert_eq!(shared.wait(Some(Duration::from_secs(5)), 0).unwrap(), WaitStatus::Completed(1));
        assert_eq!(received.try_recv().unwrap(), 5);
        assert!(!shared.lock().is_registered(reader.id()));
    }

    #[test]
    fn try_lock_fails_while_held() {
        let shared = SharedContext::new(ContextConfig::default()).unwrap();
        let guard = shared.lock();

        assert!(shared.try_lock().is_none());
        drop(guard);
        assert!(shared.try_lock().is_some());
    }
}
