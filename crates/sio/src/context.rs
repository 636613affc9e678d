// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Event multiplexing over many streams.

mod config;
mod interest;
mod notifier;
mod op;
mod selector;
mod shared;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

pub use config::{Backend, ContextConfig, DEFAULT_MAX_EVENTS, DEFAULT_URING_ENTRIES};
pub use interest::Interest;
pub use notifier::Notifier;
pub use op::{CompletedOp, OpBuilder, OpId, OpKind, OpStatus};
use notifier::NotifierState;
use op::PendingOp;
use selector::{NativeKind, NativeRequest, Registered, Selector, SelectorEvent, SelectorFacade, Submitted, directions};
pub use shared::SharedContext;
use tracing::{Level, event};

use crate::buf::ByteBuffer;
use crate::pal::RawSource;
use crate::{Error, ErrorCode, Result, Stream, StreamId};

/// How long a dropped context waits for cancelled native operations to come back.
const DRAIN_LIMIT: Duration = Duration::from_secs(1);
const DRAIN_SLICE: Duration = Duration::from_millis(10);

/// One delivery to a registration callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Event {
    stream: StreamId,
    events: Interest,
    user_data: u64,
}

impl Event {
    /// The registered stream.
    #[must_use]
    pub const fn stream(&self) -> StreamId {
        self.stream
    }

    /// What happened, limited to the interest of the registration.
    #[must_use]
    pub const fn events(&self) -> Interest {
        self.events
    }

    /// The value given at registration.
    #[must_use]
    pub const fn user_data(&self) -> u64 {
        self.user_data
    }
}

/// How a [`Context::wait()`] call ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitStatus {
    /// This many callbacks ran.
    Completed(usize),
    /// The timeout elapsed without anything to deliver.
    TimedOut,
    /// A [`Notifier`] or a signal interrupted the wait before anything was delivered.
    Interrupted,
}

type EventCallback = Box<dyn FnMut(&Event) -> ControlFlow<()> + Send>;

struct Registration {
    stream: StreamId,
    interest: Interest,
    user_data: u64,
    callback: EventCallback,
    timeout: Option<Duration>,
    last_activity: Instant,
    usage: Arc<AtomicUsize>,
}

impl Registration {
    fn release(self) {
        self.usage.fetch_sub(1, Ordering::AcqRel);
    }

    fn due(&self) -> Option<Instant> {
        self.last_activity.checked_add(self.timeout?)
    }
}

/// Everything a context tracks for one stream.
struct Watch {
    source: Option<RawSource>,
    /// The directions the selector currently watches.
    armed: Interest,
    registered: Option<Registered>,
    registration: Option<Registration>,
    reads: VecDeque<OpId>,
    writes: VecDeque<OpId>,
}

impl Watch {
    const fn new(source: Option<RawSource>) -> Self {
        Self {
            source,
            armed: Interest::empty(),
            registered: None,
            registration: None,
            reads: VecDeque::new(),
            writes: VecDeque::new(),
        }
    }

    fn wanted(&self) -> Interest {
        let mut wanted = self
            .registration
            .as_ref()
            .map_or(Interest::empty(), |registration| directions(registration.interest));
        if !self.reads.is_empty() {
            wanted |= Interest::READABLE;
        }
        if !self.writes.is_empty() {
            wanted |= Interest::WRITABLE;
        }
        wanted
    }

    fn is_idle(&self) -> bool {
        self.registration.is_none() && self.reads.is_empty() && self.writes.is_empty()
    }

    /// Readiness reported without asking the selector, for streams it cannot watch.
    fn assumed_ready(&self) -> Interest {
        if self.source.is_none() || self.registered == Some(Registered::AlwaysReady) {
            self.wanted()
        } else {
            Interest::empty()
        }
    }

    fn queue(&mut self, kind: OpKind) -> &mut VecDeque<OpId> {
        match kind {
            OpKind::Read => &mut self.reads,
            OpKind::Write => &mut self.writes,
        }
    }

    /// Brings the selector in line with what the watch needs.
    fn sync(&mut self, selector: &mut SelectorFacade, token: u64) -> Result<()> {
        let Some(source) = self.source else {
            return Ok(());
        };

        let wanted = self.wanted();
        if wanted == self.armed {
            return Ok(());
        }

        match self.registered {
            Some(Registered::Watched) if wanted.is_empty() => {
                selector.deregister(source, token)?;
                self.registered = None;
            }
            Some(Registered::Watched) => selector.reregister(source, token, wanted)?,
            Some(Registered::AlwaysReady) if wanted.is_empty() => self.registered = None,
            None if !wanted.is_empty() => self.registered = Some(selector.register(source, token, wanted)?),
            _ => {}
        }

        self.armed = wanted;
        Ok(())
    }
}

/// Waits for events on many streams at once, and drives asynchronous reads and writes.
///
/// Streams are registered with an [`Interest`] and a callback; [`wait()`][Self::wait] blocks
/// until some of them are ready and runs the callbacks of those that are. Reads and writes
/// submitted through [`read()`][Self::read] and [`write()`][Self::write] take ownership of a
/// [`ByteBuffer`] and hand it back to their callback once finished. Completion backends
/// (`io_uring`, IOCP) run them natively; readiness backends perform them when the stream
/// becomes ready.
///
/// A stream stays in use, and cannot be closed, while it is registered or has operations here.
///
/// # Example
///
/// ```
/// use std::ops::ControlFlow;
/// use std::time::Duration;
///
/// use sio::{Context, ContextConfig, Interest, Stream, StreamFlags, WaitStatus};
///
/// let (reader, mut writer) = Stream::pipe(StreamFlags::empty())?;
/// let mut context = Context::new(ContextConfig::default())?;
///
/// context.register(&reader, Interest::READABLE, 7, |event| {
///     assert_eq!(event.user_data(), 7);
///     ControlFlow::Break(())
/// })?;
/// writer.write(b"ping")?;
///
/// let status = context.wait(Some(Duration::from_secs(5)), 0)?;
/// assert_eq!(status, WaitStatus::Completed(1));
/// assert!(!context.is_registered(reader.id()));
/// # Ok::<(), sio::Error>(())
/// ```
///
/// # Thread safety
///
/// This type is `Send` but not `Sync`. Use [`SharedContext`] to share one between threads and
/// [`Notifier`] to wake it from other threads.
pub struct Context {
    backend: Backend,
    config: ContextConfig,
    selector: SelectorFacade,
    notifier: Arc<NotifierState>,
    watches: HashMap<u64, Watch>,
    ops: HashMap<OpId, PendingOp>,
    /// Operations whose callbacks are due, in the order they finished.
    finished: VecDeque<OpId>,
    events: Vec<SelectorEvent>,
}

impl Context {
    /// Creates a context on the backend `config` asks for.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::Unsupported`] if the backend is not available on this system, otherwise any
    /// failure creating it.
    pub fn new(config: ContextConfig) -> Result<Self> {
        let backend = config.requested_backend().resolve()?;
        let selector = SelectorFacade::new(backend, &config)?;

        event!(Level::DEBUG, message = "created context", backend = %backend, max_events = config.event_limit());

        Ok(Self::with_selector(backend, config, selector))
    }

    fn with_selector(backend: Backend, config: ContextConfig, selector: SelectorFacade) -> Self {
        let notifier = Arc::new(NotifierState::new(selector.wake_signal()));

        Self {
            backend,
            config,
            selector,
            notifier,
            watches: HashMap::new(),
            ops: HashMap::new(),
            finished: VecDeque::new(),
            events: Vec::new(),
        }
    }

    /// The backend in use. Never [`Backend::Auto`].
    #[must_use]
    pub const fn backend(&self) -> Backend {
        self.backend
    }

    /// The settings the context was created with.
    #[must_use]
    pub const fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// A handle that wakes this context from any thread.
    #[must_use]
    pub fn notifier(&self) -> Notifier {
        Notifier::new(Arc::clone(&self.notifier))
    }

    /// Starts delivering the events in `interest` for `stream` to `callback`.
    ///
    /// The callback runs inside [`wait()`][Self::wait] with the events that occurred, limited to
    /// `interest`. Returning [`ControlFlow::Break`] ends the registration.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::BadHandle`] if the stream is closed, [`ErrorCode::AlreadyExists`] if it is
    /// already registered, otherwise any failure of the backend.
    pub fn register(
        &mut self,
        stream: &Stream,
        interest: Interest,
        user_data: u64,
        callback: impl FnMut(&Event) -> ControlFlow<()> + Send + 'static,
    ) -> Result<()> {
        stream.native()?;
        let token = stream.id().as_u64();

        let watch = self.watches.entry(token).or_insert_with(|| Watch::new(stream.raw_source()));
        if watch.registration.is_some() {
            return Err(ErrorCode::AlreadyExists.into());
        }

        watch.registration = Some(Registration {
            stream: stream.id(),
            interest,
            user_data,
            callback: Box::new(callback),
            timeout: None,
            last_activity: Instant::now(),
            usage: Arc::clone(stream.usage()),
        });

        if let Err(error) = watch.sync(&mut self.selector, token) {
            watch.registration = None;
            if watch.is_idle() {
                self.watches.remove(&token);
            }
            return Err(error);
        }

        stream.usage().fetch_add(1, Ordering::AcqRel);
        event!(Level::DEBUG, message = "registered stream", id = %stream.id(), interest = ?interest);
        Ok(())
    }

    /// Replaces the interest of a registration.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::NotFound`] if the stream is not registered, otherwise any failure of the
    /// backend.
    pub fn modify(&mut self, stream: &Stream, interest: Interest) -> Result<()> {
        let token = stream.id().as_u64();
        let watch = self.watches.get_mut(&token).ok_or(Error::Code(ErrorCode::NotFound))?;
        let registration = watch.registration.as_mut().ok_or(Error::Code(ErrorCode::NotFound))?;

        let previous = std::mem::replace(&mut registration.interest, interest);
        if let Err(error) = watch.sync(&mut self.selector, token) {
            if let Some(registration) = watch.registration.as_mut() {
                registration.interest = previous;
            }
            return Err(error);
        }

        event!(Level::TRACE, message = "modified registration", id = %stream.id(), interest = ?interest);
        Ok(())
    }

    /// Ends a registration. Operations of the stream are not affected.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::NotFound`] if the stream is not registered.
    pub fn unregister(&mut self, stream: &Stream) -> Result<()> {
        let token = stream.id().as_u64();
        let registration = self
            .watches
            .get_mut(&token)
            .and_then(|watch| watch.registration.take())
            .ok_or(Error::Code(ErrorCode::NotFound))?;

        registration.release();
        self.refresh(token);
        event!(Level::DEBUG, message = "unregistered stream", id = %stream.id());
        Ok(())
    }

    /// Delivers [`Interest::TIMEOUT`] to the registration of `stream` whenever nothing was
    /// delivered to it for `timeout`. `None` turns this off.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::NotFound`] if the stream is not registered.
    pub fn set_timeout(&mut self, stream: &Stream, timeout: Option<Duration>) -> Result<()> {
        let registration = self
            .watches
            .get_mut(&stream.id().as_u64())
            .and_then(|watch| watch.registration.as_mut())
            .ok_or(Error::Code(ErrorCode::NotFound))?;

        registration.timeout = timeout;
        registration.last_activity = Instant::now();
        Ok(())
    }

    /// Whether the stream is registered.
    #[must_use]
    pub fn is_registered(&self, id: StreamId) -> bool {
        self.watches
            .get(&id.as_u64())
            .is_some_and(|watch| watch.registration.is_some())
    }

    /// Number of registered streams.
    #[must_use]
    pub fn registration_count(&self) -> usize {
        self.watches.values().filter(|watch| watch.registration.is_some()).count()
    }

    /// Prepares a read of up to `len` bytes from `stream` into `buffer`, placed at its cursor.
    pub fn read<'a>(&'a mut self, stream: &'a Stream, buffer: ByteBuffer, len: usize) -> OpBuilder<'a> {
        OpBuilder::new(self, stream, OpKind::Read, buffer, len)
    }

    /// Prepares a write of the bytes of `buffer` between its cursor and its end.
    pub fn write<'a>(&'a mut self, stream: &'a Stream, buffer: ByteBuffer) -> OpBuilder<'a> {
        OpBuilder::new(self, stream, OpKind::Write, buffer, 0)
    }

    /// Abandons an operation. Its callback runs during the next [`wait()`][Self::wait] with
    /// [`OpStatus::Cancelled`], unless the operation finished first.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::NotFound`] if the operation is unknown or its callback already ran.
    pub fn cancel(&mut self, op: OpId) -> Result<()> {
        self.stop(op, OpStatus::Cancelled)
    }

    /// Abandons every operation of `stream` and returns how many there were.
    ///
    /// # Errors
    ///
    /// Any failure of the backend to cancel native operations.
    pub fn cancel_stream(&mut self, stream: &Stream) -> Result<usize> {
        let ids: Vec<OpId> = self
            .ops
            .values()
            .filter(|op| op.stream == stream.id() && !op.is_finished() && op.cancelling.is_none())
            .map(|op| op.id)
            .collect();

        for &id in &ids {
            self.stop(id, OpStatus::Cancelled)?;
        }
        Ok(ids.len())
    }

    /// Number of operations whose callbacks have not run yet.
    #[must_use]
    pub fn pending_ops(&self) -> usize {
        self.ops.len()
    }

    /// Pushes operations the backend batched to the operating system without waiting.
    ///
    /// # Errors
    ///
    /// Any failure of the backend.
    pub fn flush_submissions(&mut self) -> Result<()> {
        self.selector.flush()
    }

    /// Waits up to `timeout` (forever with `None`) for events and finished operations, and runs
    /// their callbacks on the calling thread.
    ///
    /// At most `max_events` readiness events are collected from the backend per round; zero
    /// uses the configured limit.
    ///
    /// # Errors
    ///
    /// Any failure of the backend.
    pub fn wait(&mut self, timeout: Option<Duration>, max_events: usize) -> Result<WaitStatus> {
        let limit = if max_events == 0 { self.config.event_limit() } else { max_events };
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));

        loop {
            let mut delivered = self.deliver_finished() + self.deliver_notified();
            delivered += self.expire(Instant::now());
            delivered += self.deliver_finished();
            if delivered > 0 {
                return Ok(WaitStatus::Completed(delivered));
            }

            let now = Instant::now();
            let mut wake_at = deadline;
            if let Some(timer) = self.next_timer() {
                wake_at = Some(wake_at.map_or(timer, |wake_at| wake_at.min(timer)));
            }
            let mut block = wake_at.map(|wake_at| wake_at.saturating_duration_since(now));
            if self.watches.values().any(|watch| !watch.assumed_ready().is_empty()) {
                block = Some(Duration::ZERO);
            }

            self.events.clear();
            let selected = match self.selector.select(&mut self.events, limit, block) {
                Ok(selected) => selected,
                Err(error) => {
                    event!(Level::ERROR, message = "backend wait failed", backend = %self.backend, error = %error);
                    return Err(error);
                }
            };

            let mut delivered = self.dispatch(Instant::now());
            delivered += self.deliver_finished() + self.deliver_notified();
            event!(Level::TRACE, message = "wait round", delivered, woken = selected.woken, interrupted = selected.interrupted);

            if delivered > 0 {
                return Ok(WaitStatus::Completed(delivered));
            }
            if selected.woken || selected.interrupted {
                return Ok(WaitStatus::Interrupted);
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Ok(WaitStatus::TimedOut);
            }
        }
    }

    pub(crate) fn submit(&mut self, mut op: PendingOp) -> Result<OpId> {
        let id = op.id;
        op.mark_in_use();

        if !self.selector.supports_native(op.source) {
            self.ops.insert(id, op);
            if let Err(error) = self.enqueue(id) {
                if let Some(op) = self.ops.remove(&id) {
                    op.discard();
                }
                return Err(error);
            }

            event!(Level::TRACE, message = "queued operation", op = %id);
            return Ok(id);
        }

        let (ptr, len) = match op.region() {
            Ok(region) => region,
            Err(error) => {
                op.discard();
                return Err(error);
            }
        };
        let request = NativeRequest {
            kind: match op.kind {
                OpKind::Read => NativeKind::Read,
                OpKind::Write => NativeKind::Write,
            },
            ptr,
            len,
            offset: op.offset,
        };

        // SAFETY: The region lives in the storage of the op's buffer, which never moves and is
        // owned by the op until the backend reports the operation as finished or the context
        // abandons it.
        let submitted = unsafe { self.selector.submit(id.as_u64(), op.source, request) };
        match submitted {
            Ok(Submitted::Pending) => {
                op.native = true;
                self.ops.insert(id, op);
            }
            Ok(Submitted::Done(result)) => {
                op.native = true;
                self.ops.insert(id, op);
                self.complete_native(id, result);
            }
            Err(error) => {
                op.discard();
                return Err(error);
            }
        }

        event!(Level::TRACE, message = "submitted operation", op = %id, backend = %self.backend);
        Ok(id)
    }

    /// Adds an op to the readiness queue of its stream.
    fn enqueue(&mut self, id: OpId) -> Result<()> {
        let Some(op) = self.ops.get_mut(&id) else {
            return Ok(());
        };
        op.native = false;

        let token = op.stream.as_u64();
        let kind = op.kind;
        let watch = self.watches.entry(token).or_insert_with(|| Watch::new(Some(op.source)));
        watch.queue(kind).push_back(id);

        if let Err(error) = watch.sync(&mut self.selector, token) {
            watch.queue(kind).retain(|queued| *queued != id);
            if watch.is_idle() {
                self.watches.remove(&token);
            }
            return Err(error);
        }
        Ok(())
    }

    fn stop(&mut self, id: OpId, status: OpStatus) -> Result<()> {
        let op = self.ops.get_mut(&id).ok_or(Error::Code(ErrorCode::NotFound))?;
        if op.is_finished() || op.cancelling.is_some() {
            return Ok(());
        }

        if op.native {
            self.selector.cancel(id.as_u64())?;
            op.cancelling = Some(status);
        } else {
            op.finish(status, Ok(0));
            self.mark_finished(id);
        }

        event!(Level::TRACE, message = "stopping operation", op = %id, status = ?status);
        Ok(())
    }

    /// Queues the callback of a finished op.
    fn mark_finished(&mut self, id: OpId) {
        let Some(op) = self.ops.get(&id) else {
            return;
        };

        if !op.native {
            let token = op.stream.as_u64();
            if let Some(watch) = self.watches.get_mut(&token) {
                watch.reads.retain(|queued| *queued != id);
                watch.writes.retain(|queued| *queued != id);
                self.refresh(token);
            }
        }
        self.finished.push_back(id);
    }

    /// Re-syncs a watch after something was removed from it.
    fn refresh(&mut self, token: u64) {
        let Some(watch) = self.watches.get_mut(&token) else {
            return;
        };

        if let Err(error) = watch.sync(&mut self.selector, token) {
            event!(Level::WARN, message = "failed to update watched directions", token, error = %error);
        }
        if watch.is_idle() {
            self.watches.remove(&token);
        }
    }

    fn complete_native(&mut self, id: OpId, result: io::Result<usize>) {
        let Some(op) = self.ops.get_mut(&id) else {
            return;
        };

        if settle(op, result) {
            self.mark_finished(id);
            return;
        }

        event!(Level::TRACE, message = "native operation would block, retrying on readiness", op = %id);
        if let Err(error) = self.enqueue(id) {
            if let Some(op) = self.ops.get_mut(&id) {
                op.finish(OpStatus::Error, Err(error));
            }
            self.mark_finished(id);
        }
    }

    fn deliver_finished(&mut self) -> usize {
        let mut delivered = 0;

        while let Some(id) = self.finished.pop_front() {
            let Some(mut op) = self.ops.remove(&id) else {
                continue;
            };

            let callback = op.take_callback();
            let completed = op.complete();
            event!(
                Level::TRACE,
                message = "operation finished",
                op = %completed.id(),
                status = ?completed.status(),
                bytes = completed.bytes()
            );

            if let Some(callback) = callback {
                callback(completed);
            }
            delivered += 1;
        }

        delivered
    }

    fn deliver_notified(&mut self) -> usize {
        let now = Instant::now();
        self.notifier
            .take_notified()
            .into_iter()
            .map(|id| self.deliver(id.as_u64(), Interest::CUSTOM, now))
            .sum()
    }

    /// Runs the callback of a registration if any of `ready` is of interest to it.
    fn deliver(&mut self, token: u64, ready: Interest, now: Instant) -> usize {
        let Some(watch) = self.watches.get_mut(&token) else {
            return 0;
        };
        let Some(registration) = watch.registration.as_mut() else {
            return 0;
        };

        let events = ready & (registration.interest | Interest::TIMEOUT);
        if events.is_empty() {
            return 0;
        }

        registration.last_activity = now;
        let event = Event {
            stream: registration.stream,
            events,
            user_data: registration.user_data,
        };

        if (registration.callback)(&event).is_break() {
            if let Some(registration) = watch.registration.take() {
                registration.release();
            }
            self.refresh(token);
            event!(Level::DEBUG, message = "callback ended registration", id = %event.stream);
        }
        1
    }

    /// Times out due operations and delivers due registration timeouts.
    fn expire(&mut self, now: Instant) -> usize {
        let overdue: Vec<OpId> = self
            .ops
            .values()
            .filter(|op| !op.is_finished() && op.cancelling.is_none() && op.deadline.is_some_and(|deadline| deadline <= now))
            .map(|op| op.id)
            .collect();
        for id in overdue {
            if let Err(error) = self.stop(id, OpStatus::Timeout) {
                event!(Level::WARN, message = "failed to time out operation", op = %id, error = %error);
            }
        }

        let idle: Vec<u64> = self
            .watches
            .iter()
            .filter(|(_, watch)| watch.registration.as_ref().and_then(Registration::due).is_some_and(|due| due <= now))
            .map(|(token, _)| *token)
            .collect();

        idle.into_iter().map(|token| self.deliver(token, Interest::TIMEOUT, now)).sum()
    }

    fn next_timer(&self) -> Option<Instant> {
        let ops = self
            .ops
            .values()
            .filter(|op| !op.is_finished() && op.cancelling.is_none())
            .filter_map(|op| op.deadline);
        let registrations = self
            .watches
            .values()
            .filter_map(|watch| watch.registration.as_ref().and_then(Registration::due));

        ops.chain(registrations).min()
    }

    /// Handles what the selector collected plus the readiness of streams it cannot watch.
    fn dispatch(&mut self, now: Instant) -> usize {
        let mut collected = std::mem::take(&mut self.events);
        let mut ready: Vec<(u64, Interest)> = Vec::new();

        for event in collected.drain(..) {
            match event {
                SelectorEvent::Ready { token, ready: bits } => merge(&mut ready, token, bits),
                SelectorEvent::Completed { op, result } => self.complete_native(OpId::from_u64(op), result),
            }
        }
        self.events = collected;

        for (&token, watch) in &self.watches {
            let assumed = watch.assumed_ready();
            if !assumed.is_empty() {
                merge(&mut ready, token, assumed);
            }
        }

        ready
            .into_iter()
            .map(|(token, bits)| {
                let expanded = bits.expand();
                self.progress(token, expanded);
                self.deliver(token, expanded, now)
            })
            .sum()
    }

    /// Attempts the oldest queued op of each ready direction once.
    fn progress(&mut self, token: u64, ready: Interest) {
        if ready.intersects(Interest::READABLE | Interest::ERROR) {
            self.attempt(token, OpKind::Read);
        }
        if ready.intersects(Interest::WRITABLE | Interest::ERROR) {
            self.attempt(token, OpKind::Write);
        }
    }

    fn attempt(&mut self, token: u64, kind: OpKind) {
        let Some(id) = self.watches.get_mut(&token).and_then(|watch| watch.queue(kind).front().copied()) else {
            return;
        };
        let Some(op) = self.ops.get_mut(&id) else {
            return;
        };

        // SAFETY: The op keeps its stream in use, so the stream cannot have released its handle.
        match unsafe { op.attempt() } {
            Err(error) if matches!(error.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => return,
            Ok(bytes) => op.finish(OpStatus::Complete, Ok(bytes)),
            Err(error) => op.finish(OpStatus::Error, Err(error.into())),
        }

        self.mark_finished(id);
    }
}

/// Records the result the operating system reported for a native op. Returns `false` if the op
/// has to be retried once the stream is ready.
fn settle(op: &mut PendingOp, result: io::Result<usize>) -> bool {
    match (result, op.cancelling) {
        (Ok(bytes), _) => op.finish(OpStatus::Complete, Ok(bytes)),
        (Err(_aborted), Some(status)) => op.finish(status, Ok(0)),
        (Err(error), None) => {
            let error = Error::from(error);
            match error.code() {
                ErrorCode::WouldBlock => return false,
                ErrorCode::Cancelled => op.finish(OpStatus::Cancelled, Ok(0)),
                _ => op.finish(OpStatus::Error, Err(error)),
            }
        }
    }
    true
}

fn merge(ready: &mut Vec<(u64, Interest)>, token: u64, bits: Interest) {
    match ready.iter_mut().find(|(existing, _)| *existing == token) {
        Some((_, existing)) => *existing |= bits,
        None => ready.push((token, bits)),
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        for (token, mut watch) in self.watches.drain() {
            if let Some(registration) = watch.registration.take() {
                registration.release();
            }
            if let (Some(source), Some(Registered::Watched)) = (watch.source, watch.registered) {
                if let Err(error) = self.selector.deregister(source, token) {
                    event!(Level::TRACE, message = "failed to deregister on drop", token, error = %error);
                }
            }
        }

        let in_flight: Vec<OpId> = self
            .ops
            .values()
            .filter(|op| op.native && !op.is_finished())
            .map(|op| op.id)
            .collect();
        for id in &in_flight {
            if let Err(error) = self.selector.cancel(id.as_u64()) {
                event!(Level::TRACE, message = "failed to cancel on drop", op = %id, error = %error);
            }
        }

        let give_up = Instant::now() + DRAIN_LIMIT;
        while self.ops.values().any(|op| op.native && !op.is_finished()) && Instant::now() < give_up {
            let mut events = Vec::new();
            if self.selector.select(&mut events, DEFAULT_MAX_EVENTS, Some(DRAIN_SLICE)).is_err() {
                break;
            }
            for event in events {
                if let SelectorEvent::Completed { op, result } = event {
                    if let Some(op) = self.ops.get_mut(&OpId::from_u64(op)) {
                        op.finish(OpStatus::Cancelled, result.map_err(Error::from));
                    }
                }
            }
        }

        let mut abandoned = 0_usize;
        for (_, op) in self.ops.drain() {
            if op.native && !op.is_finished() {
                op.abandon();
                abandoned += 1;
            } else {
                op.discard();
            }
        }

        if abandoned > 0 {
            event!(Level::WARN, message = "context dropped with operations still running, leaking their buffers", count = abandoned);
        }
        event!(Level::DEBUG, message = "closed context", backend = %self.backend);
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("backend", &self.backend)
            .field("registrations", &self.registration_count())
            .field("pending_ops", &self.ops.len())
            .finish_non_exhaustive()
    }
}
