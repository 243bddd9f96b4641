//! In-process transport.
//!
//! Implements [`Connector`], [`Channel`] and [`CallStream`] without any I/O:
//! a test (or an embedding application) plays the peer through the methods
//! on [`LoopbackStream`] and [`LoopbackChannel`]. Every operation completes
//! through the completion queue, never inline, like a real transport.
//!
//! The stream also checks the transport rules the engine must uphold and
//! records each breach as a [`Violation`] instead of failing hard.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cqrpc_rt::{AlarmId, CompletionQueue, Tag};
use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::message::{Message, ReadSlot, Status, StatusSlot};
use crate::transport::{CallStream, Channel, ConnectivityState, Connector};

fn post(queue: &CompletionQueue, tag: Tag, ok: bool) {
    if queue.post(tag, ok).is_err() {
        tracing::debug!(?tag, ok, "completion dropped: queue shut down");
    }
}

// ── Connector ───────────────────────────────────────────────────────

enum Scripted {
    State(ConnectivityState),
    Fail(String),
}

/// Hands out [`LoopbackChannel`]s.
///
/// Each `connect` consumes the next scripted outcome; once the script is
/// exhausted channels start out [`Ready`](ConnectivityState::Ready).
#[derive(Default)]
pub struct LoopbackConnector {
    script: Mutex<VecDeque<Scripted>>,
    channels: Mutex<Vec<Arc<LoopbackChannel>>>,
    connected: Condvar,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next connect returns a channel starting in `state`.
    pub fn push_state(&self, state: ConnectivityState) {
        self.script.lock().push_back(Scripted::State(state));
    }

    /// The next connect fails.
    pub fn push_failure(&self, reason: impl Into<String>) {
        self.script.lock().push_back(Scripted::Fail(reason.into()));
    }

    /// Every channel built so far, oldest first.
    pub fn channels(&self) -> Vec<Arc<LoopbackChannel>> {
        self.channels.lock().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.channels.lock().len()
    }

    /// Block until at least `n` channels were built or `timeout` passes.
    /// Returns the newest channel on success.
    pub fn wait_for_channels(&self, n: usize, timeout: Duration) -> Option<Arc<LoopbackChannel>> {
        let deadline = Instant::now() + timeout;
        let mut channels = self.channels.lock();
        while channels.len() < n {
            if self.connected.wait_until(&mut channels, deadline).timed_out() {
                break;
            }
        }
        if channels.len() >= n {
            channels.last().cloned()
        } else {
            None
        }
    }
}

impl Connector for LoopbackConnector {
    type Channel = LoopbackChannel;

    fn connect(&self, target: &str, queue: &Arc<CompletionQueue>) -> Result<Arc<LoopbackChannel>> {
        let initial = match self.script.lock().pop_front() {
            Some(Scripted::Fail(reason)) => {
                return Err(Error::Connect {
                    target: target.to_string(),
                    reason,
                })
            }
            Some(Scripted::State(state)) => state,
            None => ConnectivityState::Ready,
        };
        let channel = Arc::new(LoopbackChannel::new(Arc::clone(queue), initial));
        self.channels.lock().push(Arc::clone(&channel));
        self.connected.notify_all();
        tracing::debug!(endpoint = target, state = %initial, "loopback channel created");
        Ok(channel)
    }
}

// ── Channel ─────────────────────────────────────────────────────────

struct ChannelState {
    state: ConnectivityState,
    watchers: Vec<(AlarmId, ConnectivityState)>,
}

/// A channel whose connectivity is driven by [`set_state`](Self::set_state).
pub struct LoopbackChannel {
    queue: Arc<CompletionQueue>,
    inner: Mutex<ChannelState>,
    changed: Condvar,
}

impl LoopbackChannel {
    pub fn new(queue: Arc<CompletionQueue>, initial: ConnectivityState) -> Self {
        LoopbackChannel {
            queue,
            inner: Mutex::new(ChannelState {
                state: initial,
                watchers: Vec::new(),
            }),
            changed: Condvar::new(),
        }
    }

    pub fn queue(&self) -> &Arc<CompletionQueue> {
        &self.queue
    }

    /// Open a call stream on this channel's queue.
    pub fn stream<Out: Message, In: Default + Send + 'static>(&self) -> Arc<LoopbackStream<Out, In>> {
        Arc::new(LoopbackStream::new(Arc::clone(&self.queue)))
    }

    /// Move to `state` and complete every watch whose baseline differs.
    pub fn set_state(&self, state: ConnectivityState) {
        let fired: Vec<AlarmId> = {
            let mut inner = self.inner.lock();
            inner.state = state;
            let (fired, kept): (Vec<_>, Vec<_>) =
                inner.watchers.drain(..).partition(|(_, last)| *last != state);
            inner.watchers = kept;
            fired.into_iter().map(|(id, _)| id).collect()
        };
        for id in fired {
            self.queue.trigger_alarm(id);
        }
        self.changed.notify_all();
    }
}

impl Channel for LoopbackChannel {
    fn state(&self) -> ConnectivityState {
        self.inner.lock().state
    }

    fn notify_on_state_change(&self, last_observed: ConnectivityState, deadline: Instant, tag: Tag) {
        let mut inner = self.inner.lock();
        if inner.state != last_observed {
            drop(inner);
            post(&self.queue, tag, true);
            return;
        }
        match self.queue.alarm(deadline, tag) {
            Ok(id) => inner.watchers.push((id, last_observed)),
            Err(_) => tracing::debug!(?tag, "state watch dropped: queue shut down"),
        }
    }

    fn wait_for_connected(&self, deadline: Instant) -> bool {
        let mut inner = self.inner.lock();
        while inner.state != ConnectivityState::Ready {
            if self.changed.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }
        inner.state == ConnectivityState::Ready
    }
}

// ── Stream ──────────────────────────────────────────────────────────

/// A transport rule the engine broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    ConcurrentRead,
    ConcurrentWrite,
    FinishWithPendingOps,
    DoubleFinish,
}

struct StreamState<Out, In> {
    inbound: VecDeque<In>,
    pending_read: Option<(ReadSlot<In>, Tag)>,
    pending_write: Option<Tag>,
    written: Vec<Out>,
    manual_ack: bool,
    fail_start: bool,
    closed: bool,
    cancelled: bool,
    finished: bool,
    finish_status: Status,
    violations: Vec<Violation>,
}

/// One call. `Out` is what the engine writes, `In` what it reads.
pub struct LoopbackStream<Out, In> {
    queue: Arc<CompletionQueue>,
    inner: Mutex<StreamState<Out, In>>,
}

impl<Out, In> LoopbackStream<Out, In> {
    pub fn new(queue: Arc<CompletionQueue>) -> Self {
        LoopbackStream {
            queue,
            inner: Mutex::new(StreamState {
                inbound: VecDeque::new(),
                pending_read: None,
                pending_write: None,
                written: Vec::new(),
                manual_ack: false,
                fail_start: false,
                closed: false,
                cancelled: false,
                finished: false,
                finish_status: Status::ok(),
                violations: Vec::new(),
            }),
        }
    }

    /// Hold each write until [`ack_write`](Self::ack_write) instead of
    /// completing it immediately.
    pub fn set_manual_write_ack(&self, manual: bool) {
        self.inner.lock().manual_ack = manual;
    }

    /// Make the next `start` fail.
    pub fn fail_start(&self) {
        self.inner.lock().fail_start = true;
    }

    /// Status reported by `finish` unless the call was cancelled.
    pub fn set_finish_status(&self, status: Status) {
        self.inner.lock().finish_status = status;
    }

    /// Deliver a message to the engine.
    pub fn push(&self, msg: In) {
        let mut inner = self.inner.lock();
        match inner.pending_read.take() {
            Some((slot, tag)) => {
                slot.fill(msg);
                drop(inner);
                post(&self.queue, tag, true);
            }
            None => inner.inbound.push_back(msg),
        }
    }

    /// End of stream: the outstanding read and all later reads fail once the
    /// queued messages are consumed.
    pub fn close(&self) {
        let pending = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.pending_read.take()
        };
        if let Some((_, tag)) = pending {
            post(&self.queue, tag, false);
        }
    }

    /// Complete the held write. Returns false if none is held.
    pub fn ack_write(&self, ok: bool) -> bool {
        let pending = self.inner.lock().pending_write.take();
        match pending {
            Some(tag) => {
                post(&self.queue, tag, ok);
                true
            }
            None => false,
        }
    }

    pub fn violations(&self) -> Vec<Violation> {
        self.inner.lock().violations.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().cancelled
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }

    pub fn has_pending_read(&self) -> bool {
        self.inner.lock().pending_read.is_some()
    }

    pub fn has_pending_write(&self) -> bool {
        self.inner.lock().pending_write.is_some()
    }
}

impl<Out: Clone, In> LoopbackStream<Out, In> {
    /// Everything the engine has written, in order.
    pub fn written(&self) -> Vec<Out> {
        self.inner.lock().written.clone()
    }
}

impl<Out: Message, In: Default + Send + 'static> CallStream for LoopbackStream<Out, In> {
    type Outbound = Out;
    type Inbound = In;

    fn start(&self, tag: Tag) {
        let ok = !std::mem::take(&mut self.inner.lock().fail_start);
        post(&self.queue, tag, ok);
    }

    fn read(&self, slot: &ReadSlot<In>, tag: Tag) {
        let mut inner = self.inner.lock();
        if inner.pending_read.is_some() {
            inner.violations.push(Violation::ConcurrentRead);
            drop(inner);
            post(&self.queue, tag, false);
            return;
        }
        if let Some(msg) = inner.inbound.pop_front() {
            slot.fill(msg);
            drop(inner);
            post(&self.queue, tag, true);
        } else if inner.closed || inner.cancelled {
            drop(inner);
            post(&self.queue, tag, false);
        } else {
            inner.pending_read = Some((slot.clone(), tag));
        }
    }

    fn write(&self, msg: &Out, tag: Tag) {
        let mut inner = self.inner.lock();
        if inner.pending_write.is_some() {
            inner.violations.push(Violation::ConcurrentWrite);
            drop(inner);
            post(&self.queue, tag, false);
            return;
        }
        if inner.cancelled {
            drop(inner);
            post(&self.queue, tag, false);
            return;
        }
        inner.written.push(msg.clone());
        if inner.manual_ack {
            inner.pending_write = Some(tag);
        } else {
            drop(inner);
            post(&self.queue, tag, true);
        }
    }

    fn finish(&self, status: &StatusSlot, tag: Tag) {
        let mut inner = self.inner.lock();
        if inner.finished {
            inner.violations.push(Violation::DoubleFinish);
        }
        if inner.pending_read.is_some() || inner.pending_write.is_some() {
            inner.violations.push(Violation::FinishWithPendingOps);
        }
        inner.finished = true;
        let reported = if inner.cancelled && inner.finish_status.is_ok() {
            Status::cancelled()
        } else {
            inner.finish_status.clone()
        };
        drop(inner);
        status.set(reported);
        post(&self.queue, tag, true);
    }

    fn cancel(&self) {
        let (read, write) = {
            let mut inner = self.inner.lock();
            inner.cancelled = true;
            (inner.pending_read.take(), inner.pending_write.take())
        };
        if let Some((_, tag)) = read {
            post(&self.queue, tag, false);
        }
        if let Some(tag) = write {
            post(&self.queue, tag, false);
        }
    }
}
