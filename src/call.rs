//! The per-call state machine.
//!
//! A [`Call`] owns three tags in its channel's registry: one for the call
//! itself (start and finish), one for its read pump and one for its write
//! pump. It stays registered, and therefore alive, until the transport has
//! delivered the finish completion; only then are its tags retired.
//!
//! Lock order is `core` before the write pump's own lock. Handler hooks always
//! run with no call lock held, so they may call back into the [`Call`].

use std::fmt;
use std::future::Future;
use std::ops::RangeInclusive;
use std::sync::{Arc, Weak};

use cqrpc_rt::{Tag, TagHandler};
use futures::channel::oneshot;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;

use crate::config::Config;
use crate::context::ChannelContext;
use crate::error::WriteError;
use crate::message::{Code, Status, StatusSlot};
use crate::pump::{Enqueued, ReadPump, WritePump};
use crate::transport::CallStream;

/// Which pumps a call arms once the transport confirms it started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamKind {
    /// Read only.
    ServerStreaming,
    /// Write only.
    ClientStreaming,
    #[default]
    Bidirectional,
}

impl StreamKind {
    pub fn reads(self) -> bool {
        matches!(self, StreamKind::ServerStreaming | StreamKind::Bidirectional)
    }

    pub fn writes(self) -> bool {
        matches!(self, StreamKind::ClientStreaming | StreamKind::Bidirectional)
    }
}

/// Per-call settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
    pub kind: StreamKind,
    /// Byte budget of the call's write pump.
    pub write_budget: usize,
    /// Re-arm the read pump after every message.
    pub auto_read: bool,
    /// Issue the next queued write after every write completion.
    pub auto_write: bool,
}

impl CallOptions {
    pub fn new(kind: StreamKind) -> Self {
        CallOptions {
            kind,
            ..Self::default()
        }
    }

    /// Options of a `kind` call with the configured write budget.
    pub fn from_config(kind: StreamKind, config: &Config) -> Self {
        CallOptions {
            kind,
            write_budget: config.write_budget,
            ..Self::default()
        }
    }
}

impl Default for CallOptions {
    fn default() -> Self {
        CallOptions {
            kind: StreamKind::Bidirectional,
            write_budget: Config::default().write_budget,
            auto_read: true,
            auto_write: true,
        }
    }
}

/// Lifecycle of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Waiting for the transport to confirm the call started.
    Create,
    /// Streaming.
    Working,
    /// Winding down after cancellation, close or end of stream.
    Finish,
    /// Winding down after a start or write failure.
    Error,
    /// The transport delivered the final status; the call is retired.
    Destroy,
}

impl CallState {
    fn is_winding_down(self) -> bool {
        matches!(self, CallState::Finish | CallState::Error | CallState::Destroy)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Create => "create",
            CallState::Working => "working",
            CallState::Finish => "finish",
            CallState::Error => "error",
            CallState::Destroy => "destroy",
        };
        f.write_str(name)
    }
}

/// Business logic attached to a call.
///
/// Every hook runs on the dispatch thread, except `on_write_dropped` when the
/// drop was caused by [`Call::cancel`] from another thread.
#[allow(unused_variables)]
pub trait CallHandler<S: CallStream>: Sized + Send + Sync + 'static {
    /// The transport confirmed the call; its pumps are armed.
    fn on_start(&self, call: &Call<S, Self>) {}

    fn on_read(&self, call: &Call<S, Self>, msg: S::Inbound);

    /// The stream ended or broke. The call is finishing.
    fn on_read_error(&self, call: &Call<S, Self>) {}

    /// The write with this id reached the transport.
    fn on_write(&self, call: &Call<S, Self>, id: u64) {}

    /// The write with this id failed. The call is finishing.
    fn on_write_error(&self, call: &Call<S, Self>, id: u64) {}

    /// Accepted messages that will never be written.
    fn on_write_dropped(&self, call: &Call<S, Self>, ids: RangeInclusive<u64>) {}

    fn on_finish(&self, call: &Call<S, Self>, status: &Status) {}
}

/// Object-safe view of a live call, held by its [`ChannelContext`].
pub trait LiveCall: Send + Sync {
    fn id(&self) -> u64;
    fn state(&self) -> CallState;
    /// Request transport-level cancellation. Returns false if the call is
    /// already winding down.
    fn cancel(&self) -> bool;
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct CallTags {
    pub(crate) call: Tag,
    pub(crate) read: Tag,
    pub(crate) write: Tag,
}

struct Core<R> {
    state: CallState,
    /// Transport operations issued and not yet completed, finish excluded.
    outstanding: usize,
    finish_issued: bool,
    /// Graceful close requested: finish once queued writes drain.
    closing: bool,
    reader: ReadPump<R>,
}

/// Hook invocations collected under the lock and run after it is released.
#[derive(Default)]
struct Deferred {
    dropped: Option<RangeInclusive<u64>>,
}

/// One streaming RPC.
pub struct Call<S: CallStream, H> {
    id: u64,
    options: CallOptions,
    stream: Arc<S>,
    handler: H,
    context: Weak<ChannelContext>,
    tags: CallTags,
    core: Mutex<Core<S::Inbound>>,
    writer: WritePump<S::Outbound>,
    status: StatusSlot,
    done: Mutex<Option<oneshot::Sender<Status>>>,
    finished: Shared<BoxFuture<'static, Status>>,
}

impl<S: CallStream, H: CallHandler<S>> Call<S, H> {
    pub(crate) fn new(
        id: u64,
        stream: Arc<S>,
        options: CallOptions,
        handler: H,
        context: Weak<ChannelContext>,
        tags: CallTags,
    ) -> Self {
        let (tx, rx) = oneshot::channel();
        let finished = rx.map(|status| status.unwrap_or_else(|_| Status::cancelled())).boxed().shared();
        let mut reader = ReadPump::new(tags.read);
        reader.set_auto(options.auto_read);
        let writer = WritePump::new(tags.write, options.write_budget);
        writer.set_auto(options.auto_write);
        Call {
            id,
            options,
            stream,
            handler,
            context,
            tags,
            core: Mutex::new(Core {
                state: CallState::Create,
                outstanding: 0,
                finish_issued: false,
                closing: false,
                reader,
            }),
            writer,
            status: StatusSlot::new(),
            done: Mutex::new(Some(tx)),
            finished,
        }
    }

    /// Issue the initiating operation. Called once, after the tags are bound.
    pub(crate) fn begin(&self) {
        let mut core = self.core.lock();
        core.outstanding += 1;
        tracing::debug!(call = self.id, kind = ?self.options.kind, "call starting");
        self.stream.start(self.tags.call);
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn options(&self) -> &CallOptions {
        &self.options
    }

    pub fn state(&self) -> CallState {
        self.core.lock().state
    }

    pub fn stream(&self) -> &Arc<S> {
        &self.stream
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Bytes waiting in the write pump, the in-flight message included.
    pub fn buffered(&self) -> usize {
        self.writer.buffered()
    }

    /// Resolves to the final status once the call is retired.
    pub fn finished(&self) -> impl Future<Output = Status> + Send + 'static {
        self.finished.clone()
    }

    /// Queue one message. Fails with `Stopped` before the call started,
    /// after close or cancel, and for calls that do not write.
    pub fn write(&self, msg: &S::Outbound) -> Result<u64, WriteError> {
        let mut core = self.core.lock();
        if core.closing {
            return Err(WriteError::Stopped);
        }
        let enqueued = self.writer.write(&*self.stream, msg)?;
        Ok(self.account(&mut core, enqueued).id())
    }

    /// Queue several messages; all or none are accepted.
    pub fn write_batch<'a, I>(&self, msgs: I) -> Result<RangeInclusive<u64>, WriteError>
    where
        I: IntoIterator<Item = &'a S::Outbound>,
    {
        let mut core = self.core.lock();
        if core.closing {
            return Err(WriteError::Stopped);
        }
        let enqueued = self.writer.write_batch(&*self.stream, msgs)?;
        Ok(self.account(&mut core, enqueued).ids)
    }

    fn account(&self, core: &mut Core<S::Inbound>, enqueued: Enqueued) -> Enqueued {
        if enqueued.issued {
            core.outstanding += 1;
        }
        enqueued
    }

    /// Issue the next read when auto-read is off. The first read is armed on
    /// start either way. Returns false if a read is
    /// outstanding or the call is not streaming.
    pub fn read_next(&self) -> bool {
        let mut core = self.core.lock();
        if core.state != CallState::Working || !self.options.kind.reads() {
            return false;
        }
        let issued = core.reader.read(&*self.stream);
        if issued {
            core.outstanding += 1;
        }
        issued
    }

    /// Issue the next queued write when auto-write is off.
    pub fn write_next(&self) -> bool {
        let mut core = self.core.lock();
        if core.state.is_winding_down() {
            return false;
        }
        let issued = self.writer.write_next(&*self.stream);
        if issued {
            core.outstanding += 1;
        }
        issued
    }

    /// Stop accepting writes and finish once the queued ones are written and
    /// the peer has ended the stream.
    pub fn close(&self) {
        let mut core = self.core.lock();
        if core.closing || core.state.is_winding_down() {
            return;
        }
        core.closing = true;
        tracing::debug!(call = self.id, "call closing");
        self.try_close(&mut core);
    }

    /// Request cancellation. The call still retires through the normal
    /// completion path.
    pub fn cancel(&self) -> bool {
        let deferred = {
            let mut core = self.core.lock();
            if core.state.is_winding_down() {
                return false;
            }
            tracing::debug!(call = self.id, state = %core.state, "call cancelled");
            core.state = CallState::Finish;
            self.begin_finish(&mut core)
        };
        self.run_deferred(deferred);
        true
    }

    // ── Transitions (core lock held) ────────────────────────────────

    /// Enter the wind-down. Unsent writes are dropped; outstanding operations
    /// are cancelled so that they complete and the finish can be issued.
    fn begin_finish(&self, core: &mut Core<S::Inbound>) -> Deferred {
        let dropped = self.writer.stop();
        if core.outstanding == 0 {
            self.issue_finish(core);
        } else {
            self.stream.cancel();
        }
        Deferred { dropped }
    }

    /// The single path to `CallStream::finish`.
    fn issue_finish(&self, core: &mut Core<S::Inbound>) {
        if core.finish_issued || core.outstanding > 0 {
            return;
        }
        core.finish_issued = true;
        tracing::trace!(call = self.id, "finish issued");
        self.stream.finish(&self.status, self.tags.call);
    }

    fn try_close(&self, core: &mut Core<S::Inbound>) {
        if core.closing && !core.state.is_winding_down() && self.writer.is_empty() && core.outstanding == 0 {
            core.state = CallState::Finish;
            self.writer.stop();
            self.issue_finish(core);
        }
    }

    fn settle(&self, core: &mut Core<S::Inbound>) {
        if core.state.is_winding_down() {
            self.issue_finish(core);
        } else {
            self.try_close(core);
        }
    }

    fn run_deferred(&self, deferred: Deferred) {
        if let Some(ids) = deferred.dropped {
            tracing::warn!(call = self.id, first = ids.start(), last = ids.end(), "unsent writes dropped");
            self.handler.on_write_dropped(self, ids);
        }
    }

    // ── Completions ─────────────────────────────────────────────────

    fn started(&self, ok: bool) {
        let mut deferred = Deferred::default();
        let started = {
            let mut core = self.core.lock();
            core.outstanding -= 1;
            if core.state.is_winding_down() {
                // Cancelled while starting.
                self.issue_finish(&mut core);
                false
            } else if !ok {
                tracing::warn!(call = self.id, "call failed to start");
                core.state = CallState::Error;
                deferred = self.begin_finish(&mut core);
                false
            } else {
                core.state = CallState::Working;
                // The first read is armed regardless of auto-read.
                if self.options.kind.reads() && core.reader.read(&*self.stream) {
                    core.outstanding += 1;
                }
                if self.options.kind.writes() {
                    self.writer.start();
                }
                tracing::debug!(call = self.id, "call started");
                // A close requested while starting may already be due.
                self.try_close(&mut core);
                true
            }
        };
        self.run_deferred(deferred);
        if started {
            self.handler.on_start(self);
        }
    }

    fn read_done(&self, ok: bool) {
        let mut deferred = Deferred::default();
        let msg = {
            let mut core = self.core.lock();
            core.outstanding -= 1;
            core.reader.complete();
            if ok {
                let msg = std::mem::take(&mut *core.reader.slot().lock());
                if !core.state.is_winding_down() && core.reader.should_continue() && core.reader.read(&*self.stream) {
                    core.outstanding += 1;
                }
                self.settle(&mut core);
                Some(msg)
            } else {
                if !core.state.is_winding_down() {
                    tracing::debug!(call = self.id, "end of stream");
                    core.state = CallState::Finish;
                    deferred = self.begin_finish(&mut core);
                } else {
                    self.issue_finish(&mut core);
                }
                None
            }
        };
        match msg {
            Some(msg) => self.handler.on_read(self, msg),
            None => self.handler.on_read_error(self),
        }
        self.run_deferred(deferred);
    }

    fn write_done(&self, ok: bool) {
        let mut deferred = Deferred::default();
        let outcome = {
            let mut core = self.core.lock();
            core.outstanding -= 1;
            if ok {
                let done = self.writer.process(&*self.stream);
                if matches!(done, Some(d) if d.issued_next) {
                    core.outstanding += 1;
                }
                self.settle(&mut core);
                done.map(|d| Ok(d.id))
            } else {
                let failed = self.writer.fail();
                if !core.state.is_winding_down() {
                    tracing::warn!(call = self.id, id = ?failed.id, "write failed");
                    core.state = CallState::Error;
                    deferred = self.begin_finish(&mut core);
                } else {
                    self.issue_finish(&mut core);
                }
                deferred.dropped = failed.dropped.or(deferred.dropped);
                failed.id.map(Err)
            }
        };
        match outcome {
            Some(Ok(id)) => self.handler.on_write(self, id),
            Some(Err(id)) => self.handler.on_write_error(self, id),
            None => {}
        }
        self.run_deferred(deferred);
    }

    fn finish_done(&self, ok: bool) {
        let status = {
            let mut core = self.core.lock();
            core.state = CallState::Destroy;
            if ok {
                self.status.get()
            } else {
                Status::new(Code::Unknown, "finish failed")
            }
        };
        if let Some(context) = self.context.upgrade() {
            context.retire(self.id, [self.tags.call, self.tags.read, self.tags.write]);
        }
        if status.is_ok() {
            tracing::info!(call = self.id, code = %status.code, message = %status.message, "call finished");
        } else {
            tracing::warn!(call = self.id, code = %status.code, message = %status.message, "call finished");
        }
        self.handler.on_finish(self, &status);
        if let Some(tx) = self.done.lock().take() {
            let _ = tx.send(status);
        }
    }

    fn on_completion(&self, tag: Tag, ok: bool) {
        if tag == self.tags.call {
            if self.core.lock().finish_issued {
                self.finish_done(ok);
            } else {
                self.started(ok);
            }
        } else if tag == self.tags.read {
            self.read_done(ok);
        } else if tag == self.tags.write {
            self.write_done(ok);
        } else {
            tracing::warn!(call = self.id, ?tag, "completion for a foreign tag");
        }
    }
}

impl<S: CallStream, H: CallHandler<S>> TagHandler for Call<S, H> {
    fn process(&self, tag: Tag) {
        self.on_completion(tag, true);
    }

    fn on_error(&self, tag: Tag) {
        self.on_completion(tag, false);
    }
}

impl<S: CallStream, H: CallHandler<S>> LiveCall for Call<S, H> {
    fn id(&self) -> u64 {
        self.id
    }

    fn state(&self) -> CallState {
        Call::state(self)
    }

    fn cancel(&self) -> bool {
        Call::cancel(self)
    }
}

impl<S: CallStream, H> fmt::Debug for Call<S, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.id)
            .field("kind", &self.options.kind)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}
