use std::collections::VecDeque;
use std::ops::RangeInclusive;

use cqrpc_rt::Tag;
use parking_lot::Mutex;

use crate::error::WriteError;
use crate::message::Message;
use crate::transport::CallStream;

/// Write pump state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    /// Nothing outstanding; the next accepted message is issued immediately.
    Idle,
    /// A write is outstanding, or queued messages wait for `write_next()`.
    Writing,
    /// Writes are rejected. A write already in flight still completes.
    Stop,
}

/// Result of a successful enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enqueued {
    /// Ids assigned to the enqueued messages, in order.
    pub ids: RangeInclusive<u64>,
    /// Whether this call issued a transport write (pump was idle).
    pub issued: bool,
}

impl Enqueued {
    /// Id of the first (for single writes, the only) enqueued message.
    pub fn id(&self) -> u64 {
        *self.ids.start()
    }
}

/// Result of a successful write completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteDone {
    /// Id of the message that was written.
    pub id: u64,
    /// Whether the next queued message was issued.
    pub issued_next: bool,
}

/// Result of a failed write completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteFailed {
    /// Id of the message whose write failed.
    pub id: Option<u64>,
    /// Queued messages that were discarded because the pump stopped.
    pub dropped: Option<RangeInclusive<u64>>,
}

struct Pending<W> {
    id: u64,
    size: usize,
    msg: W,
}

struct WriteQueue<W> {
    state: WriteState,
    pending: VecDeque<Pending<W>>,
    buffered: usize,
    next_id: u64,
    /// The front of `pending` has been handed to the transport.
    in_flight: bool,
    auto: bool,
}

impl<W> WriteQueue<W> {
    fn check_budget(&self, budget: usize, incoming: usize) -> Result<(), WriteError> {
        if self.state == WriteState::Stop {
            return Err(WriteError::Stopped);
        }
        if incoming > budget {
            return Err(WriteError::MessageTooLarge {
                size: incoming,
                budget,
            });
        }
        if self.buffered >= budget || self.buffered + incoming > budget {
            return Err(WriteError::QueueFull);
        }
        Ok(())
    }

    fn push(&mut self, msg: W, size: usize) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.buffered += size;
        self.pending.push_back(Pending { id, size, msg });
        id
    }

    fn pop_front(&mut self) -> Option<u64> {
        let done = self.pending.pop_front()?;
        self.buffered -= done.size;
        Some(done.id)
    }

    /// Discard everything not yet handed to the transport.
    fn discard_unsent(&mut self) -> Option<RangeInclusive<u64>> {
        let keep = usize::from(self.in_flight);
        if self.pending.len() <= keep {
            return None;
        }
        let dropped: Vec<Pending<W>> = self.pending.drain(keep..).collect();
        self.buffered = self.pending.iter().map(|p| p.size).sum();
        let first = dropped.first().map(|p| p.id)?;
        let last = dropped.last().map(|p| p.id)?;
        Some(first..=last)
    }

    fn issue_front<S>(&mut self, stream: &S, tag: Tag) -> bool
    where
        S: CallStream<Outbound = W>,
    {
        match self.pending.front() {
            Some(front) if !self.in_flight => {
                tracing::trace!(?tag, id = front.id, "write issued");
                stream.write(&front.msg, tag);
                self.in_flight = true;
                self.state = WriteState::Writing;
                true
            }
            _ => false,
        }
    }
}

/// Serializes bursty producers into one outstanding transport write at a time.
///
/// Messages are copied into the pump, bounded by a byte budget, and written in
/// FIFO order. Every accepted message gets a sequence id; completions report
/// the id of the message that was written. Producer calls may come from any
/// thread; completions arrive on the dispatch thread.
pub struct WritePump<W> {
    tag: Tag,
    budget: usize,
    inner: Mutex<WriteQueue<W>>,
}

impl<W: Message> WritePump<W> {
    /// Create a stopped pump issuing writes with `tag`.
    pub fn new(tag: Tag, budget: usize) -> Self {
        WritePump {
            tag,
            budget,
            inner: Mutex::new(WriteQueue {
                state: WriteState::Stop,
                pending: VecDeque::new(),
                buffered: 0,
                next_id: 0,
                in_flight: false,
                auto: true,
            }),
        }
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn state(&self) -> WriteState {
        self.inner.lock().state
    }

    /// Bytes currently held, including the message in flight.
    pub fn buffered(&self) -> usize {
        self.inner.lock().buffered
    }

    /// Messages currently held, including the message in flight.
    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_in_flight(&self) -> bool {
        self.inner.lock().in_flight
    }

    /// Whether a completion should immediately issue the next queued message.
    pub fn set_auto(&self, auto: bool) {
        self.inner.lock().auto = auto;
    }

    /// Accept writes again after [`stop`](Self::stop). Messages discarded by
    /// the stop are not restored.
    pub fn start(&self) {
        let mut q = self.inner.lock();
        if q.state == WriteState::Stop {
            q.state = if q.in_flight || !q.pending.is_empty() {
                WriteState::Writing
            } else {
                WriteState::Idle
            };
        }
    }

    /// Reject further writes and discard every queued message that has not
    /// been handed to the transport. A write already in flight is unaffected.
    /// Returns the ids of the discarded messages.
    pub fn stop(&self) -> Option<RangeInclusive<u64>> {
        let mut q = self.inner.lock();
        q.state = WriteState::Stop;
        let dropped = q.discard_unsent();
        if let Some(ids) = &dropped {
            tracing::debug!(tag = ?self.tag, ?ids, "write pump stopped with unsent messages");
        }
        dropped
    }

    /// Copy `msg` into the queue. Issues it immediately if the pump is idle.
    pub fn write<S>(&self, stream: &S, msg: &W) -> Result<Enqueued, WriteError>
    where
        S: CallStream<Outbound = W>,
    {
        let size = msg.byte_size();
        let mut q = self.inner.lock();
        q.check_budget(self.budget, size)?;
        let id = q.push(msg.clone(), size);
        let issued = q.state == WriteState::Idle && q.issue_front(stream, self.tag);
        Ok(Enqueued {
            ids: id..=id,
            issued,
        })
    }

    /// Copy a batch of messages into the queue. Either all of them are
    /// accepted or none are.
    pub fn write_batch<'a, S, I>(&self, stream: &S, msgs: I) -> Result<Enqueued, WriteError>
    where
        S: CallStream<Outbound = W>,
        I: IntoIterator<Item = &'a W>,
        W: 'a,
    {
        let msgs: Vec<&W> = msgs.into_iter().collect();
        if msgs.is_empty() {
            return Err(WriteError::EmptyBatch);
        }
        let total: usize = msgs.iter().map(|m| m.byte_size()).sum();
        let mut q = self.inner.lock();
        q.check_budget(self.budget, total)?;
        let first = q.next_id;
        for m in &msgs {
            q.push((*m).clone(), m.byte_size());
        }
        let last = q.next_id - 1;
        let issued = q.state == WriteState::Idle && q.issue_front(stream, self.tag);
        Ok(Enqueued {
            ids: first..=last,
            issued,
        })
    }

    /// Issue the front message when auto-continue is disabled. Returns false if
    /// the pump is stopped, a write is already outstanding, or nothing is queued.
    pub fn write_next<S>(&self, stream: &S) -> bool
    where
        S: CallStream<Outbound = W>,
    {
        let mut q = self.inner.lock();
        if q.state == WriteState::Stop {
            return false;
        }
        q.issue_front(stream, self.tag)
    }

    /// The outstanding write completed. Releases the written message and, if
    /// more are queued and auto-continue is on, issues the next one.
    pub fn process<S>(&self, stream: &S) -> Option<WriteDone>
    where
        S: CallStream<Outbound = W>,
    {
        let mut q = self.inner.lock();
        if !q.in_flight {
            tracing::warn!(tag = ?self.tag, "write completion with nothing in flight");
            return None;
        }
        q.in_flight = false;
        let id = q.pop_front()?;
        let issued_next = match q.state {
            WriteState::Stop => false,
            _ if q.pending.is_empty() => {
                q.state = WriteState::Idle;
                false
            }
            _ => q.auto && q.issue_front(stream, self.tag),
        };
        Some(WriteDone { id, issued_next })
    }

    /// The outstanding write failed. The transport stream is unusable after a
    /// failed write, so the pump stops and discards what is left.
    pub fn fail(&self) -> WriteFailed {
        let mut q = self.inner.lock();
        let id = if std::mem::replace(&mut q.in_flight, false) {
            q.pop_front()
        } else {
            None
        };
        q.state = WriteState::Stop;
        let dropped = q.discard_unsent();
        WriteFailed { id, dropped }
    }
}
