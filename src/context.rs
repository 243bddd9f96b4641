//! Per-channel state: the completion queue, its tag registry and the table of
//! live calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use cqrpc_rt::{CompletionQueue, Dispatcher, Tag, TagRegistry};
use parking_lot::Mutex;

use crate::call::{Call, CallHandler, CallOptions, CallTags, LiveCall};
use crate::error::{Error, QueueShutdown, Result};
use crate::transport::CallStream;

/// Everything calls on one channel share.
///
/// Replaces any notion of process-wide call tracking: each channel gets its
/// own context, and the reconnect supervisor builds a fresh one per
/// connection.
pub struct ChannelContext {
    queue: Arc<CompletionQueue>,
    tags: Arc<TagRegistry>,
    calls: Mutex<HashMap<u64, Weak<dyn LiveCall>>>,
    next_call: AtomicU64,
}

impl ChannelContext {
    pub fn new(queue: Arc<CompletionQueue>) -> Arc<Self> {
        Arc::new(ChannelContext {
            queue,
            tags: Arc::new(TagRegistry::new()),
            calls: Mutex::new(HashMap::new()),
            next_call: AtomicU64::new(1),
        })
    }

    pub fn queue(&self) -> &Arc<CompletionQueue> {
        &self.queue
    }

    pub fn tags(&self) -> &Arc<TagRegistry> {
        &self.tags
    }

    /// A dispatcher routing this channel's completions.
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(Arc::clone(&self.queue), Arc::clone(&self.tags))
    }

    /// Create a call on `stream` and issue its start operation.
    ///
    /// The call's tags are bound before anything is issued, so even a start
    /// that completes immediately finds its handler.
    pub fn start_call<S, H>(self: &Arc<Self>, stream: Arc<S>, options: CallOptions, handler: H) -> Result<Arc<Call<S, H>>>
    where
        S: CallStream,
        H: CallHandler<S>,
    {
        if self.queue.is_shutdown() {
            return Err(Error::QueueShutdown(QueueShutdown));
        }
        let id = self.next_call.fetch_add(1, Ordering::Relaxed);
        let tags = CallTags {
            call: self.tags.reserve(),
            read: self.tags.reserve(),
            write: self.tags.reserve(),
        };
        let call = Arc::new(Call::new(id, stream, options, handler, Arc::downgrade(self), tags));
        for tag in [tags.call, tags.read, tags.write] {
            self.tags.bind(tag, call.clone());
        }
        let live: Arc<dyn LiveCall> = call.clone();
        self.calls.lock().insert(id, Arc::downgrade(&live));
        call.begin();
        Ok(call)
    }

    /// Cancel the call with `id`. Returns false if it is unknown or already
    /// winding down.
    pub fn cancel(&self, id: u64) -> bool {
        let call = self.calls.lock().get(&id).and_then(Weak::upgrade);
        call.is_some_and(|call| call.cancel())
    }

    /// Cancel every live call. Returns how many accepted the request.
    pub fn cancel_all(&self) -> usize {
        let calls = self.live_calls();
        calls.iter().filter(|call| call.cancel()).count()
    }

    /// Calls that have not yet been retired.
    pub fn live_calls(&self) -> Vec<Arc<dyn LiveCall>> {
        self.calls.lock().values().filter_map(Weak::upgrade).collect()
    }

    pub fn is_idle(&self) -> bool {
        self.calls.lock().is_empty()
    }

    /// Remove a finished call and retire its tags.
    pub(crate) fn retire(&self, id: u64, tags: [Tag; 3]) {
        for tag in tags {
            self.tags.deregister(tag);
        }
        self.calls.lock().remove(&id);
    }

    /// Drop everything still registered. Only valid once no transport
    /// operation can complete any more, i.e. after the dispatch loop returned
    /// on a shut-down queue. Returns the number of calls abandoned.
    pub fn teardown(&self) -> usize {
        let abandoned = std::mem::take(&mut *self.calls.lock()).len();
        let tags = self.tags.clear();
        if abandoned > 0 {
            tracing::warn!(abandoned, tags, "channel torn down with live calls");
        }
        abandoned
    }
}
