//! Bounded batching queue with a dedicated consumer thread.
//!
//! Producers append into the active batch; the consumer swaps it for its
//! (empty) working batch under the same lock and handles the swapped batch
//! with the lock released. Storage moves wholesale on each swap, so producer
//! and consumer never share a batch.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::config::Config;
use crate::error::{Error, PushError, Result};
use crate::message::Message;

/// Compaction policy run when the active batch goes over budget.
pub trait Merge<M>: Send + 'static {
    /// Return a smaller replacement for `batch`, or `None` to keep it as is.
    /// An empty replacement is ignored.
    fn merge(&mut self, batch: &[M]) -> Option<Vec<M>>;
}

/// Keeps every message.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMerge;

impl<M> Merge<M> for NoMerge {
    fn merge(&mut self, _batch: &[M]) -> Option<Vec<M>> {
        None
    }
}

impl<M, F> Merge<M> for F
where
    F: FnMut(&[M]) -> Option<Vec<M>> + Send + 'static,
{
    fn merge(&mut self, batch: &[M]) -> Option<Vec<M>> {
        self(batch)
    }
}

/// Consumer of swapped batches. Runs on the queue's consumer thread only.
pub trait BatchSink<M>: Send + 'static {
    fn handle_batch(&mut self, batch: &[M]);
}

impl<M, F> BatchSink<M> for F
where
    F: FnMut(&[M]) + Send + 'static,
{
    fn handle_batch(&mut self, batch: &[M]) {
        self(batch)
    }
}

struct Batch<M> {
    messages: Vec<M>,
    bytes: usize,
    /// The shutdown marker travels with the batch it terminates.
    last: bool,
}

impl<M: Message> Batch<M> {
    fn new() -> Self {
        Batch {
            messages: Vec::new(),
            bytes: 0,
            last: false,
        }
    }

    fn replace(&mut self, messages: Vec<M>) {
        self.bytes = messages.iter().map(Message::byte_size).sum();
        self.messages = messages;
    }

    /// Empty the batch, keeping its allocation.
    fn reset(&mut self) {
        self.messages.clear();
        self.bytes = 0;
        self.last = false;
    }
}

struct State<M, G> {
    active: Batch<M>,
    running: bool,
    merge: G,
}

struct Shared<M, G> {
    state: Mutex<State<M, G>>,
    ready: Condvar,
    budget: usize,
}

/// Producer/consumer queue bounded by bytes.
pub struct BatchQueue<M: Message, G: Merge<M> = NoMerge> {
    name: String,
    shared: Arc<Shared<M, G>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl<M: Message> BatchQueue<M> {
    pub fn new(name: impl Into<String>, budget: usize) -> Self {
        Self::with_merge(name, budget, NoMerge)
    }

    /// A queue bounded by the configured batch budget.
    pub fn from_config(name: impl Into<String>, config: &Config) -> Self {
        Self::new(name, config.batch_budget)
    }
}

impl<M: Message, G: Merge<M>> BatchQueue<M, G> {
    /// Create a queue that accepts pushes right away; batches are handed out
    /// once [`start`](Self::start) spawns the consumer.
    pub fn with_merge(name: impl Into<String>, budget: usize, merge: G) -> Self {
        BatchQueue {
            name: name.into(),
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    active: Batch::new(),
                    running: true,
                    merge,
                }),
                ready: Condvar::new(),
                budget,
            }),
            consumer: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn budget(&self) -> usize {
        self.shared.budget
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    /// Messages waiting for the consumer.
    pub fn len(&self) -> usize {
        self.shared.state.lock().active.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes waiting for the consumer.
    pub fn bytes(&self) -> usize {
        self.shared.state.lock().active.bytes
    }

    /// Append `msg` to the active batch. Never blocks on the consumer.
    pub fn push(&self, msg: M) -> Result<(), PushError> {
        let budget = self.shared.budget;
        let mut state = self.shared.state.lock();
        if !state.running {
            return Err(PushError::NotRunning);
        }
        if state.active.bytes > budget {
            return Err(PushError::Full);
        }
        state.active.bytes += msg.byte_size();
        state.active.messages.push(msg);
        if state.active.bytes > budget {
            let State { active, merge, .. } = &mut *state;
            if let Some(merged) = merge.merge(&active.messages).filter(|m| !m.is_empty()) {
                let before = active.messages.len();
                active.replace(merged);
                tracing::debug!(queue = %self.name, before, after = active.messages.len(), bytes = active.bytes, "batch merged");
            }
        }
        drop(state);
        self.shared.ready.notify_one();
        Ok(())
    }

    /// Spawn the consumer thread.
    pub fn start<K: BatchSink<M>>(&self, sink: K) -> Result<()> {
        let mut consumer = self.consumer.lock();
        if consumer.is_some() {
            return Err(Error::AlreadyStarted("batch queue consumer"));
        }
        let shared = Arc::clone(&self.shared);
        let name = self.name.clone();
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || shared.consume(&name, sink))?;
        *consumer = Some(handle);
        Ok(())
    }

    /// Stop accepting pushes, let the consumer handle what is queued, and
    /// join it. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.running {
                state.running = false;
                state.active.last = true;
            }
        }
        self.shared.ready.notify_one();
        match self.consumer.lock().take() {
            Some(handle) => {
                if handle.join().is_err() {
                    tracing::error!(queue = %self.name, "batch consumer panicked");
                }
            }
            None => {
                let pending = self.len();
                if pending > 0 {
                    tracing::warn!(queue = %self.name, pending, "batch queue closed before a consumer started");
                }
            }
        }
    }
}

impl<M: Message, G: Merge<M>> Shared<M, G> {
    fn consume<K: BatchSink<M>>(&self, name: &str, mut sink: K) {
        tracing::debug!(queue = %name, "batch consumer started");
        let mut working = Batch::new();
        loop {
            {
                let mut state = self.state.lock();
                while state.active.messages.is_empty() && !state.active.last {
                    self.ready.wait(&mut state);
                }
                std::mem::swap(&mut state.active, &mut working);
            }
            if !working.messages.is_empty() {
                tracing::trace!(queue = %name, messages = working.messages.len(), bytes = working.bytes, "handling batch");
                sink.handle_batch(&working.messages);
            }
            let last = working.last;
            working.reset();
            if last {
                break;
            }
        }
        tracing::debug!(queue = %name, "batch consumer stopped");
    }
}

impl<M: Message, G: Merge<M>> Drop for BatchQueue<M, G> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    type Collected = Arc<Mutex<Vec<Vec<String>>>>;

    fn collector() -> (Collected, impl BatchSink<String>) {
        let batches: Collected = Arc::default();
        let sink = batches.clone();
        (batches, move |batch: &[String]| sink.lock().push(batch.to_vec()))
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(257)]
    fn every_message_arrives_in_order(#[case] n: usize) {
        let queue = BatchQueue::new("test-batch", 1 << 20);
        let (batches, sink) = collector();
        queue.start(sink).unwrap();
        let sent: Vec<String> = (0..n).map(|i| format!("m{i}")).collect();
        for msg in &sent {
            queue.push(msg.clone()).unwrap();
        }
        queue.close();

        let batches = batches.lock();
        assert!(batches.iter().all(|b| !b.is_empty()));
        assert_eq!(batches.concat(), sent);
    }

    #[test]
    fn push_after_close_is_rejected() {
        let queue = BatchQueue::<String>::new("test-batch", 64);
        queue.close();
        assert_eq!(queue.push("late".into()), Err(PushError::NotRunning));
        assert!(!queue.is_running());
    }

    #[test]
    fn over_budget_without_merge_rejects_next_push() {
        let queue = BatchQueue::<String>::new("test-batch", 4);
        queue.push("abc".into()).unwrap();
        queue.push("de".into()).unwrap();
        assert_eq!(queue.bytes(), 5);
        assert_eq!(queue.push("f".into()), Err(PushError::Full));
    }

    #[test]
    fn merge_replaces_active_batch() {
        let keep_last = |batch: &[String]| batch.last().cloned().map(|m| vec![m]);
        let queue = BatchQueue::with_merge("test-batch", 4, keep_last);
        queue.push("ab".into()).unwrap();
        queue.push("cd".into()).unwrap();
        queue.push("ef".into()).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.bytes(), 2);
    }

    #[test]
    fn empty_merge_result_keeps_the_batch() {
        let queue = BatchQueue::with_merge("test-batch", 4, |_: &[String]| Some(Vec::<String>::new()));
        queue.push("ab".into()).unwrap();
        queue.push("cd".into()).unwrap();
        queue.push("ef".into()).unwrap();
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.bytes(), 6);
        assert_eq!(queue.push("gh".into()), Err(PushError::Full));
    }

    #[test]
    fn configured_batch_budget_bounds_the_queue() {
        let config = Config {
            batch_budget: 3,
            ..Config::default()
        };
        let queue = BatchQueue::<String>::from_config("test-batch", &config);
        assert_eq!(queue.budget(), 3);
        queue.push("abcd".into()).unwrap();
        assert_eq!(queue.push("e".into()), Err(PushError::Full));
    }

    #[test]
    fn start_twice_is_an_error() {
        let queue = BatchQueue::<String>::new("test-batch", 4);
        let (_, sink) = collector();
        let (_, other) = collector();
        queue.start(sink).unwrap();
        assert!(matches!(queue.start(other), Err(Error::AlreadyStarted(_))));
    }

    #[test]
    fn consumer_thread_is_named() {
        let queue = BatchQueue::<String>::new("quote-batch", 64);
        let names = Arc::new(Mutex::new(Vec::new()));
        let seen = names.clone();
        queue
            .start(move |_: &[String]| {
                seen.lock().push(thread::current().name().map(str::to_owned));
            })
            .unwrap();
        queue.push("x".into()).unwrap();
        queue.close();
        assert_eq!(*names.lock(), vec![Some("quote-batch".to_string())]);
    }
}
