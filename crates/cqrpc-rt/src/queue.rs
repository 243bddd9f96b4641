//! The completion queue.
//!
//! Transports post `(tag, ok)` pairs here when an operation finishes; the
//! dispatch thread pulls them out with [`CompletionQueue::next`]. The queue
//! also owns a deadline-ordered alarm table so that "notify me by this
//! deadline" operations (connectivity watches, timers) complete through the
//! same path as network operations.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use concurrent_queue::{ConcurrentQueue, PopError};
use parking_lot::Mutex;
use polling::{Events, Poller};

use crate::tag::Tag;

/// One delivered completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub tag: Tag,
    pub ok: bool,
}

/// Outcome of a bounded wait on the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// A completion is available.
    Ready(Completion),
    /// Nothing completed before the timeout.
    Timeout,
    /// The queue is shut down and fully drained.
    Shutdown,
}

/// Handle of a pending alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlarmId(u64);

/// Returned when posting to a queue that has been shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("completion queue is shut down")]
pub struct QueueShutdown;

/// Alarm state: BTreeMap for ordered expiry, HashMap for id→deadline lookup.
struct AlarmState {
    heap: BTreeMap<(Instant, u64), Tag>,
    deadlines: HashMap<u64, Instant>,
    /// Set under this lock by `shutdown()`; no alarm may be added afterwards.
    closed: bool,
}

impl AlarmState {
    fn take(&mut self, id: u64) -> Option<Tag> {
        let deadline = self.deadlines.remove(&id)?;
        self.heap.remove(&(deadline, id))
    }
}

/// A multi-producer completion queue with a single logical consumer.
pub struct CompletionQueue {
    poller: Poller,
    ready: ConcurrentQueue<Completion>,
    alarms: Mutex<AlarmState>,
    alarm_id: AtomicU64,
    events: Mutex<Events>,
    shutdown: AtomicBool,
}

impl CompletionQueue {
    pub fn new() -> io::Result<Self> {
        Ok(CompletionQueue {
            poller: Poller::new()?,
            ready: ConcurrentQueue::unbounded(),
            alarms: Mutex::new(AlarmState {
                heap: BTreeMap::new(),
                deadlines: HashMap::new(),
                closed: false,
            }),
            alarm_id: AtomicU64::new(0),
            events: Mutex::new(Events::new()),
            shutdown: AtomicBool::new(false),
        })
    }

    // ── Producers ───────────────────────────────────────────────────

    /// Deliver the completion of the operation issued with `tag`.
    pub fn post(&self, tag: Tag, ok: bool) -> Result<(), QueueShutdown> {
        self.ready
            .push(Completion { tag, ok })
            .map_err(|_| QueueShutdown)?;
        self.wake();
        Ok(())
    }

    /// Arrange for `(tag, false)` to be delivered at `deadline` unless the
    /// alarm is triggered or cancelled first.
    pub fn alarm(&self, deadline: Instant, tag: Tag) -> Result<AlarmId, QueueShutdown> {
        let id = self.alarm_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.alarms.lock();
            if state.closed {
                return Err(QueueShutdown);
            }
            state.deadlines.insert(id, deadline);
            state.heap.insert((deadline, id), tag);
        }
        // The consumer may be sleeping with a longer timeout than this deadline.
        self.wake();
        Ok(AlarmId(id))
    }

    /// Deliver `(tag, true)` for a pending alarm right now.
    ///
    /// Returns false if the alarm already expired or was cancelled; its tag
    /// then has (or will have) exactly one completion already.
    pub fn trigger_alarm(&self, id: AlarmId) -> bool {
        let tag = self.alarms.lock().take(id.0);
        match tag {
            Some(tag) => self.post(tag, true).is_ok(),
            None => false,
        }
    }

    /// Remove a pending alarm without delivering anything.
    pub fn cancel_alarm(&self, id: AlarmId) -> bool {
        self.alarms.lock().take(id.0).is_some()
    }

    /// Shut the queue down. Idempotent; returns true for the first call.
    ///
    /// Pending alarms are delivered as failures, later posts are rejected and
    /// completions already queued still drain through `next()`.
    pub fn shutdown(&self) -> bool {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return false;
        }
        let expired: Vec<Tag> = {
            let mut state = self.alarms.lock();
            state.closed = true;
            state.deadlines.clear();
            std::mem::take(&mut state.heap).into_values().collect()
        };
        for tag in expired {
            let _ = self.ready.push(Completion { tag, ok: false });
        }
        self.ready.close();
        self.wake();
        true
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Completions waiting to be dispatched.
    pub fn len(&self) -> usize {
        self.ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    fn wake(&self) {
        // A failed notify only costs the consumer one extra timeout period.
        let _ = self.poller.notify();
    }

    // ── Consumer ────────────────────────────────────────────────────

    /// Block until a completion is available. Returns `None` once the queue is
    /// shut down and drained.
    pub fn next(&self) -> Option<Completion> {
        match self.poll(None) {
            Next::Ready(completion) => Some(completion),
            Next::Shutdown | Next::Timeout => None,
        }
    }

    /// Wait at most `timeout` for a completion.
    pub fn next_timeout(&self, timeout: Duration) -> Next {
        self.poll(Some(Instant::now() + timeout))
    }

    fn poll(&self, deadline: Option<Instant>) -> Next {
        loop {
            // 1. Move expired alarms into the ready queue.
            let next_alarm = self.expire_alarms();

            // 2. Hand out whatever is ready.
            match self.ready.pop() {
                Ok(completion) => return Next::Ready(completion),
                Err(PopError::Closed) => return Next::Shutdown,
                Err(PopError::Empty) => {}
            }

            // 3. Effective wait: min(caller deadline, next alarm).
            let now = Instant::now();
            if matches!(deadline, Some(d) if d <= now) {
                return Next::Timeout;
            }
            let wait = match (deadline, next_alarm) {
                (None, None) => None,
                (Some(t), None) | (None, Some(t)) => Some(t.saturating_duration_since(now)),
                (Some(a), Some(b)) => Some(a.min(b).saturating_duration_since(now)),
            };

            // 4. Sleep until notified or the wait elapses.
            let mut events = self.events.lock();
            events.clear();
            if let Err(err) = self.poller.wait(&mut events, wait) {
                if err.kind() != io::ErrorKind::Interrupted {
                    tracing::warn!(error = %err, "completion queue wait failed");
                    // Avoid spinning on a persistently failing poller.
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }

    /// Fire every alarm whose deadline has passed. Returns the next deadline.
    fn expire_alarms(&self) -> Option<Instant> {
        let now = Instant::now();
        let mut fired = Vec::new();
        let next = {
            let mut state = self.alarms.lock();
            loop {
                match state.heap.keys().next().copied() {
                    Some((deadline, id)) if deadline <= now => {
                        if let Some(tag) = state.heap.remove(&(deadline, id)) {
                            fired.push(tag);
                        }
                        state.deadlines.remove(&id);
                    }
                    Some((deadline, _)) => break Some(deadline),
                    None => break None,
                }
            }
        };
        for tag in fired {
            // Only fails after shutdown, which already flushed every alarm.
            let _ = self.ready.push(Completion { tag, ok: false });
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::TagRegistry;
    use std::sync::Arc;

    fn tags(n: usize) -> Vec<Tag> {
        let registry = TagRegistry::new();
        (0..n).map(|_| registry.reserve()).collect()
    }

    #[test]
    fn post_then_next_preserves_order() {
        let cq = CompletionQueue::new().unwrap();
        let t = tags(3);
        cq.post(t[0], true).unwrap();
        cq.post(t[1], false).unwrap();
        cq.post(t[2], true).unwrap();

        assert_eq!(cq.next(), Some(Completion { tag: t[0], ok: true }));
        assert_eq!(cq.next(), Some(Completion { tag: t[1], ok: false }));
        assert_eq!(cq.next(), Some(Completion { tag: t[2], ok: true }));
    }

    #[test]
    fn next_timeout_on_empty_queue() {
        let cq = CompletionQueue::new().unwrap();
        let start = Instant::now();
        assert_eq!(cq.next_timeout(Duration::from_millis(20)), Next::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn shutdown_drains_then_reports_shutdown() {
        let cq = CompletionQueue::new().unwrap();
        let t = tags(1);
        cq.post(t[0], true).unwrap();
        assert!(cq.shutdown());
        assert!(!cq.shutdown());
        assert_eq!(cq.post(t[0], true), Err(QueueShutdown));

        assert_eq!(cq.next(), Some(Completion { tag: t[0], ok: true }));
        assert_eq!(cq.next(), None);
        assert_eq!(cq.next_timeout(Duration::ZERO), Next::Shutdown);
    }

    #[test]
    fn alarm_expires_as_failure() {
        let cq = CompletionQueue::new().unwrap();
        let t = tags(1);
        cq.alarm(Instant::now() + Duration::from_millis(10), t[0]).unwrap();

        let start = Instant::now();
        assert_eq!(cq.next(), Some(Completion { tag: t[0], ok: false }));
        assert!(start.elapsed() >= Duration::from_millis(9));
    }

    #[test]
    fn triggered_alarm_delivers_success_once() {
        let cq = CompletionQueue::new().unwrap();
        let t = tags(1);
        let id = cq.alarm(Instant::now() + Duration::from_secs(60), t[0]).unwrap();

        assert!(cq.trigger_alarm(id));
        assert!(!cq.trigger_alarm(id));
        assert!(!cq.cancel_alarm(id));
        assert_eq!(cq.next(), Some(Completion { tag: t[0], ok: true }));
        assert_eq!(cq.next_timeout(Duration::from_millis(5)), Next::Timeout);
    }

    #[test]
    fn cancelled_alarm_delivers_nothing() {
        let cq = CompletionQueue::new().unwrap();
        let t = tags(1);
        let id = cq.alarm(Instant::now() + Duration::from_millis(5), t[0]).unwrap();
        assert!(cq.cancel_alarm(id));
        assert_eq!(cq.next_timeout(Duration::from_millis(30)), Next::Timeout);
    }

    #[test]
    fn shutdown_flushes_pending_alarms() {
        let cq = CompletionQueue::new().unwrap();
        let t = tags(1);
        cq.alarm(Instant::now() + Duration::from_secs(3600), t[0]).unwrap();
        cq.shutdown();
        assert!(cq.alarm(Instant::now(), t[0]).is_err());

        assert_eq!(cq.next(), Some(Completion { tag: t[0], ok: false }));
        assert_eq!(cq.next(), None);
    }

    #[test]
    fn post_from_another_thread_wakes_blocked_consumer() {
        let cq = Arc::new(CompletionQueue::new().unwrap());
        let t = tags(1)[0];
        let producer = {
            let cq = cq.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                cq.post(t, true).unwrap();
            })
        };
        assert_eq!(cq.next(), Some(Completion { tag: t, ok: true }));
        producer.join().unwrap();
    }

    #[test]
    fn shutdown_from_another_thread_unblocks_consumer() {
        let cq = Arc::new(CompletionQueue::new().unwrap());
        let stopper = {
            let cq = cq.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                cq.shutdown();
            })
        };
        assert_eq!(cq.next(), None);
        stopper.join().unwrap();
    }
}
