//! The dispatch loop: completion queue → registered tag handler.

use std::sync::Arc;
use std::time::Duration;

use crate::queue::{Completion, CompletionQueue, Next};
use crate::tag::TagRegistry;

/// Counters returned when a dispatch loop exits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    /// Completions routed to `process()`.
    pub processed: u64,
    /// Completions routed to `on_error()`.
    pub failed: u64,
    /// Completions dropped because their tag was no longer registered.
    pub stale: u64,
}

impl DispatchStats {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Processed => self.processed += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Stale => self.stale += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Processed,
    Failed,
    Stale,
}

/// Routes completions from one queue to the handlers of one registry.
///
/// Exactly one thread per channel should drive a dispatcher; handlers may
/// issue new operations synchronously from inside their callbacks.
#[derive(Clone)]
pub struct Dispatcher {
    queue: Arc<CompletionQueue>,
    tags: Arc<TagRegistry>,
}

impl Dispatcher {
    pub fn new(queue: Arc<CompletionQueue>, tags: Arc<TagRegistry>) -> Self {
        Dispatcher { queue, tags }
    }

    pub fn queue(&self) -> &Arc<CompletionQueue> {
        &self.queue
    }

    pub fn tags(&self) -> &Arc<TagRegistry> {
        &self.tags
    }

    /// Run until the queue reports shutdown.
    pub fn run(&self) -> DispatchStats {
        let mut stats = DispatchStats::default();
        while let Some(completion) = self.queue.next() {
            stats.record(self.route(completion));
        }
        tracing::debug!(
            processed = stats.processed,
            failed = stats.failed,
            stale = stats.stale,
            "completion queue drained"
        );
        stats
    }

    /// Route one completion. Returns false if its tag was stale.
    pub fn dispatch(&self, completion: Completion) -> bool {
        self.route(completion) != Outcome::Stale
    }

    /// Wait up to `timeout` for one completion and route it.
    pub fn try_dispatch(&self, timeout: Duration) -> Next {
        let next = self.queue.next_timeout(timeout);
        if let Next::Ready(completion) = next {
            self.route(completion);
        }
        next
    }

    /// Route everything that is ready right now without blocking, including
    /// completions produced by the handlers themselves. Returns the number of
    /// completions routed.
    pub fn drain(&self) -> usize {
        let mut routed = 0;
        while let Next::Ready(completion) = self.queue.next_timeout(Duration::ZERO) {
            self.route(completion);
            routed += 1;
        }
        routed
    }

    fn route(&self, completion: Completion) -> Outcome {
        let Completion { tag, ok } = completion;
        // The registry lock is released before the handler runs, so handlers
        // may register or retire tags themselves.
        let Some(handler) = self.tags.lookup(tag) else {
            tracing::debug!(?tag, ok, "dropping completion for unregistered tag");
            return Outcome::Stale;
        };
        if ok {
            handler.process(tag);
            Outcome::Processed
        } else {
            handler.on_error(tag);
            Outcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::{Tag, TagHandler};
    use parking_lot::Mutex;
    use std::sync::Weak;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(Tag, bool)>>,
    }

    impl TagHandler for Recorder {
        fn process(&self, tag: Tag) {
            self.seen.lock().push((tag, true));
        }
        fn on_error(&self, tag: Tag) {
            self.seen.lock().push((tag, false));
        }
    }

    fn setup() -> (Arc<CompletionQueue>, Arc<TagRegistry>, Dispatcher) {
        let cq = Arc::new(CompletionQueue::new().unwrap());
        let tags = Arc::new(TagRegistry::new());
        let dispatcher = Dispatcher::new(cq.clone(), tags.clone());
        (cq, tags, dispatcher)
    }

    #[test]
    fn routes_success_and_failure() {
        let (cq, tags, dispatcher) = setup();
        let recorder = Arc::new(Recorder::default());
        let tag = tags.register(recorder.clone());

        cq.post(tag, true).unwrap();
        cq.post(tag, false).unwrap();
        cq.shutdown();

        let stats = dispatcher.run();
        assert_eq!(stats, DispatchStats { processed: 1, failed: 1, stale: 0 });
        assert_eq!(*recorder.seen.lock(), vec![(tag, true), (tag, false)]);
    }

    #[test]
    fn completion_queued_before_deregistration_is_filtered() {
        let (cq, tags, dispatcher) = setup();
        let recorder = Arc::new(Recorder::default());
        let tag = tags.register(recorder.clone());

        cq.post(tag, true).unwrap();
        assert!(tags.deregister(tag));
        cq.shutdown();

        let stats = dispatcher.run();
        assert_eq!(stats.stale, 1);
        assert!(recorder.seen.lock().is_empty());
    }

    /// Re-posts its own tag a fixed number of times from inside `process()`.
    struct Rearm {
        queue: Arc<CompletionQueue>,
        remaining: Mutex<u32>,
    }

    impl TagHandler for Rearm {
        fn process(&self, tag: Tag) {
            let mut remaining = self.remaining.lock();
            if *remaining > 0 {
                *remaining -= 1;
                self.queue.post(tag, true).unwrap();
            }
        }
        fn on_error(&self, _tag: Tag) {}
    }

    #[test]
    fn handlers_may_issue_operations_from_callbacks() {
        let (cq, tags, dispatcher) = setup();
        let rearm = Arc::new(Rearm {
            queue: cq.clone(),
            remaining: Mutex::new(3),
        });
        let tag = tags.register(rearm.clone());
        cq.post(tag, true).unwrap();

        assert_eq!(dispatcher.drain(), 4);
        assert_eq!(*rearm.remaining.lock(), 0);
    }

    /// Retires its own tag when it completes.
    struct SelfRetiring {
        tags: Weak<TagRegistry>,
    }

    impl TagHandler for SelfRetiring {
        fn process(&self, tag: Tag) {
            if let Some(tags) = self.tags.upgrade() {
                tags.deregister(tag);
            }
        }
        fn on_error(&self, _tag: Tag) {}
    }

    #[test]
    fn handler_may_deregister_itself() {
        let (cq, tags, dispatcher) = setup();
        let handler = Arc::new(SelfRetiring {
            tags: Arc::downgrade(&tags),
        });
        let tag = tags.register(handler);
        cq.post(tag, true).unwrap();
        cq.post(tag, true).unwrap();

        assert_eq!(dispatcher.drain(), 2);
        assert!(tags.is_empty());
    }

    #[test]
    fn try_dispatch_times_out() {
        let (_cq, _tags, dispatcher) = setup();
        assert_eq!(dispatcher.try_dispatch(Duration::from_millis(5)), Next::Timeout);
    }

    #[test]
    fn run_on_dedicated_thread_exits_on_shutdown() {
        let (cq, tags, dispatcher) = setup();
        let recorder = Arc::new(Recorder::default());
        let tag = tags.register(recorder.clone());

        let thread = std::thread::spawn(move || dispatcher.run());
        for _ in 0..10 {
            cq.post(tag, true).unwrap();
        }
        std::thread::sleep(Duration::from_millis(20));
        cq.shutdown();

        let stats = thread.join().unwrap();
        assert_eq!(stats.processed, 10);
        assert_eq!(recorder.seen.lock().len(), 10);
    }
}
