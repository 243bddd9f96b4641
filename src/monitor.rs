//! Channel health monitor: a standing connectivity watch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cqrpc_rt::{Tag, TagHandler, TagRegistry};
use parking_lot::Mutex;

use crate::transport::{Channel, ConnectivityState};

/// Receives connectivity transitions.
pub trait StateObserver: Send + Sync + 'static {
    fn on_state_changed(&self, old: ConnectivityState, new: ConnectivityState);
}

impl<F> StateObserver for F
where
    F: Fn(ConnectivityState, ConnectivityState) + Send + Sync + 'static,
{
    fn on_state_changed(&self, old: ConnectivityState, new: ConnectivityState) {
        self(old, new)
    }
}

/// Keeps one state-change watch outstanding on a channel at all times.
///
/// Every watch carries a deadline; a timeout simply re-arms with the same
/// baseline. The deadline only bounds how long [`stop`](Self::stop) can go
/// unnoticed. The last observed state is written only from the monitor's
/// own completions.
pub struct HealthMonitor<C: Channel> {
    channel: Arc<C>,
    tags: Arc<TagRegistry>,
    tag: Tag,
    interval: Duration,
    observer: Box<dyn StateObserver>,
    last: Mutex<ConnectivityState>,
    stopped: AtomicBool,
}

impl<C: Channel> HealthMonitor<C> {
    /// Register the monitor and arm the first watch, baselined on the
    /// channel's current state.
    pub fn start(
        channel: Arc<C>,
        tags: &Arc<TagRegistry>,
        interval: Duration,
        observer: impl StateObserver,
    ) -> Arc<Self> {
        let baseline = channel.state();
        let monitor = Arc::new(HealthMonitor {
            channel,
            tags: Arc::clone(tags),
            tag: tags.reserve(),
            interval,
            observer: Box::new(observer),
            last: Mutex::new(baseline),
            stopped: AtomicBool::new(false),
        });
        tags.bind(monitor.tag, monitor.clone());
        tracing::debug!(tag = ?monitor.tag, state = %baseline, "health monitor started");
        monitor.arm(baseline);
        monitor
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn last_state(&self) -> ConnectivityState {
        *self.last.lock()
    }

    /// Suppress the next re-arm. The monitor deregisters itself when its
    /// outstanding watch completes.
    pub fn stop(&self) -> bool {
        !self.stopped.swap(true, Ordering::AcqRel)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn arm(&self, baseline: ConnectivityState) {
        self.channel
            .notify_on_state_change(baseline, Instant::now() + self.interval, self.tag);
    }

    fn release(&self) {
        tracing::debug!(tag = ?self.tag, "health monitor released");
        self.tags.deregister(self.tag);
    }
}

impl<C: Channel> TagHandler for HealthMonitor<C> {
    fn process(&self, _tag: Tag) {
        if self.is_stopped() {
            return self.release();
        }
        let new = self.channel.state();
        let old = std::mem::replace(&mut *self.last.lock(), new);
        if old != new {
            tracing::info!(%old, %new, "channel state changed");
            self.observer.on_state_changed(old, new);
        }
        if self.is_stopped() {
            self.release();
        } else {
            self.arm(new);
        }
    }

    fn on_error(&self, _tag: Tag) {
        if self.is_stopped() {
            return self.release();
        }
        self.arm(self.last_state());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackChannel;
    use cqrpc_rt::{CompletionQueue, Dispatcher, Next};

    type Seen = Arc<Mutex<Vec<(ConnectivityState, ConnectivityState)>>>;

    fn setup(interval: Duration) -> (Dispatcher, Arc<LoopbackChannel>, Arc<HealthMonitor<LoopbackChannel>>, Seen) {
        let queue = Arc::new(CompletionQueue::new().unwrap());
        let tags = Arc::new(TagRegistry::new());
        let channel = Arc::new(LoopbackChannel::new(queue.clone(), ConnectivityState::Ready));
        let seen: Seen = Arc::default();
        let sink = seen.clone();
        let monitor = HealthMonitor::start(channel.clone(), &tags, interval, move |old: ConnectivityState, new: ConnectivityState| {
            sink.lock().push((old, new));
        });
        (Dispatcher::new(queue, tags), channel, monitor, seen)
    }

    #[test]
    fn reports_each_transition_once() {
        let (dispatcher, channel, monitor, seen) = setup(Duration::from_secs(60));
        channel.set_state(ConnectivityState::TransientFailure);
        dispatcher.drain();
        channel.set_state(ConnectivityState::Connecting);
        dispatcher.drain();
        assert_eq!(
            *seen.lock(),
            vec![
                (ConnectivityState::Ready, ConnectivityState::TransientFailure),
                (ConnectivityState::TransientFailure, ConnectivityState::Connecting),
            ]
        );
        assert_eq!(monitor.last_state(), ConnectivityState::Connecting);
    }

    #[test]
    fn timeout_rearms_with_same_baseline() {
        let (dispatcher, channel, monitor, seen) = setup(Duration::from_millis(5));
        for _ in 0..3 {
            assert!(matches!(dispatcher.try_dispatch(Duration::from_secs(5)), Next::Ready(_)));
        }
        assert!(seen.lock().is_empty());
        assert!(dispatcher.tags().contains(monitor.tag()));

        channel.set_state(ConnectivityState::Idle);
        dispatcher.try_dispatch(Duration::from_secs(5));
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn stop_releases_on_next_completion() {
        let (dispatcher, _channel, monitor, seen) = setup(Duration::from_millis(5));
        assert!(monitor.stop());
        assert!(!monitor.stop());
        dispatcher.try_dispatch(Duration::from_secs(5));
        assert!(!dispatcher.tags().contains(monitor.tag()));
        assert!(dispatcher.tags().is_empty());
        assert_eq!(dispatcher.try_dispatch(Duration::from_millis(20)), Next::Timeout);
        assert!(seen.lock().is_empty());
    }
}
