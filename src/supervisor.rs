//! The reconnect supervisor.
//!
//! Owns the per-channel retry loop. Each iteration builds a fresh queue,
//! channel and [`ChannelContext`], waits for connectivity, hands the session
//! to the application, and dispatches until the queue shuts down. The health
//! monitor shuts the queue down on any transition away from ready, so a
//! broken channel is always rebuilt from scratch rather than repaired.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use cqrpc_rt::CompletionQueue;
use parking_lot::{Condvar, Mutex};

use crate::call::{CallOptions, StreamKind};
use crate::config::Config;
use crate::context::ChannelContext;
use crate::error::{Error, Result};
use crate::monitor::HealthMonitor;
use crate::transport::{Channel, ConnectivityState, Connector};

/// Application hooks driven by the supervisor.
#[allow(unused_variables)]
pub trait ClientHooks<C: Channel>: Send + Sync + 'static {
    /// The channel is ready. Start the session's first calls here; they run
    /// on the supervisor's dispatch thread.
    fn on_run(&self, session: &Session<C>);

    /// The supervisor is about to stop for good.
    fn on_exit(&self) {}

    fn on_channel_state_changed(&self, old: ConnectivityState, new: ConnectivityState) {}
}

/// One connected channel and its call context.
pub struct Session<C> {
    channel: Arc<C>,
    context: Arc<ChannelContext>,
    config: Config,
    number: u64,
}

impl<C> Session<C> {
    pub fn channel(&self) -> &Arc<C> {
        &self.channel
    }

    pub fn context(&self) -> &Arc<ChannelContext> {
        &self.context
    }

    /// The client's configuration, for budgets of the session's calls and
    /// queues.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Options of a `kind` call with the configured write budget.
    pub fn call_options(&self, kind: StreamKind) -> CallOptions {
        CallOptions::from_config(kind, &self.config)
    }

    /// 1 for the first successful connection, incremented on every rebuild.
    pub fn number(&self) -> u64 {
        self.number
    }
}

struct Shared<K, H> {
    connector: K,
    hooks: H,
    config: Config,
    running: AtomicBool,
    /// Queue of the session being built or dispatched, if any.
    current: Mutex<Option<Arc<CompletionQueue>>>,
    wake: Condvar,
    sessions: AtomicU64,
}

enum Attempt {
    /// Connectivity not reached in time; retry at once.
    Timeout,
    /// Connect failed or a session ended; back off first.
    Backoff,
    /// Exit requested.
    Exit,
}

/// Keeps a channel to one target alive until told to exit.
pub struct Client<K: Connector, H: ClientHooks<K::Channel>> {
    shared: Arc<Shared<K, H>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<K: Connector, H: ClientHooks<K::Channel>> Client<K, H> {
    pub fn new(connector: K, hooks: H, config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Client {
            shared: Arc::new(Shared {
                connector,
                hooks,
                config,
                running: AtomicBool::new(false),
                current: Mutex::new(None),
                wake: Condvar::new(),
                sessions: AtomicU64::new(0),
            }),
            thread: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn connector(&self) -> &K {
        &self.shared.connector
    }

    pub fn hooks(&self) -> &H {
        &self.shared.hooks
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Sessions that reached the dispatch loop so far.
    pub fn sessions(&self) -> u64 {
        self.shared.sessions.load(Ordering::Acquire)
    }

    /// Spawn the supervisor thread.
    pub fn run(&self) -> Result<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Err(Error::AlreadyStarted("client"));
        }
        self.shared.running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("cqrpc-supervisor".into())
            .spawn(move || shared.supervise())
            .inspect_err(|_| self.shared.running.store(false, Ordering::Release))?;
        *thread = Some(handle);
        Ok(())
    }

    /// Stop the loop: shut the live queue down, interrupt any backoff and
    /// join the supervisor thread. Idempotent.
    pub fn exit(&self) {
        self.shared.running.store(false, Ordering::Release);
        {
            let current = self.shared.current.lock();
            if let Some(queue) = current.as_ref() {
                queue.shutdown();
            }
            self.shared.wake.notify_all();
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!("supervisor thread panicked");
            }
        }
    }
}

impl<K: Connector, H: ClientHooks<K::Channel>> Drop for Client<K, H> {
    fn drop(&mut self) {
        self.exit();
    }
}

impl<K: Connector, H: ClientHooks<K::Channel>> Shared<K, H> {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn supervise(self: Arc<Self>) {
        tracing::info!(endpoint = %self.config.target, "supervisor started");
        while self.is_running() {
            match self.attempt() {
                Attempt::Timeout => continue,
                Attempt::Backoff => self.backoff(),
                Attempt::Exit => break,
            }
        }
        self.hooks.on_exit();
        tracing::info!(endpoint = %self.config.target, "supervisor stopped");
    }

    fn attempt(self: &Arc<Self>) -> Attempt {
        let queue = match CompletionQueue::new() {
            Ok(queue) => Arc::new(queue),
            Err(err) => {
                tracing::error!(error = %err, "failed to create completion queue");
                return Attempt::Backoff;
            }
        };
        {
            let mut current = self.current.lock();
            if !self.is_running() {
                return Attempt::Exit;
            }
            *current = Some(Arc::clone(&queue));
        }
        let outcome = self.session(&queue);
        queue.shutdown();
        *self.current.lock() = None;
        outcome
    }

    fn session(self: &Arc<Self>, queue: &Arc<CompletionQueue>) -> Attempt {
        let target = &self.config.target;
        let channel = match self.connector.connect(target, queue) {
            Ok(channel) => channel,
            Err(err) => {
                tracing::warn!(endpoint = %target, error = %err, "connect failed");
                return Attempt::Backoff;
            }
        };
        if !channel.wait_for_connected(Instant::now() + self.config.connect_timeout()) {
            tracing::info!(endpoint = %target, state = %channel.state(), "connect timed out");
            return Attempt::Timeout;
        }
        if !self.is_running() {
            return Attempt::Exit;
        }

        let number = self.sessions.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::info!(endpoint = %target, session = number, "channel ready");
        let context = ChannelContext::new(Arc::clone(queue));
        let observer = {
            let shared = Arc::clone(self);
            let queue = Arc::clone(queue);
            move |old: ConnectivityState, new: ConnectivityState| {
                shared.hooks.on_channel_state_changed(old, new);
                if new != ConnectivityState::Ready {
                    queue.shutdown();
                }
            }
        };
        let monitor = HealthMonitor::start(
            Arc::clone(&channel),
            context.tags(),
            self.config.watch_interval(),
            observer,
        );
        let session = Session {
            channel,
            context: Arc::clone(&context),
            config: self.config.clone(),
            number,
        };
        self.hooks.on_run(&session);

        let stats = context.dispatcher().run();
        monitor.stop();
        context.teardown();
        tracing::info!(
            endpoint = %target,
            session = number,
            processed = stats.processed,
            failed = stats.failed,
            stale = stats.stale,
            "session ended"
        );
        if self.is_running() {
            Attempt::Backoff
        } else {
            Attempt::Exit
        }
    }

    /// Sleep for the reconnect backoff unless `exit()` interrupts.
    fn backoff(&self) {
        let deadline = Instant::now() + self.config.reconnect_backoff();
        let mut current = self.current.lock();
        while self.is_running() {
            if self.wake.wait_until(&mut current, deadline).timed_out() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackConnector;
    use std::time::Duration;

    #[derive(Default)]
    struct Counting {
        runs: AtomicU64,
        exits: AtomicU64,
        budgets: Mutex<Vec<usize>>,
    }

    impl<C: Channel> ClientHooks<C> for Arc<Counting> {
        fn on_run(&self, session: &Session<C>) {
            let options = session.call_options(StreamKind::ServerStreaming);
            self.budgets.lock().push(options.write_budget);
            self.runs.fetch_add(1, Ordering::SeqCst);
        }

        fn on_exit(&self) {
            self.exits.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    fn config(backoff_ms: u64) -> Config {
        Config {
            target: "loopback".into(),
            connect_timeout_ms: 50,
            reconnect_backoff_ms: backoff_ms,
            ..Config::default()
        }
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = Config {
            target: String::new(),
            ..Config::default()
        };
        let err = Client::new(LoopbackConnector::new(), Arc::new(Counting::default()), config).err();
        assert!(matches!(err, Some(Error::InvalidConfig(_))));
    }

    #[test]
    fn run_twice_is_an_error() {
        let client = Client::new(LoopbackConnector::new(), Arc::new(Counting::default()), config(0)).unwrap();
        client.run().unwrap();
        assert!(matches!(client.run(), Err(Error::AlreadyStarted(_))));
        client.exit();
        assert!(!client.is_running());
    }

    #[test]
    fn connect_failure_backs_off_then_retries() {
        let connector = LoopbackConnector::new();
        connector.push_failure("refused");
        let hooks = Arc::new(Counting::default());
        let client = Client::new(connector, hooks.clone(), config(10)).unwrap();
        client.run().unwrap();

        assert!(wait_for(|| hooks.runs.load(Ordering::SeqCst) == 1));
        client.exit();
        assert_eq!(client.sessions(), 1);
        assert_eq!(hooks.runs.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.exits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn connect_timeout_retries_without_backoff() {
        let connector = LoopbackConnector::new();
        connector.push_state(ConnectivityState::Connecting);
        let hooks = Arc::new(Counting::default());
        // A backoff this long would stall the test if it were applied.
        let client = Client::new(connector, hooks.clone(), config(60_000)).unwrap();
        client.run().unwrap();

        assert!(wait_for(|| hooks.runs.load(Ordering::SeqCst) == 1));
        assert_eq!(client.connector().connect_count(), 2);
        client.exit();
    }

    #[test]
    fn session_carries_the_client_config() {
        let hooks = Arc::new(Counting::default());
        let config = Config {
            write_budget: 512,
            ..config(0)
        };
        let client = Client::new(LoopbackConnector::new(), hooks.clone(), config).unwrap();
        client.run().unwrap();

        assert!(wait_for(|| hooks.runs.load(Ordering::SeqCst) == 1));
        client.exit();
        assert_eq!(*hooks.budgets.lock(), vec![512]);
    }

    #[test]
    fn exit_interrupts_backoff() {
        let connector = LoopbackConnector::new();
        connector.push_failure("refused");
        let client = Client::new(connector, Arc::new(Counting::default()), config(60_000)).unwrap();
        client.run().unwrap();
        thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        client.exit();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(client.sessions(), 0);
    }
}
