//! The transport collaborator surface.
//!
//! The engine never performs I/O itself. A transport issues each operation it
//! is handed and later posts the operation's tag to the channel's completion
//! queue, exactly once, with `ok` telling whether it succeeded. Operations must
//! never complete inline: even an operation that fails immediately is reported
//! through the queue.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use cqrpc_rt::{CompletionQueue, Tag};

use crate::error::Result;
use crate::message::{Message, ReadSlot, StatusSlot};

/// Connectivity of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectivityState::Idle => "idle",
            ConnectivityState::Connecting => "connecting",
            ConnectivityState::Ready => "ready",
            ConnectivityState::TransientFailure => "transient-failure",
            ConnectivityState::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// One connection to a target, bound to a completion queue.
pub trait Channel: Send + Sync + 'static {
    /// Current connectivity.
    fn state(&self) -> ConnectivityState;

    /// Post `(tag, true)` once the state differs from `last_observed`, or
    /// `(tag, false)` if it has not changed by `deadline`.
    fn notify_on_state_change(&self, last_observed: ConnectivityState, deadline: Instant, tag: Tag);

    /// Block until the channel is ready or `deadline` passes.
    fn wait_for_connected(&self, deadline: Instant) -> bool;
}

/// Builds channels. Credentials and channel arguments are the connector's
/// own business.
pub trait Connector: Send + Sync + 'static {
    type Channel: Channel;

    fn connect(&self, target: &str, queue: &Arc<CompletionQueue>) -> Result<Arc<Self::Channel>>;
}

/// The transport side of one streaming call.
///
/// At most one read and one write may be outstanding at a time, and `finish`
/// may be issued once, only when nothing else is outstanding. The engine
/// upholds all three rules; transports may treat a violation as fatal.
pub trait CallStream: Send + Sync + 'static {
    /// Messages sent to the peer.
    type Outbound: Message;
    /// Messages received from the peer.
    type Inbound: Default + Send + 'static;

    /// Begin the call.
    fn start(&self, tag: Tag);

    /// Read the next inbound message into `slot`. A failed read means the
    /// stream ended or broke.
    fn read(&self, slot: &ReadSlot<Self::Inbound>, tag: Tag);

    /// Send one message. The transport copies what it needs before returning.
    fn write(&self, msg: &Self::Outbound, tag: Tag);

    /// Retrieve the call's final status into `status`.
    fn finish(&self, status: &StatusSlot, tag: Tag);

    /// Ask the transport to abort the call. Advisory: outstanding operations
    /// still complete (normally with `ok == false`).
    fn cancel(&self);
}
