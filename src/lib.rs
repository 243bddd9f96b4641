//! cqrpc: completion-queue engine for asynchronous streaming RPC.
//!
//! The transport (see [`transport`]) issues operations and reports their
//! completion on a [`CompletionQueue`]; this crate owns everything between
//! that queue and the application:
//!
//! - [`ReadPump`] / [`WritePump`]: one outstanding read or write per call,
//!   the write side bounded by a byte budget.
//! - [`Call`]: the per-call state machine, retired only after the transport
//!   delivered its final status.
//! - [`ChannelContext`]: per-channel tag registry and live-call table.
//! - [`HealthMonitor`] and [`Client`]: connectivity watch and reconnect loop.
//! - [`BatchQueue`]: byte-bounded producer/consumer batching.
//!
//! [`loopback`] provides an in-process transport.

pub mod batch;
pub mod call;
pub mod config;
pub mod context;
pub mod error;
pub mod loopback;
pub mod message;
pub mod monitor;
pub mod pump;
pub mod supervisor;
pub mod transport;

pub use batch::{BatchQueue, BatchSink, Merge, NoMerge};
pub use call::{Call, CallHandler, CallOptions, CallState, LiveCall, StreamKind};
pub use config::Config;
pub use context::ChannelContext;
pub use error::{Error, PushError, Result, WriteError};
pub use message::{Code, Message, ReadSlot, Status, StatusSlot};
pub use monitor::{HealthMonitor, StateObserver};
pub use pump::{ReadPump, WritePump, WriteState};
pub use supervisor::{Client, ClientHooks, Session};
pub use transport::{CallStream, Channel, ConnectivityState, Connector};

pub use cqrpc_rt::{
    AlarmId, Completion, CompletionQueue, DispatchStats, Dispatcher, Next, QueueShutdown, Tag,
    TagHandler, TagRegistry,
};
