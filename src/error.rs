use std::io;

use thiserror::Error;

pub use cqrpc_rt::QueueShutdown;

/// Errors returned by the cqrpc engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Creating a completion queue or spawning a thread failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Configuration file could not be parsed.
    #[error("config parse: {0}")]
    ConfigParse(#[from] toml::de::Error),
    /// Configuration value out of range.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    /// The transport could not build a channel to the target.
    #[error("connect to {target}: {reason}")]
    Connect { target: String, reason: String },
    /// The channel's completion queue has been shut down.
    #[error(transparent)]
    QueueShutdown(#[from] QueueShutdown),
    /// A component was started twice.
    #[error("{0} already started")]
    AlreadyStarted(&'static str),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Rejections returned by a write pump to its producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WriteError {
    /// Buffered bytes reached the pump's budget.
    #[error("write queue full")]
    QueueFull,
    /// The message alone is larger than the whole budget.
    #[error("message of {size} bytes exceeds write budget of {budget}")]
    MessageTooLarge { size: usize, budget: usize },
    /// The pump is stopped (call not yet started, finishing, or finished).
    #[error("writer stopped")]
    Stopped,
    /// A batched write was given no messages.
    #[error("empty write batch")]
    EmptyBatch,
}

/// Rejections returned by a batching queue to its producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PushError {
    /// The queue was closed.
    #[error("batch queue not running")]
    NotRunning,
    /// The active buffer is over budget and merging did not bring it back.
    #[error("batch queue full")]
    Full,
}
