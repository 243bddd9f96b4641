//! cqrpc-rt: completion runtime for cqrpc.
//!
//! Three pieces, each usable on its own:
//!
//! - [`CompletionQueue`]: multi-producer queue of `(tag, ok)` completions with
//!   an alarm table and a blocking `next()`.
//! - [`TagRegistry`]: per-channel slab of live tags. Tags are generation-checked
//!   handles, so a completion for a retired tag can never reach a handler.
//! - [`Dispatcher`]: the loop that pulls completions and routes them.
//!
//! Nothing here is process-global; a channel owns one queue and one registry
//! and passes them explicitly to whatever needs them.

mod dispatch;
mod queue;
mod tag;

pub use dispatch::{DispatchStats, Dispatcher};
pub use queue::{AlarmId, Completion, CompletionQueue, Next, QueueShutdown};
pub use tag::{Tag, TagHandler, TagRegistry};
