//! Read and write pumps: the per-call wrappers that turn "one outstanding
//! operation at a time" transport rules into continuous message streams.

mod read;
mod write;

pub use read::ReadPump;
pub use write::{Enqueued, WriteDone, WriteFailed, WritePump, WriteState};
