//! Message, status and slot types shared between the engine and transports.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

/// A payload the engine can buffer.
///
/// The engine never looks inside a message; it only needs to copy it into its
/// own storage and account for the bytes it holds.
pub trait Message: Clone + Send + Sync + 'static {
    /// Bytes this message occupies while buffered.
    fn byte_size(&self) -> usize;
}

impl Message for Vec<u8> {
    fn byte_size(&self) -> usize {
        self.len()
    }
}

impl Message for Box<[u8]> {
    fn byte_size(&self) -> usize {
        self.len()
    }
}

impl Message for String {
    fn byte_size(&self) -> usize {
        self.len()
    }
}

/// Status code reported when a call finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Code {
    #[default]
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    ResourceExhausted,
    Aborted,
    Internal,
    Unavailable,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Code::Ok => "ok",
            Code::Cancelled => "cancelled",
            Code::Unknown => "unknown",
            Code::InvalidArgument => "invalid argument",
            Code::DeadlineExceeded => "deadline exceeded",
            Code::NotFound => "not found",
            Code::ResourceExhausted => "resource exhausted",
            Code::Aborted => "aborted",
            Code::Internal => "internal",
            Code::Unavailable => "unavailable",
        };
        f.write_str(name)
    }
}

/// Final status of a call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Status {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Status::default()
    }

    pub fn cancelled() -> Self {
        Status::new(Code::Cancelled, "cancelled")
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

/// Reusable buffer a transport reads the next inbound message into.
///
/// Reset to `R::default()` before every read, filled by the transport before
/// it posts the read completion, and borrowed by the owner while it handles
/// the completion.
pub struct ReadSlot<R>(Arc<Mutex<R>>);

impl<R: Default> ReadSlot<R> {
    pub fn new() -> Self {
        ReadSlot(Arc::new(Mutex::new(R::default())))
    }

    pub fn reset(&self) {
        *self.0.lock() = R::default();
    }
}

impl<R> ReadSlot<R> {
    pub fn fill(&self, msg: R) {
        *self.0.lock() = msg;
    }

    pub fn lock(&self) -> MutexGuard<'_, R> {
        self.0.lock()
    }
}

impl<R: Default> Default for ReadSlot<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Clone for ReadSlot<R> {
    fn clone(&self) -> Self {
        ReadSlot(Arc::clone(&self.0))
    }
}

/// Receives the status of a finished call from the transport.
#[derive(Clone, Default)]
pub struct StatusSlot(Arc<Mutex<Status>>);

impl StatusSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, status: Status) {
        *self.0.lock() = status;
    }

    pub fn get(&self) -> Status {
        self.0.lock().clone()
    }
}
