use cqrpc_rt::Tag;

use crate::message::ReadSlot;
use crate::transport::CallStream;

/// Issues "read next message" operations for one call.
///
/// Owns the reusable read buffer and the auto-continue flag. The transport
/// allows a single outstanding read per call, so [`read`](Self::read) refuses
/// to issue a second one until [`complete`](Self::complete) has been called
/// for the first.
pub struct ReadPump<R> {
    tag: Tag,
    slot: ReadSlot<R>,
    auto: bool,
    reading: bool,
}

impl<R: Default + Send + 'static> ReadPump<R> {
    /// Create a pump issuing reads with `tag`. Auto-continue starts enabled.
    pub fn new(tag: Tag) -> Self {
        ReadPump {
            tag,
            slot: ReadSlot::new(),
            auto: true,
            reading: false,
        }
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// Whether a completed read should immediately re-arm the next one.
    pub fn set_auto(&mut self, auto: bool) {
        self.auto = auto;
    }

    pub fn auto(&self) -> bool {
        self.auto
    }

    pub fn is_reading(&self) -> bool {
        self.reading
    }

    /// The buffer the last completed read was delivered into.
    pub fn slot(&self) -> &ReadSlot<R> {
        &self.slot
    }

    /// Reset the buffer and issue one read. Returns false, issuing nothing, if
    /// a read is already outstanding.
    pub fn read<S>(&mut self, stream: &S) -> bool
    where
        S: CallStream<Inbound = R>,
    {
        if self.reading {
            return false;
        }
        self.slot.reset();
        self.reading = true;
        tracing::trace!(tag = ?self.tag, "read issued");
        stream.read(&self.slot, self.tag);
        true
    }

    /// Record that the outstanding read completed (successfully or not).
    /// Returns false if no read was outstanding.
    pub fn complete(&mut self) -> bool {
        std::mem::replace(&mut self.reading, false)
    }

    /// Whether, after a successful completion, the owner should re-arm.
    pub fn should_continue(&self) -> bool {
        self.auto && !self.reading
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackStream;
    use cqrpc_rt::{Completion, CompletionQueue, Next, TagRegistry};
    use std::sync::Arc;
    use std::time::Duration;

    fn setup() -> (Arc<CompletionQueue>, Tag, Arc<LoopbackStream<String, String>>) {
        let cq = Arc::new(CompletionQueue::new().unwrap());
        let tag = TagRegistry::new().reserve();
        let stream = Arc::new(LoopbackStream::new(cq.clone()));
        (cq, tag, stream)
    }

    #[test]
    fn read_delivers_into_slot() {
        let (cq, tag, stream) = setup();
        let mut pump = ReadPump::<String>::new(tag);
        stream.push("first".to_string());

        assert!(pump.read(&*stream));
        assert!(pump.is_reading());
        assert_eq!(cq.next(), Some(Completion { tag, ok: true }));
        assert!(pump.complete());
        assert_eq!(&*pump.slot().lock(), "first");
        assert!(pump.should_continue());
    }

    #[test]
    fn second_read_is_refused_while_outstanding() {
        let (_cq, tag, stream) = setup();
        let mut pump = ReadPump::<String>::new(tag);
        assert!(pump.read(&*stream));
        assert!(!pump.read(&*stream));
        assert!(stream.violations().is_empty());
    }

    #[test]
    fn buffer_is_reset_before_each_read() {
        let (cq, tag, stream) = setup();
        let mut pump = ReadPump::<String>::new(tag);
        stream.push("stale".to_string());
        pump.read(&*stream);
        cq.next();
        pump.complete();

        // Nothing queued: the read stays pending and the slot is cleared.
        pump.read(&*stream);
        assert!(pump.slot().lock().is_empty());
        assert_eq!(cq.next_timeout(Duration::from_millis(5)), Next::Timeout);
    }

    #[test]
    fn closed_stream_fails_the_read() {
        let (cq, tag, stream) = setup();
        let mut pump = ReadPump::<String>::new(tag);
        pump.read(&*stream);
        stream.close();
        assert_eq!(cq.next(), Some(Completion { tag, ok: false }));
        assert!(pump.complete());
        assert!(!pump.complete());
    }

    #[test]
    fn auto_disabled_stops_continuation() {
        let tag = TagRegistry::new().reserve();
        let mut pump = ReadPump::<String>::new(tag);
        pump.set_auto(false);
        assert!(!pump.should_continue());
        pump.set_auto(true);
        assert!(pump.should_continue());
    }
}
