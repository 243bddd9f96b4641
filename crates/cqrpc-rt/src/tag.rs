//! Tags and the per-channel tag registry.
//!
//! Every asynchronous operation is issued together with one [`Tag`]. The tag is
//! a plain handle into a [`TagRegistry`] slot, never an address, so a
//! completion that arrives after its owner retired the tag resolves to nothing
//! instead of to freed or reused memory.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use slab::Slab;

/// Opaque identity attached to one in-flight operation.
///
/// Layout (64-bit):
/// ```text
/// Bits 63..32: generation
/// Bits 31..0:  slot key
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(u64);

impl Tag {
    const KEY_MASK: u64 = 0xFFFF_FFFF;
    const GEN_SHIFT: u64 = 32;

    fn new(key: usize, generation: u32) -> Self {
        debug_assert!(key <= u32::MAX as usize, "tag slot key exceeds 32 bits");
        Tag(((generation as u64) << Self::GEN_SHIFT) | (key as u64 & Self::KEY_MASK))
    }

    /// Slot key inside the owning registry.
    #[inline]
    pub fn key(self) -> usize {
        (self.0 & Self::KEY_MASK) as usize
    }

    /// Generation the slot had when this tag was handed out.
    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> Self::GEN_SHIFT) as u32
    }

    /// Raw encoded value, suitable for passing through a transport as user data.
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Rebuild a tag from a value previously returned by [`Tag::raw`].
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Tag(raw)
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({}#{})", self.key(), self.generation())
    }
}

/// Completion handler bound to one or more tags.
///
/// Called by the dispatch loop with the tag that completed. A handler bound to
/// several tags (a call with separate read and write operations, for example)
/// tells them apart by comparing the tag argument.
pub trait TagHandler: Send + Sync {
    /// The operation issued with `tag` completed successfully.
    fn process(&self, tag: Tag);

    /// The operation issued with `tag` failed, timed out or was cancelled.
    fn on_error(&self, tag: Tag);
}

struct Slot {
    generation: u32,
    /// `None` between `reserve()` and `bind()`.
    handler: Option<Arc<dyn TagHandler>>,
}

/// The set of tags the dispatch loop is allowed to route to.
///
/// One registry exists per channel. The internal lock is held only for the
/// slab mutation itself; handlers are always invoked after it is released.
pub struct TagRegistry {
    slots: Mutex<Slab<Slot>>,
    generation: AtomicU32,
}

impl TagRegistry {
    pub fn new() -> Self {
        TagRegistry {
            slots: Mutex::new(Slab::new()),
            generation: AtomicU32::new(0),
        }
    }

    /// Reserve a tag whose handler is bound later.
    ///
    /// Completions for a reserved but unbound tag are treated as stale. Owners
    /// that need their own tags before they can be constructed reserve first,
    /// build themselves, then [`bind`](Self::bind), and only then issue the
    /// first operation.
    pub fn reserve(&self) -> Tag {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let mut slots = self.slots.lock();
        let entry = slots.vacant_entry();
        let key = entry.key();
        entry.insert(Slot {
            generation,
            handler: None,
        });
        Tag::new(key, generation)
    }

    /// Attach a handler to a reserved tag. Returns false if the tag is stale.
    pub fn bind(&self, tag: Tag, handler: Arc<dyn TagHandler>) -> bool {
        let mut slots = self.slots.lock();
        match slots.get_mut(tag.key()) {
            Some(slot) if slot.generation == tag.generation() => {
                slot.handler = Some(handler);
                true
            }
            _ => false,
        }
    }

    /// Reserve and bind in one step.
    pub fn register(&self, handler: Arc<dyn TagHandler>) -> Tag {
        let tag = self.reserve();
        self.bind(tag, handler);
        tag
    }

    /// Retire a tag. Later completions carrying it are dropped by the dispatch
    /// loop. Returns false if the tag was already retired.
    pub fn deregister(&self, tag: Tag) -> bool {
        let removed = {
            let mut slots = self.slots.lock();
            let live = matches!(slots.get(tag.key()), Some(slot) if slot.generation == tag.generation());
            live.then(|| slots.remove(tag.key()))
        };
        removed.is_some()
    }

    /// Resolve a tag to its handler, if it is still registered and bound.
    pub fn lookup(&self, tag: Tag) -> Option<Arc<dyn TagHandler>> {
        let slots = self.slots.lock();
        match slots.get(tag.key()) {
            Some(slot) if slot.generation == tag.generation() => slot.handler.clone(),
            _ => None,
        }
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.lookup(tag).is_some()
    }

    /// Number of registered tags, bound or not.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retire every tag. Used when a channel is torn down; the handlers are
    /// dropped after the lock is released.
    pub fn clear(&self) -> usize {
        let drained: Vec<Slot> = self.slots.lock().drain().collect();
        drained.len()
    }
}

impl Default for TagRegistry {
    fn default() -> Self {
        Self::new()
    }
}
