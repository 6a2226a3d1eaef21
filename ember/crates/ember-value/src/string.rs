//! Interned strings.
//!
//! [`WString`] is a leaf object on the heap: it holds no outgoing
//! references, so its [`ember_gc::Trace`] impl traces nothing. The
//! interesting part is [`StringPool`], which deliberately holds **weak**
//! references to every interned string. A string reachable only through
//! the pool must still be collected -- interning a string does not keep it
//! alive. That means the pool can never be handed to
//! [`ember_gc::Heap::register_root`]; instead, `ember-runtime` calls
//! [`StringPool::sweep_weak`] after marking and before sweeping, unlinking
//! any chain entry whose color is still white so the pool never outlives
//! the memory it points at.

use std::cell::{Cell, RefCell};

use ember_gc::{Gc, Color, Heap, Trace, GcHeader};
use std::ptr::NonNull;

/// An immutable, interned byte string.
///
/// Two `WString`s with identical bytes are always the same heap object:
/// see [`StringPool::intern`].
pub struct WString {
    hash: u32,
    bytes: Box<[u8]>,
}

impl WString {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_str(&self) -> &str {
        // Source text is UTF-8 and the lexer never slices mid-codepoint;
        // byte strings built by concatenation preserve that invariant too.
        std::str::from_utf8(&self.bytes).unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }
}

impl Trace for WString {
    fn trace(&self, _push: &mut dyn FnMut(NonNull<GcHeader>)) {}
}

/// FNV-1a, matching the "precomputed hash" the data model calls for without
/// pulling in a hashing crate for a single function.
fn hash_bytes(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Hash-interning pool with weak references into the heap.
///
/// Modeled as chained buckets rather than open addressing, so a bucket can
/// be walked and pruned in place during [`StringPool::sweep_weak`] without
/// disturbing probe sequences for the strings that survive.
pub struct StringPool {
    buckets: RefCell<Vec<Vec<Gc<WString>>>>,
    count: Cell<usize>,
}

const INITIAL_BUCKETS: usize = 64;

impl StringPool {
    pub fn new() -> Self {
        StringPool {
            buckets: RefCell::new(vec![Vec::new(); INITIAL_BUCKETS]),
            count: Cell::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.count.get()
    }

    pub fn is_empty(&self) -> bool {
        self.count.get() == 0
    }

    /// Interns `bytes`, returning the existing string if one with the same
    /// content is already pooled, or allocating a new one on `heap`
    /// otherwise.
    pub fn intern(&self, heap: &Heap, bytes: &[u8]) -> Gc<WString> {
        let hash = hash_bytes(bytes);
        if let Some(existing) = self.find(hash, bytes) {
            return existing;
        }
        let ws = heap.alloc(WString {
            hash,
            bytes: bytes.into(),
        });
        self.insert(hash, ws);
        if self.load_factor() > 1.0 {
            self.rehash();
        }
        ws
    }

    fn find(&self, hash: u32, bytes: &[u8]) -> Option<Gc<WString>> {
        let buckets = self.buckets.borrow();
        let idx = (hash as usize) % buckets.len();
        buckets[idx]
            .iter()
            .find(|s| s.hash() == hash && s.as_bytes() == bytes)
            .copied()
    }

    fn insert(&self, hash: u32, ws: Gc<WString>) {
        let mut buckets = self.buckets.borrow_mut();
        let idx = (hash as usize) % buckets.len();
        buckets[idx].push(ws);
        self.count.set(self.count.get() + 1);
    }

    fn load_factor(&self) -> f64 {
        self.count.get() as f64 / self.buckets.borrow().len() as f64
    }

    fn rehash(&self) {
        let mut buckets = self.buckets.borrow_mut();
        let new_len = buckets.len() * 2;
        let mut new_buckets: Vec<Vec<Gc<WString>>> = vec![Vec::new(); new_len];
        for chain in buckets.drain(..) {
            for ws in chain {
                let idx = (ws.hash() as usize) % new_len;
                new_buckets[idx].push(ws);
            }
        }
        *buckets = new_buckets;
    }

    /// Unlinks every pooled string whose color is still white after a mark
    /// phase, i.e. every string reachable only through the pool itself.
    /// Must run before [`ember_gc::Heap::sweep`] frees their memory.
    pub fn sweep_weak(&self) {
        let mut buckets = self.buckets.borrow_mut();
        let mut removed = 0usize;
        for chain in buckets.iter_mut() {
            chain.retain(|ws| {
                let alive = unsafe { ws.header().as_ref() }.color() != Color::White;
                if !alive {
                    removed += 1;
                }
                alive
            });
        }
        self.count.set(self.count.get().saturating_sub(removed));
    }
}

impl Default for StringPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_gc::GcConfig;

    #[test]
    fn interning_returns_same_object() {
        let heap = Heap::new(GcConfig::default());
        let pool = StringPool::new();
        let a = pool.intern(&heap, b"abc");
        let b = pool.intern(&heap, b"abc");
        assert_eq!(a.as_ptr(), b.as_ptr());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn distinct_bytes_intern_distinct_objects() {
        let heap = Heap::new(GcConfig::default());
        let pool = StringPool::new();
        let a = pool.intern(&heap, b"abc");
        let b = pool.intern(&heap, b"xyz");
        assert_ne!(a.as_ptr(), b.as_ptr());
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn unreferenced_string_is_unlinked_after_weak_sweep() {
        let heap = Heap::new(GcConfig::default());
        let pool = StringPool::new();
        pool.intern(&heap, b"ephemeral");
        assert_eq!(pool.len(), 1);
        // no roots reference the string; it should be collected entirely.
        heap.mark_from_roots(std::iter::empty());
        pool.sweep_weak();
        heap.sweep();
        assert_eq!(pool.len(), 0);
        assert_eq!(heap.bytes_allocated(), 0);
    }

    #[test]
    fn rooted_string_survives_weak_sweep() {
        let heap = Heap::new(GcConfig::default());
        let pool = StringPool::new();
        let s = pool.intern(&heap, b"kept");
        heap.mark_from_roots(vec![s.header()]);
        pool.sweep_weak();
        heap.sweep();
        assert_eq!(pool.len(), 1);
    }
}
