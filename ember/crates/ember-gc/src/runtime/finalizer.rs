use std::cell::RefCell;
use std::ptr::NonNull;

use crate::object::{Color, GcHeader};

/// A userdata object whose header went white during a cycle and which had
/// a finalizer registered for it.
///
/// `ember-runtime` drains these after [`crate::Heap::mark_from_roots`] but
/// before [`crate::Heap::sweep`], runs the registered callback (which may
/// resurrect the object by storing it somewhere reachable -- the sweep
/// hasn't happened yet, so the memory is still valid), then lets the sweep
/// proceed.
pub struct PendingFinalizer {
    pub header: NonNull<GcHeader>,
}

/// Tracks which live userdata objects have a `__gc` callback so the heap
/// doesn't need a field on every object for the (rare) finalizable case.
#[derive(Default)]
pub struct FinalizerRegistry {
    registered: RefCell<Vec<NonNull<GcHeader>>>,
}

impl FinalizerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, header: NonNull<GcHeader>) {
        self.registered.borrow_mut().push(header);
    }

    pub fn unregister(&self, header: NonNull<GcHeader>) {
        self.registered.borrow_mut().retain(|h| *h != header);
    }

    /// Returns every registered object that is still white after marking,
    /// i.e. about to be swept, and removes them from the registry (a
    /// finalizer runs at most once).
    pub fn drain_unreachable(&self) -> Vec<PendingFinalizer> {
        let mut registered = self.registered.borrow_mut();
        let mut pending = Vec::new();
        registered.retain(|&header| {
            let is_white = unsafe { header.as_ref() }.color() == Color::White;
            if is_white {
                pending.push(PendingFinalizer { header });
            }
            !is_white
        });
        pending
    }
}
