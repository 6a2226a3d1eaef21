//! Host-owned opaque data exposed to scripts.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::ptr::NonNull;

use ember_gc::{Gc, GcHeader, Trace};

use crate::table::Table;

/// A block of host-defined data a script can hold a reference to but never
/// inspect directly, except through metamethods the host installs on its
/// metatable.
///
/// Only `UserData` (not arbitrary tables) gets `__gc` finalizer callbacks
/// run on collection; see `ember_gc::FinalizerRegistry`.
pub struct UserData {
    data: RefCell<Box<dyn Any>>,
    metatable: Cell<Option<Gc<Table>>>,
}

impl UserData {
    pub fn new<T: Any>(value: T) -> Self {
        UserData {
            data: RefCell::new(Box::new(value)),
            metatable: Cell::new(None),
        }
    }

    pub fn metatable(&self) -> Option<Gc<Table>> {
        self.metatable.get()
    }

    pub fn set_metatable(&self, mt: Option<Gc<Table>>) {
        self.metatable.set(mt);
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<std::cell::Ref<'_, T>> {
        std::cell::Ref::filter_map(self.data.borrow(), |b| b.downcast_ref::<T>()).ok()
    }
}

impl Trace for UserData {
    fn trace(&self, push: &mut dyn FnMut(NonNull<GcHeader>)) {
        if let Some(mt) = self.metatable.get() {
            push(mt.header());
        }
    }
}
