//! Captured-variable cells.

use std::cell::Cell;
use std::ptr::NonNull;

use ember_gc::{GcHeader, Trace};

use crate::value::{trace_value, Value};

/// Either an open reference into a still-live stack slot, or a closed,
/// owned value once the frame that declared the local has returned.
///
/// Open upvalues that reference the same stack slot are the same
/// `UpValue` object (see `ember-runtime`'s open-upvalue list), so mutating
/// the captured variable through one closure is observed by every other
/// closure that captured it -- the invariant the sharing test in the data
/// model exercises.
#[derive(Clone, Copy)]
pub enum UpValueState {
    /// Index into the owning frame's register window.
    Open(usize),
    Closed(Value),
}

pub struct UpValue {
    state: Cell<UpValueState>,
}

impl UpValue {
    pub fn new_open(stack_index: usize) -> Self {
        UpValue {
            state: Cell::new(UpValueState::Open(stack_index)),
        }
    }

    pub fn state(&self) -> UpValueState {
        self.state.get()
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state.get(), UpValueState::Open(_))
    }

    pub fn open_index(&self) -> Option<usize> {
        match self.state.get() {
            UpValueState::Open(i) => Some(i),
            UpValueState::Closed(_) => None,
        }
    }

    /// Closes the upvalue over `value`, detaching it from the stack.
    pub fn close(&self, value: Value) {
        self.state.set(UpValueState::Closed(value));
    }

    pub fn get_closed(&self) -> Option<Value> {
        match self.state.get() {
            UpValueState::Closed(v) => Some(v),
            UpValueState::Open(_) => None,
        }
    }
}

impl Trace for UpValue {
    fn trace(&self, push: &mut dyn FnMut(NonNull<GcHeader>)) {
        if let UpValueState::Closed(v) = self.state.get() {
            trace_value(&v, push);
        }
    }
}
