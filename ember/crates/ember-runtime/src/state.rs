//! The interpreter's global state: heap, globals, the value stack, and the
//! frame stack.
//!
//! A `State` is the embedding API's handle (see [`crate::api`]) and the
//! `NativeContext` every base-library function runs against. Only one `State`
//! exists per independent script environment -- there is no notion of
//! multiple Lua "universes" sharing a heap, matching the data model's
//! "global state confined to a single handle" note.

use ember_gc::{FinalizerRegistry, GcConfig, Gc, Heap, RootHandle};
use ember_value::{StringPool, Table, UpValue, UserData, Value, WString};

use crate::error::{ErrorKind, RuntimeError};
use crate::base;
use crate::frame::Frame;

/// Depth cap for `__index`/`__newindex` metatable chains and for
/// `tostring`/compare metamethod dispatch loops. The data model leaves the
/// exact bound unspecified; this mirrors the reference implementation's
/// own fixed limit rather than looping until the host's real stack
/// overflows.
pub const MAX_METATABLE_CHAIN: u32 = 100;

pub struct State {
    pub(crate) heap: Heap,
    pub(crate) strings: StringPool,
    pub globals: Gc<Table>,
    /// Host-only storage not reachable from script code, e.g. cached
    /// references the embedding API stashes between calls.
    pub registry: Gc<Table>,
    pub(crate) stack: std::cell::RefCell<Vec<Value>>,
    pub(crate) frames: std::cell::RefCell<Vec<Frame>>,
    /// Open upvalues, sorted ascending by the stack index they point at
    /// so `close_upvalues_from` can binary-search the cutoff and
    /// `find_or_create_upvalue` can dedup in sorted-insert order.
    pub(crate) open_upvalues: std::cell::RefCell<Vec<Gc<UpValue>>>,
    /// Preallocated at construction so raising "out of memory" never
    /// itself needs to allocate.
    pub(crate) oom_value: Value,
    pub(crate) chunk_name: std::cell::RefCell<String>,
    /// Userdata whose metatable has a `__gc` callback, registered by
    /// `api.rs::setmetatable`. Drained and run in `collect_garbage`
    /// between marking and sweeping.
    pub(crate) finalizers: FinalizerRegistry,
}

impl State {
    pub fn new() -> Self {
        Self::with_config(GcConfig::default())
    }

    pub fn with_config(config: GcConfig) -> Self {
        let heap = Heap::new(config);
        let strings = StringPool::new();
        let globals = heap.alloc(Table::new());
        let registry = heap.alloc(Table::new());
        heap.register_root(globals.header());
        heap.register_root(registry.header());
        let oom_message = strings.intern(&heap, b"not enough memory");
        let state = State {
            heap,
            strings,
            globals,
            registry,
            stack: std::cell::RefCell::new(Vec::with_capacity(256)),
            frames: std::cell::RefCell::new(Vec::new()),
            open_upvalues: std::cell::RefCell::new(Vec::new()),
            oom_value: Value::String(oom_message),
            chunk_name: std::cell::RefCell::new(String::from("?")),
            finalizers: FinalizerRegistry::new(),
        };
        base::install(&state);
        state
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn strings(&self) -> &StringPool {
        &self.strings
    }

    pub fn intern(&self, s: &str) -> Gc<WString> {
        self.strings.intern(&self.heap, s.as_bytes())
    }

    pub fn oom_value(&self) -> Value {
        self.oom_value
    }

    // -- value stack -----------------------------------------------------

    pub(crate) fn stack_len(&self) -> usize {
        self.stack.borrow().len()
    }

    pub(crate) fn push(&self, value: Value) {
        self.stack.borrow_mut().push(value);
    }

    pub(crate) fn get(&self, index: usize) -> Value {
        self.stack.borrow().get(index).copied().unwrap_or(Value::Nil)
    }

    pub(crate) fn set(&self, index: usize, value: Value) {
        let mut stack = self.stack.borrow_mut();
        if index >= stack.len() {
            stack.resize(index + 1, Value::Nil);
        }
        stack[index] = value;
    }

    pub(crate) fn truncate(&self, len: usize) {
        self.stack.borrow_mut().truncate(len);
    }

    // -- upvalues ----------------------------------------------------------

    /// Finds an already-open upvalue pointing at `stack_index`, or creates
    /// one. Two closures capturing the same local must share the exact
    /// same `UpValue` object -- that's what makes a write through one
    /// visible through the other.
    pub(crate) fn find_or_create_upvalue(&self, stack_index: usize) -> Gc<UpValue> {
        let mut open = self.open_upvalues.borrow_mut();
        match open.binary_search_by_key(&stack_index, |uv| uv.open_index().unwrap_or(usize::MAX)) {
            Ok(pos) => open[pos],
            Err(pos) => {
                let uv = self.heap.alloc(UpValue::new_open(stack_index));
                open.insert(pos, uv);
                uv
            }
        }
    }

    /// Closes every open upvalue at or above `from`, copying the current
    /// stack value into it so it survives the frame that declared it
    /// returning.
    pub(crate) fn close_upvalues_from(&self, from: usize) {
        let mut open = self.open_upvalues.borrow_mut();
        let cutoff = open.partition_point(|uv| uv.open_index().unwrap_or(usize::MAX) < from);
        let stack = self.stack.borrow();
        for uv in open.drain(cutoff..) {
            if let Some(idx) = uv.open_index() {
                uv.close(stack.get(idx).copied().unwrap_or(Value::Nil));
            }
        }
    }

    // -- garbage collection ------------------------------------------------

    /// Runs a full mark/sweep cycle if accumulated allocation debt
    /// warrants it. Marks the value stack and every live frame's closure
    /// as extra roots (the globals and registry tables are registered
    /// roots already), then lets the string pool drop dead weak entries
    /// before sweeping -- see `ember_gc::heap` for why that ordering
    /// matters.
    pub fn collect_garbage_if_needed(&self) {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    pub fn collect_garbage(&self) {
        let extra_roots = self.extra_roots();
        self.heap.mark_from_roots(extra_roots);
        self.strings.sweep_weak();
        self.run_finalizers();
        self.heap.sweep();
    }

    /// Runs `__gc` for every registered userdata that didn't get marked
    /// this cycle, before `sweep` reclaims its memory. A finalizer that
    /// stashes the userdata somewhere reachable resurrects it -- the
    /// object is still valid at this point, sweep hasn't run yet.
    fn run_finalizers(&self) {
        for pending in self.finalizers.drain_unreachable() {
            let userdata: Gc<UserData> = unsafe { Gc::from_header(pending.header) };
            let Some(mt) = userdata.metatable() else { continue };
            let gc_fn = mt.get(&Value::String(self.intern("__gc")));
            if !gc_fn.is_nil() {
                let _ = crate::vm::call_value(self, gc_fn, &[Value::UserData(userdata)]);
            }
        }
    }

    fn extra_roots(&self) -> Vec<RootHandle> {
        let mut roots = Vec::new();
        for value in self.stack.borrow().iter() {
            push_value_root(value, &mut roots);
        }
        for frame in self.frames.borrow().iter() {
            roots.push(frame.closure.header());
        }
        for uv in self.open_upvalues.borrow().iter() {
            roots.push(uv.header());
        }
        push_value_root(&self.oom_value, &mut roots);
        roots
    }

    // -- calling -------------------------------------------------------------

    pub fn chunk_name(&self) -> String {
        self.chunk_name.borrow().clone()
    }

    pub fn set_chunk_name(&self, name: &str) {
        *self.chunk_name.borrow_mut() = name.to_string();
    }

    pub fn current_line(&self) -> u32 {
        let frames = self.frames.borrow();
        match frames.last() {
            // `frame.ip` points at the instruction currently being handled
            // (or, for a native call in progress, the `CALL`/`TAILCALL` that
            // invoked it) until `step` advances it at the very end -- no
            // pre-increment convention here, so no -1 adjustment.
            Some(frame) => frame
                .closure
                .prototype()
                .map(|p| p.instruction_line(frame.ip))
                .unwrap_or(0),
            None => 0,
        }
    }

    pub fn runtime_error(&self, message: impl Into<String>) -> RuntimeError {
        let message = message.into();
        let value = Value::String(self.intern(&message));
        RuntimeError::new(ErrorKind::Runtime, &self.chunk_name(), self.current_line(), message)
            .with_value(value)
    }
}

fn push_value_root(value: &Value, roots: &mut Vec<RootHandle>) {
    match value {
        Value::String(s) => roots.push(s.header()),
        Value::Table(t) => roots.push(t.header()),
        Value::Closure(c) => roots.push(c.header()),
        Value::UserData(u) => roots.push(u.header()),
        Value::Prototype(p) => roots.push(p.header()),
        Value::UpValue(u) => roots.push(u.header()),
        Value::Nil | Value::Boolean(_) | Value::Number(_) | Value::LightUserData(_) => {}
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}
