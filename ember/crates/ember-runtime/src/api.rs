//! The stack-based embedding API a host uses to drive a [`State`] from
//! outside: indices address a single shared value stack (positive counts
//! from the bottom, negative from the top), matching the data model's
//! embedding section rather than handing out `Value` references directly.
//!
//! This module only adds methods to [`State`] -- there is no separate
//! handle type, since every operation here already needs the same heap,
//! string pool and stack `vm` and `base` work against.

use ember_gc::Gc;
use ember_util::Handler;
use ember_value::{Closure, Table, Value};

use crate::error::{ErrorKind, RuntimeError};
use crate::state::State;
use crate::vm;

/// Multiple-results sentinel for [`State::call`]/[`State::pcall`], mirroring
/// the reference embedding API's `LUA_MULTRET`.
pub const MULTRET: i32 = -1;

impl State {
    /// Resolves a 1-based-from-bottom or negative-from-top index to an
    /// absolute stack offset, if it names a slot that currently exists.
    fn resolve_index(&self, idx: i32) -> Option<usize> {
        let len = self.stack_len() as i32;
        let abs = if idx > 0 { idx - 1 } else { len + idx };
        if abs >= 0 && abs < len {
            Some(abs as usize)
        } else {
            None
        }
    }

    fn at(&self, idx: i32) -> Value {
        self.resolve_index(idx).map(|i| self.get(i)).unwrap_or(Value::Nil)
    }

    // -- lifecycle ---------------------------------------------------------

    /// `open()`: a fresh `State` with the base globals already installed.
    /// There is no separate allocator-callback parameter here -- `ember-gc`
    /// takes its tuning through [`ember_gc::GcConfig`] at construction
    /// instead of a C-style `alloc_fn`/`ud` pair.
    pub fn open() -> State {
        State::new()
    }

    // `close` has no work to do beyond ordinary `Drop` -- the heap, string
    // pool and stack are all owned fields that tear down when `State` does.

    // -- stack ---------------------------------------------------------------

    /// `top()`: number of values currently on the stack.
    pub fn top(&self) -> i32 {
        self.stack_len() as i32
    }

    /// `settop(idx)`: grows the stack with `Nil` or truncates it so
    /// `top()` becomes `idx` (or, for a negative `idx`, `top() + idx + 1`).
    pub fn settop(&self, idx: i32) {
        let len = self.stack_len() as i32;
        let target = if idx >= 0 { idx } else { len + idx + 1 };
        let target = target.max(0) as usize;
        if target >= self.stack_len() {
            for _ in self.stack_len()..target {
                self.push(Value::Nil);
            }
        } else {
            self.truncate(target);
        }
    }

    pub fn push_nil(&self) {
        self.push(Value::Nil);
    }

    pub fn push_bool(&self, b: bool) {
        self.push(Value::Boolean(b));
    }

    pub fn push_number(&self, n: f64) {
        self.push(Value::Number(n));
    }

    pub fn push_integer(&self, n: i64) {
        self.push(Value::Number(n as f64));
    }

    pub fn push_string(&self, s: &str) {
        self.push(Value::String(self.intern(s)));
    }

    pub fn push_cfunction(&self, f: ember_value::NativeFn, name: &'static str) {
        let closure = self.heap().alloc(Closure::new_native(f, name, vec![]));
        self.push(Value::Closure(closure));
    }

    pub fn push_lightuserdata(&self, ptr: *mut std::ffi::c_void) {
        self.push(Value::LightUserData(ptr));
    }

    pub fn push_value(&self, idx: i32) {
        self.push(self.at(idx));
    }

    /// `pop(n)`: discards the top `n` values.
    pub fn pop(&self, n: usize) {
        let len = self.stack_len();
        self.truncate(len.saturating_sub(n));
    }

    /// `insert(idx)`: moves the top value down to `idx`, shifting
    /// everything originally at or above `idx` up by one.
    pub fn insert(&self, idx: i32) {
        let Some(at) = self.resolve_index(idx) else { return };
        let top = self.stack_len() - 1;
        let v = self.get(top);
        for i in (at..top).rev() {
            self.set(i + 1, self.get(i));
        }
        self.set(at, v);
    }

    /// `remove(idx)`: removes the value at `idx`, shifting everything
    /// above it down by one.
    pub fn remove(&self, idx: i32) {
        let Some(at) = self.resolve_index(idx) else { return };
        let top = self.stack_len();
        for i in at..top - 1 {
            self.set(i, self.get(i + 1));
        }
        self.pop(1);
    }

    /// `replace(idx)`: pops the top value and stores it at `idx`.
    pub fn replace(&self, idx: i32) {
        let v = self.at(-1);
        self.pop(1);
        if let Some(at) = self.resolve_index(idx) {
            self.set(at, v);
        }
    }

    // -- types ---------------------------------------------------------------

    pub fn type_at(&self, idx: i32) -> &'static str {
        self.at(idx).type_name()
    }

    pub fn is_nil(&self, idx: i32) -> bool {
        self.at(idx).is_nil()
    }

    pub fn is_bool(&self, idx: i32) -> bool {
        matches!(self.at(idx), Value::Boolean(_))
    }

    pub fn is_number(&self, idx: i32) -> bool {
        self.at(idx).as_number().is_some()
    }

    pub fn is_string(&self, idx: i32) -> bool {
        matches!(self.at(idx), Value::String(_))
    }

    pub fn is_table(&self, idx: i32) -> bool {
        matches!(self.at(idx), Value::Table(_))
    }

    pub fn is_function(&self, idx: i32) -> bool {
        matches!(self.at(idx), Value::Closure(_))
    }

    pub fn is_userdata(&self, idx: i32) -> bool {
        matches!(self.at(idx), Value::UserData(_) | Value::LightUserData(_))
    }

    pub fn to_bool(&self, idx: i32) -> bool {
        self.at(idx).is_truthy()
    }

    pub fn to_number(&self, idx: i32) -> Option<f64> {
        self.at(idx).as_number()
    }

    pub fn to_integer(&self, idx: i32) -> Option<i64> {
        self.at(idx).as_number().map(|n| n as i64)
    }

    pub fn to_string_value(&self, idx: i32) -> Option<String> {
        self.at(idx).as_str().map(str::to_string)
    }

    // -- tables ----------------------------------------------------------

    pub fn newtable(&self) {
        let t = self.heap().alloc(Table::new());
        self.push(Value::Table(t));
    }

    /// Pushes a fresh userdata wrapping `value`. The host downcasts it
    /// back out through whatever native functions it installs on the
    /// metatable set via `setmetatable`.
    pub fn push_userdata<T: std::any::Any>(&self, value: T) {
        let u = self.heap().alloc(ember_value::UserData::new(value));
        self.push(Value::UserData(u));
    }

    fn require_table(&self, idx: i32) -> Result<Gc<Table>, RuntimeError> {
        match self.at(idx) {
            Value::Table(t) => Ok(t),
            other => Err(self.runtime_error(format!("attempt to index a {} value", other.type_name()))),
        }
    }

    /// `rawget(idx)`: pops a key, pushes `table[key]` with no metamethod
    /// dispatch.
    pub fn rawget(&self, idx: i32) -> Result<(), RuntimeError> {
        let t = self.require_table(idx)?;
        let key = self.at(-1);
        self.pop(1);
        self.push(t.get(&key));
        Ok(())
    }

    /// `rawset(idx)`: pops a value then a key, assigns `table[key] = value`
    /// with no metamethod dispatch.
    pub fn rawset(&self, idx: i32) -> Result<(), RuntimeError> {
        let t = self.require_table(idx)?;
        let value = self.at(-1);
        let key = self.at(-2);
        self.pop(2);
        t.set(key, value).map_err(|e| self.runtime_error(e.to_string()))
    }

    pub fn rawgeti(&self, idx: i32, n: i64) -> Result<(), RuntimeError> {
        let t = self.require_table(idx)?;
        self.push(t.get(&Value::Number(n as f64)));
        Ok(())
    }

    pub fn rawseti(&self, idx: i32, n: i64) -> Result<(), RuntimeError> {
        let t = self.require_table(idx)?;
        let value = self.at(-1);
        self.pop(1);
        t.set(Value::Number(n as f64), value).map_err(|e| self.runtime_error(e.to_string()))
    }

    /// `getfield(idx, name)`: like `gettable`, but the key is a literal
    /// name rather than the stack top -- may invoke `__index`.
    pub fn getfield(&self, idx: i32, name: &str) -> Result<(), RuntimeError> {
        let table = self.at(idx);
        let key = Value::String(self.intern(name));
        let result = vm::index_get(self, table, key)?;
        self.push(result);
        Ok(())
    }

    /// `setfield(idx, name)`: pops a value, assigns `table[name] = value`
    /// -- may invoke `__newindex`.
    pub fn setfield(&self, idx: i32, name: &str) -> Result<(), RuntimeError> {
        let table = self.at(idx);
        let key = Value::String(self.intern(name));
        let value = self.at(-1);
        self.pop(1);
        vm::index_set(self, table, key, value)
    }

    /// `gettable(idx)`: pops a key, pushes `table[key]` -- may invoke
    /// `__index`.
    pub fn gettable(&self, idx: i32) -> Result<(), RuntimeError> {
        let table = self.at(idx);
        let key = self.at(-1);
        self.pop(1);
        let result = vm::index_get(self, table, key)?;
        self.push(result);
        Ok(())
    }

    /// `settable(idx)`: pops a value then a key, assigns `table[key] =
    /// value` -- may invoke `__newindex`.
    pub fn settable(&self, idx: i32) -> Result<(), RuntimeError> {
        let table = self.at(idx);
        let value = self.at(-1);
        let key = self.at(-2);
        self.pop(2);
        vm::index_set(self, table, key, value)
    }

    /// `next(idx)`: raw iteration keyed off the value at the stack top.
    /// Pops the key; on success leaves the next key and value pushed and
    /// returns `true`, otherwise pushes nothing and returns `false`.
    pub fn next(&self, idx: i32) -> Result<bool, RuntimeError> {
        let t = self.require_table(idx)?;
        let key = self.at(-1);
        self.pop(1);
        match t.next(&key) {
            Some((k, v)) => {
                self.push(k);
                self.push(v);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn raw_equal(&self, idx1: i32, idx2: i32) -> bool {
        self.at(idx1) == self.at(idx2)
    }

    // -- globals -----------------------------------------------------------

    pub fn getglobal(&self, name: &str) {
        self.push(self.globals.get(&Value::String(self.intern(name))));
    }

    pub fn setglobal(&self, name: &str) {
        let value = self.at(-1);
        self.pop(1);
        self.globals
            .set(Value::String(self.intern(name)), value)
            .expect("interned string keys are never nil");
    }

    // -- calls ---------------------------------------------------------------

    /// `call(nargs, nresults)`: the function and its `nargs` arguments
    /// must be the top `nargs + 1` stack slots. Replaces them with the
    /// call's results (padded or truncated to `nresults`, unless
    /// `nresults == MULTRET`).
    pub fn call(&self, nargs: usize, nresults: i32) -> Result<(), RuntimeError> {
        let base = self.stack_len() - nargs - 1;
        let callee = self.get(base);
        let args: Vec<Value> = (base + 1..base + 1 + nargs).map(|i| self.get(i)).collect();
        let results = vm::call_value(self, callee, &args)?;
        self.truncate(base);
        self.deliver(results, nresults);
        Ok(())
    }

    fn deliver(&self, mut results: Vec<Value>, nresults: i32) {
        if nresults != MULTRET {
            results.resize(nresults.max(0) as usize, Value::Nil);
        }
        for v in results {
            self.push(v);
        }
    }

    /// `pcall(nargs, nresults, errfunc) → status`: like `call`, but an
    /// error is caught rather than propagated. `errfunc` is a stack index
    /// of a message handler called with the error object (`0` for none).
    /// Returns `0` on success, nonzero on error; on error, the stack top
    /// holds the (possibly handler-transformed) error object.
    pub fn pcall(&self, nargs: usize, nresults: i32, errfunc: i32) -> i32 {
        let base = self.stack_len() - nargs - 1;
        let callee = self.get(base);
        let args: Vec<Value> = (base + 1..base + 1 + nargs).map(|i| self.get(i)).collect();
        match vm::call_value(self, callee, &args) {
            Ok(results) => {
                self.truncate(base);
                self.deliver(results, nresults);
                0
            }
            Err(err) => {
                self.truncate(base);
                let mut errval = err.value;
                if errfunc != 0 {
                    let handler = self.at(errfunc);
                    if let Ok(mut handled) = vm::call_value(self, handler, &[errval]) {
                        errval = handled.pop().unwrap_or(errval);
                    }
                }
                self.push(errval);
                1
            }
        }
    }

    /// `error()`: pops the top of stack and hands back the `RuntimeError`
    /// it raises, for the host to propagate with `?`.
    pub fn error(&self) -> RuntimeError {
        let value = self.at(-1);
        self.pop(1);
        match value.as_str() {
            Some(s) => self.runtime_error(s.to_string()),
            None => RuntimeError::new(ErrorKind::Runtime, &self.chunk_name(), self.current_line(), "(non-string error object)")
                .with_value(value),
        }
    }

    /// Renders the value at `idx` the same way the base library's
    /// `tostring` does (honoring `__tostring`), for a host that wants to
    /// display a result without going through a script call.
    pub fn describe(&self, idx: i32) -> String {
        let v = self.at(idx);
        if let Some(handler) = vm::metamethod(self, &v, "__tostring") {
            if let Ok(mut results) = vm::call_value(self, handler, &[v]) {
                if let Some(s) = results.pop().and_then(|r| r.as_str().map(str::to_string)) {
                    return s;
                }
            }
        }
        crate::base::default_tostring(&v)
    }

    // -- metatables ------------------------------------------------------

    /// `getmetatable(idx)`: pushes the metatable of the value at `idx` and
    /// returns `true`, or pushes nothing and returns `false` if it has
    /// none.
    pub fn getmetatable(&self, idx: i32) -> bool {
        let mt = match self.at(idx) {
            Value::Table(t) => t.metatable(),
            Value::UserData(u) => u.metatable(),
            _ => None,
        };
        match mt {
            Some(mt) => {
                self.push(Value::Table(mt));
                true
            }
            None => false,
        }
    }

    /// `setmetatable(idx)`: pops a table or `nil` and installs it as the
    /// metatable of the value at `idx`.
    pub fn setmetatable(&self, idx: i32) -> Result<(), RuntimeError> {
        let mt = match self.at(-1) {
            Value::Nil => None,
            Value::Table(t) => Some(t),
            other => return Err(self.runtime_error(format!("bad argument (nil or table expected, got {})", other.type_name()))),
        };
        self.pop(1);
        match self.at(idx) {
            Value::Table(t) => {
                t.set_metatable(mt);
                Ok(())
            }
            Value::UserData(u) => {
                u.set_metatable(mt);
                self.finalizers.unregister(u.header());
                if let Some(mt) = mt {
                    if !mt.get(&Value::String(self.intern("__gc"))).is_nil() {
                        self.finalizers.register(u.header());
                    }
                }
                Ok(())
            }
            other => Err(self.runtime_error(format!("attempt to set metatable on a {} value", other.type_name()))),
        }
    }

    // -- load --------------------------------------------------------------

    /// `load(source, chunkname)`: compiles `source` into a top-level
    /// closure and pushes it. A lex/syntax error returns `Err` (with a
    /// message + line describing the first diagnostic) instead of
    /// pushing anything, matching the data model's `load` error path.
    pub fn load(&self, source: &str, chunk_name: &str) -> Result<(), RuntimeError> {
        let handler = Handler::new();
        match ember_par::compile(source, chunk_name, self.heap(), self.strings(), &handler) {
            Ok(prototype) => {
                let closure = self.heap().alloc(Closure::new_script(prototype, vec![]));
                self.set_chunk_name(chunk_name);
                self.push(Value::Closure(closure));
                Ok(())
            }
            Err(_) => {
                let diag = handler.diagnostics().into_iter().next();
                let (line, message) = diag
                    .map(|d| (d.span.line, d.message))
                    .unwrap_or_else(|| (0, "compilation failed".to_string()));
                Err(RuntimeError::new(ErrorKind::Syntax, chunk_name, line, message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Loads and runs `source` as a fresh top-level chunk, returning every
    /// value it left on the stack.
    fn run(source: &str) -> Vec<Value> {
        let state = State::open();
        state.load(source, "test").expect("source should compile");
        state.call(0, MULTRET).expect("chunk should run");
        (1..=state.top()).map(|i| state.at(i)).collect()
    }

    #[test]
    fn interning_round_trip() {
        let state = State::open();
        state.push_string("abc");
        state.push_string("abc");
        assert!(state.raw_equal(-1, -2));
    }

    #[test]
    fn array_from_hash_promotion() {
        let results = run(
            r#"
            local t = {}
            t[4] = "four"; t[5] = "five"; t[6] = "six"; t[7] = "seven"
            t[1] = "one"; t[2] = "two"; t[3] = "three"
            return t[1], t[2], t[3], t[4], t[5], t[6], t[7], t[8]
            "#,
        );
        let expected = ["one", "two", "three", "four", "five", "six", "seven"];
        for (i, want) in expected.iter().enumerate() {
            assert_eq!(results[i].as_str(), Some(*want));
        }
        assert_eq!(results[7], Value::Nil);
    }

    #[test]
    fn short_circuit_and_or() {
        let results = run(r#"return (1 == 1) and "yes" or "no""#);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_str(), Some("yes"));

        let results = run(r#"return nil and error("!") or "ok""#);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_str(), Some("ok"));
    }

    #[test]
    fn protected_error_recovers_and_state_stays_usable() {
        let state = State::open();
        state.load(r#"error("boom")"#, "chunk").expect("should compile");
        let status = state.pcall(0, MULTRET, 0);
        assert_ne!(status, 0);
        let message = state.to_string_value(-1).expect("error object should be a string");
        assert_eq!(message, "chunk:1: boom");
        state.pop(1);

        // The state is still usable after an error unwound past this pcall.
        state.load("return 1 + 1", "chunk2").expect("should compile");
        assert_eq!(state.pcall(0, MULTRET, 0), 0);
        assert_eq!(state.to_number(-1), Some(2.0));
    }

    #[test]
    fn numeric_for_both_directions() {
        let results = run("local s = 0\nfor i = 1, 10 do s = s + i end\nreturn s");
        assert_eq!(results[0], Value::Number(55.0));

        let results = run("local s = 0\nfor i = 10, 1, -1 do s = s + i end\nreturn s");
        assert_eq!(results[0], Value::Number(55.0));
    }

    #[test]
    fn upvalue_sharing_across_closures() {
        let results = run(
            r#"
            local function make()
                local x = 0
                return function() x = x + 1; return x end, function() return x end
            end
            local inc, get = make()
            inc(); inc()
            return get()
            "#,
        );
        assert_eq!(results[0], Value::Number(2.0));
    }

    #[test]
    fn rawget_rawset_round_trip() {
        let state = State::open();
        state.newtable();
        state.push_string("value");
        state.rawseti(-2, 1).expect("rawseti should succeed");
        state.rawgeti(-1, 1).expect("rawgeti should succeed");
        assert_eq!(state.to_string_value(-1).as_deref(), Some("value"));
    }

    #[test]
    fn gc_reclaims_ephemeral_strings() {
        let state = State::open();
        let baseline = state.strings().len();
        for i in 0..1000 {
            state.push_string(&format!("ephemeral-{i}"));
        }
        state.settop(0);
        state.collect_garbage();
        assert_eq!(state.strings().len(), baseline);
    }

    use std::sync::atomic::{AtomicBool, Ordering};

    static GC_RAN: AtomicBool = AtomicBool::new(false);

    fn gc_marker(_ctx: &mut dyn ember_value::NativeContext, _args: &[Value]) -> Result<Vec<Value>, Value> {
        GC_RAN.store(true, Ordering::SeqCst);
        Ok(vec![])
    }

    #[test]
    fn finalizer_runs_on_gc_for_userdata_with_gc_metamethod() {
        GC_RAN.store(false, Ordering::SeqCst);
        let state = State::open();
        state.push_userdata(42i32);
        state.newtable();
        state.push_cfunction(gc_marker, "gc_marker");
        state.setfield(-2, "__gc").expect("setfield should succeed");
        state.setmetatable(-1).expect("setmetatable should succeed");
        state.settop(0);
        state.collect_garbage();
        assert!(GC_RAN.load(Ordering::SeqCst));
    }
}
