//! Callable objects: a compiled prototype plus its captured upvalues, or a
//! host-supplied native function.

use std::ptr::NonNull;

use ember_gc::{Gc, GcHeader, Heap, Trace};

use crate::prototype::Prototype;
use crate::string::{StringPool, WString};
use crate::upvalue::UpValue;
use crate::value::Value;

/// What a native function needs from the running `State` to do anything
/// beyond pure arithmetic on its arguments: allocate on the heap, intern a
/// string, or call back into a Lua value (a callback argument, a metatable
/// lookup). Defined here rather than taking `ember-runtime`'s `State`
/// directly so `ember-value` doesn't have to depend on its own downstream
/// consumer -- `ember-runtime` implements this trait once, on `State`.
pub trait NativeContext {
    fn heap(&self) -> &Heap;
    fn strings(&self) -> &StringPool;

    fn intern(&self, s: &str) -> Gc<WString> {
        self.strings().intern(self.heap(), s.as_bytes())
    }

    /// Calls `callee` with `args`, reentering the interpreter. Used by
    /// natives like `pcall` that must invoke a Lua value themselves rather
    /// than just operating on their own arguments.
    fn call_value(&mut self, callee: Value, args: Vec<Value>) -> Result<Vec<Value>, Value>;

    /// Chunk name and line of the call site that invoked this native, for
    /// natives like `error` that prefix a string message with position
    /// information the same way an internal runtime error does.
    fn position(&self) -> (String, u32) {
        (String::from("?"), 0)
    }
}

/// Host function signature. Arguments and results both travel through the
/// caller-supplied value stack window, matching the calling convention
/// used for script closures so the VM's `CALL` handling doesn't need two
/// code paths at the dispatch level -- only at the point where it decides
/// whether to push a new frame or invoke this directly.
pub type NativeFn = fn(ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Vec<Value>, Value>;

pub enum ClosureKind {
    Script {
        prototype: Gc<Prototype>,
        upvalues: Vec<Gc<UpValue>>,
    },
    Native {
        function: NativeFn,
        /// Native closures may also capture upvalues, but as plain values
        /// rather than cells into a Lua stack frame -- there is no frame.
        upvalues: Vec<Value>,
        name: &'static str,
    },
}

pub struct Closure {
    pub kind: ClosureKind,
}

impl Closure {
    pub fn new_script(prototype: Gc<Prototype>, upvalues: Vec<Gc<UpValue>>) -> Self {
        Closure {
            kind: ClosureKind::Script {
                prototype,
                upvalues,
            },
        }
    }

    pub fn new_native(function: NativeFn, name: &'static str, upvalues: Vec<Value>) -> Self {
        Closure {
            kind: ClosureKind::Native {
                function,
                upvalues,
                name,
            },
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self.kind, ClosureKind::Native { .. })
    }

    pub fn prototype(&self) -> Option<Gc<Prototype>> {
        match &self.kind {
            ClosureKind::Script { prototype, .. } => Some(*prototype),
            ClosureKind::Native { .. } => None,
        }
    }
}

impl Trace for Closure {
    fn trace(&self, push: &mut dyn FnMut(NonNull<GcHeader>)) {
        match &self.kind {
            ClosureKind::Script {
                prototype,
                upvalues,
            } => {
                push(prototype.header());
                for uv in upvalues {
                    push(uv.header());
                }
            }
            ClosureKind::Native { upvalues, .. } => {
                for v in upvalues {
                    crate::value::trace_value(v, push);
                }
            }
        }
    }
}
