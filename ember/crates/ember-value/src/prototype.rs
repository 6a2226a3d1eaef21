//! The immutable compiled form of a function definition.

use std::ptr::NonNull;

use ember_gc::{Gc, GcHeader, Trace};

use crate::instruction::Instruction;
use crate::value::{trace_value, Value};

/// Where a closure's upvalue comes from when the closure is instantiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpvalSource {
    /// Captures a local register of the function that contains this
    /// prototype's `CLOSURE` instruction.
    ParentLocal(u32),
    /// Captures one of the enclosing function's own upvalues.
    ParentUpvalue(u32),
}

#[derive(Debug, Clone)]
pub struct UpvalDesc {
    pub name: String,
    pub source: UpvalSource,
}

/// An immutable compiled function, attached to the heap once
/// `Function_CreatePrototype`-equivalent finalization runs in the parser.
pub struct Prototype {
    pub num_params: u8,
    pub is_vararg: bool,
    pub max_stack_size: u8,
    pub code: Vec<Instruction>,
    pub constants: Vec<Value>,
    pub prototypes: Vec<Gc<Prototype>>,
    pub upvalues: Vec<UpvalDesc>,
    /// Source line number per instruction, same length as `code`, used to
    /// format `"<chunk>:<line>: <message>"` runtime errors.
    pub line_info: Vec<u32>,
    pub source_name: String,
}

impl Prototype {
    pub fn instruction_line(&self, ip: usize) -> u32 {
        self.line_info.get(ip).copied().unwrap_or(0)
    }
}

impl Trace for Prototype {
    fn trace(&self, push: &mut dyn FnMut(NonNull<GcHeader>)) {
        for constant in &self.constants {
            trace_value(constant, push);
        }
        for nested in &self.prototypes {
            push(nested.header());
        }
    }
}
