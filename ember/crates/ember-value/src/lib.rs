//! Tagged values, interned strings, hybrid tables, and compiled function
//! prototypes -- the object graph `ember-runtime` executes against.
//!
//! Every reference-typed variant of [`Value`] is a [`ember_gc::Gc`]
//! pointer into a heap owned by the embedding `State`. This crate defines
//! the shapes and their [`ember_gc::Trace`] impls; it holds no heap of its
//! own and no notion of bytecode dispatch -- those belong to `ember-par`
//! and `ember-runtime` respectively.

pub mod closure;
pub mod error;
pub mod instruction;
pub mod prototype;
pub mod string;
pub mod table;
pub mod upvalue;
pub mod userdata;
pub mod value;

pub use closure::{Closure, ClosureKind, NativeContext, NativeFn};
pub use error::{Result, ValueError};
pub use instruction::{
    encode_rk_constant, is_rk_constant, rk_constant_index, Instruction, Opcode, MAX_RK_INDEX,
};
pub use prototype::{Prototype, UpvalDesc, UpvalSource};
pub use string::{StringPool, WString};
pub use table::Table;
pub use upvalue::{UpValue, UpValueState};
pub use userdata::UserData;
pub use value::Value;
