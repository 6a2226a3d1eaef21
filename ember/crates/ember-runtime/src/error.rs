//! Runtime error kinds and formatting.
//!
//! Mirrors the error-handling design: every runtime error carries a kind, a
//! chunk name and a line, and formats as `"<chunk>:<line>: <message>"`. A
//! script-level error (raised by `error()`, or by an operation the VM can't
//! perform) is itself a [`ember_value::Value`] travelling up through
//! `pcall`'s recovery mechanism, not this type -- `RuntimeError` is the
//! Rust-level error `vm::call_value` returns when there is no active
//! protected call to hand the value to instead.

use ember_value::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum ErrorKind {
    Lex,
    Syntax,
    Runtime,
    Memory,
    /// An error was raised while already unwinding from another error
    /// (e.g. a `__gc` finalizer, or a message handler, itself errored).
    /// The data model calls this out as its own case because it can't be
    /// given the usual `pcall` treatment -- there is no enclosing
    /// protected frame left to hand a `Value` to.
    ErrorInErrorHandler,
}

/// A runtime error that propagated past every protected call on the frame
/// stack. Formats as `"<chunk>:<line>: <message>"` per the error-handling
/// design; `value` is the original Lua-level error object (usually a
/// string, but `error()` accepts any value).
#[derive(Debug, Error, Clone)]
#[error("{chunk}:{line}: {message}")]
pub struct RuntimeError {
    pub kind: ErrorKind,
    pub chunk: String,
    pub line: u32,
    pub message: String,
    pub value: Value,
}

impl RuntimeError {
    pub fn new(kind: ErrorKind, chunk: &str, line: u32, message: impl Into<String>) -> Self {
        RuntimeError {
            kind,
            chunk: chunk.to_string(),
            line,
            message: message.into(),
            value: Value::Nil, // replaced with the interned error string once the caller has heap access
        }
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = value;
        self
    }
}
