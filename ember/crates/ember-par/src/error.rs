//! Compile-time error signaling.
//!
//! Per the error-handling design, a lexical or syntactic error aborts the
//! whole `load`/`compile` call -- there is no panic-mode statement recovery.
//! The human-readable message is reported to the [`ember_util::Handler`] at
//! the point of detection; [`ParseAbort`] only carries enough information to
//! unwind the recursive-descent call stack back to [`crate::compile`] via
//! `?`, so the parser's control flow stays visible in its return types
//! instead of relying on panics.

/// Sentinel propagated with `?` once a diagnostic has already been emitted.
#[derive(Debug, Clone, Copy)]
pub struct ParseAbort;

pub type PResult<T> = Result<T, ParseAbort>;

/// Returned by [`crate::compile`] when compilation failed. The actual
/// message(s) are already in the `Handler` passed to `compile`; this is
/// just a status marker for the caller (mirrors the embedding API's
/// `load` returning a status alongside a pushed error value).
#[derive(Debug, Clone, Copy)]
pub struct CompileError;
