//! ember-util - Core Utilities and Foundation Types
//!
//! ============================================================================
//! MODULE OVERVIEW
//! ============================================================================
//!
//! This crate provides fundamental utilities shared by every stage of the
//! `ember` toolchain -- lexer, parser/compiler, GC, value representation and
//! runtime. These utilities are designed to be zero-cost abstractions that
//! improve code clarity, type safety, and performance without runtime
//! overhead.
//!
//! DESIGN PRINCIPLES:
//! ------------------
//! 1. ZERO-COST ABSTRACTIONS
//!    All utilities compile down to efficient code with no runtime penalty
//!    compared to hand-written implementations.
//!
//! 2. TYPE SAFETY
//!    Leverage Rust's type system to prevent bugs at compile time.
//!    Examples: typed indices prevent mixing different ID spaces.
//!
//! 3. ERGONOMICS
//!    APIs should be intuitive and easy to use correctly.
//!
//! ============================================================================
//! TYPED INDEX PATTERN
//! ============================================================================
//!
//! A compiler or VM juggles multiple index spaces -- register numbers,
//! constant-table slots, instruction offsets. Using raw `usize`/`u32` for all
//! of these is error-prone: nothing stops a constant index from being used
//! where a register index was meant. [`index_vec::IndexVec`] pairs a `Vec<T>`
//! with a newtype index so the compiler catches the mix-up instead of a
//! runtime panic finding it.

pub mod diagnostic;
pub mod index_vec;
pub mod span;

mod error;

pub use diagnostic::{Diagnostic, DiagnosticBuilder, DiagnosticCode, Handler, Level, SourceSnippet};
pub use error::{DiagnosticError, IndexVecError, SourceMapError};
pub use index_vec::{Idx, IndexVec};
pub use span::{FileId, SourceFile, SourceMap, Span};
