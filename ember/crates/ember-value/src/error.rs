use thiserror::Error;

/// Errors raised by the value model itself: malformed keys, type errors at
/// the raw-operation level. Higher-level "attempt to X a Y value" runtime
/// errors with source:line context are formatted by `ember-runtime`; this
/// enum is the underlying cause it wraps.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValueError {
    #[error("table index is NaN")]
    NaNKey,

    #[error("table index is nil")]
    NilKey,

    #[error("attempt to compare two incompatible values")]
    Incomparable,

    #[error("string length exceeds maximum supported size")]
    StringTooLong,
}

pub type Result<T> = std::result::Result<T, ValueError>;
