use thiserror::Error;

/// Errors raised by the collector itself, as distinct from errors the
/// embedding VM raises when a script runs out of memory at the language
/// level (those are reported through `ember-runtime`, not here).
#[derive(Debug, Error)]
pub enum GcError {
    #[error("out of memory: requested {requested} bytes, {allocated} bytes already live")]
    OutOfMemory { requested: usize, allocated: usize },

    #[error("heap initialization failed: {0}")]
    HeapInitialization(String),

    #[error("invalid root handle: {0:#x}")]
    InvalidRoot(usize),

    #[error("collection cycle failed: {0}")]
    CycleFailed(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    #[error("bounds check failed: index {index} out of bounds for length {length}")]
    BoundsCheckFailed { index: usize, length: usize },
}

impl GcError {
    /// Whether the embedding VM can plausibly recover (e.g. by reporting a
    /// Lua-level error to the script) rather than aborting the process.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, GcError::OutOfMemory { .. })
    }

    /// Whether this indicates a bug in the collector or its caller, as
    /// opposed to an environmental condition like memory pressure.
    pub fn is_bug(&self) -> bool {
        matches!(
            self,
            GcError::InvalidRoot(_)
                | GcError::InvalidState { .. }
                | GcError::BoundsCheckFailed { .. }
                | GcError::Internal(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, GcError>;
