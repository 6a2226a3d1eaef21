//! Error handling module for the `ember` CLI.
//!
//! This module provides custom error types using `thiserror` for structured
//! error handling throughout the application.

use thiserror::Error;

/// Main error type for the `ember` CLI application.
#[derive(Error, Debug)]
pub enum EmberToolError {
    /// A script failed to load (lex/syntax error) or raised an error past
    /// every protected call while running.
    #[error("{0}")]
    Script(String),

    /// Error when IO operations fail (reading a script file, REPL input).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error when logging initialization fails.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias using `EmberToolError`.
pub type Result<T> = std::result::Result<T, EmberToolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_error_display() {
        let err = EmberToolError::Script("chunk:3: boom".to_string());
        assert_eq!(err.to_string(), "chunk:3: boom");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let tool_err: EmberToolError = io_err.into();
        assert!(matches!(tool_err, EmberToolError::Io(_)));
    }
}
