//! # Error Handling
//!
//! Error types for Kura operations.
//!
//! ## Design Principles
//!
//! 1. **Actionable**: Every error should guide the caller toward resolution
//! 2. **Contextual**: Errors include relevant context (names, paths, limits)
//! 3. **Read paths stay cheap**: misses and denials on the lookup path are
//!    reported as `None`, not as errors; only genuine failures surface here

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for Kura operations
pub type Result<T> = std::result::Result<T, Error>;

/// Primary error type for Kura
#[derive(Error, Debug)]
pub enum Error {
    #[error("property store is not initialized")]
    NotInitialized,

    #[error("property name \"{name}\" is too long (limit {limit})")]
    NameTooLong { name: String, limit: usize },

    #[error("malformed property name \"{name}\"")]
    InvalidName { name: String },

    #[error("value for \"{name}\" is too long ({len} bytes, limit {limit})")]
    ValueTooLong { name: String, len: usize, limit: usize },

    #[error("access denied for \"{name}\"")]
    Denied { name: String },

    #[error("failed to map {path}: {message}")]
    MapFailure { path: PathBuf, message: String },

    #[error("property area is out of space")]
    AllocExhausted,

    #[error("property \"{name}\" is read-only")]
    ReadOnly { name: String },

    #[error("property service did not respond within {timeout_ms}ms")]
    ProtocolTimeout { timeout_ms: u64 },

    #[error("property service protocol error: {message}")]
    Protocol { message: String },

    #[error("failed to apply label \"{label}\" to {path}: {message}")]
    LabelApplyFailure { label: String, path: PathBuf, message: String },

    #[error("IO error: {message}")]
    Io { message: String, source: std::io::Error },
}

impl Error {
    /// Get error code for monitoring
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::NotInitialized => "NOT_INITIALIZED",
            Error::NameTooLong { .. } => "NAME_TOO_LONG",
            Error::InvalidName { .. } => "INVALID_NAME",
            Error::ValueTooLong { .. } => "VALUE_TOO_LONG",
            Error::Denied { .. } => "DENIED",
            Error::MapFailure { .. } => "MAP_FAILURE",
            Error::AllocExhausted => "ALLOC_EXHAUSTED",
            Error::ReadOnly { .. } => "READ_ONLY",
            Error::ProtocolTimeout { .. } => "PROTOCOL_TIMEOUT",
            Error::Protocol { .. } => "PROTOCOL_ERROR",
            Error::LabelApplyFailure { .. } => "LABEL_APPLY_FAILURE",
            Error::Io { .. } => "IO_ERROR",
        }
    }

    /// Check if the operation may succeed on retry
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::ProtocolTimeout { .. } => true,
            Error::Denied { .. } => true,
            Error::AllocExhausted => false,
            Error::MapFailure { .. } => false,
            Error::Io { .. } => false,
            _ => false,
        }
    }
}

// Conversion from std::io::Error
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        let err = Error::ValueTooLong {
            name: "sys.x".to_string(),
            len: 200,
            limit: 92,
        };
        assert_eq!(err.error_code(), "VALUE_TOO_LONG");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn io_conversion_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err: Error = io.into();
        assert_eq!(err.error_code(), "IO_ERROR");
    }
}
