//! Gateway error types
//!
//! Unified error handling across the gateway crates.

/// Top-level error type for gateway operations.
///
/// Crate-specific errors (backend, hub) are converted to string variants at
/// the crate border; the inner detail is preserved in the message.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Server not prepared")]
    NotPrepared,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using `RelayError`.
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = RelayError::Backend("connection refused".into());
        assert_eq!(err.to_string(), "Backend error: connection refused");
    }
}
