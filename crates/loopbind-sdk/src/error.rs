//! Error types for the loopbind embedding ABI

/// Result type for ABI calls
pub type AbiResult<T> = Result<T, NativeError>;

/// Errors raised into the scripting runtime as exceptions.
///
/// Recoverable native failures (file not found, connection refused, ...) are
/// not represented here; those are returned as values following the
/// `nil, message, code` convention.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NativeError {
    /// Type mismatch during conversion
    #[error("expected {expected}, got {got}")]
    TypeMismatch {
        /// Expected type name
        expected: String,
        /// Actual type name
        got: String,
    },

    /// Invalid argument at a 1-based position
    #[error("bad argument #{index} ({message})")]
    ArgumentError {
        /// 1-based argument position
        index: usize,
        /// What was wrong with it
        message: String,
    },

    /// Operation on a handle or object in the wrong lifecycle state
    #[error("{0}")]
    Lifecycle(String),

    /// Script code raised an error inside a protected call
    #[error("{0}")]
    Runtime(String),

    /// The embedding could not allocate a new object
    #[error("not enough memory")]
    OutOfMemory,

    /// ABI operation failed
    #[error("{0}")]
    AbiError(String),
}

impl NativeError {
    /// Build an argument error for a 1-based position.
    pub fn argument(index: usize, message: impl Into<String>) -> Self {
        NativeError::ArgumentError {
            index,
            message: message.into(),
        }
    }
}

impl From<String> for NativeError {
    fn from(s: String) -> Self {
        NativeError::AbiError(s)
    }
}

impl From<&str> for NativeError {
    fn from(s: &str) -> Self {
        NativeError::AbiError(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argument_error_display() {
        let err = NativeError::argument(2, "expected callable, got number");
        assert_eq!(err.to_string(), "bad argument #2 (expected callable, got number)");
    }

    #[test]
    fn test_from_str() {
        let err: NativeError = "boom".into();
        assert_eq!(err, NativeError::AbiError("boom".to_string()));
    }
}
