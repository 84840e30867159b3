use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type for the Recall system.
///
/// Every fallible operation in the storage and vector crates returns this
/// type. Failures are never converted into empty or zero-valued results:
/// a caller either gets real data or one of these variants.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RecallError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingGeneration(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timed out after {after_ms}ms: {operation}")]
    Timeout { operation: String, after_ms: u64 },

    #[error("Worker pool saturated: {0}")]
    Saturated(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Coarse classification of a [`RecallError`].
///
/// Callers that only need to branch on the failure class (retry policy,
/// status mapping, health reports) match on this instead of the full error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    EmbeddingUnavailable,
    EmbeddingGenerationError,
    DimensionMismatch,
    StorageError,
    NotFound,
    Timeout,
    Saturated,
    Config,
    Io,
    Serialization,
}

impl RecallError {
    /// Return the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RecallError::InvalidInput(_) => ErrorKind::InvalidInput,
            RecallError::EmbeddingUnavailable(_) => ErrorKind::EmbeddingUnavailable,
            RecallError::EmbeddingGeneration(_) => ErrorKind::EmbeddingGenerationError,
            RecallError::DimensionMismatch { .. } => ErrorKind::DimensionMismatch,
            RecallError::Storage(_) => ErrorKind::StorageError,
            RecallError::NotFound(_) => ErrorKind::NotFound,
            RecallError::Timeout { .. } => ErrorKind::Timeout,
            RecallError::Saturated(_) => ErrorKind::Saturated,
            RecallError::Config(_) => ErrorKind::Config,
            RecallError::Io(_) => ErrorKind::Io,
            RecallError::Serialization(_) => ErrorKind::Serialization,
        }
    }
}

impl From<toml::de::Error> for RecallError {
    fn from(err: toml::de::Error) -> Self {
        RecallError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for RecallError {
    fn from(err: toml::ser::Error) -> Self {
        RecallError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for RecallError {
    fn from(err: serde_json::Error) -> Self {
        RecallError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Recall operations.
pub type Result<T> = std::result::Result<T, RecallError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RecallError::InvalidInput("empty text".to_string());
        assert_eq!(err.to_string(), "Invalid input: empty text");
    }

    #[test]
    fn test_dimension_mismatch_display() {
        let err = RecallError::DimensionMismatch {
            expected: 384,
            actual: 3,
        };
        assert_eq!(err.to_string(), "Dimension mismatch: expected 384, got 3");
    }

    #[test]
    fn test_timeout_display() {
        let err = RecallError::Timeout {
            operation: "embed".to_string(),
            after_ms: 250,
        };
        assert_eq!(err.to_string(), "Timed out after 250ms: embed");
    }

    #[test]
    fn test_kind_mapping() {
        let cases: Vec<(RecallError, ErrorKind)> = vec![
            (RecallError::InvalidInput("x".into()), ErrorKind::InvalidInput),
            (
                RecallError::EmbeddingUnavailable("x".into()),
                ErrorKind::EmbeddingUnavailable,
            ),
            (
                RecallError::EmbeddingGeneration("x".into()),
                ErrorKind::EmbeddingGenerationError,
            ),
            (
                RecallError::DimensionMismatch {
                    expected: 1,
                    actual: 2,
                },
                ErrorKind::DimensionMismatch,
            ),
            (RecallError::Storage("x".into()), ErrorKind::StorageError),
            (RecallError::NotFound("x".into()), ErrorKind::NotFound),
            (
                RecallError::Timeout {
                    operation: "x".into(),
                    after_ms: 1,
                },
                ErrorKind::Timeout,
            ),
            (RecallError::Saturated("x".into()), ErrorKind::Saturated),
            (RecallError::Config("x".into()), ErrorKind::Config),
            (
                RecallError::Serialization("x".into()),
                ErrorKind::Serialization,
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.kind(), expected, "wrong kind for {}", error);
        }
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: RecallError = io_err.into();
        assert!(matches!(err, RecallError::Io(_)));
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_error_from_toml_de() {
        let err: std::result::Result<toml::Value, _> = toml::from_str("invalid = [[[");
        let recall_err: RecallError = err.unwrap_err().into();
        assert!(matches!(recall_err, RecallError::Config(_)));
    }

    #[test]
    fn test_error_from_serde_json() {
        let err: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope }");
        let recall_err: RecallError = err.unwrap_err().into();
        assert!(matches!(recall_err, RecallError::Serialization(_)));
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::EmbeddingGenerationError).unwrap();
        assert_eq!(json, "\"embedding_generation_error\"");
    }

    #[test]
    fn test_result_type_with_question_mark() {
        fn inner() -> Result<String> {
            let io_result: std::result::Result<i32, std::io::Error> = Ok(42);
            let value = io_result?;
            Ok(value.to_string())
        }

        assert_eq!(inner().unwrap(), "42");
    }
}
