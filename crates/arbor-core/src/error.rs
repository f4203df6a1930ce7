use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while loading data, building vocabularies, or
/// driving a training run.
#[derive(Debug, Error)]
pub enum ArborError {
    /// A required option is missing, out of range, or inconsistent with another option.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Training or dev data for the requested treebank is not available.
    #[error("no data available: {0}")]
    DataUnavailable(String),

    /// A file that the operation cannot proceed without does not exist.
    #[error("resource not found: {}", .0.display())]
    ResourceNotFound(PathBuf),

    /// An input file is malformed.
    #[error("{}:{line}: {message}", path.display())]
    Format {
        /// The file being read.
        path: PathBuf,
        /// One-based line number of the offending row.
        line: usize,
        /// What was wrong with the row.
        message: String,
    },

    /// A batch was encoded with a vocabulary different from the trainer's.
    #[error("vocabulary mismatch: expected fingerprint {expected:016x}, got {actual:016x}")]
    VocabMismatch {
        /// Fingerprint of the trainer's vocabulary.
        expected: u64,
        /// Fingerprint of the vocabulary the batch was encoded with.
        actual: u64,
    },

    /// The secondary optimizer was requested after the switch already happened.
    #[error("optimizer already switched to {0}")]
    OptimizerAlreadySwitched(String),

    /// Numeric backend failure.
    #[error("model error: {0}")]
    Model(String),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Safetensors (de)serialization failure.
    #[error("safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),
}

impl ArborError {
    /// Shorthand for building a [`ArborError::Format`].
    pub fn format(path: impl Into<PathBuf>, line: usize, message: impl Into<String>) -> Self {
        ArborError::Format {
            path: path.into(),
            line,
            message: message.into(),
        }
    }
}

/// Result type alias for arbor operations.
pub type Result<T> = std::result::Result<T, ArborError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = ArborError::Configuration("charlm_shorthand is required".into());
        assert_eq!(
            err.to_string(),
            "configuration error: charlm_shorthand is required"
        );

        let err = ArborError::format("dev.conllu", 12, "expected 10 columns, found 3");
        assert_eq!(err.to_string(), "dev.conllu:12: expected 10 columns, found 3");

        let err = ArborError::VocabMismatch {
            expected: 1,
            actual: 2,
        };
        assert!(err.to_string().contains("0000000000000001"));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ArborError>();
    }
}
