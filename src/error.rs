//! Error types for eagle3-train.

use thiserror::Error;

/// Result type alias for eagle3-train operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for eagle3-train.
#[derive(Error, Debug)]
pub enum Error {
    /// Model loading failed.
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    /// HuggingFace Hub request failed.
    #[error("hub error: {0}")]
    Hub(String),

    /// Tokenization error.
    #[error("tokenization error: {0}")]
    Tokenization(String),

    /// Malformed dataset record.
    #[error("dataset error at line {line}: {message}")]
    Dataset { line: usize, message: String },

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Numeric failure while training.
    #[error("training error: {0}")]
    Training(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
