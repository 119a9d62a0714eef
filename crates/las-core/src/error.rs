//! Error types for the LAS workspace.

use thiserror::Error;

/// Main error type for LAS operations.
#[derive(Error, Debug)]
pub enum LasError {
    /// Audio loading and feature extraction errors.
    #[error("Audio error: {0}")]
    Audio(String),

    /// Configuration errors (unsupported attention/cell names, bad sizes).
    ///
    /// Raised at construction time, before any decode call can run.
    #[error("Config error: {0}")]
    Config(String),

    /// Invalid call arguments for a single decode call.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Model loading errors.
    #[error("Model error: {0}")]
    Model(String),

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle tensor errors.
    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    /// JSON parsing errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for LAS operations.
pub type LasResult<T> = Result<T, LasError>;
