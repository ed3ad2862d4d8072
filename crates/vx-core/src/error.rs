//! Error types for VoxMix core

use thiserror::Error;

/// Core error type
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Unsupported sample format: {bits} bits ({kind})")]
    UnsupportedFormat { bits: u16, kind: &'static str },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias
pub type CoreResult<T> = Result<T, CoreError>;
