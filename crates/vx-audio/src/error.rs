//! Audio device error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio device found")]
    NoDevice,

    #[error("Device index out of range: {0}")]
    DeviceNotFound(usize),

    #[error("Backend not initialized")]
    NotInitialized,

    #[error("No stream has been created")]
    NoStream,

    #[error("Failed to get device config: {0}")]
    ConfigError(String),

    #[error("Failed to build stream: {0}")]
    StreamBuildError(String),

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("Unsupported sample format: {0}")]
    UnsupportedFormat(String),

    #[error("Backend error: {0}")]
    BackendError(String),
}

pub type AudioResult<T> = Result<T, AudioError>;
