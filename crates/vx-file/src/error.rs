//! Sound file error types

use thiserror::Error;
use vx_core::CoreError;

#[derive(Error, Debug)]
pub enum FileError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid file: {0}")]
    InvalidFile(String),

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("WAV error: {0}")]
    WavError(String),

    #[error("Seek out of range: frame {0}")]
    SeekOutOfRange(i64),

    #[error("Invalid sound file handle")]
    InvalidHandle,

    #[error("Loader thread unavailable: {0}")]
    LoaderUnavailable(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

pub type FileResult<T> = Result<T, FileError>;

impl From<hound::Error> for FileError {
    fn from(err: hound::Error) -> Self {
        match err {
            hound::Error::IoError(e) => FileError::Io(e),
            hound::Error::Unsupported => FileError::UnsupportedFormat("WAV".into()),
            other => FileError::WavError(other.to_string()),
        }
    }
}

impl From<symphonia::core::errors::Error> for FileError {
    fn from(err: symphonia::core::errors::Error) -> Self {
        use symphonia::core::errors::Error;
        match err {
            Error::IoError(e) => FileError::Io(e),
            Error::Unsupported(what) => FileError::UnsupportedFormat(what.to_string()),
            other => FileError::DecodeError(other.to_string()),
        }
    }
}
