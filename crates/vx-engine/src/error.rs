//! Engine error types

use thiserror::Error;

use vx_audio::AudioError;
use vx_core::CoreError;
use vx_file::FileError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid sound file: {0}")]
    InvalidSoundFile(String),

    #[error("Invalid voice handle")]
    InvalidVoice,

    #[error("Invalid emitter handle")]
    InvalidEmitter,

    #[error("Voice handle space exhausted")]
    HandlesExhausted,

    #[error("Unsupported channel count: {0}")]
    UnsupportedChannelCount(usize),

    #[error("Failed to spawn thread '{name}': {reason}")]
    ThreadSpawn { name: &'static str, reason: String },

    #[error("Audio system is shut down")]
    ShutDown,

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error(transparent)]
    File(#[from] FileError),
}

pub type EngineResult<T> = Result<T, EngineError>;
