//! vx-file: Sound file decoding and caching for VoxMix
//!
//! Supported formats:
//! - WAV (via hound) - 8/16/24/32-bit int, 32-bit float
//! - FLAC, OGG Vorbis, MP3, AIFF (via symphonia)
//!
//! `SoundFileManager` owns the decoded data and hands out `SoundSource`s;
//! voices read them through `SoundFileReader` implementations.

mod error;
mod manager;
mod reader;

pub use error::*;
pub use manager::*;
pub use reader::*;
