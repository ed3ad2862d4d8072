//! vx-engine: Voice lifecycle and mixing core
//!
//! Turns "play this sound" requests into a priority-managed stream of mixed
//! audio:
//! - Admission and stealing against fixed real and virtual voice pools
//! - Per-tick rebalancing by weighted priority
//! - Ramped pitch and volume with fades
//! - Lock-free mixer running in the hardware callback
//! - Streamed sources fed by a decode worker
//!
//! ```text
//!  main thread          control thread              hardware callback
//!  ───────────          ──────────────              ─────────────────
//!  AudioSystem ──cmd──▶ VoiceManager ──MixerCommand──▶ VoiceMixer
//!       ▲                 │    ▲                          │
//!       └──notification───┘    └────────MixerEvent────────┘
//! ```

// Mixer lanes and slots use explicit indexing
#![allow(clippy::needless_range_loop)]
// Voice start parameters travel together
#![allow(clippy::too_many_arguments)]

mod control;
mod decode;
mod emitter;
mod error;
mod mixer;
mod pitch;
mod queue;
mod src;
mod system;
mod voice_manager;
mod volume;

pub use decode::*;
pub use emitter::*;
pub use error::*;
pub use mixer::*;
pub use pitch::*;
pub use queue::*;
pub use src::*;
pub use system::*;
pub use voice_manager::*;
pub use volume::*;

pub use vx_core::{AudioSystemConfig, EmitterHandle, Handle, SoundFileHandle, VoiceHandle};
pub use vx_file::{LoadMode, SoundFileState, SoundSource};
