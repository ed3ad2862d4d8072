//! vx-core: Shared types for the VoxMix voice engine
//!
//! This crate provides the foundational pieces used by every other VoxMix crate:
//! - Generation-counted entity handles (voices, emitters, sound files)
//! - Linear ramp interpolation for dynamic parameters
//! - Sample format descriptions and conversion
//! - System configuration

mod config;
mod dynamic_param;
mod entity;
mod error;
mod sample;

pub use config::*;
pub use dynamic_param::*;
pub use entity::*;
pub use error::*;
pub use sample::*;

/// Sample type used throughout the mixing pipeline
pub type Sample = f32;
