//! Audio system configuration
//!
//! One owned `AudioSystemConfig` is built at startup and passed down to every
//! subsystem. It can be loaded from JSON; missing fields take their defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{CoreError, CoreResult, DEFAULT_MIN_FREE_INDICES};

/// Sound file cache policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoundFileCacheConfig {
    /// Seconds an unreferenced entry may sit idle before it is flushed
    pub flush_time_threshold_secs: f64,
    /// Loaded-bytes budget; unreferenced entries are evicted LRU-first above it
    pub target_memory_limit_bytes: usize,
}

impl Default for SoundFileCacheConfig {
    fn default() -> Self {
        Self {
            flush_time_threshold_secs: 30.0,
            target_memory_limit_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Distance attenuation for spatialized voices
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttenuationConfig {
    /// Full volume inside this distance
    pub min_distance: f32,
    /// Silent beyond this distance
    pub max_distance: f32,
}

impl Default for AttenuationConfig {
    fn default() -> Self {
        Self {
            min_distance: 1.0,
            max_distance: 100.0,
        }
    }
}

/// Top-level configuration for the voice engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSystemConfig {
    /// Real (decoded and mixed) voice slots
    pub max_voices: usize,
    /// Virtual (tracked but silent) voice slots
    pub max_virtual_voices: usize,
    /// Control thread tick period in milliseconds
    pub control_tick_ms: u64,
    /// Hardware block size in frames
    pub block_size_frames: usize,
    /// Output device index (`None` selects the default device)
    pub device_index: Option<usize>,
    /// Free handle reserve before indices are recycled
    pub min_free_handles: usize,
    /// Capacity of the lock-free part of each command queue
    pub command_queue_capacity: usize,
    /// How long shutdown waits for worker threads
    pub shutdown_timeout_ms: u64,
    /// Per-voice ring size for streamed sound files, in frames
    pub stream_ring_frames: usize,
    pub sound_file_cache: SoundFileCacheConfig,
    pub attenuation: AttenuationConfig,
}

impl Default for AudioSystemConfig {
    fn default() -> Self {
        Self {
            max_voices: 32,
            max_virtual_voices: 1000,
            control_tick_ms: 33,
            block_size_frames: 1024,
            device_index: None,
            min_free_handles: DEFAULT_MIN_FREE_INDICES,
            command_queue_capacity: 4096,
            shutdown_timeout_ms: 2000,
            stream_ring_frames: 16384,
            sound_file_cache: SoundFileCacheConfig::default(),
            attenuation: AttenuationConfig::default(),
        }
    }
}

impl AudioSystemConfig {
    /// Parse a JSON document
    pub fn from_json_str(json: &str) -> CoreResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_json_str(&text)?;
        log::info!(
            "Loaded audio config from {} ({} real / {} virtual voices)",
            path.as_ref().display(),
            config.max_voices,
            config.max_virtual_voices
        );
        Ok(config)
    }

    pub fn to_json_string(&self) -> CoreResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Total parallel-array size (real + virtual slots)
    pub fn total_voice_slots(&self) -> usize {
        self.max_voices + self.max_virtual_voices
    }

    /// Control tick period in seconds
    pub fn control_tick_secs(&self) -> f64 {
        self.control_tick_ms as f64 / 1000.0
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.max_voices == 0 {
            return Err(CoreError::InvalidConfig("max_voices must be > 0".into()));
        }
        if self.control_tick_ms == 0 {
            return Err(CoreError::InvalidConfig("control_tick_ms must be > 0".into()));
        }
        if self.block_size_frames == 0 {
            return Err(CoreError::InvalidConfig(
                "block_size_frames must be > 0".into(),
            ));
        }
        if self.command_queue_capacity == 0 {
            return Err(CoreError::InvalidConfig(
                "command_queue_capacity must be > 0".into(),
            ));
        }
        if self.stream_ring_frames < self.block_size_frames {
            return Err(CoreError::InvalidConfig(format!(
                "stream_ring_frames ({}) must hold at least one block ({})",
                self.stream_ring_frames, self.block_size_frames
            )));
        }
        if self.attenuation.max_distance <= self.attenuation.min_distance {
            return Err(CoreError::InvalidConfig(
                "attenuation.max_distance must exceed min_distance".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AudioSystemConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.total_voice_slots(), 1032);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config =
            AudioSystemConfig::from_json_str(r#"{ "max_voices": 8, "max_virtual_voices": 0 }"#)
                .unwrap();
        assert_eq!(config.max_voices, 8);
        assert_eq!(config.max_virtual_voices, 0);
        assert_eq!(config.control_tick_ms, 33);
        assert_eq!(config.sound_file_cache, SoundFileCacheConfig::default());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = AudioSystemConfig::from_json_str(r#"{ "max_voices": 0 }"#).unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));

        let err = AudioSystemConfig::from_json_str("not json").unwrap_err();
        assert!(matches!(err, CoreError::Serialization(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audio.json");

        let mut config = AudioSystemConfig::default();
        config.max_voices = 16;
        config.sound_file_cache.flush_time_threshold_secs = 5.0;
        std::fs::write(&path, config.to_json_string().unwrap()).unwrap();

        let loaded = AudioSystemConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
