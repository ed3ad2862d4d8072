//! vx-audio: Device backends for the VoxMix mixer
//!
//! The voice engine only needs a device that can open a stream and call it
//! back with fixed-size blocks. This crate defines that contract and provides
//! two implementations:
//!
//! ```text
//! ┌──────────────┐     ┌───────────────┐     ┌─────────────┐
//! │ VoiceMixer   │◀────│ DeviceBackend │────▶│ cpal Device │
//! │ (callback)   │     │               │     │             │
//! │              │     │ CpalBackend   │     │  or         │
//! │              │     │ NullBackend   │────▶│ timer thread│
//! └──────────────┘     └───────────────┘     └─────────────┘
//! ```
//!
//! `open_backend` tries the platform device and falls back to the silent
//! `NullBackend`, so a missing or broken device never takes the host down.

mod device;
mod error;
mod null;
mod stream;

pub use device::*;
pub use error::*;
pub use null::*;
pub use stream::*;

use vx_core::SampleFormat;

// ═══════════════════════════════════════════════════════════════════════════════
// SPEAKERS
// ═══════════════════════════════════════════════════════════════════════════════

/// Speaker positions in channel order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Speaker {
    FrontLeft,
    FrontRight,
    FrontCenter,
    LowFrequency,
    BackLeft,
    BackRight,
    SideLeft,
    SideRight,
    Unknown,
}

/// Conventional speaker layout for a channel count
pub fn speaker_layout(channels: usize) -> Vec<Speaker> {
    use Speaker::*;
    match channels {
        1 => vec![FrontCenter],
        2 => vec![FrontLeft, FrontRight],
        4 => vec![FrontLeft, FrontRight, BackLeft, BackRight],
        6 => vec![FrontLeft, FrontRight, FrontCenter, LowFrequency, BackLeft, BackRight],
        8 => vec![
            FrontLeft,
            FrontRight,
            FrontCenter,
            LowFrequency,
            BackLeft,
            BackRight,
            SideLeft,
            SideRight,
        ],
        n => (0..n)
            .map(|i| match i {
                0 => FrontLeft,
                1 => FrontRight,
                _ => Unknown,
            })
            .collect(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CALLBACK CONTRACT
// ═══════════════════════════════════════════════════════════════════════════════

/// Output device description
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub is_default: bool,
    pub channels: usize,
    pub frame_rate: u32,
    pub speakers: Vec<Speaker>,
    pub native_format: SampleFormat,
}

/// Stream status flags reported to the callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamStatus(u32);

impl StreamStatus {
    pub const NONE: Self = Self(0);
    /// The device dropped output (the callback ran late)
    pub const OUTPUT_UNDERFLOW: Self = Self(1 << 0);
    /// The device reported more output than it could consume
    pub const OUTPUT_OVERFLOW: Self = Self(1 << 1);

    #[inline]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for StreamStatus {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for StreamStatus {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Everything the mixer gets per hardware block
pub struct CallbackInfo<'a> {
    /// Interleaved output, `block_size_frames * num_channels` samples, pre-zeroed
    pub output: &'a mut [f32],
    pub frame_rate: u32,
    pub num_channels: usize,
    pub speakers: &'a [Speaker],
    /// Seconds of audio delivered before this block
    pub stream_time: f64,
    pub status: StreamStatus,
}

impl CallbackInfo<'_> {
    /// Frames in this block
    #[inline]
    pub fn num_frames(&self) -> usize {
        if self.num_channels == 0 {
            0
        } else {
            self.output.len() / self.num_channels
        }
    }
}

/// Hardware callback; returning `false` makes the backend output silence for the block
pub type AudioCallback = Box<dyn FnMut(&mut CallbackInfo<'_>) -> bool + Send + 'static>;

/// Stream creation parameters
pub struct StreamParams {
    /// Output device (`None` = default device)
    pub device_index: Option<usize>,
    pub block_size_frames: usize,
    pub callback: AudioCallback,
}

/// Platform device contract used by the engine
pub trait DeviceBackend {
    /// Backend name for logging
    fn name(&self) -> &str;

    fn initialize(&mut self) -> AudioResult<()>;

    fn output_device_count(&self) -> usize;

    fn output_device_info(&self, index: Option<usize>) -> AudioResult<DeviceInfo>;

    fn create_stream(&mut self, params: StreamParams) -> AudioResult<()>;

    fn start_stream(&mut self) -> AudioResult<()>;

    fn stop_stream(&mut self) -> AudioResult<()>;

    /// Tear the stream down; the callback is dropped
    fn shutdown_stream(&mut self) -> AudioResult<()>;

    fn is_running(&self) -> bool;

    /// Info for the device the current stream was opened on
    fn stream_info(&self) -> Option<&DeviceInfo>;
}

/// Open the platform device, falling back to the silent device on failure
///
/// The returned backend already has its stream created but not started.
pub fn open_backend(
    device_index: Option<usize>,
    block_size_frames: usize,
    make_callback: impl Fn() -> AudioCallback,
) -> Box<dyn DeviceBackend> {
    let mut cpal_backend = CpalBackend::new();
    let opened = cpal_backend.initialize().and_then(|_| {
        cpal_backend.create_stream(StreamParams {
            device_index,
            block_size_frames,
            callback: make_callback(),
        })
    });

    match opened {
        Ok(()) => Box::new(cpal_backend),
        Err(e) => {
            log::warn!("Failed to open audio device: {}. Falling back to silent output.", e);
            let mut null = NullBackend::new();
            // The null device cannot fail to open
            let _ = null.initialize();
            let _ = null.create_stream(StreamParams {
                device_index: None,
                block_size_frames,
                callback: make_callback(),
            });
            Box::new(null)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speaker_layouts() {
        assert_eq!(speaker_layout(2), vec![Speaker::FrontLeft, Speaker::FrontRight]);
        assert_eq!(speaker_layout(6).len(), 6);
        assert_eq!(speaker_layout(3)[2], Speaker::Unknown);
    }

    #[test]
    fn test_status_flags() {
        let mut status = StreamStatus::NONE;
        assert!(status.is_empty());
        status |= StreamStatus::OUTPUT_OVERFLOW;
        assert!(status.contains(StreamStatus::OUTPUT_OVERFLOW));
        assert!(!status.contains(StreamStatus::OUTPUT_UNDERFLOW));
        assert!(!status.contains(StreamStatus::NONE));
        assert_eq!(StreamStatus::from_bits(status.bits()), status);
    }
}
