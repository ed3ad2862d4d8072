//! Silent fallback device
//!
//! Drives the engine callback from a timer thread at the block rate of a
//! virtual stereo 48 kHz device, discarding the output.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use vx_core::SampleFormat;

use crate::{
    AudioCallback, AudioError, AudioResult, CallbackInfo, DeviceBackend, DeviceInfo,
    StreamParams, StreamStatus, speaker_layout,
};

/// Frame rate of the virtual device
pub const NULL_DEVICE_FRAME_RATE: u32 = 48_000;
/// Channel count of the virtual device
pub const NULL_DEVICE_CHANNELS: usize = 2;

struct NullStream {
    callback: Arc<Mutex<AudioCallback>>,
    block_size_frames: usize,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

/// Backend that renders into a discarded buffer on a timer
pub struct NullBackend {
    info: DeviceInfo,
    initialized: bool,
    stream: Option<NullStream>,
}

impl NullBackend {
    pub fn new() -> Self {
        Self {
            info: DeviceInfo {
                name: "Null Output".to_string(),
                is_default: true,
                channels: NULL_DEVICE_CHANNELS,
                frame_rate: NULL_DEVICE_FRAME_RATE,
                speakers: speaker_layout(NULL_DEVICE_CHANNELS),
                native_format: SampleFormat::F32,
            },
            initialized: false,
            stream: None,
        }
    }
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceBackend for NullBackend {
    fn name(&self) -> &str {
        "null"
    }

    fn initialize(&mut self) -> AudioResult<()> {
        self.initialized = true;
        Ok(())
    }

    fn output_device_count(&self) -> usize {
        1
    }

    fn output_device_info(&self, index: Option<usize>) -> AudioResult<DeviceInfo> {
        if !self.initialized {
            return Err(AudioError::NotInitialized);
        }
        match index {
            None | Some(0) => Ok(self.info.clone()),
            Some(i) => Err(AudioError::DeviceNotFound(i)),
        }
    }

    fn create_stream(&mut self, params: StreamParams) -> AudioResult<()> {
        if !self.initialized {
            return Err(AudioError::NotInitialized);
        }
        if params.block_size_frames == 0 {
            return Err(AudioError::ConfigError("block size must be > 0".into()));
        }
        self.shutdown_stream()?;

        self.stream = Some(NullStream {
            callback: Arc::new(Mutex::new(params.callback)),
            block_size_frames: params.block_size_frames,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        });
        log::info!(
            "Null output: {} ch @ {} Hz, {} frame blocks",
            self.info.channels,
            self.info.frame_rate,
            params.block_size_frames
        );
        Ok(())
    }

    fn start_stream(&mut self) -> AudioResult<()> {
        let stream = self.stream.as_mut().ok_or(AudioError::NoStream)?;
        if stream.thread.is_some() {
            return Ok(());
        }

        stream.running.store(true, Ordering::Release);
        let running = Arc::clone(&stream.running);
        let callback = Arc::clone(&stream.callback);
        let block_size_frames = stream.block_size_frames;
        let channels = self.info.channels;
        let frame_rate = self.info.frame_rate;
        let speakers = self.info.speakers.clone();

        let thread = std::thread::Builder::new()
            .name("vx-null-device".into())
            .spawn(move || {
                let mut buffer = vec![0.0f32; block_size_frames * channels];
                let block_duration =
                    Duration::from_secs_f64(block_size_frames as f64 / frame_rate as f64);
                let mut frames_rendered: u64 = 0;
                let mut deadline = Instant::now();

                while running.load(Ordering::Acquire) {
                    buffer.fill(0.0);
                    let mut info = CallbackInfo {
                        output: &mut buffer,
                        frame_rate,
                        num_channels: channels,
                        speakers: &speakers,
                        stream_time: frames_rendered as f64 / frame_rate as f64,
                        status: StreamStatus::NONE,
                    };
                    {
                        let mut render = callback.lock();
                        render(&mut info);
                    }
                    frames_rendered += block_size_frames as u64;

                    deadline += block_duration;
                    let now = Instant::now();
                    if deadline > now {
                        std::thread::sleep(deadline - now);
                    } else {
                        deadline = now;
                    }
                }
            })
            .map_err(|e| AudioError::BackendError(e.to_string()))?;

        stream.thread = Some(thread);
        Ok(())
    }

    fn stop_stream(&mut self) -> AudioResult<()> {
        let stream = self.stream.as_mut().ok_or(AudioError::NoStream)?;
        stream.running.store(false, Ordering::Release);
        if let Some(thread) = stream.thread.take() {
            if thread.join().is_err() {
                return Err(AudioError::StreamError(
                    "null device thread panicked".into(),
                ));
            }
        }
        Ok(())
    }

    fn shutdown_stream(&mut self) -> AudioResult<()> {
        if self.stream.is_some() {
            self.stop_stream()?;
        }
        self.stream = None;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.stream
            .as_ref()
            .is_some_and(|s| s.running.load(Ordering::Acquire))
    }

    fn stream_info(&self) -> Option<&DeviceInfo> {
        self.stream.as_ref().map(|_| &self.info)
    }
}

impl Drop for NullBackend {
    fn drop(&mut self) {
        let _ = self.shutdown_stream();
    }
}
