//! cpal output backend
//!
//! cpal hands the data callback buffers of whatever size the host picked.
//! `BlockAdapter` re-chunks them so the engine callback always renders exactly
//! `block_size_frames` frames.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize as CpalBufferSize, Device, Host, Stream, StreamConfig, SupportedBufferSize};

use crate::device::{describe_output_device, get_host, output_devices};
use crate::{
    AudioCallback, AudioError, AudioResult, CallbackInfo, DeviceBackend, DeviceInfo, Speaker,
    StreamParams, StreamStatus,
};

// ═══════════════════════════════════════════════════════════════════════════════
// BLOCK ADAPTER
// ═══════════════════════════════════════════════════════════════════════════════

/// Re-chunks host buffers into fixed engine blocks
pub(crate) struct BlockAdapter {
    callback: AudioCallback,
    block: Vec<f32>,
    read_pos: usize,
    frame_rate: u32,
    num_channels: usize,
    speakers: Vec<Speaker>,
    frames_rendered: u64,
    status: Arc<AtomicU32>,
}

impl BlockAdapter {
    pub(crate) fn new(
        callback: AudioCallback,
        block_size_frames: usize,
        frame_rate: u32,
        speakers: Vec<Speaker>,
        status: Arc<AtomicU32>,
    ) -> Self {
        let num_channels = speakers.len();
        let block = vec![0.0; block_size_frames * num_channels];
        Self {
            callback,
            read_pos: block.len(),
            block,
            frame_rate,
            num_channels,
            speakers,
            frames_rendered: 0,
            status,
        }
    }

    /// Fill a host buffer, rendering new blocks as needed
    pub(crate) fn fill(&mut self, data: &mut [f32]) {
        if self.block.is_empty() {
            data.fill(0.0);
            return;
        }

        let mut written = 0;
        while written < data.len() {
            if self.read_pos >= self.block.len() {
                self.render_block();
            }
            let count = (self.block.len() - self.read_pos).min(data.len() - written);
            data[written..written + count]
                .copy_from_slice(&self.block[self.read_pos..self.read_pos + count]);
            self.read_pos += count;
            written += count;
        }
    }

    fn render_block(&mut self) {
        self.block.fill(0.0);

        let status = StreamStatus::from_bits(self.status.swap(0, Ordering::AcqRel));
        let mut info = CallbackInfo {
            output: &mut self.block,
            frame_rate: self.frame_rate,
            num_channels: self.num_channels,
            speakers: &self.speakers,
            stream_time: self.frames_rendered as f64 / self.frame_rate.max(1) as f64,
            status,
        };

        if !(self.callback)(&mut info) {
            self.block.fill(0.0);
        }

        self.frames_rendered += (self.block.len() / self.num_channels) as u64;
        self.read_pos = 0;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CPAL BACKEND
// ═══════════════════════════════════════════════════════════════════════════════

/// Platform output through cpal
pub struct CpalBackend {
    host: Option<Host>,
    devices: Vec<Device>,
    infos: Vec<DeviceInfo>,
    default_index: Option<usize>,
    stream: Option<Stream>,
    stream_info: Option<DeviceInfo>,
    status: Arc<AtomicU32>,
    running: bool,
}

impl CpalBackend {
    pub fn new() -> Self {
        Self {
            host: None,
            devices: Vec::new(),
            infos: Vec::new(),
            default_index: None,
            stream: None,
            stream_info: None,
            status: Arc::new(AtomicU32::new(0)),
            running: false,
        }
    }

    fn resolve_index(&self, index: Option<usize>) -> AudioResult<usize> {
        if self.host.is_none() {
            return Err(AudioError::NotInitialized);
        }
        match index {
            Some(i) if i < self.infos.len() => Ok(i),
            Some(i) => Err(AudioError::DeviceNotFound(i)),
            None => self.default_index.ok_or(AudioError::NoDevice),
        }
    }

    /// Pick an f32 config at the device's default rate
    fn output_config(device: &Device, block_size_frames: usize) -> AudioResult<StreamConfig> {
        let default = device
            .default_output_config()
            .map_err(|e| AudioError::ConfigError(e.to_string()))?;
        let sample_rate = default.sample_rate();

        let supported = if default.sample_format() == cpal::SampleFormat::F32 {
            default
        } else {
            device
                .supported_output_configs()
                .map_err(|e| AudioError::ConfigError(e.to_string()))?
                .find(|c| {
                    c.sample_format() == cpal::SampleFormat::F32
                        && c.min_sample_rate() <= sample_rate
                        && c.max_sample_rate() >= sample_rate
                })
                .map(|c| c.with_sample_rate(sample_rate))
                .ok_or_else(|| {
                    AudioError::UnsupportedFormat(format!(
                        "no f32 output at {} Hz",
                        sample_rate.0
                    ))
                })?
        };

        let block = block_size_frames as u32;
        let buffer_size = match supported.buffer_size() {
            SupportedBufferSize::Range { min, max } if *min <= block && block <= *max => {
                CpalBufferSize::Fixed(block)
            }
            _ => CpalBufferSize::Default,
        };

        Ok(StreamConfig {
            channels: supported.channels(),
            sample_rate,
            buffer_size,
        })
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceBackend for CpalBackend {
    fn name(&self) -> &str {
        "cpal"
    }

    fn initialize(&mut self) -> AudioResult<()> {
        let host = get_host();
        let default_name = host.default_output_device().and_then(|d| d.name().ok());

        self.devices.clear();
        self.infos.clear();
        self.default_index = None;

        for device in output_devices(&host)? {
            let is_default = match (&default_name, device.name()) {
                (Some(default), Ok(name)) => *default == name,
                _ => false,
            };
            match describe_output_device(&device, is_default) {
                Ok(info) => {
                    if is_default && self.default_index.is_none() {
                        self.default_index = Some(self.infos.len());
                    }
                    self.infos.push(info);
                    self.devices.push(device);
                }
                Err(e) => log::debug!("Skipping output device: {}", e),
            }
        }

        if self.devices.is_empty() {
            return Err(AudioError::NoDevice);
        }
        if self.default_index.is_none() {
            self.default_index = Some(0);
        }

        log::info!(
            "cpal host {:?}: {} output device(s)",
            host.id(),
            self.devices.len()
        );
        self.host = Some(host);
        Ok(())
    }

    fn output_device_count(&self) -> usize {
        self.infos.len()
    }

    fn output_device_info(&self, index: Option<usize>) -> AudioResult<DeviceInfo> {
        let index = self.resolve_index(index)?;
        Ok(self.infos[index].clone())
    }

    fn create_stream(&mut self, params: StreamParams) -> AudioResult<()> {
        if self.stream.is_some() {
            self.shutdown_stream()?;
        }

        let index = self.resolve_index(params.device_index)?;
        let device = &self.devices[index];
        let config = Self::output_config(device, params.block_size_frames)?;

        let mut info = self.infos[index].clone();
        info.channels = config.channels as usize;
        info.frame_rate = config.sample_rate.0;
        info.speakers = crate::speaker_layout(info.channels);

        self.status.store(0, Ordering::Release);
        let mut adapter = BlockAdapter::new(
            params.callback,
            params.block_size_frames,
            info.frame_rate,
            info.speakers.clone(),
            Arc::clone(&self.status),
        );

        let error_status = Arc::clone(&self.status);
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    adapter.fill(data);
                },
                move |err| {
                    if let cpal::StreamError::DeviceNotAvailable = err {
                        log::error!("Audio output device lost: {}", err);
                    } else {
                        // Host-specific errors are xruns on the common backends
                        error_status
                            .fetch_or(StreamStatus::OUTPUT_UNDERFLOW.bits(), Ordering::AcqRel);
                    }
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        log::info!(
            "Opened '{}': {} ch @ {} Hz, {:?}",
            info.name,
            info.channels,
            info.frame_rate,
            config.buffer_size
        );
        self.stream = Some(stream);
        self.stream_info = Some(info);
        self.running = false;
        Ok(())
    }

    fn start_stream(&mut self) -> AudioResult<()> {
        let stream = self.stream.as_ref().ok_or(AudioError::NoStream)?;
        stream
            .play()
            .map_err(|e| AudioError::StreamError(e.to_string()))?;
        self.running = true;
        Ok(())
    }

    fn stop_stream(&mut self) -> AudioResult<()> {
        let stream = self.stream.as_ref().ok_or(AudioError::NoStream)?;
        stream
            .pause()
            .map_err(|e| AudioError::StreamError(e.to_string()))?;
        self.running = false;
        Ok(())
    }

    fn shutdown_stream(&mut self) -> AudioResult<()> {
        if self.running {
            if let Err(e) = self.stop_stream() {
                log::warn!("Failed to pause stream before shutdown: {}", e);
            }
        }
        self.running = false;
        self.stream = None;
        self.stream_info = None;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn stream_info(&self) -> Option<&DeviceInfo> {
        self.stream_info.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_adapter(block_frames: usize) -> (BlockAdapter, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let callback: AudioCallback = Box::new(move |info: &mut CallbackInfo<'_>| {
            let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
            assert_eq!(info.num_frames(), 4);
            info.output.fill(n as f32);
            true
        });
        let adapter = BlockAdapter::new(
            callback,
            block_frames,
            48_000,
            vec![Speaker::FrontLeft, Speaker::FrontRight],
            Arc::new(AtomicU32::new(0)),
        );
        (adapter, calls)
    }

    #[test]
    fn test_adapter_rechunks_host_buffers() {
        let (mut adapter, calls) = counting_adapter(4);

        // 3 frames stereo, then 7 frames: spans two engine blocks
        let mut first = [0.0f32; 6];
        adapter.fill(&mut first);
        assert_eq!(first, [1.0; 6]);
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        let mut second = [0.0f32; 14];
        adapter.fill(&mut second);
        assert_eq!(&second[..2], &[1.0, 1.0]);
        assert_eq!(&second[2..10], &[2.0; 8]);
        assert_eq!(&second[10..], &[3.0; 4]);
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_adapter_silences_rejected_blocks() {
        let callback: AudioCallback = Box::new(|info: &mut CallbackInfo<'_>| {
            info.output.fill(0.5);
            false
        });
        let status = Arc::new(AtomicU32::new(StreamStatus::OUTPUT_UNDERFLOW.bits()));
        let mut adapter =
            BlockAdapter::new(callback, 8, 44_100, vec![Speaker::FrontCenter], status.clone());

        let mut data = [1.0f32; 8];
        adapter.fill(&mut data);
        assert_eq!(data, [0.0; 8]);
        // Status flags are consumed by the block that saw them
        assert_eq!(status.load(Ordering::Relaxed), 0);
    }
}
