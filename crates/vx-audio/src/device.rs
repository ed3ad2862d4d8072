//! Audio device enumeration and selection

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Device, Host};

use vx_core::SampleFormat;

use crate::{AudioError, AudioResult, DeviceInfo, speaker_layout};

/// Get the audio host (platform-specific backend)
pub fn get_host() -> Host {
    // On Linux, prefer JACK when it is running, otherwise use default (ALSA)
    #[cfg(all(target_os = "linux", feature = "jack"))]
    {
        if let Some(host) = cpal::available_hosts()
            .into_iter()
            .find(|h| *h == cpal::HostId::Jack)
        {
            if let Ok(host) = cpal::host_from_id(host) {
                return host;
            }
        }
    }

    cpal::default_host()
}

/// Map a cpal sample format onto the engine's closed format set
pub fn map_sample_format(format: cpal::SampleFormat) -> Option<SampleFormat> {
    match format {
        cpal::SampleFormat::U8 | cpal::SampleFormat::I8 => Some(SampleFormat::U8),
        cpal::SampleFormat::I16 | cpal::SampleFormat::U16 => Some(SampleFormat::I16),
        cpal::SampleFormat::I32 | cpal::SampleFormat::U32 => Some(SampleFormat::I32),
        cpal::SampleFormat::F32 => Some(SampleFormat::F32),
        cpal::SampleFormat::F64 => Some(SampleFormat::F64),
        _ => None,
    }
}

/// Enumerate output devices
pub fn output_devices(host: &Host) -> AudioResult<Vec<Device>> {
    Ok(host
        .output_devices()
        .map_err(|e| AudioError::BackendError(e.to_string()))?
        .collect())
}

/// Describe an output device from its default output config
pub fn describe_output_device(device: &Device, is_default: bool) -> AudioResult<DeviceInfo> {
    let name = device.name().unwrap_or_else(|_| "<unknown>".to_string());
    let config = device
        .default_output_config()
        .map_err(|e| AudioError::ConfigError(e.to_string()))?;

    let channels = config.channels() as usize;
    let native_format = map_sample_format(config.sample_format()).ok_or_else(|| {
        AudioError::UnsupportedFormat(format!("{:?}", config.sample_format()))
    })?;

    Ok(DeviceInfo {
        name,
        is_default,
        channels,
        frame_rate: config.sample_rate().0,
        speakers: speaker_layout(channels),
        native_format,
    })
}

/// List available output devices with their default configs
pub fn list_output_devices() -> AudioResult<Vec<DeviceInfo>> {
    let host = get_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());

    let mut devices = Vec::new();
    for device in output_devices(&host)? {
        let is_default = match (&default_name, device.name()) {
            (Some(default), Ok(name)) => *default == name,
            _ => false,
        };
        match describe_output_device(&device, is_default) {
            Ok(info) => devices.push(info),
            Err(e) => log::debug!("Skipping output device: {}", e),
        }
    }

    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_sample_format() {
        assert_eq!(map_sample_format(cpal::SampleFormat::F32), Some(SampleFormat::F32));
        assert_eq!(map_sample_format(cpal::SampleFormat::I16), Some(SampleFormat::I16));
        assert_eq!(map_sample_format(cpal::SampleFormat::U8), Some(SampleFormat::U8));
    }
}
