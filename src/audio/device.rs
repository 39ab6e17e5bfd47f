//! Output device enumeration

use cpal::traits::{DeviceTrait, HostTrait};
use serde::Serialize;

use crate::error::AudioError;

/// Sample rates probed when reporting device capabilities
const COMMON_SAMPLE_RATES: [u32; 6] = [44100, 48000, 88200, 96000, 176400, 192000];

/// Serializable description of an output device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AudioDeviceInfo {
    pub id: String,
    pub name: String,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

/// Wrapper around cpal device
pub struct AudioDevice {
    inner: cpal::Device,
    pub name: String,
}

impl AudioDevice {
    pub fn from_cpal(device: cpal::Device) -> Self {
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        Self { inner: device, name }
    }

    pub fn into_inner(self) -> cpal::Device {
        self.inner
    }
}

/// Device id as used on the command line and in the status API
pub fn device_id(name: &str) -> String {
    format!("output:{}", name)
}

/// List all available output devices
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());

    let Ok(devices) = host.output_devices() else {
        return Vec::new();
    };

    let mut infos: Vec<AudioDeviceInfo> = Vec::new();
    for device in devices {
        let Ok(name) = device.name() else { continue };
        if infos.iter().any(|d| d.name == name) {
            continue;
        }
        let (sample_rates, channels) = get_device_capabilities(&device);
        infos.push(AudioDeviceInfo {
            id: device_id(&name),
            is_default: default_name.as_ref() == Some(&name),
            name,
            sample_rates,
            channels,
        });
    }
    infos
}

fn get_device_capabilities(device: &cpal::Device) -> (Vec<u32>, Vec<u16>) {
    let mut sample_rates = Vec::new();
    let mut channels = Vec::new();

    if let Ok(configs) = device.supported_output_configs() {
        for config in configs {
            for rate_val in COMMON_SAMPLE_RATES {
                let rate = cpal::SampleRate(rate_val);
                if rate >= config.min_sample_rate()
                    && rate <= config.max_sample_rate()
                    && !sample_rates.contains(&rate_val)
                {
                    sample_rates.push(rate_val);
                }
            }
            if !channels.contains(&config.channels()) {
                channels.push(config.channels());
            }
        }
    }

    sample_rates.sort_unstable();
    channels.sort_unstable();
    (sample_rates, channels)
}

/// Resolve an output device by id, or the default device for `None`
pub fn get_output_device(id: Option<&str>) -> Result<AudioDevice, AudioError> {
    let host = cpal::default_host();

    let Some(id) = id else {
        return host
            .default_output_device()
            .map(AudioDevice::from_cpal)
            .ok_or_else(|| AudioError::DeviceNotFound("No default output device".to_string()));
    };

    let name = id.strip_prefix("output:").unwrap_or(id);
    let devices = host
        .output_devices()
        .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

    for device in devices {
        if device.name().map(|n| n == name).unwrap_or(false) {
            return Ok(AudioDevice::from_cpal(device));
        }
    }

    Err(AudioError::DeviceNotFound(id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_prefix() {
        assert_eq!(device_id("Speakers"), "output:Speakers");
    }

    #[test]
    fn test_unknown_device_is_not_found() {
        // Holds on hosts with or without audio hardware
        let result = get_output_device(Some("output:__no_such_device__"));
        assert!(matches!(result, Err(AudioError::DeviceNotFound(_))));
    }

    #[test]
    fn test_listed_devices_are_unique() {
        let devices = list_devices();
        for (i, device) in devices.iter().enumerate() {
            assert!(device.id.starts_with("output:"));
            assert!(devices[i + 1..].iter().all(|d| d.name != device.name));
        }
    }
}
