//! Audio input device enumeration

use cpal::traits::{DeviceTrait, HostTrait};
use serde::Serialize;

use crate::error::AudioError;

/// Description of an input device
#[derive(Debug, Clone, Serialize)]
pub struct AudioDeviceInfo {
    pub id: String,
    pub name: String,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

/// List all available input devices
pub fn list_input_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let mut devices = Vec::new();
    if let Ok(inputs) = host.input_devices() {
        for device in inputs {
            if let Ok(name) = device.name() {
                let (sample_rates, channels) = get_device_capabilities(&device);
                devices.push(AudioDeviceInfo {
                    id: format!("input:{}", name),
                    is_default: default_name.as_ref() == Some(&name),
                    name,
                    sample_rates,
                    channels,
                });
            }
        }
    }

    devices
}

/// Resolve an `input:<name>` identifier, or the default input when `None`
pub fn get_input_device(id: Option<&str>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();

    let Some(id) = id else {
        return host
            .default_input_device()
            .ok_or_else(|| AudioError::DeviceNotFound("default input".to_string()));
    };

    let wanted = id.strip_prefix("input:").unwrap_or(id);
    host.input_devices()
        .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?
        .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
        .ok_or_else(|| AudioError::DeviceNotFound(id.to_string()))
}

fn get_device_capabilities(device: &cpal::Device) -> (Vec<u32>, Vec<u16>) {
    let mut sample_rates = Vec::new();
    let mut channels = Vec::new();

    if let Ok(configs) = device.supported_input_configs() {
        for config in configs {
            for rate in [8_000, 12_000, 16_000, 24_000, 48_000] {
                if (config.min_sample_rate().0..=config.max_sample_rate().0).contains(&rate)
                    && !sample_rates.contains(&rate)
                {
                    sample_rates.push(rate);
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
