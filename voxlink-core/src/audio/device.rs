//! Audio device enumeration and selection.

use serde::{Deserialize, Serialize};

#[cfg(feature = "audio-cpal")]
use crate::error::{Result, VoiceError};

/// Metadata about an audio device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    /// Whether this is the system default device for its direction.
    pub is_default: bool,
    /// Input devices that likely capture system output rather than a voice.
    pub is_loopback_like: bool,
}

const LOOPBACK_KEYWORDS: &[&str] = &[
    "stereo mix",
    "wave out",
    "what u hear",
    "what you hear",
    "loopback",
    "monitor of",
    "virtual output",
];

/// Best-effort heuristic for loopback/system-output capture devices.
pub fn is_loopback_like_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    LOOPBACK_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Order devices: default first, loopback-like last, then by name.
fn sort_devices(list: &mut [DeviceInfo]) {
    list.sort_by_key(|d| {
        (
            !d.is_default,
            d.is_loopback_like,
            d.name.to_ascii_lowercase(),
        )
    });
}

#[cfg(feature = "audio-cpal")]
fn describe<I>(devices: I, default_name: Option<String>, input: bool) -> Vec<DeviceInfo>
where
    I: Iterator<Item = cpal::Device>,
{
    use cpal::traits::DeviceTrait;

    let mut list = devices
        .enumerate()
        .map(|(idx, device)| {
            let name = device
                .name()
                .unwrap_or_else(|_| format!("Device {}", idx + 1));
            DeviceInfo {
                is_default: default_name.as_deref() == Some(name.as_str()),
                is_loopback_like: input && is_loopback_like_name(&name),
                name,
            }
        })
        .collect::<Vec<_>>();
    sort_devices(&mut list);
    list
}

/// List all audio input devices. Empty if enumeration fails.
#[cfg(feature = "audio-cpal")]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());
    match host.input_devices() {
        Ok(devices) => describe(devices, default_name, true),
        Err(e) => {
            tracing::warn!("failed to enumerate input devices: {e}");
            vec![]
        }
    }
}

/// List all audio output devices. Empty if enumeration fails.
#[cfg(feature = "audio-cpal")]
pub fn list_output_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());
    match host.output_devices() {
        Ok(devices) => describe(devices, default_name, false),
        Err(e) => {
            tracing::warn!("failed to enumerate output devices: {e}");
            vec![]
        }
    }
}

/// Preferred input by name, else the default, else the first available.
#[cfg(feature = "audio-cpal")]
pub(crate) fn resolve_input_device(preferred: Option<&str>) -> Result<cpal::Device> {
    use cpal::traits::HostTrait;

    let host = cpal::default_host();
    let listed = host
        .input_devices()
        .map(|d| d.collect::<Vec<_>>())
        .map_err(|e| VoiceError::Device(e.to_string()));
    pick_device(preferred, listed, host.default_input_device())
        .ok_or(VoiceError::NoInputDevice)
}

/// Preferred output by name, else the default, else the first available.
#[cfg(feature = "audio-cpal")]
pub(crate) fn resolve_output_device(preferred: Option<&str>) -> Result<cpal::Device> {
    use cpal::traits::HostTrait;

    let host = cpal::default_host();
    let listed = host
        .output_devices()
        .map(|d| d.collect::<Vec<_>>())
        .map_err(|e| VoiceError::Device(e.to_string()));
    pick_device(preferred, listed, host.default_output_device())
        .ok_or(VoiceError::NoOutputDevice)
}

#[cfg(feature = "audio-cpal")]
fn pick_device(
    preferred: Option<&str>,
    listed: Result<Vec<cpal::Device>>,
    default: Option<cpal::Device>,
) -> Option<cpal::Device> {
    use cpal::traits::DeviceTrait;

    let mut devices = match listed {
        Ok(devices) => devices,
        Err(e) => {
            tracing::warn!("failed to list devices while resolving preference: {e}");
            Vec::new()
        }
    };

    if let Some(name) = preferred {
        if let Some(idx) = devices
            .iter()
            .position(|d| d.name().map(|n| n == name).unwrap_or(false))
        {
            return Some(devices.swap_remove(idx));
        }
        tracing::warn!("preferred device '{}' not found, falling back", name);
    }

    default.or_else(|| {
        if devices.is_empty() {
            None
        } else {
            tracing::warn!("no default device, falling back to first available");
            Some(devices.swap_remove(0))
        }
    })
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    vec![]
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_output_devices() -> Vec<DeviceInfo> {
    vec![]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_common_loopback_names() {
        assert!(is_loopback_like_name("Stereo Mix (Realtek Audio)"));
        assert!(is_loopback_like_name("Monitor of Built-in Audio"));
        assert!(!is_loopback_like_name("Microphone Array (USB PnP Audio Device)"));
    }

    #[test]
    fn default_sorts_first_and_loopback_last() {
        let mut list = vec![
            DeviceInfo {
                name: "Stereo Mix".into(),
                is_default: false,
                is_loopback_like: true,
            },
            DeviceInfo {
                name: "b-mic".into(),
                is_default: false,
                is_loopback_like: false,
            },
            DeviceInfo {
                name: "a-headset".into(),
                is_default: true,
                is_loopback_like: false,
            },
        ];
        sort_devices(&mut list);
        let names: Vec<_> = list.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["a-headset", "b-mic", "Stereo Mix"]);
    }
}
