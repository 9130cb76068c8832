//! Audio device enumeration and monitor resolution.

use serde::{Deserialize, Serialize};

/// One source advertised by the sound server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDevice {
    pub name: String,
    pub label: String,
}

impl AudioDevice {
    pub fn new(name: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
        }
    }

    /// PulseAudio/PipeWire name a sink's monitor literally `<sink>.monitor`.
    pub fn is_literal_monitor(&self) -> bool {
        self.name.ends_with(".monitor")
    }

    /// Whether the name or label denotes a monitor/loopback role.
    pub fn has_monitor_role(&self) -> bool {
        let name = self.name.to_lowercase();
        let label = self.label.to_lowercase();
        ["monitor", "loopback"]
            .iter()
            .any(|role| name.contains(role) || label.contains(role))
    }
}

/// Pick the device to capture system audio from.
///
/// A literal monitor wins; otherwise the first device with a monitor or
/// loopback role. `None` means system audio cannot be captured.
pub fn resolve_monitor_device(devices: &[AudioDevice]) -> Option<&AudioDevice> {
    devices
        .iter()
        .find(|d| d.is_literal_monitor())
        .or_else(|| devices.iter().find(|d| d.has_monitor_role()))
}

/// Parse the long form of `pactl list sources`.
pub fn parse_pactl_sources(output: &str) -> Vec<AudioDevice> {
    let mut devices = Vec::new();
    let mut name: Option<String> = None;
    let mut label: Option<String> = None;

    let mut flush = |name: &mut Option<String>, label: &mut Option<String>| {
        if let Some(n) = name.take() {
            let l = label.take().unwrap_or_else(|| n.clone());
            devices.push(AudioDevice::new(n, l));
        }
        *label = None;
    };

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("Source #") {
            flush(&mut name, &mut label);
        } else if let Some(value) = trimmed.strip_prefix("Name:") {
            name = Some(value.trim().to_string());
        } else if let Some(value) = trimmed.strip_prefix("Description:") {
            label = Some(value.trim().to_string());
        }
    }
    flush(&mut name, &mut label);

    devices
}
