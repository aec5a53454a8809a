//! Device configuration, status tracking, and audio device enumeration.

use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use cvosc_transport::sanitize;

/// 30s of inactivity on a previously-CONNECTED device is asserted as TIMEOUT.
const TIMEOUT_THRESHOLD: Duration = Duration::from_secs(30);

/// What role a device plays in a channel's input/output lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    AudioInput,
    AudioOutput,
    CvInput,
    CvOutput,
    OscInput,
    OscOutput,
    MidiIn,
    MidiOut,
    Virtual,
}

impl DeviceKind {
    pub fn is_audio(self) -> bool {
        matches!(self, DeviceKind::AudioInput | DeviceKind::AudioOutput)
    }

    pub fn is_osc(self) -> bool {
        matches!(
            self,
            DeviceKind::OscInput | DeviceKind::OscOutput | DeviceKind::CvInput | DeviceKind::CvOutput
        )
    }
}

/// How an OSC-backed device reaches its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceTransport {
    UdpUnicast,
    UdpMulticast,
    Tcp,
}

/// Configuration for one input or output device attached to a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub device_id: String,
    pub display_name: String,
    pub kind: DeviceKind,
    #[serde(default)]
    pub transport: Option<DeviceTransport>,
    #[serde(default)]
    pub remote_addr: String,
    #[serde(default)]
    pub remote_port: u16,
    #[serde(default)]
    pub local_addr: String,
    #[serde(default)]
    pub local_port: u16,
    #[serde(default)]
    pub osc_address_prefix: String,
    /// Scale applied to input RMS before publishing as the CV level.
    /// Defaults to 50.0, matching the mic-tuned scaling the engine inherits,
    /// but line-level CV sources should override it per device.
    #[serde(default = "default_signal_level")]
    pub signal_level: f32,
    #[serde(default)]
    pub signal_offset: f32,
    #[serde(default)]
    pub invert: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub auto_reconnect: bool,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub audio_device_index: Option<usize>,
}

fn default_signal_level() -> f32 {
    50.0
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    5000
}

impl DeviceConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if self.device_id.is_empty() || self.device_id.len() > 256 {
            return Err(CoreError::InvalidDeviceConfig(format!(
                "device_id must be 1..=256 chars, got {}",
                self.device_id.len()
            )));
        }
        if self.kind.is_osc() {
            if !self.osc_address_prefix.is_empty() {
                sanitize(&self.osc_address_prefix)
                    .map_err(|e| CoreError::InvalidDeviceConfig(e.to_string()))?;
            }
            if self.remote_port == 0 {
                return Err(CoreError::InvalidDeviceConfig(
                    "remote_port must be in (0, 65535]".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Connection status of one device, driven entirely by the engine loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
    Timeout,
}

/// Status plus the bookkeeping needed for the 30s timeout sweep.
#[derive(Debug, Clone)]
pub struct DeviceStatusEntry {
    pub status: DeviceStatus,
    pub last_activity: Instant,
    pub message_count: u64,
    pub last_error: Option<String>,
}

impl DeviceStatusEntry {
    pub fn new() -> Self {
        Self {
            status: DeviceStatus::Disconnected,
            last_activity: Instant::now(),
            message_count: 0,
            last_error: None,
        }
    }

    pub fn mark_connected(&mut self) {
        self.status = DeviceStatus::Connected;
        self.last_activity = Instant::now();
    }

    pub fn mark_activity(&mut self) {
        self.last_activity = Instant::now();
        self.message_count += 1;
        if self.status == DeviceStatus::Timeout {
            self.status = DeviceStatus::Connected;
        }
    }

    pub fn mark_error(&mut self, message: impl Into<String>) {
        self.status = DeviceStatus::Error;
        self.last_error = Some(message.into());
    }

    /// Run once per engine loop iteration. A previously-CONNECTED device that
    /// hasn't seen activity in `TIMEOUT_THRESHOLD` transitions to TIMEOUT.
    pub fn sweep_timeout(&mut self) {
        if self.status == DeviceStatus::Connected && self.last_activity.elapsed() > TIMEOUT_THRESHOLD {
            self.status = DeviceStatus::Timeout;
        }
    }
}

impl Default for DeviceStatusEntry {
    fn default() -> Self {
        Self::new()
    }
}

/// Input or output role for an enumerated host audio device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioDeviceType {
    Input,
    Output,
}

/// A host audio device as reported by `cpal`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioDevice {
    pub id: String,
    pub name: String,
    pub device_type: AudioDeviceType,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub max_channels: u16,
}

impl AudioDevice {
    pub fn enumerate_all() -> CoreResult<Vec<AudioDevice>> {
        let host = cpal::default_host();
        let mut devices = Vec::new();

        let default_input_name = host.default_input_device().and_then(|d| d.name().ok());
        let default_output_name = host.default_output_device().and_then(|d| d.name().ok());

        if let Ok(input_devices) = host.input_devices() {
            for device in input_devices {
                if let Ok(d) =
                    Self::from_cpal_device(&device, AudioDeviceType::Input, default_input_name.as_deref())
                {
                    devices.push(d);
                }
            }
        }

        if let Ok(output_devices) = host.output_devices() {
            for device in output_devices {
                if let Ok(d) = Self::from_cpal_device(
                    &device,
                    AudioDeviceType::Output,
                    default_output_name.as_deref(),
                ) {
                    devices.push(d);
                }
            }
        }

        if devices.is_empty() {
            return Err(CoreError::NoDevicesFound);
        }

        Ok(devices)
    }

    pub fn enumerate_inputs() -> CoreResult<Vec<AudioDevice>> {
        Ok(Self::enumerate_all()?
            .into_iter()
            .filter(|d| d.device_type == AudioDeviceType::Input)
            .collect())
    }

    pub fn enumerate_outputs() -> CoreResult<Vec<AudioDevice>> {
        Ok(Self::enumerate_all()?
            .into_iter()
            .filter(|d| d.device_type == AudioDeviceType::Output)
            .collect())
    }

    fn from_cpal_device(
        device: &cpal::Device,
        device_type: AudioDeviceType,
        default_name: Option<&str>,
    ) -> CoreResult<Self> {
        let name = device
            .name()
            .map_err(|e| CoreError::DeviceNotFound(e.to_string()))?;
        let id = name.clone();
        let is_default = default_name.map(|d| d == name).unwrap_or(false);

        let (sample_rates, max_channels) = match device_type {
            AudioDeviceType::Input => Self::query_configs(device.supported_input_configs().ok()),
            AudioDeviceType::Output => Self::query_configs(device.supported_output_configs().ok()),
        };

        Ok(AudioDevice {
            id,
            name,
            device_type,
            is_default,
            sample_rates,
            max_channels,
        })
    }

    fn query_configs(
        configs: Option<impl Iterator<Item = cpal::SupportedStreamConfigRange>>,
    ) -> (Vec<u32>, u16) {
        const COMMON_RATES: [u32; 6] = [44100, 48000, 88200, 96000, 176400, 192000];
        let mut sample_rates = Vec::new();
        let mut max_channels = 0u16;

        if let Some(configs) = configs {
            for config in configs {
                max_channels = max_channels.max(config.channels());
                let min = config.min_sample_rate().0;
                let max = config.max_sample_rate().0;
                for &rate in &COMMON_RATES {
                    if rate >= min && rate <= max && !sample_rates.contains(&rate) {
                        sample_rates.push(rate);
                    }
                }
            }
        }

        sample_rates.sort_unstable();
        (sample_rates, max_channels)
    }
}

/// Device handlers beyond audio (MIDI, Wi-Fi) are mostly stubs in the
/// original engine; this trait gives them the same operation set as the
/// audio path while leaving audio as the one real implementation.
pub trait DeviceHandler {
    fn open(&mut self, config: &DeviceConfig) -> CoreResult<()>;
    fn close(&mut self);
    fn is_open(&self) -> bool;
}

pub struct MidiDeviceHandler;

impl DeviceHandler for MidiDeviceHandler {
    fn open(&mut self, _config: &DeviceConfig) -> CoreResult<()> {
        Err(CoreError::InvalidDeviceConfig(
            "MIDI device handling is not implemented".into(),
        ))
    }

    fn close(&mut self) {}

    fn is_open(&self) -> bool {
        false
    }
}

pub struct WifiDeviceHandler;

impl DeviceHandler for WifiDeviceHandler {
    fn open(&mut self, _config: &DeviceConfig) -> CoreResult<()> {
        Err(CoreError::InvalidDeviceConfig(
            "Wi-Fi device handling is not implemented".into(),
        ))
    }

    fn close(&mut self) {}

    fn is_open(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> DeviceConfig {
        DeviceConfig {
            device_id: "dev-1".into(),
            display_name: "Test".into(),
            kind: DeviceKind::OscOutput,
            transport: Some(DeviceTransport::UdpUnicast),
            remote_addr: "127.0.0.1".into(),
            remote_port: 9000,
            local_addr: String::new(),
            local_port: 0,
            osc_address_prefix: "/cv/channel".into(),
            signal_level: 50.0,
            signal_offset: 0.0,
            invert: false,
            enabled: true,
            auto_reconnect: false,
            timeout_ms: 5000,
            audio_device_index: None,
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn empty_device_id_rejected() {
        let mut c = base_config();
        c.device_id = String::new();
        assert!(c.validate().is_err());
    }

    #[test]
    fn too_long_device_id_rejected() {
        let mut c = base_config();
        c.device_id = "x".repeat(257);
        assert!(c.validate().is_err());
    }

    #[test]
    fn bad_osc_prefix_rejected() {
        let mut c = base_config();
        c.osc_address_prefix = "cv channel".into();
        assert!(c.validate().is_err());
    }

    #[test]
    fn zero_remote_port_rejected_for_osc() {
        let mut c = base_config();
        c.remote_port = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn default_signal_level_is_fifty() {
        let json = r#"{"device_id":"d","display_name":"D","kind":"CvInput"}"#;
        let c: DeviceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(c.signal_level, 50.0);
        assert!(c.enabled);
    }

    #[test]
    fn status_times_out_after_inactivity() {
        let mut entry = DeviceStatusEntry::new();
        entry.mark_connected();
        entry.last_activity = Instant::now() - Duration::from_secs(31);
        entry.sweep_timeout();
        assert_eq!(entry.status, DeviceStatus::Timeout);
    }

    #[test]
    fn status_reconnects_on_activity_after_timeout() {
        let mut entry = DeviceStatusEntry::new();
        entry.mark_connected();
        entry.status = DeviceStatus::Timeout;
        entry.mark_activity();
        assert_eq!(entry.status, DeviceStatus::Connected);
    }

    #[test]
    fn audio_device_type_serialization() {
        let input = AudioDeviceType::Input;
        let json = serde_json::to_string(&input).unwrap();
        let deserialized: AudioDeviceType = serde_json::from_str(&json).unwrap();
        assert_eq!(input, deserialized);
    }

    #[test]
    #[ignore = "requires audio hardware"]
    fn enumerate_all_devices() {
        assert!(AudioDevice::enumerate_all().is_ok());
    }
}
