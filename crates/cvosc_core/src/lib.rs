//! cvosc core - CV-to-OSC mixer engine
//!
//! This crate provides the routing engine behind the CLI: channel state
//! machines, audio/OSC device management, calibration, and message
//! formatting, coordinated by a single background `MixerEngine` thread.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Supervisory caller (CLI)                  │
//! │   (commands)──▶ MixerEngine ◀──(events, levels, health)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ crossbeam-channel
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Engine thread                          │
//! │  drain commands ─▶ route OSC ─▶ forward channels ─▶ sleep   │
//! │        (audio capture/output driven independently by cpal)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Passthrough policy
//!
//! The forward path is intentionally zero-gain: no per-channel fader,
//! mute/solo, or master scaling is applied to a value as it moves from
//! input to output. The only thing the engine does to a value in flight
//! is decide, via `should_be_audible`, whether to forward it at all.
//! Calibration (a per-channel linear fit against a known voltage
//! reference) and a device's own `signal_offset`/`invert` are signal
//! conditioning, not mixing, and are applied at the edges rather than
//! mid-stream.

mod channel;
mod config;
mod device;
mod engine;
mod error;
mod format;
mod message;
mod meter;
mod settings;
mod stream;
mod stream_manager;

pub use channel::{should_be_audible, Channel, ChannelMode, ChannelState};
pub use config::{EngineConfig, StreamConfig};
pub use device::{
    AudioDevice, AudioDeviceType, DeviceConfig, DeviceKind, DeviceStatus, DeviceStatusEntry,
    DeviceTransport,
};
pub use engine::{ChannelConfigEntry, MasterConfig, MixerConfigFile, MixerEngine};
pub use error::{CoreError, CoreResult};
pub use format::{
    ArgumentSource, FormatManager, GeneratedMessage, MessageTemplate, OscCondition, OscConditionType,
};
pub use message::{Command, DeviceStatusKind, Event, HealthStatusKind};
pub use meter::SignalMeter;
pub use settings::{CvRange, Profile, ProfileStore};
pub use stream::AudioStream;
pub use stream_manager::StreamManager;

// Re-export the DSP types callers need to interpret calibration/classification
// results without depending on cvosc_dsp directly.
pub use cvosc_dsp::{
    CalibrationPoint, CalibrationResult, CalibrationStore, ClassificationResult, SignalKind,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crate_exports() {
        let _config = EngineConfig::default();
        let engine = MixerEngine::new().unwrap();
        assert_eq!(engine.total_errors(), 0);
    }
}
