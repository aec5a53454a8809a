//! Message Types for Thread Communication
//!
//! Commands flow from supervisory callers -> engine thread
//! Events flow from engine thread -> supervisory callers

use serde::{Deserialize, Serialize};

use crate::channel::ChannelMode;
use crate::device::DeviceConfig;
use cvosc_telemetry::HealthStatus;

/// Commands sent from supervisory callers to the mixer engine.
#[derive(Debug, Clone)]
pub enum Command {
    StartChannel(usize),
    StopChannel(usize),
    ResetChannelError(usize),
    SetChannelMode { channel: usize, mode: ChannelMode },
    AddInputDevice { channel: usize, device: DeviceConfig },
    AddOutputDevice { channel: usize, device: DeviceConfig },

    StartCalibration(usize),
    AddCalibrationPoint { channel: usize, expected_volts: f32 },
    FinishCalibration(usize),

    SetLearningMode(bool),
    SetLearningTarget(Option<usize>),

    StartDeviceDiscovery,
    StopDeviceDiscovery,

    ResetStatistics,
    RequestState,

    /// An OSC message arrived on a bound receiver; routed via `route_input`.
    IncomingOsc { address: String, values: Vec<f32> },

    Shutdown,
}

/// Events sent from the mixer engine to supervisory callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Event {
    Started,
    Stopped,
    Error { message: String },

    ChannelStateChanged { channel: usize, state: crate::channel::ChannelState },

    /// Level update for meters: channel index plus input/output levels.
    LevelUpdate { channel: usize, input: f32, output: f32 },

    DeviceStatusChanged { device_id: String, status: DeviceStatusKind },

    BufferUnderrun,

    /// Health rollup, sampled at the same cadence as performance metrics.
    HealthUpdate(HealthStatusKind),
}

/// `cvosc_telemetry::HealthStatus` doesn't derive `Serialize`, so events
/// carry this mirrored copy across the channel boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatusKind {
    Healthy,
    Caution,
    Warning,
    Degraded,
    Critical,
}

impl From<HealthStatus> for HealthStatusKind {
    fn from(value: HealthStatus) -> Self {
        match value {
            HealthStatus::Healthy => HealthStatusKind::Healthy,
            HealthStatus::Caution => HealthStatusKind::Caution,
            HealthStatus::Warning => HealthStatusKind::Warning,
            HealthStatus::Degraded => HealthStatusKind::Degraded,
            HealthStatus::Critical => HealthStatusKind::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceStatusKind {
    Disconnected,
    Connecting,
    Connected,
    Error,
    Timeout,
}

impl From<crate::device::DeviceStatus> for DeviceStatusKind {
    fn from(value: crate::device::DeviceStatus) -> Self {
        use crate::device::DeviceStatus as D;
        match value {
            D::Disconnected => DeviceStatusKind::Disconnected,
            D::Connecting => DeviceStatusKind::Connecting,
            D::Connected => DeviceStatusKind::Connected,
            D::Error => DeviceStatusKind::Error,
            D::Timeout => DeviceStatusKind::Timeout,
        }
    }
}

impl Event {
    pub fn error<E: std::fmt::Display>(err: E) -> Self {
        Event::Error { message: err.to_string() }
    }
}
