//! Core Engine Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("No audio devices found")]
    NoDevicesFound,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to play audio stream: {0}")]
    StreamPlayError(String),

    #[error("Invalid device configuration: {0}")]
    InvalidDeviceConfig(String),

    #[error("Invalid channel index: {0}")]
    InvalidChannelIndex(usize),

    #[error("Failed to open audio device (retryable: {retryable}): {message}")]
    AudioOpenError { message: String, retryable: bool },

    #[error("Message queue overflowed")]
    QueueOverflow,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Engine already running")]
    AlreadyRunning,

    #[error("Engine not running")]
    NotRunning,

    #[error("DSP error: {0}")]
    Dsp(#[from] cvosc_dsp::DspError),

    #[error("Transport error: {0}")]
    Transport(#[from] cvosc_transport::TransportError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] cvosc_telemetry::TelemetryError),

    #[error("Channel send error - receiver dropped")]
    ChannelSendError,

    #[error("Channel receive error - sender dropped")]
    ChannelRecvError,
}

pub type CoreResult<T> = Result<T, CoreError>;
