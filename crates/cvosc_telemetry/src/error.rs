//! Telemetry error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("recovery attempts exhausted for category {0:?}")]
    RecoveryExhausted(crate::error_handler::Category),

    #[error("failed to read performance counters: {0}")]
    HistoryIoError(#[from] std::io::Error),
}

pub type TelemetryResult<T> = Result<T, TelemetryError>;
