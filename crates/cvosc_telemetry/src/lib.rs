//! Telemetry: bounded error history with rate-limited recovery, and a
//! performance monitor sampling CPU/RSS/load plus OSC and audio
//! throughput counters.

mod error;
mod error_handler;
mod perf_monitor;

pub use error::{TelemetryError, TelemetryResult};
pub use error_handler::{Category, ErrorEvent, ErrorHandler, HealthStatus, Severity};
pub use perf_monitor::{EfficiencyAlert, MonitorConfig, PerformanceMonitor, PerformanceSample};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crate_exports() {
        let _handler = ErrorHandler::default();
        let _monitor = PerformanceMonitor::new(MonitorConfig::default());
    }
}
