//! Signal conditioning for the CV-to-OSC routing engine.
//!
//! This crate provides:
//! - One-pole IIR, moving-average, median, and exponential filters, plus
//!   the preset chains used to condition CV and audio inputs.
//! - Least-squares linear calibration with JSON persistence.
//! - Rolling-window signal classification (CV vs. audio vs. unknown).
//!
//! Filters are a tagged enum rather than trait objects, since the hot path
//! runs once per sample per channel and a match is cheaper than a vtable
//! call.

mod calibrator;
mod classifier;
mod error;
mod filter;

pub use calibrator::{
    fit_linear, is_plausible_point, CalibrationPoint, CalibrationResult, CalibrationStore,
};
pub use classifier::{ClassificationResult, SignalAnalysis, SignalKind};
pub use error::{DspError, DspResult};
pub use filter::{
    ExponentialState, Filter, FilterFactory, HighPassState, LowPassState, MedianState,
    MovingAverageState,
};
