//! Per-channel linear (offset/scale) calibration with least-squares fit and
//! JSON persistence.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{DspError, DspResult};

const MIN_ACCURACY: f32 = 0.9;
const MAX_AGE_DAYS: i64 = 30;
const DEGENERATE_EPSILON: f32 = 1e-10;
const POINT_TOLERANCE: f32 = 0.1;

/// One (expected voltage, measured raw value) sample taken during
/// calibration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    pub input_voltage: f32,
    pub measured_value: f32,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl CalibrationPoint {
    pub fn new(input_voltage: f32, measured_value: f32) -> Self {
        Self {
            input_voltage,
            measured_value,
            timestamp: Utc::now(),
        }
    }
}

/// Result of fitting `measured = scale * expected + offset` to a channel's
/// calibration points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationResult {
    #[serde(default)]
    pub is_valid: bool,
    #[serde(default)]
    pub actual_min: f32,
    #[serde(default = "default_max")]
    pub actual_max: f32,
    #[serde(default)]
    pub offset: f32,
    #[serde(default = "default_scale")]
    pub scale: f32,
    #[serde(default)]
    pub accuracy: f32,
    #[serde(default = "Utc::now")]
    pub calibration_time: DateTime<Utc>,
    #[serde(default)]
    pub points: Vec<CalibrationPoint>,
}

fn default_scale() -> f32 {
    1.0
}

fn default_max() -> f32 {
    10.0
}

impl Default for CalibrationResult {
    fn default() -> Self {
        Self {
            is_valid: false,
            actual_min: 0.0,
            actual_max: default_max(),
            offset: 0.0,
            scale: default_scale(),
            accuracy: 0.0,
            calibration_time: Utc::now(),
            points: Vec::new(),
        }
    }
}

impl CalibrationResult {
    /// Apply this calibration to a raw reading. Invalid calibrations pass
    /// the raw value through unchanged.
    pub fn apply(&self, raw_value: f32) -> f32 {
        if !self.is_valid {
            return raw_value;
        }
        raw_value * self.scale + self.offset
    }

    /// A calibration counts as usable when it fit well and isn't stale.
    pub fn is_usable(&self) -> bool {
        self.is_valid
            && self.accuracy > MIN_ACCURACY
            && Utc::now() - self.calibration_time < Duration::days(MAX_AGE_DAYS)
    }
}

/// Least-squares fit of `measured = scale * expected + offset` plus an
/// R-squared goodness-of-fit score.
pub fn fit_linear(points: &[CalibrationPoint]) -> DspResult<CalibrationResult> {
    if points.len() < 2 {
        return Err(DspError::CalibrationPointRejected {
            reason: format!("need at least 2 points, got {}", points.len()),
        });
    }

    let n = points.len() as f32;
    let (sum_x, sum_y, sum_xy, sum_xx) = points.iter().fold(
        (0.0_f32, 0.0_f32, 0.0_f32, 0.0_f32),
        |(sx, sy, sxy, sxx), p| {
            (
                sx + p.input_voltage,
                sy + p.measured_value,
                sxy + p.input_voltage * p.measured_value,
                sxx + p.input_voltage * p.input_voltage,
            )
        },
    );

    let denominator = n * sum_xx - sum_x * sum_x;
    if denominator.abs() < DEGENERATE_EPSILON {
        return Err(DspError::CalibrationDegenerate);
    }

    let scale = (n * sum_xy - sum_x * sum_y) / denominator;
    let offset = (sum_y - scale * sum_x) / n;
    let accuracy = r_squared(points, offset, scale);

    let actual_min = points
        .iter()
        .map(|p| p.input_voltage)
        .fold(f32::INFINITY, f32::min);
    let actual_max = points
        .iter()
        .map(|p| p.input_voltage)
        .fold(f32::NEG_INFINITY, f32::max);

    Ok(CalibrationResult {
        is_valid: accuracy > 0.8,
        actual_min,
        actual_max,
        offset,
        scale,
        accuracy,
        calibration_time: Utc::now(),
        points: points.to_vec(),
    })
}

fn r_squared(points: &[CalibrationPoint], offset: f32, scale: f32) -> f32 {
    if points.is_empty() {
        return 0.0;
    }
    let mean_y = points.iter().map(|p| p.measured_value).sum::<f32>() / points.len() as f32;

    let (ss_res, ss_tot) = points.iter().fold((0.0_f32, 0.0_f32), |(res, tot), p| {
        let predicted = scale * p.input_voltage + offset;
        (
            res + (p.measured_value - predicted).powi(2),
            tot + (p.measured_value - mean_y).powi(2),
        )
    });

    if ss_tot < DEGENERATE_EPSILON {
        return 0.0;
    }
    1.0 - (ss_res / ss_tot)
}

/// Rejects a calibration point whose measured/expected ratio is wildly off,
/// catching obviously bad wiring before it pollutes the fit.
pub fn is_plausible_point(expected: f32, measured: f32) -> bool {
    if expected == 0.0 {
        return measured.abs() < 1.0;
    }
    let ratio = (measured / expected).abs();
    ratio > (1.0 - POINT_TOLERANCE) && ratio < (1.0 + POINT_TOLERANCE)
}

/// Per-channel calibration store with JSON persistence. Mirrors the
/// load-or-default settings pattern used across this workspace: a missing
/// or corrupt file is logged and replaced with defaults rather than
/// propagated as an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationStore {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub channels: Vec<CalibrationResult>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl CalibrationStore {
    pub fn new(channel_count: usize) -> Self {
        Self {
            version: default_version(),
            channels: (0..channel_count).map(|_| CalibrationResult::default()).collect(),
        }
    }

    pub fn load_or_default(path: &Path, channel_count: usize) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<CalibrationStore>(&contents) {
                Ok(mut store) => {
                    store.channels.resize_with(channel_count, CalibrationResult::default);
                    info!(path = %path.display(), "loaded calibration");
                    store
                }
                Err(err) => {
                    error!(path = %path.display(), error = %err, "failed to parse calibration file");
                    Self::new(channel_count)
                }
            },
            Err(_) => {
                warn!(path = %path.display(), "no existing calibration file, using defaults");
                Self::new(channel_count)
            }
        }
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .expect("CalibrationStore always serializes");
        fs::write(path, json)
    }

    pub fn apply(&self, channel: usize, raw_value: f32) -> f32 {
        self.channels
            .get(channel)
            .map(|c| c.apply(raw_value))
            .unwrap_or(raw_value)
    }

    pub fn validate(&self, channel: usize) -> bool {
        self.channels.get(channel).map(|c| c.is_usable()).unwrap_or(false)
    }
}
