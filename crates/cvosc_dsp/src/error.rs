//! DSP error types

use thiserror::Error;

/// Errors that can occur during filtering, calibration, or classification.
#[derive(Error, Debug)]
pub enum DspError {
    #[error("Invalid window size: {0} (must be > 0)")]
    InvalidWindowSize(usize),

    #[error("Sample rate must be positive, got {0}")]
    InvalidSampleRate(f32),

    #[error("Invalid filter alpha {0} (must be in [0.001, 1.0])")]
    InvalidAlpha(f32),

    #[error("Calibration is degenerate: points are collinear in voltage or too few were supplied")]
    CalibrationDegenerate,

    #[error("Calibration point rejected: {reason}")]
    CalibrationPointRejected { reason: String },

    #[error("Invalid channel index: {0}")]
    InvalidChannelIndex(usize),
}

pub type DspResult<T> = Result<T, DspError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DspError::InvalidWindowSize(0);
        assert!(err.to_string().contains('0'));

        let err = DspError::InvalidAlpha(2.0);
        assert!(err.to_string().contains('2'));
    }
}
