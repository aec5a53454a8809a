//! Signal filters for conditioning raw CV and audio samples before analysis
//! or transmission.
//!
//! Filters are a tagged enum rather than trait objects: the hot path runs
//! once per sample on every active channel, and matching on a `Filter`
//! variant is cheaper and more cache-friendly than a vtable call through
//! `Box<dyn Filter>`.

use std::collections::VecDeque;

use crate::error::{DspError, DspResult};

const MAX_WINDOW: usize = 32;

/// A single signal-conditioning stage.
#[derive(Debug, Clone)]
pub enum Filter {
    LowPass(LowPassState),
    HighPass(HighPassState),
    MovingAverage(MovingAverageState),
    Median(MedianState),
    Exponential(ExponentialState),
    Chain(Vec<Filter>),
}

impl Filter {
    pub fn low_pass(cutoff_hz: f32, sample_rate: f32) -> DspResult<Filter> {
        Ok(Filter::LowPass(LowPassState::new(cutoff_hz, sample_rate)?))
    }

    pub fn high_pass(cutoff_hz: f32, sample_rate: f32) -> DspResult<Filter> {
        Ok(Filter::HighPass(HighPassState::new(cutoff_hz, sample_rate)?))
    }

    pub fn moving_average(window: usize) -> DspResult<Filter> {
        Ok(Filter::MovingAverage(MovingAverageState::new(window)?))
    }

    pub fn median(window: usize) -> DspResult<Filter> {
        Ok(Filter::Median(MedianState::new(window)?))
    }

    pub fn exponential(alpha: f32) -> DspResult<Filter> {
        Ok(Filter::Exponential(ExponentialState::new(alpha)?))
    }

    pub fn chain(stages: Vec<Filter>) -> Filter {
        Filter::Chain(stages)
    }

    /// Process one sample. Must not allocate once the filter has been built
    /// (the `Chain` and window-based variants pre-size their storage).
    pub fn process(&mut self, input: f32) -> f32 {
        match self {
            Filter::LowPass(s) => s.process(input),
            Filter::HighPass(s) => s.process(input),
            Filter::MovingAverage(s) => s.process(input),
            Filter::Median(s) => s.process(input),
            Filter::Exponential(s) => s.process(input),
            Filter::Chain(stages) => stages.iter_mut().fold(input, |acc, f| f.process(acc)),
        }
    }

    pub fn reset(&mut self) {
        match self {
            Filter::LowPass(s) => s.reset(),
            Filter::HighPass(s) => s.reset(),
            Filter::MovingAverage(s) => s.reset(),
            Filter::Median(s) => s.reset(),
            Filter::Exponential(s) => s.reset(),
            Filter::Chain(stages) => stages.iter_mut().for_each(Filter::reset),
        }
    }
}

fn validate_sample_rate(sample_rate: f32) -> DspResult<()> {
    if sample_rate <= 0.0 {
        return Err(DspError::InvalidSampleRate(sample_rate));
    }
    Ok(())
}

fn validate_window(window: usize) -> DspResult<usize> {
    if window == 0 {
        return Err(DspError::InvalidWindowSize(window));
    }
    Ok(window.min(MAX_WINDOW))
}

/// One-pole low-pass: `y[n] = alpha*x[n] + (1-alpha)*y[n-1]`,
/// `alpha = dt/(rc+dt)`, `rc = 1/(2*pi*fc)`.
#[derive(Debug, Clone)]
pub struct LowPassState {
    alpha: f32,
    last_output: Option<f32>,
}

impl LowPassState {
    pub fn new(cutoff_hz: f32, sample_rate: f32) -> DspResult<Self> {
        validate_sample_rate(sample_rate)?;
        let rc = 1.0 / (2.0 * std::f32::consts::PI * cutoff_hz);
        let dt = 1.0 / sample_rate;
        let alpha = dt / (rc + dt);
        Ok(Self {
            alpha,
            last_output: None,
        })
    }

    pub fn process(&mut self, input: f32) -> f32 {
        let prev = self.last_output.unwrap_or(input);
        let output = self.alpha * input + (1.0 - self.alpha) * prev;
        self.last_output = Some(output);
        output
    }

    pub fn reset(&mut self) {
        self.last_output = None;
    }
}

/// One-pole high-pass: `y[n] = alpha*(y[n-1] + x[n] - x[n-1])`,
/// `alpha = rc/(rc+dt)`. Returns 0 on the first sample (no prior `x[n-1]`).
#[derive(Debug, Clone)]
pub struct HighPassState {
    alpha: f32,
    last_input: Option<f32>,
    last_output: f32,
}

impl HighPassState {
    pub fn new(cutoff_hz: f32, sample_rate: f32) -> DspResult<Self> {
        validate_sample_rate(sample_rate)?;
        let rc = 1.0 / (2.0 * std::f32::consts::PI * cutoff_hz);
        let dt = 1.0 / sample_rate;
        let alpha = rc / (rc + dt);
        Ok(Self {
            alpha,
            last_input: None,
            last_output: 0.0,
        })
    }

    pub fn process(&mut self, input: f32) -> f32 {
        let output = match self.last_input {
            None => 0.0,
            Some(prev_in) => self.alpha * (self.last_output + input - prev_in),
        };
        self.last_input = Some(input);
        self.last_output = output;
        output
    }

    pub fn reset(&mut self) {
        self.last_input = None;
        self.last_output = 0.0;
    }
}

/// O(1) running-sum moving average over a bounded window.
#[derive(Debug, Clone)]
pub struct MovingAverageState {
    window: VecDeque<f32>,
    capacity: usize,
    sum: f32,
}

impl MovingAverageState {
    pub fn new(window: usize) -> DspResult<Self> {
        let capacity = validate_window(window)?;
        Ok(Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            sum: 0.0,
        })
    }

    pub fn process(&mut self, input: f32) -> f32 {
        self.window.push_back(input);
        self.sum += input;
        if self.window.len() > self.capacity {
            if let Some(oldest) = self.window.pop_front() {
                self.sum -= oldest;
            }
        }
        self.sum / self.window.len() as f32
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.sum = 0.0;
    }
}

/// Median filter over a bounded window, sorted on every call (window is
/// capped at 32 samples, so this stays cheap).
#[derive(Debug, Clone)]
pub struct MedianState {
    window: VecDeque<f32>,
    capacity: usize,
    scratch: Vec<f32>,
}

impl MedianState {
    pub fn new(window: usize) -> DspResult<Self> {
        let capacity = validate_window(window)?;
        Ok(Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            scratch: Vec::with_capacity(capacity),
        })
    }

    pub fn process(&mut self, input: f32) -> f32 {
        self.window.push_back(input);
        if self.window.len() > self.capacity {
            self.window.pop_front();
        }
        self.scratch.clear();
        self.scratch.extend(self.window.iter().copied());
        self.scratch
            .sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        self.scratch[self.scratch.len() / 2]
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.scratch.clear();
    }
}

/// Exponential moving average: `y[n] = alpha*x[n] + (1-alpha)*y[n-1]`,
/// alpha clamped to `[0.001, 1.0]`.
#[derive(Debug, Clone)]
pub struct ExponentialState {
    alpha: f32,
    last_output: Option<f32>,
}

impl ExponentialState {
    pub fn new(alpha: f32) -> DspResult<Self> {
        if !(0.0..=1.0).contains(&alpha) {
            return Err(DspError::InvalidAlpha(alpha));
        }
        Ok(Self {
            alpha: alpha.clamp(0.001, 1.0),
            last_output: None,
        })
    }

    pub fn process(&mut self, input: f32) -> f32 {
        let output = match self.last_output {
            None => input,
            Some(prev) => self.alpha * input + (1.0 - self.alpha) * prev,
        };
        self.last_output = Some(output);
        output
    }

    pub fn reset(&mut self) {
        self.last_output = None;
    }
}

/// Presets mirroring the built-in filter chains: CV conditioning, audio
/// conditioning, UI smoothing, and aggressive noise reduction.
pub struct FilterFactory;

impl FilterFactory {
    pub fn cv_filter(sample_rate: f32) -> Filter {
        Filter::chain(vec![
            Filter::median(3).expect("window 3 is always valid"),
            Filter::low_pass(50.0, sample_rate).expect("cutoff 50Hz is always valid"),
        ])
    }

    pub fn audio_filter(sample_rate: f32) -> Filter {
        Filter::chain(vec![
            Filter::high_pass(20.0, sample_rate).expect("cutoff 20Hz is always valid"),
            Filter::low_pass(20_000.0, sample_rate).expect("cutoff 20kHz is always valid"),
        ])
    }

    pub fn smoothing_filter() -> Filter {
        Filter::exponential(0.05).expect("alpha 0.05 is always valid")
    }

    pub fn noise_reduction_filter(sample_rate: f32) -> Filter {
        Filter::chain(vec![
            Filter::median(5).expect("window 5 is always valid"),
            Filter::moving_average(8).expect("window 8 is always valid"),
            Filter::low_pass(100.0, sample_rate).expect("cutoff 100Hz is always valid"),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_pass_bootstraps_from_first_sample() {
        let mut f = LowPassState::new(50.0, 44100.0).unwrap();
        assert_eq!(f.process(1.0), 1.0);
    }

    #[test]
    fn low_pass_converges_to_dc_input() {
        let mut f = LowPassState::new(50.0, 44100.0).unwrap();
        let mut last = 0.0;
        for _ in 0..10_000 {
            last = f.process(1.0);
        }
        assert!((last - 1.0).abs() < 1e-3);
    }

    #[test]
    fn high_pass_returns_zero_on_first_sample() {
        let mut f = HighPassState::new(20.0, 44100.0).unwrap();
        assert_eq!(f.process(5.0), 0.0);
    }

    #[test]
    fn high_pass_blocks_dc() {
        let mut f = HighPassState::new(20.0, 44100.0).unwrap();
        let mut last = 0.0;
        for _ in 0..10_000 {
            last = f.process(3.0);
        }
        assert!(last.abs() < 1e-2);
    }

    #[test]
    fn moving_average_of_constant_is_constant() {
        let mut f = MovingAverageState::new(8).unwrap();
        for _ in 0..8 {
            f.process(2.0);
        }
        assert!((f.process(2.0) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn median_rejects_single_spike() {
        let mut f = MedianState::new(5).unwrap();
        for _ in 0..4 {
            f.process(0.0);
        }
        let out = f.process(100.0);
        assert_eq!(out, 0.0);
    }

    #[test]
    fn exponential_clamps_alpha() {
        let f = ExponentialState::new(5.0);
        assert!(f.is_err());
    }

    #[test]
    fn exponential_first_sample_passthrough() {
        let mut f = ExponentialState::new(0.05).unwrap();
        assert_eq!(f.process(3.0), 3.0);
    }

    #[test]
    fn chain_applies_stages_in_order() {
        let mut chain = Filter::chain(vec![
            Filter::exponential(1.0).unwrap(),
            Filter::exponential(1.0).unwrap(),
        ]);
        // alpha = 1.0 on both stages means pure passthrough
        assert_eq!(chain.process(7.0), 7.0);
    }

    #[test]
    fn reset_clears_state() {
        let mut f = Filter::low_pass(50.0, 44100.0).unwrap();
        f.process(10.0);
        f.process(10.0);
        f.reset();
        assert_eq!(f.process(3.0), 3.0);
    }

    #[test]
    fn cv_filter_preset_shape() {
        let mut f = FilterFactory::cv_filter(44100.0);
        let out = f.process(1.0);
        assert!(out.is_finite());
    }

    #[test]
    fn invalid_window_size_rejected() {
        assert!(Filter::median(0).is_err());
        assert!(Filter::moving_average(0).is_err());
    }
}
