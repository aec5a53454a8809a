//! Signal metering: a ring buffer of recent samples plus decaying peak/RMS.

use std::collections::VecDeque;
use std::time::Instant;

const METER_WINDOW: usize = 100;
const PEAK_DECAY_PER_SEC: f32 = 0.98;

/// Ring buffer of the last `METER_WINDOW` samples with derived current,
/// peak (monotone decay), and RMS levels.
#[derive(Debug)]
pub struct SignalMeter {
    window: VecDeque<f32>,
    current: f32,
    peak: f32,
    rms: f32,
    last_update: Instant,
}

impl SignalMeter {
    pub fn new() -> Self {
        Self {
            window: VecDeque::with_capacity(METER_WINDOW),
            current: 0.0,
            peak: 0.0,
            rms: 0.0,
            last_update: Instant::now(),
        }
    }

    /// Push a new sample, decaying the peak for elapsed time first.
    pub fn push(&mut self, sample: f32) {
        self.decay_peak();

        if self.window.len() == METER_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(sample);

        self.current = sample;
        self.peak = self.peak.max(sample.abs());
        self.rms = self.compute_rms();
        self.last_update = Instant::now();
    }

    /// Apply exponential peak decay for time elapsed since the last update,
    /// without touching the window. Called both by `push` and by the
    /// engine loop when a channel has no fresh sample this cycle.
    pub fn decay_peak(&mut self) {
        let elapsed = self.last_update.elapsed().as_secs_f32();
        if elapsed > 0.0 {
            self.peak *= PEAK_DECAY_PER_SEC.powf(elapsed);
        }
    }

    fn compute_rms(&self) -> f32 {
        if self.window.is_empty() {
            return 0.0;
        }
        let sum_sq: f32 = self.window.iter().map(|x| x * x).sum();
        (sum_sq / self.window.len() as f32).sqrt()
    }

    pub fn current(&self) -> f32 {
        self.current
    }

    pub fn peak(&self) -> f32 {
        self.peak
    }

    pub fn rms(&self) -> f32 {
        self.rms
    }

    pub fn last_update(&self) -> Instant {
        self.last_update
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.current = 0.0;
        self.peak = 0.0;
        self.rms = 0.0;
        self.last_update = Instant::now();
    }
}

impl Default for SignalMeter {
    fn default() -> Self {
        Self::new()
    }
}
