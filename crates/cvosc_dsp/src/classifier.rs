//! Rolling-window signal classification: is this channel carrying CV,
//! audio, or something we can't tell yet.

use std::collections::VecDeque;

const MAX_WINDOW: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Cv,
    Audio,
    Unknown,
}

mod serde_impl {
    use super::SignalKind;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    impl Serialize for SignalKind {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            let s = match self {
                SignalKind::Cv => "CV",
                SignalKind::Audio => "AUDIO",
                SignalKind::Unknown => "UNKNOWN",
            };
            serializer.serialize_str(s)
        }
    }

    impl<'de> Deserialize<'de> for SignalKind {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            let s = String::deserialize(deserializer)?;
            Ok(match s.as_str() {
                "CV" => SignalKind::Cv,
                "AUDIO" => SignalKind::Audio,
                _ => SignalKind::Unknown,
            })
        }
    }
}

/// Rolling statistics over the most recent samples of a channel.
#[derive(Debug, Clone)]
pub struct SignalAnalysis {
    window: VecDeque<f32>,
    capacity: usize,
    consecutive_stable: u32,
}

/// A snapshot of derived statistics plus the classification decision.
#[derive(Debug, Clone, Copy)]
pub struct ClassificationResult {
    pub dc: f32,
    pub ac_rms: f32,
    pub peak_to_peak: f32,
    pub change_rate: f32,
    pub consecutive_stable: u32,
    pub kind: SignalKind,
    pub confidence: f32,
}

impl SignalAnalysis {
    pub fn new(window: usize) -> Self {
        let capacity = window.clamp(1, MAX_WINDOW);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            consecutive_stable: 0,
        }
    }

    pub fn push(&mut self, sample: f32) {
        self.window.push_back(sample);
        if self.window.len() > self.capacity {
            self.window.pop_front();
        }
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.consecutive_stable = 0;
    }

    /// Compute rolling statistics and classify based on §4.C thresholds.
    /// Returns `None` until the window has at least two samples.
    ///
    /// `consecutive_stable` increments while the signal classifies as CV
    /// with `change_rate < 0.01`, and resets to 0 otherwise - it's state
    /// carried across calls, not a pure function of the current window.
    pub fn classify(&mut self, device_name_hint: Option<&str>) -> Option<ClassificationResult> {
        if self.window.len() < 2 {
            return None;
        }

        let n = self.window.len() as f32;
        let dc = self.window.iter().sum::<f32>() / n;
        let ac_rms = (self.window.iter().map(|x| (x - dc).powi(2)).sum::<f32>() / n).sqrt();
        let peak_to_peak = self.window.iter().cloned().fold(f32::MIN, f32::max)
            - self.window.iter().cloned().fold(f32::MAX, f32::min);
        let change_rate = self
            .window
            .iter()
            .zip(self.window.iter().skip(1))
            .map(|(a, b)| (b - a).abs())
            .sum::<f32>()
            / (n - 1.0).max(1.0);

        let looks_like_cv =
            ac_rms < 0.01 && change_rate < 0.01 && peak_to_peak < 0.1 * dc.abs().max(1e-6);
        let looks_like_audio = ac_rms > 0.1 || change_rate > 0.1;

        let (kind, base_confidence) = if looks_like_cv && !looks_like_audio {
            (SignalKind::Cv, (1.0 - (ac_rms / 0.1)).clamp(0.0, 1.0))
        } else if looks_like_audio {
            (SignalKind::Audio, (ac_rms / 0.1).clamp(0.0, 1.0).max((change_rate / 0.1).clamp(0.0, 1.0)))
        } else {
            (SignalKind::Unknown, 0.3)
        };

        let confidence = match device_name_hint.map(str::to_lowercase) {
            Some(hint) if kind == SignalKind::Cv && name_suggests_cv(&hint) => {
                (base_confidence + 0.2).min(1.0)
            }
            Some(hint) if kind == SignalKind::Audio && name_suggests_audio(&hint) => {
                (base_confidence + 0.2).min(1.0)
            }
            _ => base_confidence,
        };

        if kind == SignalKind::Cv && change_rate < 0.01 {
            self.consecutive_stable += 1;
        } else {
            self.consecutive_stable = 0;
        }

        Some(ClassificationResult {
            dc,
            ac_rms,
            peak_to_peak,
            change_rate,
            consecutive_stable: self.consecutive_stable,
            kind,
            confidence,
        })
    }
}

fn name_suggests_cv(name: &str) -> bool {
    ["cv", "control", "modular", "eurorack", "gate"]
        .iter()
        .any(|needle| name.contains(needle))
}

fn name_suggests_audio(name: &str) -> bool {
    ["mic", "audio", "line in", "interface"]
        .iter()
        .any(|needle| name.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steady_dc_classifies_as_cv() {
        let mut a = SignalAnalysis::new(64);
        for _ in 0..64 {
            a.push(2.5);
        }
        let result = a.classify(None).unwrap();
        assert_eq!(result.kind, SignalKind::Cv);
    }

    #[test]
    fn consecutive_stable_increments_on_cv_and_resets_on_audio() {
        let mut a = SignalAnalysis::new(64);
        for _ in 0..64 {
            a.push(2.5);
        }
        let first = a.classify(None).unwrap();
        assert_eq!(first.consecutive_stable, 1);
        let second = a.classify(None).unwrap();
        assert_eq!(second.consecutive_stable, 2);

        for i in 0..64 {
            let t = i as f32 * 0.1;
            a.push((t * 2.0 * std::f32::consts::PI).sin());
        }
        let after_audio = a.classify(None).unwrap();
        assert_eq!(after_audio.consecutive_stable, 0);
    }

    #[test]
    fn sine_wave_classifies_as_audio() {
        let mut a = SignalAnalysis::new(64);
        for i in 0..64 {
            let t = i as f32 * 0.1;
            a.push((t * 2.0 * std::f32::consts::PI).sin());
        }
        let result = a.classify(None).unwrap();
        assert_eq!(result.kind, SignalKind::Audio);
    }

    #[test]
    fn window_caps_at_256() {
        let a = SignalAnalysis::new(10_000);
        assert_eq!(a.capacity, 256);
    }

    #[test]
    fn empty_window_has_no_classification() {
        let mut a = SignalAnalysis::new(64);
        assert!(a.classify(None).is_none());
    }

    #[test]
    fn device_name_hint_boosts_confidence() {
        let mut a = SignalAnalysis::new(64);
        for _ in 0..64 {
            a.push(1.0);
        }
        let without_hint = a.classify(None).unwrap();
        let with_hint = a.classify(Some("Eurorack CV Interface")).unwrap();
        assert!(with_hint.confidence >= without_hint.confidence);
    }
}
