//! Audio Stream Management
//!
//! One `AudioStream` wraps up to two CPAL streams (capture, output) that
//! hand samples off through an `rtrb` lock-free SPSC ring buffer. Input
//! samples are downmixed to mono, pushed into the ring, and scored for CV
//! level; output samples are popped back out of the same ring for
//! zero-copy duplex passthrough.
//!
//! There is intentionally no per-channel gain, fader, mute, solo, or master
//! processing applied to the samples in this module - that gating happens
//! once, at the message-routing layer, via `should_be_audible`. This module
//! only ever does: downmix, meter, passthrough.

use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig as CpalStreamConfig};
use crossbeam_channel::Sender;
use rtrb::{Consumer, Producer, RingBuffer};

use crate::config::StreamConfig;
use crate::error::{CoreError, CoreResult};
use crate::message::Event;

/// 2 seconds of audio at 44.1kHz, matching the window the original
/// passthrough engine used for its circular buffer.
const BUFFER_SIZE: usize = 44_100 * 2;

/// Below this CV level, an RMS-based reading is considered too quiet to
/// trust and the engine falls back to a peak-based estimate instead.
const RMS_FLOOR: f32 = 0.1;
const PEAK_FALLBACK_MULTIPLIER: f32 = 10.0;
const CV_MAX: f32 = 10.0;

/// Pop `count` mono samples off `consumer`, or return `None` if that many
/// aren't available yet (caller should fill with silence and count an
/// underrun). Never blocks - the output callback can't afford to.
fn drain(consumer: &mut Consumer<f32>, count: usize) -> Option<Vec<f32>> {
    if consumer.slots() < count {
        return None;
    }
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(consumer.pop().ok()?);
    }
    Some(out)
}

/// Downmix a frame of interleaved samples to mono.
fn downmix(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    frame.iter().sum::<f32>() / frame.len() as f32
}

/// Score a block of mono samples into a 0-10V CV reading: RMS scaled by
/// `signal_level`, falling back to peak * 10 when the RMS reading is too
/// quiet to register (typical of line-level CV through a mic-tuned path).
fn score_cv_level(mono: &[f32], signal_level: f32) -> (f32, f32, f32) {
    if mono.is_empty() {
        return (0.0, 0.0, 0.0);
    }
    let sum_sq: f32 = mono.iter().map(|s| s * s).sum();
    let rms = (sum_sq / mono.len() as f32).sqrt();
    let peak = mono.iter().fold(0.0_f32, |acc, s| acc.max(s.abs()));

    let mut cv = (rms * signal_level).clamp(0.0, CV_MAX);
    if cv < RMS_FLOOR && peak > 0.01 {
        cv = (peak * PEAK_FALLBACK_MULTIPLIER).clamp(0.0, CV_MAX);
    }
    (cv, rms, peak)
}

/// One open audio stream: capture, output, or both sharing an `rtrb` ring
/// buffer. The producer/consumer halves live inside the CPAL callback
/// closures themselves (each callback owns its half by move), so there's
/// nothing left to hold here once the streams are built.
pub struct AudioStream {
    #[allow(dead_code)]
    capture_stream: Option<Stream>,
    #[allow(dead_code)]
    output_stream: Option<Stream>,
    level: Arc<Mutex<f32>>,
    pub config: StreamConfig,
}

impl AudioStream {
    /// Open an input-only stream: capture, downmix, score CV level, and
    /// hold samples in the circular buffer for an eventual output reader.
    pub fn start_input(
        config: StreamConfig,
        device: &Device,
        signal_level: f32,
        event_sender: Sender<Event>,
    ) -> CoreResult<Self> {
        config.validate().map_err(CoreError::ConfigError)?;
        Self::open_with_retry(config, |cfg| {
            Self::build_input_only(cfg, device, signal_level, event_sender.clone())
        })
    }

    /// Open an output-only stream, reading passthrough samples from a
    /// buffer that some other input stream (or nothing) is writing into.
    pub fn start_output(
        config: StreamConfig,
        device: &Device,
        event_sender: Sender<Event>,
    ) -> CoreResult<Self> {
        config.validate().map_err(CoreError::ConfigError)?;
        Self::open_with_retry(config, |cfg| {
            Self::build_output_only(cfg, device, event_sender.clone())
        })
    }

    /// Open a duplex stream: one capture device and one output device
    /// sharing a single circular buffer, giving zero-copy passthrough.
    pub fn start_duplex(
        config: StreamConfig,
        input_device: &Device,
        output_device: &Device,
        signal_level: f32,
        event_sender: Sender<Event>,
    ) -> CoreResult<Self> {
        config.validate().map_err(CoreError::ConfigError)?;
        Self::open_with_retry(config, |cfg| {
            Self::build_duplex(cfg, input_device, output_device, signal_level, event_sender.clone())
        })
    }

    /// Retry once, with channel count forced to 1 and buffer size doubled,
    /// if the first attempt fails to open the device. Escalates the second
    /// failure as a non-retryable error.
    fn open_with_retry(
        config: StreamConfig,
        build: impl Fn(&StreamConfig) -> CoreResult<Self>,
    ) -> CoreResult<Self> {
        match build(&config) {
            Ok(stream) => Ok(stream),
            Err(first_err) => {
                let retry_config = StreamConfig {
                    sample_rate: config.sample_rate,
                    channels: 1,
                    buffer_size: config.buffer_size.saturating_mul(2),
                };
                tracing::warn!(error = %first_err, "audio open failed, retrying with mono/larger buffer");
                build(&retry_config).map_err(|_| CoreError::AudioOpenError {
                    message: first_err.to_string(),
                    retryable: false,
                })
            }
        }
    }

    fn build_input_only(
        config: &StreamConfig,
        device: &Device,
        signal_level: f32,
        event_sender: Sender<Event>,
    ) -> CoreResult<Self> {
        let (producer, _consumer) = RingBuffer::<f32>::new(BUFFER_SIZE);
        let level = Arc::new(Mutex::new(0.0));
        let cpal_config = to_cpal_config(config);

        let capture_stream =
            Self::build_capture_stream(device, &cpal_config, producer, Arc::clone(&level), signal_level, event_sender)?;
        capture_stream
            .play()
            .map_err(|e| CoreError::StreamPlayError(e.to_string()))?;

        Ok(Self {
            capture_stream: Some(capture_stream),
            output_stream: None,
            level,
            config: config.clone(),
        })
    }

    fn build_output_only(
        config: &StreamConfig,
        device: &Device,
        event_sender: Sender<Event>,
    ) -> CoreResult<Self> {
        let (_producer, consumer) = RingBuffer::<f32>::new(BUFFER_SIZE);
        let level = Arc::new(Mutex::new(0.0));
        let cpal_config = to_cpal_config(config);

        let output_stream = Self::build_output_stream(device, &cpal_config, consumer, event_sender)?;
        output_stream
            .play()
            .map_err(|e| CoreError::StreamPlayError(e.to_string()))?;

        Ok(Self {
            capture_stream: None,
            output_stream: Some(output_stream),
            level,
            config: config.clone(),
        })
    }

    fn build_duplex(
        config: &StreamConfig,
        input_device: &Device,
        output_device: &Device,
        signal_level: f32,
        event_sender: Sender<Event>,
    ) -> CoreResult<Self> {
        let (producer, consumer) = RingBuffer::<f32>::new(BUFFER_SIZE);
        let level = Arc::new(Mutex::new(0.0));
        let cpal_config = to_cpal_config(config);

        let capture_stream = Self::build_capture_stream(
            input_device,
            &cpal_config,
            producer,
            Arc::clone(&level),
            signal_level,
            event_sender.clone(),
        )?;
        let output_stream = Self::build_output_stream(output_device, &cpal_config, consumer, event_sender)?;

        capture_stream
            .play()
            .map_err(|e| CoreError::StreamPlayError(e.to_string()))?;
        output_stream
            .play()
            .map_err(|e| CoreError::StreamPlayError(e.to_string()))?;

        Ok(Self {
            capture_stream: Some(capture_stream),
            output_stream: Some(output_stream),
            level,
            config: config.clone(),
        })
    }

    fn build_capture_stream(
        device: &Device,
        config: &CpalStreamConfig,
        mut producer: Producer<f32>,
        level: Arc<Mutex<f32>>,
        signal_level: f32,
        event_sender: Sender<Event>,
    ) -> CoreResult<Stream> {
        let channels = config.channels as usize;
        let err_sender = event_sender.clone();

        let stream = device
            .build_input_stream(
                config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let mut mono = Vec::with_capacity(data.len() / channels.max(1) + 1);
                    for frame in data.chunks(channels.max(1)) {
                        let sample = downmix(frame);
                        // Dropped, not overwritten, if the output side has
                        // fallen behind and the ring is full.
                        let _ = producer.push(sample);
                        mono.push(sample);
                    }
                    let (cv, _rms, _peak) = score_cv_level(&mono, signal_level);
                    if let Ok(mut l) = level.lock() {
                        *l = cv;
                    }
                },
                move |err| {
                    let _ = err_sender.try_send(Event::error(err));
                },
                None,
            )
            .map_err(|e| CoreError::StreamBuildError(e.to_string()))?;

        Ok(stream)
    }

    fn build_output_stream(
        device: &Device,
        config: &CpalStreamConfig,
        mut consumer: Consumer<f32>,
        event_sender: Sender<Event>,
    ) -> CoreResult<Stream> {
        let channels = config.channels as usize;
        let err_sender = event_sender.clone();

        let stream = device
            .build_output_stream(
                config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / channels.max(1);
                    match drain(&mut consumer, frames) {
                        Some(samples) => {
                            for (frame, sample) in data.chunks_mut(channels.max(1)).zip(samples) {
                                for slot in frame.iter_mut() {
                                    *slot = sample;
                                }
                            }
                        }
                        None => {
                            data.fill(0.0);
                            let _ = event_sender.try_send(Event::BufferUnderrun);
                        }
                    }
                },
                move |err| {
                    let _ = err_sender.try_send(Event::error(err));
                },
                None,
            )
            .map_err(|e| CoreError::StreamBuildError(e.to_string()))?;

        Ok(stream)
    }

    /// Current scored CV level (0-10V) from the most recent capture block.
    pub fn current_level(&self) -> f32 {
        self.level.lock().map(|l| *l).unwrap_or(0.0)
    }
}

fn to_cpal_config(config: &StreamConfig) -> CpalStreamConfig {
    CpalStreamConfig {
        channels: config.channels,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Fixed(config.buffer_size),
    }
}
