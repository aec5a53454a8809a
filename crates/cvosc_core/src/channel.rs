//! Channel: identity, state machine, device lists, and meters.

use serde::{Deserialize, Serialize};

use crate::device::DeviceConfig;
use crate::error::{CoreError, CoreResult};
use crate::meter::SignalMeter;

const MAX_DEVICES_PER_ROLE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    Stopped,
    Running,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelMode {
    Mix,
    Solo,
    Mute,
}

/// One routable signal path: a voltage range, a state machine, bounded
/// input/output device lists, and the two meters the engine loop reads.
pub struct Channel {
    pub channel_id: usize,
    pub name: String,
    pub color: (u8, u8, u8),
    pub state: ChannelState,
    pub mode: ChannelMode,
    min_v: f32,
    max_v: f32,
    level_volts: f32,
    pub inputs: Vec<DeviceConfig>,
    pub outputs: Vec<DeviceConfig>,
    pub input_meter: SignalMeter,
    pub output_meter: SignalMeter,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub errors: u64,
}

impl Channel {
    /// `min_v < max_v` is a hard invariant; callers that violate it get
    /// `InvalidDeviceConfig` back rather than an inconsistent channel.
    pub fn new(channel_id: usize, name: impl Into<String>, min_v: f32, max_v: f32) -> CoreResult<Self> {
        if !(min_v < max_v) {
            return Err(CoreError::InvalidDeviceConfig(format!(
                "channel voltage range must satisfy min < max, got [{min_v}, {max_v}]"
            )));
        }
        Ok(Self {
            channel_id,
            name: name.into(),
            color: (128, 128, 128),
            state: ChannelState::Stopped,
            mode: ChannelMode::Mix,
            min_v,
            max_v,
            level_volts: min_v.max(0.0).min(max_v),
            inputs: Vec::new(),
            outputs: Vec::new(),
            input_meter: SignalMeter::new(),
            output_meter: SignalMeter::new(),
            messages_received: 0,
            messages_sent: 0,
            errors: 0,
        })
    }

    pub fn range(&self) -> (f32, f32) {
        (self.min_v, self.max_v)
    }

    pub fn level_volts(&self) -> f32 {
        self.level_volts
    }

    pub fn set_level_volts(&mut self, volts: f32) {
        self.level_volts = volts.clamp(self.min_v, self.max_v);
    }

    /// Normalize the current level into `[0, 1]` over the channel's range.
    /// Metering/UI convenience only - the OSC forward path is exact
    /// passthrough and never multiplies by this.
    pub fn normalized_level(&self) -> f32 {
        if (self.max_v - self.min_v).abs() < f32::EPSILON {
            return 0.0;
        }
        ((self.level_volts - self.min_v) / (self.max_v - self.min_v)).clamp(0.0, 1.0)
    }

    pub fn add_input(&mut self, device: DeviceConfig) -> CoreResult<()> {
        if self.inputs.len() >= MAX_DEVICES_PER_ROLE {
            return Err(CoreError::InvalidDeviceConfig(format!(
                "channel {} already has {} input devices",
                self.channel_id, MAX_DEVICES_PER_ROLE
            )));
        }
        device.validate()?;
        self.inputs.push(device);
        Ok(())
    }

    pub fn add_output(&mut self, device: DeviceConfig) -> CoreResult<()> {
        if self.outputs.len() >= MAX_DEVICES_PER_ROLE {
            return Err(CoreError::InvalidDeviceConfig(format!(
                "channel {} already has {} output devices",
                self.channel_id, MAX_DEVICES_PER_ROLE
            )));
        }
        device.validate()?;
        self.outputs.push(device);
        Ok(())
    }

    /// Whether this channel has at least one enabled audio input and
    /// output, the condition under which the engine prefers a duplex stream.
    pub fn has_audio_duplex_pair(&self) -> bool {
        self.inputs
            .iter()
            .any(|d| d.enabled && d.kind.is_audio())
            && self.outputs.iter().any(|d| d.enabled && d.kind.is_audio())
    }

    pub fn start(&mut self) {
        self.state = ChannelState::Running;
    }

    pub fn stop(&mut self) {
        self.state = ChannelState::Stopped;
    }

    pub fn mark_error(&mut self) {
        self.state = ChannelState::Error;
        self.errors += 1;
    }

    pub fn reset_from_error(&mut self) {
        if self.state == ChannelState::Error {
            self.state = ChannelState::Stopped;
        }
    }
}

/// `should_be_audible`: the shared solo guard used by both the forward
/// loop and `route_output`, so a SOLO exclusion can't leak through either
/// path (§9 Design Notes, solo symmetry decision).
pub fn should_be_audible(channel: &Channel, any_solo_active: bool) -> bool {
    if channel.state != ChannelState::Running {
        return false;
    }
    if channel.mode == ChannelMode::Mute {
        return false;
    }
    if any_solo_active {
        channel.mode == ChannelMode::Solo
    } else {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_inverted_range() {
        assert!(Channel::new(0, "c0", 10.0, 0.0).is_err());
    }

    #[test]
    fn level_is_clamped_to_range() {
        let mut c = Channel::new(0, "c0", 0.0, 10.0).unwrap();
        c.set_level_volts(12.0);
        assert_eq!(c.level_volts(), 10.0);
        c.set_level_volts(-5.0);
        assert_eq!(c.level_volts(), 0.0);
    }

    #[test]
    fn normalization_matches_scenario_1() {
        let mut c = Channel::new(0, "c0", 0.0, 10.0).unwrap();
        let expected = [0.0, 0.25, 0.5, 1.0, 1.0];
        for (input, exp) in [0.0, 2.5, 5.0, 10.0, 12.0].iter().zip(expected.iter()) {
            c.set_level_volts(*input);
            assert!((c.normalized_level() - exp).abs() < 1e-6);
        }
    }

    #[test]
    fn input_list_bounded_at_eight() {
        let mut c = Channel::new(0, "c0", 0.0, 10.0).unwrap();
        for i in 0..8 {
            let cfg = crate::device::DeviceConfig {
                device_id: format!("in-{i}"),
                display_name: "in".into(),
                kind: crate::device::DeviceKind::CvInput,
                transport: None,
                remote_addr: String::new(),
                remote_port: 0,
                local_addr: String::new(),
                local_port: 0,
                osc_address_prefix: String::new(),
                signal_level: 50.0,
                signal_offset: 0.0,
                invert: false,
                enabled: true,
                auto_reconnect: false,
                timeout_ms: 5000,
                audio_device_index: None,
            };
            assert!(c.add_input(cfg).is_ok());
        }
        let ninth = crate::device::DeviceConfig {
            device_id: "in-9".into(),
            display_name: "in".into(),
            kind: crate::device::DeviceKind::CvInput,
            transport: None,
            remote_addr: String::new(),
            remote_port: 0,
            local_addr: String::new(),
            local_port: 0,
            osc_address_prefix: String::new(),
            signal_level: 50.0,
            signal_offset: 0.0,
            invert: false,
            enabled: true,
            auto_reconnect: false,
            timeout_ms: 5000,
            audio_device_index: None,
        };
        assert!(c.add_input(ninth).is_err());
    }

    #[test]
    fn solo_excludes_non_solo_running_channels() {
        let mut mix = Channel::new(0, "mix", 0.0, 10.0).unwrap();
        mix.start();
        let mut solo = Channel::new(1, "solo", 0.0, 10.0).unwrap();
        solo.start();
        solo.mode = ChannelMode::Solo;

        assert!(!should_be_audible(&mix, true));
        assert!(should_be_audible(&solo, true));
    }

    #[test]
    fn no_solo_means_all_running_channels_audible() {
        let mut c = Channel::new(0, "c0", 0.0, 10.0).unwrap();
        c.start();
        assert!(should_be_audible(&c, false));
    }

    #[test]
    fn stopped_channel_never_audible() {
        let c = Channel::new(0, "c0", 0.0, 10.0).unwrap();
        assert!(!should_be_audible(&c, false));
    }

    #[test]
    fn muted_channel_never_audible_even_without_solo() {
        let mut c = Channel::new(0, "c0", 0.0, 10.0).unwrap();
        c.start();
        c.mode = ChannelMode::Mute;
        assert!(!should_be_audible(&c, false));
    }

    #[test]
    fn error_resets_to_stopped() {
        let mut c = Channel::new(0, "c0", 0.0, 10.0).unwrap();
        c.mark_error();
        assert_eq!(c.state, ChannelState::Error);
        c.reset_from_error();
        assert_eq!(c.state, ChannelState::Stopped);
    }
}
