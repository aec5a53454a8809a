//! Mixer engine: channel state machine, message routing, and the
//! background engine loop.
//!
//! Passthrough policy (load-bearing): the forward path applies no
//! per-channel gain, offset, fader, mute/solo, or master scaling to a
//! value in flight. The only gate applied is `should_be_audible`,
//! applied symmetrically in both the per-tick forward loop and
//! `route_input`'s immediate dispatch, so a SOLO exclusion can't leak
//! through either path. Calibration and per-device `signal_offset`/
//! `invert` are not mixing - they're device-specific conditioning
//! applied before/after the mixer's own zero-gain pass.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use cvosc_dsp::{fit_linear, is_plausible_point, CalibrationPoint, CalibrationStore};
use cvosc_telemetry::{Category, ErrorHandler, HealthStatus, MonitorConfig, PerformanceMonitor};
use cvosc_transport::{parse_channel_address, OscReceiver, OscSender, OscType};

use crate::channel::{should_be_audible, Channel, ChannelMode, ChannelState};
use crate::config::EngineConfig;
use crate::device::{
    AudioDevice, DeviceConfig, DeviceStatus, DeviceStatusEntry, DeviceTransport,
};
use crate::error::{CoreError, CoreResult};
use crate::format::FormatManager;
use crate::message::{Command, DeviceStatusKind, Event};
use crate::stream_manager::StreamManager;

const DEFAULT_CHANNEL_COUNT: usize = 8;
const MIN_CHANNELS: usize = 1;
const MAX_CHANNELS: usize = 32;
const OSC_METER_FRESHNESS: Duration = Duration::from_millis(100);
const DISCOVERY_INTERVAL: Duration = Duration::from_secs(5);
const MIXER_CONFIG_VERSION: &str = "2.0.0";
const SIMULATED_DISCOVERED_DEVICES: [&str; 3] =
    ["TouchDesigner (127.0.0.1:9000)", "Max/MSP (127.0.0.1:7000)", "Resolume (127.0.0.1:7001)"];

/// The `device_mutex` of §5: senders/receivers/statuses behind one lock,
/// never held across a send, stream open/close, or callback.
struct DeviceMaps {
    statuses: HashMap<String, DeviceStatusEntry>,
    senders: HashMap<String, OscSender>,
    receivers: HashMap<String, OscReceiver>,
}

struct Shared {
    channels: Mutex<Vec<Channel>>,
    devices: Mutex<DeviceMaps>,
    stream_manager: StreamManager,
    format: Mutex<FormatManager>,
    calibration: Mutex<CalibrationStore>,
    /// In-progress calibration points, keyed by channel, cleared on
    /// `start_calibration` and consumed by `finish_calibration`.
    calibration_points: Mutex<HashMap<usize, Vec<CalibrationPoint>>>,
    /// Fixed broadcast target for `FormatManager`-generated messages
    /// (the profile's `osc_host`/`osc_port`), separate from a channel's
    /// own explicit output device list.
    default_osc_sender: Mutex<Option<OscSender>>,
    errors: Arc<ErrorHandler>,
    perf: Arc<PerformanceMonitor>,
    running: AtomicBool,
    discovery_enabled: AtomicBool,
    total_errors: AtomicU64,
    config: EngineConfig,
    command_tx: Sender<Command>,
    event_tx: Sender<Event>,
}

/// Supervisory handle to the mixer engine. Owns the command/event
/// channels and joins the background threads on drop.
pub struct MixerEngine {
    command_tx: Sender<Command>,
    event_rx: Receiver<Event>,
    shared: Arc<Shared>,
    engine_thread: Option<JoinHandle<()>>,
    discovery_thread: Option<JoinHandle<()>>,
    master_level: Mutex<f32>,
    master_mute: AtomicBool,
}

impl MixerEngine {
    pub fn new() -> CoreResult<Self> {
        Self::with_config(DEFAULT_CHANNEL_COUNT, EngineConfig::default())
    }

    pub fn with_channel_count(channel_count: usize) -> CoreResult<Self> {
        Self::with_config(channel_count, EngineConfig::default())
    }

    pub fn with_config(channel_count: usize, config: EngineConfig) -> CoreResult<Self> {
        let channel_count = channel_count.clamp(MIN_CHANNELS, MAX_CHANNELS);
        let mut channels = Vec::with_capacity(channel_count);
        for i in 0..channel_count {
            channels.push(Channel::new(i, format!("channel-{}", i + 1), 0.0, 10.0)?);
        }
        Self::build(channels, config)
    }

    /// Construct with one voltage range per channel (from a profile's
    /// `cv_ranges`). The channel count is fixed to `ranges.len()`.
    pub fn with_channel_ranges(ranges: &[(f32, f32)], config: EngineConfig) -> CoreResult<Self> {
        let channel_count = ranges.len().clamp(MIN_CHANNELS, MAX_CHANNELS);
        let mut channels = Vec::with_capacity(channel_count);
        for (i, (min_v, max_v)) in ranges.iter().take(channel_count).enumerate() {
            channels.push(Channel::new(i, format!("channel-{}", i + 1), *min_v, *max_v)?);
        }
        Self::build(channels, config)
    }

    fn build(channels: Vec<Channel>, config: EngineConfig) -> CoreResult<Self> {
        let channel_count = channels.len();
        let (command_tx, command_rx) = unbounded::<Command>();
        let (event_tx, event_rx) = unbounded::<Event>();

        let shared = Arc::new(Shared {
            channels: Mutex::new(channels),
            devices: Mutex::new(DeviceMaps {
                statuses: HashMap::new(),
                senders: HashMap::new(),
                receivers: HashMap::new(),
            }),
            stream_manager: StreamManager::new(),
            format: Mutex::new(FormatManager::new()),
            calibration: Mutex::new(CalibrationStore::new(channel_count)),
            calibration_points: Mutex::new(HashMap::new()),
            default_osc_sender: Mutex::new(None),
            errors: Arc::new(ErrorHandler::default()),
            perf: Arc::new(PerformanceMonitor::new(MonitorConfig::default())),
            running: AtomicBool::new(true),
            discovery_enabled: AtomicBool::new(false),
            total_errors: AtomicU64::new(0),
            config,
            command_tx: command_tx.clone(),
            event_tx,
        });

        let loop_shared = Arc::clone(&shared);
        let engine_thread = thread::Builder::new()
            .name("cvosc-engine".into())
            .spawn(move || engine_loop(loop_shared, command_rx))
            .map_err(|e| CoreError::StreamBuildError(e.to_string()))?;

        let discovery_shared = Arc::clone(&shared);
        let discovery_thread = thread::Builder::new()
            .name("cvosc-discovery".into())
            .spawn(move || discovery_loop(discovery_shared))
            .map_err(|e| CoreError::StreamBuildError(e.to_string()))?;

        Ok(Self {
            command_tx,
            event_rx,
            shared,
            engine_thread: Some(engine_thread),
            discovery_thread: Some(discovery_thread),
            master_level: Mutex::new(1.0),
            master_mute: AtomicBool::new(false),
        })
    }

    fn send(&self, command: Command) -> CoreResult<()> {
        self.command_tx.send(command).map_err(|_| CoreError::ChannelSendError)
    }

    pub fn start_channel(&self, channel: usize) -> CoreResult<()> {
        self.send(Command::StartChannel(channel))
    }

    pub fn stop_channel(&self, channel: usize) -> CoreResult<()> {
        self.send(Command::StopChannel(channel))
    }

    pub fn reset_channel_error(&self, channel: usize) -> CoreResult<()> {
        self.send(Command::ResetChannelError(channel))
    }

    pub fn set_channel_mode(&self, channel: usize, mode: ChannelMode) -> CoreResult<()> {
        self.send(Command::SetChannelMode { channel, mode })
    }

    pub fn add_input_device(&self, channel: usize, device: DeviceConfig) -> CoreResult<()> {
        self.send(Command::AddInputDevice { channel, device })
    }

    pub fn add_output_device(&self, channel: usize, device: DeviceConfig) -> CoreResult<()> {
        self.send(Command::AddOutputDevice { channel, device })
    }

    pub fn start_calibration(&self, channel: usize) -> CoreResult<()> {
        self.send(Command::StartCalibration(channel))
    }

    pub fn add_calibration_point(&self, channel: usize, expected_volts: f32) -> CoreResult<()> {
        self.send(Command::AddCalibrationPoint { channel, expected_volts })
    }

    pub fn finish_calibration(&self, channel: usize) -> CoreResult<()> {
        self.send(Command::FinishCalibration(channel))
    }

    pub fn set_learning_mode(&self, enabled: bool) -> CoreResult<()> {
        self.send(Command::SetLearningMode(enabled))
    }

    pub fn set_learning_target(&self, target: Option<usize>) -> CoreResult<()> {
        self.send(Command::SetLearningTarget(target))
    }

    pub fn start_device_discovery(&self) -> CoreResult<()> {
        self.send(Command::StartDeviceDiscovery)
    }

    pub fn stop_device_discovery(&self) -> CoreResult<()> {
        self.send(Command::StopDeviceDiscovery)
    }

    pub fn reset_statistics(&self) -> CoreResult<()> {
        self.send(Command::ResetStatistics)
    }

    pub fn request_state(&self) -> CoreResult<()> {
        self.send(Command::RequestState)
    }

    pub fn route_incoming_osc(&self, address: String, values: Vec<f32>) -> CoreResult<()> {
        self.send(Command::IncomingOsc { address, values })
    }

    pub fn poll_event(&self) -> Option<Event> {
        self.event_rx.try_recv().ok()
    }

    pub fn wait_event(&self) -> Option<Event> {
        self.event_rx.recv().ok()
    }

    /// Point `FormatManager`-generated messages (the `/cv/{channel}`,
    /// `/gate/{channel}` templates) at a fixed target, e.g. the active
    /// profile's `osc_host`/`osc_port`.
    pub fn set_default_osc_target(&self, host: &str, port: u16) -> CoreResult<()> {
        let addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|e| CoreError::ConfigError(format!("invalid OSC target: {e}")))?;
        let sender = OscSender::new_udp_unicast(addr)?;
        *self.shared.default_osc_sender.lock().expect("default sender lock poisoned") = Some(sender);
        Ok(())
    }

    pub fn total_messages_per_second(&self) -> u64 {
        let channels = self.shared.channels.lock().expect("channel lock poisoned");
        channels.iter().map(|c| c.messages_received + c.messages_sent).sum()
    }

    pub fn total_active_connections(&self) -> usize {
        self.shared
            .devices
            .lock()
            .expect("device lock poisoned")
            .statuses
            .values()
            .filter(|s| s.status == DeviceStatus::Connected)
            .count()
    }

    pub fn total_errors(&self) -> u64 {
        self.shared.total_errors.load(Ordering::Relaxed)
    }

    pub fn health_status(&self) -> HealthStatus {
        self.shared.errors.health_status()
    }

    pub fn set_master_level(&self, level: f32) {
        *self.master_level.lock().expect("master level lock poisoned") = level;
    }

    pub fn master_level(&self) -> f32 {
        *self.master_level.lock().expect("master level lock poisoned")
    }

    pub fn set_master_mute(&self, muted: bool) {
        self.master_mute.store(muted, Ordering::Relaxed);
    }

    pub fn master_mute(&self) -> bool {
        self.master_mute.load(Ordering::Relaxed)
    }

    pub fn list_audio_devices() -> CoreResult<Vec<AudioDevice>> {
        AudioDevice::enumerate_all()
    }

    pub fn load_configuration(path: &Path) -> CoreResult<MixerConfigFile> {
        let contents = std::fs::read_to_string(path).map_err(|e| CoreError::ConfigError(e.to_string()))?;
        serde_json::from_str(&contents).map_err(|e| CoreError::ConfigError(e.to_string()))
    }

    /// Apply a loaded `MixerConfigFile` to the already-constructed
    /// channel set. Channel count and voltage range are fixed at
    /// construction (§4.I: "created at engine construction"); this
    /// updates name, colour, level, and device lists only.
    pub fn apply_configuration(&self, config: &MixerConfigFile) -> CoreResult<()> {
        self.set_master_level(config.mixer.master_level);
        self.set_master_mute(config.mixer.master_mute);
        let mut channels = self.shared.channels.lock().expect("channel lock poisoned");
        for entry in &config.channels {
            if let Some(ch) = channels.get_mut(entry.id) {
                ch.name = entry.name.clone();
                ch.color = entry.color;
                ch.set_level_volts(entry.level_volts);
                ch.inputs = entry.input_devices.clone();
                ch.outputs = entry.output_devices.clone();
            }
        }
        Ok(())
    }

    pub fn save_configuration(&self, path: &Path) -> CoreResult<()> {
        let channels = self.shared.channels.lock().expect("channel lock poisoned");
        let entries: Vec<ChannelConfigEntry> = channels
            .iter()
            .map(|c| {
                let (min_range, max_range) = c.range();
                ChannelConfigEntry {
                    id: c.channel_id,
                    name: c.name.clone(),
                    level_volts: c.level_volts(),
                    min_range,
                    max_range,
                    color: c.color,
                    input_devices: c.inputs.clone(),
                    output_devices: c.outputs.clone(),
                }
            })
            .collect();
        drop(channels);

        let file = MixerConfigFile {
            version: MIXER_CONFIG_VERSION.to_string(),
            mixer: MasterConfig { master_level: self.master_level(), master_mute: self.master_mute() },
            channels: entries,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::ConfigError(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(&file).map_err(|e| CoreError::ConfigError(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| CoreError::ConfigError(e.to_string()))
    }
}

impl Drop for MixerEngine {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let _ = self.command_tx.send(Command::Shutdown);
        if let Some(handle) = self.engine_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.discovery_thread.take() {
            let _ = handle.join();
        }
    }
}

/// On-disk mixer configuration shape (§6 "Mixer configuration (JSON)").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixerConfigFile {
    pub version: String,
    pub mixer: MasterConfig,
    pub channels: Vec<ChannelConfigEntry>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MasterConfig {
    #[serde(rename = "masterLevel")]
    pub master_level: f32,
    #[serde(rename = "masterMute")]
    pub master_mute: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfigEntry {
    pub id: usize,
    pub name: String,
    #[serde(rename = "levelVolts")]
    pub level_volts: f32,
    #[serde(rename = "minRange")]
    pub min_range: f32,
    #[serde(rename = "maxRange")]
    pub max_range: f32,
    pub color: (u8, u8, u8),
    #[serde(rename = "inputDevices")]
    pub input_devices: Vec<DeviceConfig>,
    #[serde(rename = "outputDevices")]
    pub output_devices: Vec<DeviceConfig>,
}

// --- Engine loop and its helpers, run entirely on the engine thread. ---

fn engine_loop(shared: Arc<Shared>, command_rx: Receiver<Command>) {
    info!("mixer engine loop started");
    let _ = shared.event_tx.send(Event::Started);
    let mut last_perf_sample = Instant::now();
    let interval = Duration::from_millis(shared.config.update_interval_ms.max(1));

    'outer: loop {
        while let Ok(command) = command_rx.try_recv() {
            if matches!(command, Command::Shutdown) {
                break 'outer;
            }
            handle_command(&shared, command);
        }

        sweep_device_timeouts(&shared);

        if last_perf_sample.elapsed() >= Duration::from_secs(1) {
            sample_performance(&shared);
            last_perf_sample = Instant::now();
        }

        forward_running_channels(&shared);

        shared.perf.record_cycle();
        thread::sleep(interval);
    }

    shutdown_all_devices(&shared);
    let _ = shared.event_tx.send(Event::Stopped);
    info!("mixer engine loop stopped");
}

fn handle_command(shared: &Arc<Shared>, command: Command) {
    match command {
        Command::StartChannel(id) => start_channel(shared, id),
        Command::StopChannel(id) => stop_channel(shared, id),
        Command::ResetChannelError(id) => reset_channel_error(shared, id),
        Command::SetChannelMode { channel, mode } => set_channel_mode(shared, channel, mode),
        Command::AddInputDevice { channel, device } => add_device(shared, channel, device, true),
        Command::AddOutputDevice { channel, device } => add_device(shared, channel, device, false),
        Command::StartCalibration(channel) => start_calibration(shared, channel),
        Command::AddCalibrationPoint { channel, expected_volts } => {
            add_calibration_point(shared, channel, expected_volts)
        }
        Command::FinishCalibration(channel) => finish_calibration(shared, channel),
        Command::SetLearningMode(enabled) => {
            shared.format.lock().expect("format lock poisoned").set_learning_mode(enabled)
        }
        Command::SetLearningTarget(target) => {
            shared.format.lock().expect("format lock poisoned").set_learning_target(target)
        }
        Command::StartDeviceDiscovery => shared.discovery_enabled.store(true, Ordering::SeqCst),
        Command::StopDeviceDiscovery => shared.discovery_enabled.store(false, Ordering::SeqCst),
        Command::ResetStatistics => reset_statistics(shared),
        Command::RequestState => emit_state_snapshot(shared),
        Command::IncomingOsc { address, values } => route_input(shared, &address, &values),
        Command::Shutdown => {}
    }
}

fn resolve_audio_device(name: &str, is_input: bool) -> CoreResult<cpal::Device> {
    let host = cpal::default_host();
    let found = if is_input {
        host.input_devices()
            .map_err(|e| CoreError::DeviceNotFound(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
    } else {
        host.output_devices()
            .map_err(|e| CoreError::DeviceNotFound(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
    };
    found.ok_or_else(|| CoreError::DeviceNotFound(name.to_string()))
}

fn start_channel(shared: &Arc<Shared>, id: usize) {
    let (inputs, outputs, duplex_capable) = {
        let channels = shared.channels.lock().expect("channel lock poisoned");
        match channels.get(id) {
            Some(ch) => (ch.inputs.clone(), ch.outputs.clone(), ch.has_audio_duplex_pair()),
            None => return,
        }
    };

    let mut duplex_input_id = None;
    let mut duplex_output_id = None;
    if duplex_capable {
        let input = inputs.iter().find(|d| d.enabled && d.kind.is_audio());
        let output = outputs.iter().find(|d| d.enabled && d.kind.is_audio());
        if let (Some(input), Some(output)) = (input, output) {
            match (resolve_audio_device(&input.device_id, true), resolve_audio_device(&output.device_id, false)) {
                (Ok(in_dev), Ok(out_dev)) => {
                    let key = format!("{id}-duplex");
                    match shared.stream_manager.create_duplex(
                        key,
                        shared.config.stream.clone(),
                        &in_dev,
                        &out_dev,
                        input.signal_level,
                        shared.event_tx.clone(),
                    ) {
                        Ok(()) => {
                            duplex_input_id = Some(input.device_id.clone());
                            duplex_output_id = Some(output.device_id.clone());
                            mark_device_connected(shared, &input.device_id);
                            mark_device_connected(shared, &output.device_id);
                        }
                        Err(e) => {
                            warn!(channel = id, error = %e, "duplex stream open failed, falling back to independent streams")
                        }
                    }
                }
                _ => warn!(channel = id, "could not resolve duplex audio device pair"),
            }
        }
    }

    let mut any_ok = duplex_input_id.is_some();
    for device in inputs.iter().filter(|d| d.enabled) {
        if Some(&device.device_id) == duplex_input_id.as_ref() {
            continue;
        }
        match open_input_device(shared, id, device) {
            Ok(()) => any_ok = true,
            Err(e) => {
                mark_device_error(shared, &device.device_id, e.to_string());
                shared.errors.log_error(Category::Audio, "failed to open input device", e.to_string(), true);
            }
        }
    }
    for device in outputs.iter().filter(|d| d.enabled) {
        if Some(&device.device_id) == duplex_output_id.as_ref() {
            continue;
        }
        match open_output_device(shared, device) {
            Ok(()) => any_ok = true,
            Err(e) => {
                mark_device_error(shared, &device.device_id, e.to_string());
                shared.errors.log_error(Category::Audio, "failed to open output device", e.to_string(), true);
            }
        }
    }

    let mut channels = shared.channels.lock().expect("channel lock poisoned");
    let Some(ch) = channels.get_mut(id) else { return };
    if any_ok || (inputs.is_empty() && outputs.is_empty()) {
        ch.start();
    } else {
        ch.mark_error();
    }
    let state = ch.state;
    drop(channels);
    let _ = shared.event_tx.send(Event::ChannelStateChanged { channel: id, state });
}

fn stop_channel(shared: &Arc<Shared>, id: usize) {
    let (inputs, outputs) = {
        let channels = shared.channels.lock().expect("channel lock poisoned");
        match channels.get(id) {
            Some(ch) => (ch.inputs.clone(), ch.outputs.clone()),
            None => return,
        }
    };

    shared.stream_manager.remove(&format!("{id}-duplex"));
    for device in inputs.iter().chain(outputs.iter()) {
        if device.kind.is_audio() {
            shared.stream_manager.remove(&device.device_id);
        } else {
            let mut devices = shared.devices.lock().expect("device lock poisoned");
            if let Some(receiver) = devices.receivers.remove(&device.device_id) {
                drop(devices);
                receiver.stop();
                devices = shared.devices.lock().expect("device lock poisoned");
            }
            devices.senders.remove(&device.device_id);
        }
        let mut devices = shared.devices.lock().expect("device lock poisoned");
        devices.statuses.entry(device.device_id.clone()).or_insert_with(DeviceStatusEntry::new).status =
            DeviceStatus::Disconnected;
    }

    let mut channels = shared.channels.lock().expect("channel lock poisoned");
    if let Some(ch) = channels.get_mut(id) {
        ch.stop();
    }
}

fn reset_channel_error(shared: &Arc<Shared>, id: usize) {
    let mut channels = shared.channels.lock().expect("channel lock poisoned");
    let Some(ch) = channels.get_mut(id) else { return };
    ch.reset_from_error();
    let state = ch.state;
    drop(channels);
    let _ = shared.event_tx.send(Event::ChannelStateChanged { channel: id, state });
}

fn set_channel_mode(shared: &Arc<Shared>, channel: usize, mode: ChannelMode) {
    let mut channels = shared.channels.lock().expect("channel lock poisoned");
    if let Some(ch) = channels.get_mut(channel) {
        ch.mode = mode;
    }
}

fn add_device(shared: &Arc<Shared>, channel: usize, device: DeviceConfig, is_input: bool) {
    let device_id = device.device_id.clone();
    let mut channels = shared.channels.lock().expect("channel lock poisoned");
    let Some(ch) = channels.get_mut(channel) else {
        shared.errors.log_error(Category::Config, "add device to unknown channel", format!("channel {channel}"), false);
        return;
    };
    let result = if is_input { ch.add_input(device) } else { ch.add_output(device) };
    drop(channels);
    match result {
        Ok(()) => {
            let mut devices = shared.devices.lock().expect("device lock poisoned");
            devices.statuses.entry(device_id).or_insert_with(DeviceStatusEntry::new);
        }
        Err(e) => shared.errors.log_error(Category::Config, "invalid device configuration", e.to_string(), false),
    }
}

fn open_input_device(shared: &Arc<Shared>, channel_id: usize, device: &DeviceConfig) -> CoreResult<()> {
    if device.kind.is_audio() {
        let cpal_device = resolve_audio_device(&device.device_id, true)?;
        shared.stream_manager.create_input(
            device.device_id.clone(),
            shared.config.stream.clone(),
            &cpal_device,
            device.signal_level,
            shared.event_tx.clone(),
        )?;
    } else {
        let receiver = OscReceiver::bind(device.local_port)?;
        let address = if device.osc_address_prefix.is_empty() {
            format!("/cv/{}", channel_id + 1)
        } else {
            device.osc_address_prefix.clone()
        };
        let command_tx = shared.command_tx.clone();
        let bound_address = address.clone();
        receiver.register_handler(address, move |msg| {
            let values: Vec<f32> = msg.args.iter().filter_map(osc_arg_as_f32).collect();
            let _ = command_tx.send(Command::IncomingOsc { address: bound_address.clone(), values });
        });
        receiver.start()?;
        let mut devices = shared.devices.lock().expect("device lock poisoned");
        devices.receivers.insert(device.device_id.clone(), receiver);
    }
    mark_device_connected(shared, &device.device_id);
    Ok(())
}

fn open_output_device(shared: &Arc<Shared>, device: &DeviceConfig) -> CoreResult<()> {
    if device.kind.is_audio() {
        let cpal_device = resolve_audio_device(&device.device_id, false)?;
        shared.stream_manager.create_output(
            device.device_id.clone(),
            shared.config.stream.clone(),
            &cpal_device,
            shared.event_tx.clone(),
        )?;
    } else {
        let target: SocketAddr = format!("{}:{}", device.remote_addr, device.remote_port)
            .parse()
            .map_err(|e| CoreError::InvalidDeviceConfig(format!("bad remote address: {e}")))?;
        let sender = match device.transport.unwrap_or(DeviceTransport::UdpUnicast) {
            DeviceTransport::UdpUnicast => OscSender::new_udp_unicast(target)?,
            DeviceTransport::UdpMulticast => {
                let group = device
                    .remote_addr
                    .parse()
                    .map_err(|e| CoreError::InvalidDeviceConfig(format!("bad multicast group: {e}")))?;
                OscSender::new_udp_multicast(group, device.remote_port)?
            }
            DeviceTransport::Tcp => OscSender::new_tcp(target)?,
        };
        let mut devices = shared.devices.lock().expect("device lock poisoned");
        devices.senders.insert(device.device_id.clone(), sender);
    }
    mark_device_connected(shared, &device.device_id);
    Ok(())
}

fn osc_arg_as_f32(value: &OscType) -> Option<f32> {
    match value {
        OscType::Float(f) => Some(*f),
        OscType::Double(d) => Some(*d as f32),
        OscType::Int(i) => Some(*i as f32),
        _ => None,
    }
}

fn current_raw_level(shared: &Arc<Shared>, channel_idx: usize) -> f32 {
    let audio_device_id = {
        let channels = shared.channels.lock().expect("channel lock poisoned");
        channels
            .get(channel_idx)
            .and_then(|c| c.inputs.iter().find(|d| d.enabled && d.kind.is_audio()).map(|d| d.device_id.clone()))
    };
    if let Some(device_id) = audio_device_id {
        shared.stream_manager.input_level(&device_id)
    } else {
        shared
            .channels
            .lock()
            .expect("channel lock poisoned")
            .get(channel_idx)
            .map(|c| c.input_meter.current())
            .unwrap_or(0.0)
    }
}

fn start_calibration(shared: &Arc<Shared>, channel: usize) {
    shared.calibration_points.lock().expect("calibration points lock poisoned").insert(channel, Vec::new());
}

fn add_calibration_point(shared: &Arc<Shared>, channel: usize, expected_volts: f32) {
    let measured = current_raw_level(shared, channel);
    if !is_plausible_point(expected_volts, measured) {
        shared.errors.log_warning(
            Category::Calibration,
            "implausible calibration point rejected",
            format!("channel {channel}: expected {expected_volts}, measured {measured}"),
        );
        return;
    }
    let mut points = shared.calibration_points.lock().expect("calibration points lock poisoned");
    points.entry(channel).or_default().push(CalibrationPoint::new(expected_volts, measured));
}

fn finish_calibration(shared: &Arc<Shared>, channel: usize) {
    let points = shared.calibration_points.lock().expect("calibration points lock poisoned").remove(&channel).unwrap_or_default();
    match fit_linear(&points) {
        Ok(result) => {
            let mut calibration = shared.calibration.lock().expect("calibration lock poisoned");
            if let Some(slot) = calibration.channels.get_mut(channel) {
                *slot = result;
            }
        }
        Err(e) => shared.errors.log_error(Category::Calibration, "calibration fit failed", e.to_string(), true),
    }
}

fn reset_statistics(shared: &Arc<Shared>) {
    let mut channels = shared.channels.lock().expect("channel lock poisoned");
    for ch in channels.iter_mut() {
        ch.messages_received = 0;
        ch.messages_sent = 0;
        ch.errors = 0;
    }
    drop(channels);
    shared.format.lock().expect("format lock poisoned").reset_statistics();
    let mut devices = shared.devices.lock().expect("device lock poisoned");
    for entry in devices.statuses.values_mut() {
        entry.message_count = 0;
    }
    shared.total_errors.store(0, Ordering::Relaxed);
}

fn emit_state_snapshot(shared: &Arc<Shared>) {
    let channels = shared.channels.lock().expect("channel lock poisoned");
    for ch in channels.iter() {
        let _ = shared.event_tx.send(Event::ChannelStateChanged { channel: ch.channel_id, state: ch.state });
        let _ = shared.event_tx.send(Event::LevelUpdate {
            channel: ch.channel_id,
            input: ch.input_meter.current(),
            output: ch.output_meter.current(),
        });
    }
}

/// Parse the channel index from an incoming address, update the
/// channel's input side, and forward immediately (still passthrough) to
/// its enabled OSC/CV output devices, gated by `should_be_audible`.
fn route_input(shared: &Arc<Shared>, address: &str, values: &[f32]) {
    let Some(channel_number) = parse_channel_address(address) else {
        shared.format.lock().expect("format lock poisoned").learn_message(address, values, None);
        return;
    };
    let channel_idx = channel_number - 1;
    let raw = values.first().copied().unwrap_or(0.0);
    let calibrated = shared.calibration.lock().expect("calibration lock poisoned").apply(channel_idx, raw);

    let outputs = {
        let mut channels = shared.channels.lock().expect("channel lock poisoned");
        let any_solo = channels.iter().any(|c| c.state == ChannelState::Running && c.mode == ChannelMode::Solo);
        let Some(ch) = channels.get_mut(channel_idx) else { return };
        if ch.state != ChannelState::Running {
            return;
        }
        ch.input_meter.push(calibrated);
        ch.set_level_volts(calibrated);
        ch.messages_received += 1;
        if should_be_audible(ch, any_solo) { Some(ch.outputs.clone()) } else { None }
    };

    shared.format.lock().expect("format lock poisoned").record_received(address);

    let Some(outputs) = outputs else { return };
    for device in outputs.iter().filter(|d| d.enabled && d.kind.is_osc()) {
        send_to_osc_output(shared, channel_idx, device, calibrated);
    }
    let _ = shared.event_tx.send(Event::LevelUpdate { channel: channel_idx, input: calibrated, output: calibrated });
}

fn send_to_osc_output(shared: &Arc<Shared>, channel_idx: usize, device: &DeviceConfig, level: f32) {
    let formatted = if device.invert { -level } else { level } + device.signal_offset;
    let address =
        if device.osc_address_prefix.is_empty() { format!("/cv/channel/{}", channel_idx + 1) } else { device.osc_address_prefix.clone() };

    let result = {
        let devices = shared.devices.lock().expect("device lock poisoned");
        devices.senders.get(&device.device_id).map(|s| s.send_float(&address, formatted))
    };
    match result {
        Some(Ok(())) => {
            mark_device_activity(shared, &device.device_id);
            shared.perf.record_osc_sent();
        }
        Some(Err(e)) => {
            mark_device_error(shared, &device.device_id, e.to_string());
            shared.perf.record_osc_failed();
            shared.errors.log_error(Category::Network, "OSC output send failed", e.to_string(), true);
        }
        None => {}
    }
}

fn mark_device_connected(shared: &Arc<Shared>, device_id: &str) {
    let mut devices = shared.devices.lock().expect("device lock poisoned");
    devices.statuses.entry(device_id.to_string()).or_insert_with(DeviceStatusEntry::new).mark_connected();
    drop(devices);
    let _ = shared.event_tx.send(Event::DeviceStatusChanged { device_id: device_id.to_string(), status: DeviceStatusKind::Connected });
}

fn mark_device_activity(shared: &Arc<Shared>, device_id: &str) {
    let mut devices = shared.devices.lock().expect("device lock poisoned");
    devices.statuses.entry(device_id.to_string()).or_insert_with(DeviceStatusEntry::new).mark_activity();
}

fn mark_device_error(shared: &Arc<Shared>, device_id: &str, message: String) {
    {
        let mut devices = shared.devices.lock().expect("device lock poisoned");
        devices.statuses.entry(device_id.to_string()).or_insert_with(DeviceStatusEntry::new).mark_error(message);
    }
    shared.total_errors.fetch_add(1, Ordering::Relaxed);
    let _ = shared.event_tx.send(Event::DeviceStatusChanged { device_id: device_id.to_string(), status: DeviceStatusKind::Error });
}

fn sweep_device_timeouts(shared: &Arc<Shared>) {
    let mut devices = shared.devices.lock().expect("device lock poisoned");
    let mut changed = Vec::new();
    for (id, entry) in devices.statuses.iter_mut() {
        let before = entry.status;
        entry.sweep_timeout();
        if entry.status != before {
            changed.push((id.clone(), entry.status));
        }
    }
    drop(devices);
    for (id, status) in changed {
        let _ = shared.event_tx.send(Event::DeviceStatusChanged { device_id: id, status: status.into() });
    }
}

fn sample_performance(shared: &Arc<Shared>) {
    let _ = shared.perf.sample();
    let health = shared.errors.health_status();
    let _ = shared.event_tx.send(Event::HealthUpdate(health.into()));
}

/// Step 4 of the engine loop: acquire the latest sample per running
/// channel, update meters, and dispatch to enabled outputs. Audio
/// outputs need no explicit action here - they read passthrough samples
/// directly out of the stream's own circular buffer.
fn forward_running_channels(shared: &Arc<Shared>) {
    let any_solo = {
        let channels = shared.channels.lock().expect("channel lock poisoned");
        channels.iter().any(|c| c.state == ChannelState::Running && c.mode == ChannelMode::Solo)
    };

    let channel_count = shared.channels.lock().expect("channel lock poisoned").len();
    let mut cv_values = vec![0.0f32; channel_count];

    for idx in 0..channel_count {
        let is_running = {
            shared.channels.lock().expect("channel lock poisoned").get(idx).map(|c| c.state == ChannelState::Running).unwrap_or(false)
        };
        if !is_running {
            continue;
        }

        let audio_input_device = {
            let channels = shared.channels.lock().expect("channel lock poisoned");
            channels[idx].inputs.iter().find(|d| d.enabled && d.kind.is_audio()).map(|d| d.device_id.clone())
        };

        let level = if let Some(device_id) = &audio_input_device {
            Some(shared.stream_manager.input_level(device_id))
        } else {
            let mut channels = shared.channels.lock().expect("channel lock poisoned");
            let ch = &mut channels[idx];
            if ch.input_meter.last_update().elapsed() <= OSC_METER_FRESHNESS {
                Some(ch.input_meter.current())
            } else {
                ch.input_meter.decay_peak();
                None
            }
        };

        let Some(level) = level else { continue };
        let calibrated = shared.calibration.lock().expect("calibration lock poisoned").apply(idx, level);

        let (outputs, audible) = {
            let mut channels = shared.channels.lock().expect("channel lock poisoned");
            let ch = &mut channels[idx];
            ch.input_meter.push(calibrated);
            ch.output_meter.push(calibrated);
            ch.set_level_volts(calibrated);
            (ch.outputs.clone(), should_be_audible(ch, any_solo))
        };

        if audible {
            cv_values[idx] = calibrated;
            for device in outputs.iter().filter(|d| d.enabled && d.kind.is_osc()) {
                send_to_osc_output(shared, idx, device, calibrated);
            }
            let _ = shared.event_tx.send(Event::LevelUpdate { channel: idx, input: calibrated, output: calibrated });
        }
    }

    dispatch_default_messages(shared, &cv_values);
}

/// Dispatches `FormatManager`-generated messages to the fixed default
/// target, if one has been configured via `set_default_osc_target`.
/// Inaudible channels carry a zeroed `cv_values` entry rather than
/// being excluded from the template pass - `generate_messages` shares
/// edge-detection state across channels per template, so excluding an
/// index outright would desynchronize that state for the others.
fn dispatch_default_messages(shared: &Arc<Shared>, cv_values: &[f32]) {
    let has_target = shared.default_osc_sender.lock().expect("default sender lock poisoned").is_some();
    if !has_target {
        return;
    }
    let messages = shared.format.lock().expect("format lock poisoned").generate_messages(cv_values);
    for msg in &messages {
        let result = {
            let sender_guard = shared.default_osc_sender.lock().expect("default sender lock poisoned");
            sender_guard.as_ref().map(|s| s.send_float_array(&msg.address, &msg.arguments))
        };
        match result {
            Some(Ok(())) => {
                shared.perf.record_osc_sent();
                shared.format.lock().expect("format lock poisoned").record_sent(&msg.address);
            }
            Some(Err(e)) => {
                shared.perf.record_osc_failed();
                shared.errors.log_error(Category::Network, "default OSC send failed", e.to_string(), true);
            }
            None => {}
        }
    }
}

fn shutdown_all_devices(shared: &Arc<Shared>) {
    let mut devices = shared.devices.lock().expect("device lock poisoned");
    for (_, receiver) in devices.receivers.drain() {
        receiver.stop();
    }
    devices.senders.clear();
}

fn discovery_loop(shared: Arc<Shared>) {
    info!("device discovery thread started");
    while shared.running.load(Ordering::SeqCst) {
        if shared.discovery_enabled.load(Ordering::SeqCst) {
            for name in SIMULATED_DISCOVERED_DEVICES {
                debug!(device = name, "discovered OSC peer");
            }
        }
        let mut waited = Duration::ZERO;
        while waited < DISCOVERY_INTERVAL && shared.running.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(200));
            waited += Duration::from_millis(200);
        }
    }
    info!("device discovery thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructs_with_default_channel_count() {
        let engine = MixerEngine::new().unwrap();
        assert_eq!(engine.total_active_connections(), 0);
        assert_eq!(engine.total_errors(), 0);
    }

    #[test]
    fn channel_count_is_clamped() {
        let engine = MixerEngine::with_channel_count(0).unwrap();
        assert!(engine.shared.channels.lock().unwrap().len() >= MIN_CHANNELS);

        let engine = MixerEngine::with_channel_count(1000).unwrap();
        assert!(engine.shared.channels.lock().unwrap().len() <= MAX_CHANNELS);
    }

    #[test]
    fn starting_an_empty_channel_transitions_to_running() {
        let engine = MixerEngine::new().unwrap();
        engine.start_channel(0).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let mut saw_running = false;
        while let Some(event) = engine.poll_event() {
            if let Event::ChannelStateChanged { channel: 0, state: ChannelState::Running } = event {
                saw_running = true;
            }
        }
        assert!(saw_running);
    }

    #[test]
    fn incoming_osc_updates_channel_level() {
        let engine = MixerEngine::new().unwrap();
        engine.start_channel(0).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        engine.route_incoming_osc("/cv/1".into(), vec![3.5]).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        let level = engine.shared.channels.lock().unwrap()[0].level_volts();
        assert!((level - 3.5).abs() < 1e-3);
    }

    #[test]
    fn unmatched_address_does_not_panic() {
        let engine = MixerEngine::new().unwrap();
        engine.route_incoming_osc("/not/a/channel".into(), vec![1.0]).unwrap();
        std::thread::sleep(Duration::from_millis(30));
    }

    #[test]
    fn calibration_round_trip_does_not_panic_with_no_input() {
        let engine = MixerEngine::new().unwrap();
        engine.start_calibration(0).unwrap();
        engine.add_calibration_point(0, 1.0).unwrap();
        engine.add_calibration_point(0, 5.0).unwrap();
        engine.add_calibration_point(0, 9.0).unwrap();
        engine.finish_calibration(0).unwrap();
        std::thread::sleep(Duration::from_millis(50));
    }

    #[test]
    fn reset_statistics_clears_counters() {
        let engine = MixerEngine::new().unwrap();
        engine.route_incoming_osc("/cv/1".into(), vec![1.0]).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        engine.reset_statistics().unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(engine.total_messages_per_second(), 0);
    }
}
