//! cvosc - command-line entry point for the CV-to-OSC routing engine.

use std::collections::HashMap;
use std::io::{self, BufRead, Write as _};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use cvosc_core::{ChannelMode, EngineConfig, Event, MixerEngine, Profile, ProfileStore};

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_tracing_level(self) -> tracing::Level {
        match self {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "cvosc", about = "CV-to-OSC signal routing engine", disable_version_flag = true)]
struct Cli {
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: (),

    /// Run an interactive REPL instead of a headless daemon.
    #[arg(short = 'i', long)]
    interactive: bool,

    /// List available audio devices and exit.
    #[arg(short = 'l', long = "list-devices")]
    list_devices: bool,

    /// Run headless as a background service (the default mode).
    #[arg(short = 'd', long)]
    daemon: bool,

    /// Load profile configuration from this file instead of the default path.
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    #[arg(long)]
    verbose: bool,

    #[arg(short = 'q', long)]
    quiet: bool,

    #[arg(long = "osc-host")]
    osc_host: Option<String>,

    #[arg(long = "osc-port")]
    osc_port: Option<u16>,

    #[arg(long = "audio-device")]
    audio_device: Option<String>,

    #[arg(long = "update-interval")]
    update_interval: Option<u64>,

    #[arg(long = "log-level", value_enum)]
    log_level: Option<LogLevel>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    init_logging(&cli);

    if cli.list_devices {
        return list_devices();
    }

    let mut profile = resolve_profile(&cli)?;
    apply_overrides(&cli, &mut profile);

    let ranges: Vec<(f32, f32)> = if profile.cv_ranges.is_empty() {
        vec![(0.0, 10.0); 8]
    } else {
        profile.cv_ranges.iter().map(|r| (r.min, r.max)).collect()
    };

    let mut engine_config = EngineConfig::default();
    engine_config.update_interval_ms = profile.update_interval_ms;

    let engine = MixerEngine::with_channel_ranges(&ranges, engine_config)
        .context("failed to start the mixer engine")?;
    engine
        .set_default_osc_target(&profile.osc_host, profile.osc_port)
        .with_context(|| format!("failed to bind OSC target {}:{}", profile.osc_host, profile.osc_port))?;

    info!(host = %profile.osc_host, port = profile.osc_port, channels = ranges.len(), "cvosc starting");

    if cli.interactive {
        run_interactive(&engine)
    } else {
        run_daemon(&engine)
    }
}

fn resolve_profile(cli: &Cli) -> Result<Profile> {
    match &cli.config {
        Some(path) => load_profile_from_path(path).map(|store| store.active()),
        None => Ok(ProfileStore::load().active()),
    }
}

fn load_profile_from_path(path: &Path) -> Result<ProfileStore> {
    let contents = std::fs::read_to_string(path).with_context(|| format!("reading config file {path:?}"))?;
    if let Ok(store) = serde_json::from_str::<ProfileStore>(&contents) {
        return Ok(store);
    }
    let profile: Profile =
        serde_json::from_str(&contents).with_context(|| format!("parsing config file {path:?}"))?;
    let mut profiles = HashMap::new();
    profiles.insert("default".to_string(), profile);
    Ok(ProfileStore { active_profile: "default".to_string(), profiles })
}

fn apply_overrides(cli: &Cli, profile: &mut Profile) {
    if let Some(host) = &cli.osc_host {
        profile.osc_host = host.clone();
    }
    if let Some(port) = cli.osc_port {
        profile.osc_port = port;
    }
    if cli.audio_device.is_some() {
        profile.audio_device = cli.audio_device.clone();
    }
    if let Some(ms) = cli.update_interval {
        profile.update_interval_ms = ms;
    }
}

fn init_logging(cli: &Cli) {
    if cli.quiet {
        return;
    }
    let level = if let Some(level) = cli.log_level {
        level.as_tracing_level()
    } else if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let _ = tracing_subscriber::fmt().with_max_level(level).with_target(false).try_init();
}

fn list_devices() -> Result<()> {
    let devices = MixerEngine::list_audio_devices().context("failed to enumerate audio devices")?;
    if devices.is_empty() {
        println!("no audio devices found");
        return Ok(());
    }
    for device in devices {
        println!(
            "{:?}\t{}{}\tchannels={}\trates={:?}",
            device.device_type,
            device.name,
            if device.is_default { " (default)" } else { "" },
            device.max_channels,
            device.sample_rates,
        );
    }
    Ok(())
}

fn run_daemon(engine: &MixerEngine) -> Result<()> {
    for channel in 0..8 {
        let _ = engine.start_channel(channel);
    }
    info!("running headless; stop with SIGINT/SIGTERM");
    loop {
        match engine.wait_event() {
            Some(event) => log_event(&event),
            None => break,
        }
    }
    Ok(())
}

fn run_interactive(engine: &MixerEngine) -> Result<()> {
    println!("cvosc interactive mode - commands: start <ch>, stop <ch>, mode <ch> mix|solo|mute, status, quit");
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        drain_events(engine);
        print!("> ");
        io::stdout().flush().ok();

        let Some(line) = lines.next() else { break };
        let line = line.context("reading stdin")?;
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            ["quit"] | ["exit"] => break,
            ["start", ch] => dispatch(engine.start_channel(parse_channel(ch)?)),
            ["stop", ch] => dispatch(engine.stop_channel(parse_channel(ch)?)),
            ["mode", ch, mode] => {
                let mode = parse_mode(mode)?;
                dispatch(engine.set_channel_mode(parse_channel(ch)?, mode));
            }
            ["status"] => {
                println!(
                    "active connections: {}  errors: {}  health: {:?}",
                    engine.total_active_connections(),
                    engine.total_errors(),
                    engine.health_status(),
                );
            }
            [] => {}
            _ => println!("unrecognized command: {line}"),
        }
    }
    Ok(())
}

fn parse_channel(raw: &str) -> Result<usize> {
    raw.parse::<usize>().with_context(|| format!("invalid channel index: {raw}"))
}

fn parse_mode(raw: &str) -> Result<ChannelMode> {
    match raw {
        "mix" => Ok(ChannelMode::Mix),
        "solo" => Ok(ChannelMode::Solo),
        "mute" => Ok(ChannelMode::Mute),
        other => anyhow::bail!("unknown channel mode: {other}"),
    }
}

fn dispatch(result: cvosc_core::CoreResult<()>) {
    if let Err(e) = result {
        warn!(error = %e, "command failed");
    }
}

fn drain_events(engine: &MixerEngine) {
    while let Some(event) = engine.poll_event() {
        log_event(&event);
    }
}

fn log_event(event: &Event) {
    match event {
        Event::Error { message } => warn!(%message, "engine error"),
        Event::BufferUnderrun => warn!("buffer underrun"),
        other => tracing::debug!(?other, "engine event"),
    }
    // avoid a tight spin if callers poll in a loop with no events pending
    std::thread::sleep(Duration::from_millis(0));
}
