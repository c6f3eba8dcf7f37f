//! Desktop host for the device core.
//!
//! Runs the full control core against the host's sound devices, a logging
//! board and whichever server transport the config names. Press Enter to
//! start or stop a manual listening turn; Ctrl-C exits.

use anyhow::Context;
use clap::{Parser, Subcommand};
use fae_device::audio::cpal_codec::CpalCodec;
use fae_device::audio::{
    AudioCodec, AudioEncoder, KeywordSpotter, Pcm16Codec, SoundBank, WakeWordEngine,
};
use fae_device::board::{Board, HostBoard};
use fae_device::protocol::select_protocol;
use fae_device::{AppParts, Application, CoreHandle, DeviceConfig, DeviceState};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Voice assistant device core, hosted on a desktop.
#[derive(Parser)]
#[command(name = "fae-device-host", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long, env = "FAE_DEVICE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the device core (default).
    Run,

    /// List available audio devices.
    Devices,

    /// Write the effective configuration to the config path.
    InitConfig,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let path = cli
        .config
        .clone()
        .unwrap_or_else(DeviceConfig::default_config_path);
    let mut config = if path.exists() {
        DeviceConfig::from_file(&path)
            .with_context(|| format!("loading config from {}", path.display()))?
    } else {
        DeviceConfig::default()
    };

    let _log_guard = init_logging(&config)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(&mut config, &path),
        Command::Devices => list_devices(),
        Command::InitConfig => {
            config.device.ensure_client_id();
            config.save_to_file(&path)?;
            println!("wrote {}", path.display());
            Ok(())
        }
    }
}

/// Stderr always; a daily rolling file too when a log directory is set.
fn init_logging(
    config: &DeviceConfig,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("fae_device=info,display=info,tokio_tungstenite=warn")
        })
    };
    let stderr = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    match &config.logging.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "fae-device.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter())
                .with(stderr)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter())
                .with(stderr)
                .init();
            Ok(None)
        }
    }
}

fn run(config: &mut DeviceConfig, path: &std::path::Path) -> anyhow::Result<()> {
    if config.device.client_id.trim().is_empty() {
        config.device.ensure_client_id();
        if let Err(e) = config.save_to_file(path) {
            warn!("client id not persisted: {e}");
        }
    }
    let encoder = Pcm16Codec;
    if config.protocol.audio_format != encoder.format() {
        info!(
            "host codec speaks {}, announcing it instead of {:?}",
            encoder.format(),
            config.protocol.audio_format
        );
        config.protocol.audio_format = encoder.format().to_owned();
    }
    let config: &DeviceConfig = config;
    config.validate()?;
    println!("Fae device v{}", env!("CARGO_PKG_VERSION"));

    let codec: Arc<dyn AudioCodec> = Arc::new(CpalCodec::open(&config.audio)?);
    let wake_word: Option<Box<dyn WakeWordEngine>> = if config.wakeword.enabled {
        match KeywordSpotter::new(&config.wakeword, config.audio.input_sample_rate) {
            Ok(spotter) => Some(Box::new(spotter)),
            Err(e) => {
                warn!("wake word disabled: {e}");
                None
            }
        }
    } else {
        None
    };

    let board: Arc<dyn Board> = Arc::new(HostBoard::new(&config.device.board));
    let app = Application::new(
        config,
        AppParts {
            codec,
            encoder: Box::new(encoder),
            decoder: Box::new(Pcm16Codec),
            wake_word,
            sounds: SoundBank::builtin(config.audio.output_sample_rate),
            protocol: select_protocol(config)?,
            board,
            tools: Vec::new(),
        },
    )?;

    let handle = app.handle();
    spawn_ctrl_c(handle.clone())?;
    spawn_push_to_talk(handle, app.state_reader())?;

    println!("Press Enter to talk, Enter again to stop. Ctrl-C to quit.");
    app.run()?;
    info!("fae-device-host shut down cleanly");
    Ok(())
}

fn spawn_ctrl_c(handle: CoreHandle) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    std::thread::Builder::new()
        .name("fae-signal".into())
        .spawn(move || {
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    println!("\nShutting down...");
                    handle.shutdown();
                }
            });
        })?;
    Ok(())
}

fn spawn_push_to_talk(
    handle: CoreHandle,
    state: fae_device::state::StateReader,
) -> anyhow::Result<()> {
    std::thread::Builder::new()
        .name("fae-stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                if line.is_err() {
                    break;
                }
                let delivered = if state.get() == DeviceState::Listening {
                    handle.stop_listening()
                } else {
                    handle.start_listening()
                };
                if !delivered {
                    break;
                }
            }
        })?;
    Ok(())
}

fn list_devices() -> anyhow::Result<()> {
    println!("Input devices:");
    for name in CpalCodec::list_input_devices()? {
        println!("  {name}");
    }
    println!("Output devices:");
    for name in CpalCodec::list_output_devices()? {
        println!("  {name}");
    }
    Ok(())
}
