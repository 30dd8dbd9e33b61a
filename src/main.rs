//! DroidMirror - Android screen mirroring client
//!
//! Runs a headless mirroring session: connects to the device, decodes the
//! video stream and logs session events until Ctrl+C or disconnect.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use clap::Parser;
use droid_mirror::{
    config::{format_bitrate, Config, ConfigManager},
    events::{ClientEvent, EventKind},
    logging::{init_logging, LogLevel},
    session::MirrorClient,
    transport::AdbTransport,
    video::FpsCounter,
};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "droid-mirror",
    about = "Mirror and control an Android device over ADB",
    version
)]
struct Cli {
    #[arg(short = 'd', long, value_name = "SERIAL", help = "Device serial (defaults to the first attached device)")]
    device: Option<String>,

    #[arg(short = 'm', long, value_name = "PIXELS", help = "Limit the longer video side (0 = unlimited)")]
    max_size: Option<u16>,

    #[arg(short = 's', long, value_name = "FPS", help = "Limit the frame rate (0 = unlimited)")]
    max_fps: Option<u16>,

    #[arg(short = 'b', long, value_name = "BPS", help = "Video bitrate in bits per second")]
    bitrate: Option<u32>,

    #[arg(long, value_name = "NAME", help = "Device encoder to use")]
    encoder_name: Option<String>,

    #[arg(long, value_name = "PATH", help = "Local server jar to deploy")]
    server_path: Option<PathBuf>,

    #[arg(long, value_name = "MS", help = "How long to wait for the server to listen")]
    timeout_ms: Option<u64>,

    #[arg(long, action = clap::ArgAction::SetTrue, help = "Keep the device awake while mirroring")]
    stay_awake: bool,

    #[arg(short = 'v', long, action = clap::ArgAction::Count, help = "Increase log verbosity")]
    verbose: u8,
}

impl Cli {
    /// Applies command line overrides on top of the stored configuration
    fn apply(&self, config: &mut Config) {
        if let Some(max_size) = self.max_size {
            config.server.max_size = max_size;
        }
        if let Some(max_fps) = self.max_fps {
            config.server.max_fps = max_fps;
        }
        if let Some(bitrate) = self.bitrate {
            config.server.bitrate = bitrate;
        }
        if let Some(encoder) = &self.encoder_name {
            config.server.encoder_name = Some(encoder.clone());
        }
        if let Some(path) = &self.server_path {
            config.server.server_path = path.clone();
        }
        if let Some(timeout) = self.timeout_ms {
            config.connection.connection_timeout_ms = timeout;
        }
        if self.stay_awake {
            config.server.stay_awake = true;
        }
        if let Some(device) = &self.device {
            config.device.serial = Some(device.clone());
        }
        if self.verbose > 0 {
            config.server.log_level = self.log_level().server_level().to_string();
        }
    }

    fn log_level(&self) -> LogLevel {
        LogLevel::from_verbosity(self.verbose)
    }
}

async fn pick_device(transport: &AdbTransport, configured: Option<String>) -> Result<String> {
    if let Some(serial) = configured {
        return Ok(serial);
    }

    let devices = transport
        .list_devices()
        .await
        .with_context(|| format!("Could not list devices from ADB at {}", transport.address()))?;
    match devices.into_iter().find(|d| d.is_online()) {
        Some(device) => Ok(device.serial),
        None => bail!("No device attached"),
    }
}

fn subscribe_logging(client: &MirrorClient, disconnected: mpsc::UnboundedSender<()>) {
    let events = client.events();

    events.subscribe(EventKind::Init, |event| {
        if let ClientEvent::Init {
            device_name,
            resolution,
        } = event
        {
            info!("Mirroring {} at {}", device_name, resolution);
        }
    });

    events.subscribe(EventKind::Resized, |event| {
        if let ClientEvent::Resized(resolution) = event {
            info!("Video resized to {}", resolution);
        }
    });

    let fps = Mutex::new(FpsCounter::new());
    events.subscribe(EventKind::Frame, move |_| {
        let rate = fps.lock().ok().and_then(|mut counter| counter.tick());
        if let Some(rate) = rate {
            info!("FPS: {}", rate);
        }
    });

    events.subscribe(EventKind::Disconnect, move |event| {
        if let ClientEvent::Disconnect(Some(e)) = &event {
            warn!("Session ended: {}", e);
        }
        let _ = disconnected.send(());
    });
}

async fn run(cli: Cli) -> Result<()> {
    let config_manager = ConfigManager::new()?;
    let mut config = config_manager.load_or_create_default()?;
    info!("Configuration loaded from: {:?}", config_manager.config_file());

    cli.apply(&mut config);
    config.validate()?;

    let transport = AdbTransport::from_config(&config.connection);
    let serial = pick_device(&transport, config.device.serial.clone()).await?;
    info!(
        "Device {}, bitrate {}, max size {}, max fps {}",
        serial,
        format_bitrate(config.server.bitrate.into()),
        config.server.max_size,
        config.server.max_fps
    );

    let client = MirrorClient::new(serial, config, Arc::new(transport));
    let (disconnected_tx, mut disconnected_rx) = mpsc::unbounded_channel();
    subscribe_logging(&client, disconnected_tx);

    client.start().await.context("Failed to start mirroring")?;
    info!("Press Ctrl+C to exit");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            info!("Shutting down...");
        }
        _ = disconnected_rx.recv() => {}
    }

    client.stop();
    let stats = client.pipeline_stats();
    info!(
        "Decoded {} frames from {} access units ({:.1}% ok)",
        stats.frames_decoded,
        stats.access_units,
        stats.success_rate()
    );

    match client.last_error() {
        Some(e) => bail!("Disconnected: {}", e),
        None => Ok(()),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_level());

    info!("Starting DroidMirror v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        std::process::exit(1);
    }

    info!("DroidMirror stopped.");
}
