use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use facecap_core::{
    CaptureEncoder, CapturePolicy, EmptyFramePolicy, PerformanceMode, ScrfdDetector,
};
use facecap_hw::{still_channel, Camera, CameraFacing};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod pipeline;
mod presenter;
mod session;

use config::{parse_size, Config};
use engine::{spawn_engine, EngineSettings};
use pipeline::{spawn_analysis, PreviewGeometry, Pump};
use presenter::TerminalPresenter;
use session::{PermissionSession, StdinActions, SystemBroker};

#[derive(Parser)]
#[command(name = "facecap", about = "Face detection preview with automatic still capture")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the camera, track faces and capture a still whenever one is seen
    Run(RunArgs),
    /// List V4L2 capture devices
    Devices {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Default)]
struct RunArgs {
    /// TOML config file (overrides FACECAP_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Camera to use: front or back
    #[arg(long)]
    facing: Option<CameraFacing>,
    /// Device node for the selected camera (e.g. /dev/video2)
    #[arg(long)]
    device: Option<String>,
    /// Detector mode: fast or accurate
    #[arg(long)]
    performance: Option<PerformanceMode>,
    /// What an empty frame does to the overlay: hold or clear
    #[arg(long)]
    empty_policy: Option<EmptyFramePolicy>,
    /// Still capture throttling: unthrottled or single
    #[arg(long)]
    capture_policy: Option<CapturePolicy>,
    /// JPEG quality, 1-100
    #[arg(long)]
    quality: Option<u8>,
    /// Preview view size as WIDTHxHEIGHT
    #[arg(long, value_parser = parse_size)]
    preview: Option<(u32, u32)>,
    /// Re-check the device node instead of asking the desktop portal
    #[arg(long)]
    no_portal: bool,
    /// Decode the five facial landmarks
    #[arg(long)]
    landmarks: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(facing) = self.facing {
            config.facing = facing;
        }
        if let Some(device) = &self.device {
            match config.facing {
                CameraFacing::Front => config.front_device = device.clone(),
                CameraFacing::Back => config.back_device = device.clone(),
            }
        }
        if let Some(mode) = self.performance {
            config.detector.performance = mode;
        }
        if let Some(policy) = self.empty_policy {
            config.empty_policy = policy;
        }
        if let Some(policy) = self.capture_policy {
            config.capture_policy = policy;
        }
        if let Some(q) = self.quality {
            config.jpeg_quality = q;
        }
        if self.preview.is_some() {
            config.preview = self.preview;
        }
        if self.no_portal {
            config.portal = false;
        }
        if self.landmarks {
            config.detector.landmarks = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            let mut config = Config::load(args.config.as_deref())?;
            args.apply(&mut config);
            run(config).await
        }
        Commands::Devices { json } => {
            let devices = Camera::list_devices();
            if json {
                println!("{}", serde_json::to_string_pretty(&devices)?);
            } else if devices.is_empty() {
                println!("No V4L2 capture devices found");
            } else {
                for d in &devices {
                    println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
                }
            }
            Ok(())
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let selector = config.selector();
    let device = selector.device().to_string();
    tracing::info!(
        device = %device,
        facing = ?config.facing,
        performance = ?config.detector.performance,
        "facecap starting"
    );

    let (mut presenter, _writer) =
        TerminalPresenter::spawn().context("spawning terminal writer")?;
    let mut session = PermissionSession::new(
        SystemBroker::new(&device, config.portal),
        StdinActions::new(),
    );
    // Nothing touches the camera or the model before access is granted.
    let mut camera = session
        .launch(&mut presenter, || Camera::open(&device, config.width, config.height))
        .await??;
    tracing::debug!(
        status = ?session.status(),
        prompts = session.prompts(),
        "camera access granted"
    );
    tracing::info!(
        device = %device,
        width = camera.width,
        height = camera.height,
        fourcc = ?camera.fourcc,
        "camera opened"
    );
    if config.warmup_frames > 0 {
        tracing::info!(count = config.warmup_frames, "discarding warmup frames");
        camera.warm_up(config.warmup_frames)?;
    }

    let model_path = config.scrfd_model_path();
    let detector = ScrfdDetector::load(&model_path, config.detector)
        .with_context(|| format!("loading face detector from {model_path}"))?;
    tracing::info!(path = %model_path, "SCRFD detector loaded");

    let (publisher, still) = still_channel();
    let engine = spawn_engine(
        EngineSettings {
            empty_policy: config.empty_policy,
            capture_policy: config.capture_policy,
            encoder: CaptureEncoder::new(config.jpeg_quality),
        },
        Arc::new(still),
        presenter.clone(),
    );

    let stop = Arc::new(AtomicBool::new(false));
    let pump = Pump {
        source: camera,
        detector,
        geometry: PreviewGeometry {
            view: config.preview,
            mirrored: selector.mirrored(),
        },
        publisher,
        engine: engine.clone(),
    };
    let pump_thread =
        spawn_analysis(pump, Arc::clone(&stop)).context("spawning analysis thread")?;
    let mut pump_done = tokio::task::spawn_blocking(move || pump_thread.join());

    let joined = tokio::select! {
        joined = &mut pump_done => joined,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted; stopping analysis");
            stop.store(true, Ordering::Relaxed);
            pump_done.await
        }
    };
    let stats = joined?.map_err(|_| anyhow::anyhow!("analysis thread panicked"))?;
    presenter.end_line();

    if let Some(latest) = engine.latest_capture().await? {
        tracing::info!(
            width = latest.capture.width,
            height = latest.capture.height,
            frame = latest.frame_sequence,
            base64_len = latest.capture.base64.len(),
            "latest capture held in memory"
        );
    }
    let snapshot = engine.snapshot().await?;
    tracing::info!(
        frames = stats.frames,
        summary = %serde_json::to_string(&snapshot)?,
        "facecap stopped"
    );
    Ok(())
}
