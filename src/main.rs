//! CLI entry point for the well-plate positioning engine.
//!
//! Two commands:
//! - `run`: execute the batch configured in the settings file.
//! - `home`: home and calibrate once, then exit.
//!
//! `--sim` swaps the hardware for the in-process simulator, which renders
//! wells as bright disks displaced by the positioning error; useful for
//! tuning gains and validating batch files without a stage attached.

use anyhow::Context;
use clap::{Parser, Subcommand};
use platepos::align::AlignmentController;
use platepos::batch::BatchSequencer;
use platepos::config::Settings;
use platepos::events::EventBus;
use platepos::frame::FrameBus;
use platepos::locator::TargetLocator;
use platepos::sim::{spawn_camera, SimOptions, SimPlant, SimTransport};
use platepos::snapshot::PngSink;
use platepos::stage::StagePositioner;
use platepos::transport::MotionTransport;
use platepos::wellmap::{PlatePosition, WellMap};
use platepos::StopFlag;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "platepos")]
#[command(about = "Automated well-plate positioning over an XY stage", long_about = None)]
struct Cli {
    /// Settings file (TOML).
    #[arg(long, default_value = "config/default.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured batch to completion.
    Run {
        /// Use the in-process hardware simulator.
        #[arg(long)]
        sim: bool,

        /// Serial device of the stepper board (real hardware).
        #[arg(long, default_value = "/tmp/printer")]
        port: String,

        #[arg(long, default_value_t = 250_000)]
        baud: u32,
    },

    /// Home the stage and calibrate the light source, then exit.
    Home {
        #[arg(long)]
        sim: bool,

        #[arg(long, default_value = "/tmp/printer")]
        port: String,

        #[arg(long, default_value_t = 250_000)]
        baud: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)
        .with_context(|| format!("loading settings from {}", cli.config.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run { sim, port, baud } => run_batch(settings, sim, &port, baud).await,
        Commands::Home { sim, port, baud } => home_once(settings, sim, &port, baud).await,
    }
}

struct Rig {
    transport: Arc<dyn MotionTransport>,
    frames: FrameBus,
    camera: Option<tokio::task::JoinHandle<()>>,
}

/// Build the transport and frame source, either simulated or real.
fn build_rig(settings: &Settings, sim: bool, port: &str, baud: u32) -> anyhow::Result<Rig> {
    let frames = FrameBus::new();

    if sim {
        let transport = SimTransport::new(SimOptions::default());

        // The optical scale is set equal to the alignment gains so the
        // simulated loop converges the way a tuned rig does.
        let map = WellMap::from_geometry(&settings.plate);
        let mut wells = vec![PlatePosition::new(0.0, 0.0)];
        for row in 1..=map.rows() {
            for col in 1..=map.cols() {
                if let Some(pos) = map.position(row, col) {
                    wells.push(pos);
                }
            }
        }
        let plant = SimPlant {
            wells,
            px_per_mm_x: settings.alignment.gain_x,
            px_per_mm_y: settings.alignment.gain_y,
            width: settings.camera.width,
            height: settings.camera.height,
            well_radius_px: f64::from(settings.camera.height) * 0.375,
        };
        let camera = spawn_camera(
            plant,
            transport.state_handle(),
            frames.clone(),
            Duration::from_millis(30),
        );
        return Ok(Rig {
            transport,
            frames,
            camera: Some(camera),
        });
    }

    #[cfg(feature = "transport_serial")]
    {
        let transport = Arc::new(
            platepos::transport::serial::SerialTransport::open(port, baud)
                .with_context(|| format!("opening serial port {port}"))?,
        );
        warn!("no frame source is wired up in real mode; attach one to the FrameBus via the library API");
        Ok(Rig {
            transport,
            frames,
            camera: None,
        })
    }
    #[cfg(not(feature = "transport_serial"))]
    {
        let _ = (port, baud);
        anyhow::bail!(
            "built without the transport_serial feature; use --sim or rebuild with --features transport_serial"
        );
    }
}

fn make_stage(settings: &Settings, rig: &Rig, stop: &StopFlag) -> StagePositioner {
    let locator = Arc::new(TargetLocator::new(
        settings.locator.clone(),
        &settings.camera,
    ));
    StagePositioner::new(
        Arc::clone(&rig.transport),
        locator,
        rig.frames.clone(),
        EventBus::default(),
        stop.clone(),
        settings.clone(),
    )
}

/// Request a cooperative stop on Ctrl-C.
fn hook_ctrl_c(stop: StopFlag) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("stop requested, finishing the current operation");
            stop.request_stop();
        }
    });
}

async fn run_batch(settings: Settings, sim: bool, port: &str, baud: u32) -> anyhow::Result<()> {
    let stop = StopFlag::new();
    hook_ctrl_c(stop.clone());
    let rig = build_rig(&settings, sim, port, baud)?;

    // The stage and the alignment controller share one locator so the
    // calibrated radius window applies to both.
    let locator = Arc::new(TargetLocator::new(
        settings.locator.clone(),
        &settings.camera,
    ));
    let stage = StagePositioner::new(
        Arc::clone(&rig.transport),
        Arc::clone(&locator) as Arc<dyn platepos::WellLocator>,
        rig.frames.clone(),
        EventBus::default(),
        stop.clone(),
        settings.clone(),
    );
    let controller = AlignmentController::new(
        locator,
        rig.frames.clone(),
        EventBus::default(),
        stop.clone(),
        settings.clone(),
    );
    let snapshots = Arc::new(PngSink::new(&settings.batch.output_root));

    let mut sequencer = BatchSequencer::new(
        stage,
        controller,
        rig.frames.clone(),
        snapshots,
        EventBus::default(),
        stop,
        settings,
    );

    let report = sequencer.run().await?;
    info!(
        passes = report.passes,
        completed = report.wells_completed,
        failed = report.wells_failed,
        stopped = report.stopped,
        "batch report"
    );
    if let Some(camera) = rig.camera {
        camera.abort();
    }
    Ok(())
}

async fn home_once(settings: Settings, sim: bool, port: &str, baud: u32) -> anyhow::Result<()> {
    let stop = StopFlag::new();
    hook_ctrl_c(stop.clone());
    let rig = build_rig(&settings, sim, port, baud)?;
    let mut stage = make_stage(&settings, &rig, &stop);

    stage.home().await?;
    if let Some((x, y)) = stage.alignment_target() {
        info!(x, y, "homed; alignment target calibrated");
    }
    if let Some(camera) = rig.camera {
        camera.abort();
    }
    Ok(())
}
