//! DRRP sweep acquisition binary.
//!
//! Wires the configured (or mocked) instruments into the capture sequencer
//! and runs one sweep: cool the sensor, configure timing, home both stages,
//! then capture at every angular step.

use anyhow::Result;
use clap::Parser;
use drrp_daq::config::Settings;
use drrp_daq::core::{BurstCamera, BurstSpec, RotationStage, SweepPlan};
use drrp_daq::sequencer::CaptureSequencer;
use drrp_daq::storage::{CapturePathPlanner, StackSink, TiffStackWriter};
use drrp_daq::{adapters, instrument};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Synchronized dual-rotation-stage and camera acquisition for DRRP
/// polarimetry.
#[derive(Parser, Debug)]
#[command(name = "drrp_daq", version, about)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Total sweep angle of the primary stage, degrees.
    #[arg(long)]
    total_angle: Option<f64>,

    /// Primary stage increment per step, degrees.
    #[arg(long)]
    increment: Option<f64>,

    /// Frames retained per capture.
    #[arg(long)]
    frames: Option<usize>,

    /// Acquisition frame rate, Hz.
    #[arg(long)]
    frame_rate: Option<f64>,

    /// Integration time per frame, milliseconds.
    #[arg(long)]
    exposure_ms: Option<f64>,

    /// Sensor cooling setpoint, degrees Celsius.
    #[arg(long)]
    setpoint: Option<f64>,

    /// Directory capture files are written into.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Run against in-memory mock instruments instead of hardware.
    #[arg(long)]
    mock: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::new(cli.config.as_deref())?;

    if let Some(total) = cli.total_angle {
        settings.sweep.total_angle_deg = total;
    }
    if let Some(increment) = cli.increment {
        settings.sweep.increment_deg = increment;
    }
    if let Some(frames) = cli.frames {
        settings.sweep.frames_per_burst = frames;
    }
    if let Some(rate) = cli.frame_rate {
        settings.camera.frame_rate_hz = rate;
    }
    if let Some(exposure_ms) = cli.exposure_ms {
        settings.camera.exposure = Duration::from_secs_f64(exposure_ms / 1e3);
    }
    if let Some(setpoint) = cli.setpoint {
        settings.camera.setpoint_c = setpoint;
    }
    if let Some(output_dir) = cli.output_dir {
        settings.storage.output_dir = output_dir;
    }
    settings.validate()?;

    let plan = SweepPlan::new(settings.sweep.total_angle_deg, settings.sweep.increment_deg)?;
    let burst = BurstSpec::for_exposure(settings.sweep.frames_per_burst, settings.camera.exposure)?;

    let (camera, mut primary, mut secondary) = if cli.mock {
        build_mock_instruments()
    } else {
        build_hardware_instruments(&settings).await?
    };

    // Home both stages before the sweep so the recorded angles share the
    // mounts' reference zero.
    for stage in [primary.as_mut(), secondary.as_mut()] {
        stage.move_absolute(0.0).await?;
        stage.home().await?;
    }
    info!(
        "current positions are {:.3} and {:.3} degrees",
        primary.position(),
        secondary.position()
    );

    let planner = CapturePathPlanner::new(
        settings.storage.output_dir.clone(),
        settings.storage.prefix.clone(),
        camera.frame_rate_hz(),
        camera.exposure(),
        "tiff",
    );
    let sink: Box<dyn StackSink> = Box::new(TiffStackWriter::new(planner));

    let mut sequencer = CaptureSequencer::new(
        camera,
        primary,
        secondary,
        sink,
        plan,
        burst,
        settings.sequencer.clone(),
    );

    let report = sequencer.run().await?;
    info!(
        "sweep finished: {} capture files in '{}'",
        report.capture_paths.len(),
        settings.storage.output_dir.display()
    );
    Ok(())
}

type InstrumentSet = (
    Box<dyn BurstCamera>,
    Box<dyn RotationStage>,
    Box<dyn RotationStage>,
);

fn build_mock_instruments() -> InstrumentSet {
    info!("running with mock instruments");
    (
        Box::new(instrument::MockBurstCamera::new("mock_camera", 640, 512)),
        Box::new(instrument::MockStage::new("mock_stage_1")),
        Box::new(instrument::MockStage::new("mock_stage_2")),
    )
}

async fn build_hardware_instruments(settings: &Settings) -> Result<InstrumentSet> {
    let camera_adapter = adapters::SerialAdapter::new(
        settings.camera.port.clone(),
        settings.camera.baud_rate,
    )
    .with_line_terminator("\r\n")
    .with_response_delimiter('\n');

    // The vendor frame-grabber SDK binding is injected here when available;
    // until then bursts come from the simulated grabber.
    warn!("no frame grabber link configured; using simulated frames");
    let link = instrument::SimulatedGrabber::new(640, 512);

    let mut camera = instrument::Cred2Camera::new(
        "cred2",
        Box::new(camera_adapter),
        Box::new(link),
        settings.camera.cooling_poll,
        settings.camera.cooling_max_polls,
    );
    camera.initialize().await?;
    camera.set_frame_rate(settings.camera.frame_rate_hz).await?;
    camera.set_exposure(settings.camera.exposure).await?;
    camera
        .set_conversion_gain(instrument::ConversionGain::Low)
        .await?;
    camera.set_sensor_setpoint(settings.camera.setpoint_c).await?;
    camera
        .wait_for_setpoint(settings.camera.setpoint_tolerance_c)
        .await?;

    let mut primary = instrument::Ell14Stage::new(
        "stage_primary",
        settings.stages.primary_address,
        Box::new(adapters::SerialAdapter::new(
            settings.stages.primary_port.clone(),
            settings.stages.baud_rate,
        )),
        settings.stages.move_poll,
        settings.stages.move_max_polls,
    );
    primary.initialize().await?;

    let mut secondary = instrument::Ell14Stage::new(
        "stage_secondary",
        settings.stages.secondary_address,
        Box::new(adapters::SerialAdapter::new(
            settings.stages.secondary_port.clone(),
            settings.stages.baud_rate,
        )),
        settings.stages.move_poll,
        settings.stages.move_max_polls,
    );
    secondary.initialize().await?;

    Ok((Box::new(camera), Box::new(primary), Box::new(secondary)))
}
