//! Core traits and data types for the sweep acquisition system.
//!
//! This module defines the foundational abstractions the capture sequencer is
//! built on, providing trait-based interfaces for the two hardware roles it
//! drives and the immutable value types that flow between them.
//!
//! # Architecture Overview
//!
//! - [`RotationStage`], [`BurstCamera`]: capability traits for the two device
//!   roles; implementations handle protocol-specific details
//! - [`SweepPlan`], [`BurstSpec`]: immutable run parameters, validated at
//!   construction
//! - [`RawFrame`], [`CaptureUnit`]: data produced per step, owned by the
//!   sequencer until handed to the storage sink
//! - [`SequencerState`]: the per-step lifecycle of the control loop
//!
//! # Thread Safety
//!
//! The traits require `Send + Sync` so device handles can cross task
//! boundaries, but the control loop itself is strictly sequential: the
//! sequencer exclusively owns its handles for the duration of a sweep and
//! never overlaps camera acquisition with stage motion.

use crate::error::{AppResult, DrrpError};
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Fixed angular coupling between the two stages: for every degree the
/// primary (polarizer) stage advances, the secondary (retarder) stage
/// advances five. The whole procedure exists to hold this ratio.
pub const SECONDARY_RATIO: f64 = 5.0;

/// Per-frame retrieval settle delay, as a multiple of the integration time.
/// Empirical value carried over from the acquisition hardware bring-up.
pub const RETRIEVAL_SETTLE_FACTOR: f64 = 1.3;

/// Instrument lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstrumentState {
    /// Not connected to hardware.
    Disconnected,
    /// Connection in progress.
    Connecting,
    /// Connected and ready to operate.
    Ready,
    /// Error state (see the returned error for details).
    Error,
    /// Shutting down.
    ShuttingDown,
}

/// A single raw frame as retrieved from the camera.
///
/// Pixels are 16-bit monochrome, row-major.
#[derive(Clone, Debug, PartialEq)]
pub struct RawFrame {
    /// Index of this frame within its burst.
    pub frame_number: usize,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixel data, `width * height` values in row-major order.
    pub pixels: Vec<u16>,
}

impl RawFrame {
    /// Total number of pixels (`width * height`).
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// The angular sweep parameters, validated at construction and immutable
/// thereafter.
#[derive(Clone, Copy, Debug)]
pub struct SweepPlan {
    total_angle_deg: f64,
    increment_deg: f64,
}

impl SweepPlan {
    /// Create a plan covering `total_angle_deg` in steps of `increment_deg`.
    ///
    /// The increment must be positive and finite; the total must be
    /// non-negative. A total that is not an exact multiple of the increment
    /// is truncated, matching `step_count`.
    pub fn new(total_angle_deg: f64, increment_deg: f64) -> AppResult<Self> {
        if !increment_deg.is_finite() || increment_deg <= 0.0 {
            return Err(DrrpError::Configuration(format!(
                "increment must be a positive angle, got {increment_deg}"
            )));
        }
        if !total_angle_deg.is_finite() || total_angle_deg < 0.0 {
            return Err(DrrpError::Configuration(format!(
                "total angle must be non-negative, got {total_angle_deg}"
            )));
        }
        Ok(Self {
            total_angle_deg,
            increment_deg,
        })
    }

    /// The full sweep extent in degrees.
    pub fn total_angle_deg(&self) -> f64 {
        self.total_angle_deg
    }

    /// The primary stage's per-step advance in degrees.
    pub fn increment_deg(&self) -> f64 {
        self.increment_deg
    }

    /// Number of advances the sweep performs: `floor(total / increment)`.
    pub fn step_count(&self) -> usize {
        (self.total_angle_deg / self.increment_deg).floor() as usize
    }

    /// Number of captures the sweep produces, including the initial
    /// pre-move position: `step_count() + 1`.
    pub fn capture_count(&self) -> usize {
        self.step_count() + 1
    }
}

/// Burst parameters: how many frames each capture keeps and how long to
/// settle between frame retrievals. Immutable after construction.
#[derive(Clone, Copy, Debug)]
pub struct BurstSpec {
    frame_count: usize,
    settle: Duration,
}

impl BurstSpec {
    /// Create a burst spec for `frame_count` retained frames per capture.
    pub fn new(frame_count: usize, settle: Duration) -> AppResult<Self> {
        if frame_count < 1 {
            return Err(DrrpError::Configuration(
                "at least one frame per burst is required".to_string(),
            ));
        }
        Ok(Self {
            frame_count,
            settle,
        })
    }

    /// Convenience constructor deriving the settle delay from the camera
    /// integration time ([`RETRIEVAL_SETTLE_FACTOR`] x exposure).
    pub fn for_exposure(frame_count: usize, exposure: Duration) -> AppResult<Self> {
        Self::new(frame_count, exposure.mul_f64(RETRIEVAL_SETTLE_FACTOR))
    }

    /// Number of frames retained per capture.
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Settle delay between frame retrievals.
    pub fn settle(&self) -> Duration {
        self.settle
    }

    /// Number of frames the camera is armed for per burst: one more than is
    /// retained, because the leading frame of a fresh burst is a sensor
    /// warm-up artifact and is always discarded.
    pub fn armed_count(&self) -> usize {
        self.frame_count + 1
    }
}

/// One completed capture: the retained frame stack plus the stage angles
/// held throughout the burst. Constructed once per step and handed to the
/// storage sink by reference; never mutated afterwards.
#[derive(Clone, Debug)]
pub struct CaptureUnit {
    /// Retained frames in retrieval order (length = `BurstSpec::frame_count`).
    pub frames: Vec<RawFrame>,
    /// Primary stage angle at capture time, degrees.
    pub position1_deg: f64,
    /// Secondary stage angle at capture time, degrees.
    pub position2_deg: f64,
    /// Zero-based step index within the sweep.
    pub step_index: usize,
}

/// Lifecycle of the capture control loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequencerState {
    /// Created, sweep not started.
    Idle,
    /// Configuring the camera for the next burst.
    Arming,
    /// Burst running; waiting for completion.
    Acquiring,
    /// Fetching captured frames.
    Retrieving,
    /// Writing the assembled capture unit.
    Persisting,
    /// Moving both stages to the next angular step.
    Advancing,
    /// Sweep completed successfully.
    Done,
    /// Sweep aborted on an unrecoverable fault.
    Failed,
}

impl SequencerState {
    /// Short name for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            SequencerState::Idle => "Idle",
            SequencerState::Arming => "Arming",
            SequencerState::Acquiring => "Acquiring",
            SequencerState::Retrieving => "Retrieving",
            SequencerState::Persisting => "Persisting",
            SequencerState::Advancing => "Advancing",
            SequencerState::Done => "Done",
            SequencerState::Failed => "Failed",
        }
    }
}

/// Rotation stage capability trait.
///
/// The sequencer works with this trait instead of concrete drivers so the
/// sweep logic stays hardware-agnostic. Move operations use synchronous-wait
/// semantics: they return only once the actuator reports motion finished, so
/// callers may treat a returned `Ok` as "the stage is at the target angle".
#[async_trait]
pub trait RotationStage: Send + Sync {
    /// Stable identifier for diagnostics.
    fn id(&self) -> &str;

    /// Run the homing sequence; blocks until the reference position is found.
    async fn home(&mut self) -> Result<()>;

    /// Move to an absolute angle in degrees; blocks until motion completes.
    async fn move_absolute(&mut self, angle_deg: f64) -> Result<()>;

    /// Move by a relative delta in degrees; blocks until motion completes.
    async fn move_relative(&mut self, delta_deg: f64) -> Result<()>;

    /// Last known angle in degrees. Never blocks and never fails; reflects
    /// the position reported at the end of the most recent motion.
    fn position(&self) -> f64;
}

/// Camera burst-capture capability trait.
///
/// Models a camera/frame-grabber pair that captures a bounded burst of
/// frames: arm for N frames, start asynchronously, poll for completion,
/// retrieve frames by index, stop.
#[async_trait]
pub trait BurstCamera: Send + Sync {
    /// Stable identifier for diagnostics.
    fn id(&self) -> &str;

    /// Configure the device to capture exactly `frames` frames on the next
    /// [`start`](BurstCamera::start). Fails if `frames < 1` or the device
    /// rejects the configuration.
    async fn arm(&mut self, frames: usize) -> Result<()>;

    /// Begin acquisition asynchronously. Fails if the camera is not armed.
    async fn start(&mut self) -> Result<()>;

    /// Non-blocking poll of the burst-completion flag.
    async fn is_burst_finished(&mut self) -> Result<bool>;

    /// Retrieve one already-captured frame by its index within the burst.
    async fn frame(&mut self, index: usize) -> Result<RawFrame>;

    /// Halt acquisition. Idempotent; safe whether or not a burst is running.
    async fn stop(&mut self) -> Result<()>;

    /// Currently configured integration time.
    fn exposure(&self) -> Duration;

    /// Currently configured frame rate in Hz.
    fn frame_rate_hz(&self) -> f64;
}
