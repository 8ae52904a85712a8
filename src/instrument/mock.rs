//! Mock instruments that generate synthetic data.
//!
//! These doubles implement the same capability traits as the hardware
//! drivers so the sweep logic can run off-hardware, both in tests and via
//! the binary's `--mock` flag. Clones share state, letting a test keep a
//! handle for assertions after moving the instrument into the sequencer.

use crate::core::{BurstCamera, RawFrame, RotationStage};
use crate::instrument::cred2::FrameGrabberLink;
use crate::error::DrrpError;
use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Synthetic 16-bit gradient frame with a little shot-noise-like jitter.
fn synthetic_frame(frame_number: usize, width: u32, height: u32) -> RawFrame {
    let mut rng = rand::thread_rng();
    let mut pixels = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        for x in 0..width {
            let base = (((x + y) % 256) * 256) as u16;
            pixels.push(base.saturating_add(rng.gen_range(0..64)));
        }
    }
    RawFrame {
        frame_number,
        width,
        height,
        pixels,
    }
}

// ============================================================================
// Mock rotation stage
// ============================================================================

#[derive(Default)]
struct StageState {
    position_deg: f64,
    homed: bool,
    relative_moves: Vec<f64>,
    fail_after_moves: Option<usize>,
}

/// In-memory [`RotationStage`] with instantaneous, always-successful motion
/// (unless a failure is scripted).
#[derive(Clone)]
pub struct MockStage {
    id: String,
    state: Arc<Mutex<StageState>>,
}

impl MockStage {
    /// Create a stage at 0 degrees.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: Arc::new(Mutex::new(StageState::default())),
        }
    }

    /// Make every relative move after the first `count` fail with an
    /// actuator error.
    pub fn fail_after_moves(&self, count: usize) {
        self.lock().fail_after_moves = Some(count);
    }

    /// Every relative move delta issued so far, in order.
    pub fn relative_moves(&self) -> Vec<f64> {
        self.lock().relative_moves.clone()
    }

    /// Whether the homing sequence has run.
    pub fn is_homed(&self) -> bool {
        self.lock().homed
    }

    #[allow(clippy::unwrap_used)]
    fn lock(&self) -> MutexGuard<'_, StageState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl RotationStage for MockStage {
    fn id(&self) -> &str {
        &self.id
    }

    async fn home(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.position_deg = 0.0;
        state.homed = true;
        Ok(())
    }

    async fn move_absolute(&mut self, angle_deg: f64) -> Result<()> {
        self.lock().position_deg = angle_deg;
        Ok(())
    }

    async fn move_relative(&mut self, delta_deg: f64) -> Result<()> {
        let mut state = self.lock();
        if let Some(limit) = state.fail_after_moves {
            if state.relative_moves.len() >= limit {
                return Err(DrrpError::Actuator(format!(
                    "stage '{}' communication lost",
                    self.id
                ))
                .into());
            }
        }
        state.relative_moves.push(delta_deg);
        state.position_deg += delta_deg;
        Ok(())
    }

    fn position(&self) -> f64 {
        self.lock().position_deg
    }
}

// ============================================================================
// Mock burst camera
// ============================================================================

struct CameraState {
    width: u32,
    height: u32,
    exposure: Duration,
    frame_rate_hz: f64,

    armed: Option<usize>,
    started: bool,
    fail_arm: bool,
    /// The first N started bursts never report finished.
    unfinished_bursts: u32,

    bursts_started: u32,
    /// Completion polls observed per started burst.
    poll_counts: Vec<u32>,
    stop_count: u32,
}

/// In-memory [`BurstCamera`] producing synthetic frames, with scriptable
/// arm failures and completion-poll behavior.
#[derive(Clone)]
pub struct MockBurstCamera {
    id: String,
    state: Arc<Mutex<CameraState>>,
}

impl MockBurstCamera {
    /// Create a camera producing `width` x `height` synthetic frames.
    pub fn new(id: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            id: id.into(),
            state: Arc::new(Mutex::new(CameraState {
                width,
                height,
                exposure: Duration::from_micros(100),
                frame_rate_hz: 600.0,
                armed: None,
                started: false,
                fail_arm: false,
                unfinished_bursts: 0,
                bursts_started: 0,
                poll_counts: Vec::new(),
                stop_count: 0,
            })),
        }
    }

    /// Make every subsequent `arm` call fail.
    pub fn fail_arm(&self) {
        self.lock().fail_arm = true;
    }

    /// Make the first `count` started bursts never report finished.
    pub fn with_unfinished_bursts(self, count: u32) -> Self {
        self.lock().unfinished_bursts = count;
        self
    }

    /// Number of bursts started so far.
    pub fn bursts_started(&self) -> u32 {
        self.lock().bursts_started
    }

    /// Completion polls observed for each started burst.
    pub fn poll_counts(&self) -> Vec<u32> {
        self.lock().poll_counts.clone()
    }

    /// Number of `stop` calls so far.
    pub fn stop_count(&self) -> u32 {
        self.lock().stop_count
    }

    #[allow(clippy::unwrap_used)]
    fn lock(&self) -> MutexGuard<'_, CameraState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl BurstCamera for MockBurstCamera {
    fn id(&self) -> &str {
        &self.id
    }

    async fn arm(&mut self, frames: usize) -> Result<()> {
        let mut state = self.lock();
        if state.fail_arm {
            return Err(DrrpError::Camera(format!(
                "camera '{}' rejected burst configuration",
                self.id
            ))
            .into());
        }
        if frames < 1 {
            return Err(DrrpError::Camera("cannot arm for zero frames".to_string()).into());
        }
        state.armed = Some(frames);
        state.started = false;
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        let mut state = self.lock();
        if state.armed.is_none() {
            return Err(
                DrrpError::Camera("start requested before the camera was armed".to_string())
                    .into(),
            );
        }
        state.started = true;
        state.bursts_started += 1;
        state.poll_counts.push(0);
        Ok(())
    }

    async fn is_burst_finished(&mut self) -> Result<bool> {
        let mut state = self.lock();
        if !state.started {
            return Ok(false);
        }
        if let Some(count) = state.poll_counts.last_mut() {
            *count += 1;
        }
        Ok(state.bursts_started > state.unfinished_bursts)
    }

    async fn frame(&mut self, index: usize) -> Result<RawFrame> {
        let state = self.lock();
        let count = state
            .armed
            .ok_or_else(|| DrrpError::Camera("frame requested with no burst armed".to_string()))?;
        if index >= count {
            return Err(DrrpError::FrameIndex { index, count }.into());
        }
        Ok(synthetic_frame(index, state.width, state.height))
    }

    async fn stop(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.started = false;
        state.armed = None;
        state.stop_count += 1;
        Ok(())
    }

    fn exposure(&self) -> Duration {
        self.lock().exposure
    }

    fn frame_rate_hz(&self) -> f64 {
        self.lock().frame_rate_hz
    }
}

// ============================================================================
// Simulated frame grabber
// ============================================================================

struct GrabberState {
    width: u32,
    height: u32,
    armed: Option<usize>,
    started: bool,
    polls: u32,
    finish_after_polls: u32,
}

/// Off-hardware [`FrameGrabberLink`] producing synthetic frames. Stands in
/// for the vendor acquisition SDK when none is wired up.
#[derive(Clone)]
pub struct SimulatedGrabber {
    state: Arc<Mutex<GrabberState>>,
}

impl SimulatedGrabber {
    /// Create a grabber producing `width` x `height` frames that finishes
    /// its bursts immediately.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(GrabberState {
                width,
                height,
                armed: None,
                started: false,
                polls: 0,
                finish_after_polls: 0,
            })),
        }
    }

    #[allow(clippy::unwrap_used)]
    fn lock(&self) -> MutexGuard<'_, GrabberState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl FrameGrabberLink for SimulatedGrabber {
    async fn arm_frames(&mut self, frames: usize) -> Result<()> {
        let mut state = self.lock();
        state.armed = Some(frames);
        state.started = false;
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        let mut state = self.lock();
        if state.armed.is_none() {
            return Err(DrrpError::Camera("grabber started before arming".to_string()).into());
        }
        state.started = true;
        state.polls = 0;
        Ok(())
    }

    async fn is_finished(&mut self) -> Result<bool> {
        let mut state = self.lock();
        if !state.started {
            return Ok(false);
        }
        state.polls += 1;
        Ok(state.polls > state.finish_after_polls)
    }

    async fn fetch(&mut self, index: usize) -> Result<RawFrame> {
        let state = self.lock();
        let count = state
            .armed
            .ok_or_else(|| DrrpError::Camera("fetch with no burst armed".to_string()))?;
        if !state.started {
            return Err(DrrpError::Camera("fetch before burst start".to_string()).into());
        }
        if index >= count {
            return Err(DrrpError::FrameIndex { index, count }.into());
        }
        Ok(synthetic_frame(index, state.width, state.height))
    }

    async fn stop(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.started = false;
        state.armed = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_stage_records_moves() {
        let stage = MockStage::new("s1");
        let mut handle = stage.clone();
        handle.move_relative(10.0).await.unwrap();
        handle.move_relative(10.0).await.unwrap();
        assert_eq!(stage.relative_moves(), vec![10.0, 10.0]);
        assert_eq!(stage.position(), 20.0);
    }

    #[tokio::test]
    async fn test_mock_stage_scripted_failure() {
        let stage = MockStage::new("s1");
        stage.fail_after_moves(1);
        let mut handle = stage.clone();
        handle.move_relative(5.0).await.unwrap();
        assert!(handle.move_relative(5.0).await.is_err());
        // Failed move leaves position untouched
        assert_eq!(stage.position(), 5.0);
    }

    #[tokio::test]
    async fn test_mock_camera_burst_cycle() {
        let camera = MockBurstCamera::new("c1", 4, 4);
        let mut handle = camera.clone();
        handle.arm(3).await.unwrap();
        handle.start().await.unwrap();
        assert!(handle.is_burst_finished().await.unwrap());

        let frame = handle.frame(2).await.unwrap();
        assert_eq!(frame.pixels.len(), 16);
        assert!(handle.frame(3).await.is_err());

        handle.stop().await.unwrap();
        handle.stop().await.unwrap(); // idempotent
        assert_eq!(camera.stop_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_camera_unfinished_burst_never_completes() {
        let camera = MockBurstCamera::new("c1", 4, 4).with_unfinished_bursts(1);
        let mut handle = camera.clone();
        handle.arm(2).await.unwrap();
        handle.start().await.unwrap();
        for _ in 0..5 {
            assert!(!handle.is_burst_finished().await.unwrap());
        }
        assert_eq!(camera.poll_counts(), vec![5]);
    }
}
