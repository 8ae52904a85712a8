//! The capture sequencer: the acquisition-synchronization control loop.
//!
//! For each angular step the sequencer arms the camera for a bounded burst,
//! starts acquisition, waits for completion under a bounded poll, retrieves
//! and assembles the frames (discarding the leading warm-up frame), persists
//! the stack tagged with the stage angles held throughout the burst, and
//! then advances both stages in the fixed 1:5 ratio.
//!
//! The loop is strictly sequential: camera acquisition and stage motion
//! never overlap within a step, which is what makes the recorded angles
//! valid for the entire burst. The sequencer exclusively owns its device
//! handles and sink for the duration of the sweep.
//!
//! A burst whose completion poll exhausts its budget is not silently
//! retrieved; it is stopped and retried once (configurable), and a second
//! exhaustion fails the sweep with the step identified in the diagnostic.

use crate::config::PacingSettings;
use crate::core::{
    BurstCamera, BurstSpec, CaptureUnit, RawFrame, RotationStage, SequencerState, SweepPlan,
    SECONDARY_RATIO,
};
use crate::error::DrrpError;
use crate::storage::StackSink;
use anyhow::{Context, Result};
use std::path::PathBuf;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Summary of a completed sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Paths of the capture files, in step order.
    pub capture_paths: Vec<PathBuf>,
}

/// The per-step acquisition state machine.
pub struct CaptureSequencer {
    camera: Box<dyn BurstCamera>,
    primary: Box<dyn RotationStage>,
    secondary: Box<dyn RotationStage>,
    sink: Box<dyn StackSink>,

    plan: SweepPlan,
    burst: BurstSpec,
    pacing: PacingSettings,
    state: SequencerState,
}

impl CaptureSequencer {
    /// Take exclusive ownership of the devices and sink for one sweep.
    pub fn new(
        camera: Box<dyn BurstCamera>,
        primary: Box<dyn RotationStage>,
        secondary: Box<dyn RotationStage>,
        sink: Box<dyn StackSink>,
        plan: SweepPlan,
        burst: BurstSpec,
        pacing: PacingSettings,
    ) -> Self {
        Self {
            camera,
            primary,
            secondary,
            sink,
            plan,
            burst,
            pacing,
            state: SequencerState::Idle,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SequencerState {
        self.state
    }

    /// Execute the full sweep: `step_count + 1` captures including the
    /// initial pre-move position. Aborts on the first unrecoverable fault;
    /// there is no resumption of a partially completed sweep.
    pub async fn run(&mut self) -> Result<SweepReport> {
        let step_count = self.plan.step_count();
        info!(
            "starting sweep: {} captures, increment {:.3} deg, {} frames per burst",
            step_count + 1,
            self.plan.increment_deg(),
            self.burst.frame_count()
        );

        let mut report = SweepReport::default();
        for step in 0..=step_count {
            match self.run_step(step).await {
                Ok(path) => report.capture_paths.push(path),
                Err(e) => {
                    self.set_state(SequencerState::Failed);
                    return Err(e.context(format!(
                        "sweep aborted at step {step} of {step_count}"
                    )));
                }
            }
        }

        self.set_state(SequencerState::Done);
        info!("sweep complete: {} captures", report.capture_paths.len());
        Ok(report)
    }

    /// One full step: arm, acquire (with bounded retry), retrieve, persist,
    /// advance. Returns the path of the persisted capture.
    async fn run_step(&mut self, step: usize) -> Result<PathBuf> {
        self.set_state(SequencerState::Arming);
        // An arming fault mid-sweep indicates a device-level problem needing
        // operator intervention; it is fatal, never retried.
        self.camera
            .arm(self.burst.armed_count())
            .await
            .context("arming the camera")?;

        let mut attempt = 0u32;
        loop {
            self.set_state(SequencerState::Acquiring);
            match self.acquire_burst().await {
                Ok(()) => break,
                Err(e) if attempt < self.pacing.burst_retries && is_poll_timeout(&e) => {
                    attempt += 1;
                    warn!(
                        "burst at step {step} missed its completion bound, retrying ({attempt}/{})",
                        self.pacing.burst_retries
                    );
                    self.camera.stop().await?;
                    self.set_state(SequencerState::Arming);
                    self.camera
                        .arm(self.burst.armed_count())
                        .await
                        .context("re-arming after a completion timeout")?;
                }
                Err(e) => return Err(e),
            }
        }

        self.set_state(SequencerState::Retrieving);
        let frames = self
            .retrieve_frames()
            .await
            .with_context(|| format!("retrieving frames at step {step}"))?;

        // Positions are snapshotted after retrieval: the stages have not
        // moved since before the burst, so these are the angles held for
        // its whole duration.
        self.set_state(SequencerState::Persisting);
        let unit = CaptureUnit {
            frames,
            position1_deg: self.primary.position(),
            position2_deg: self.secondary.position(),
            step_index: step,
        };
        info!(
            "step {step}: position 1 is {:.3} deg, position 2 is {:.3} deg",
            unit.position1_deg, unit.position2_deg
        );
        let path = self
            .sink
            .write(&unit)
            .await
            .with_context(|| format!("persisting capture at step {step}"))?;

        self.set_state(SequencerState::Advancing);
        self.advance()
            .await
            .with_context(|| format!("advancing stages after step {step}"))?;

        Ok(path)
    }

    /// Start the armed burst and wait for completion under the bounded poll.
    async fn acquire_burst(&mut self) -> Result<()> {
        self.camera.start().await.context("starting the burst")?;

        // Coarse pacing: the burst cannot possibly be done before
        // frame_count x integration time has elapsed. Heuristic, not a
        // guarantee; the poll below decides.
        sleep(self.camera.exposure() * self.burst.frame_count() as u32).await;

        let mut attempts = 0u32;
        loop {
            if self.camera.is_burst_finished().await? {
                debug!("burst finished after {attempts} completion polls");
                return Ok(());
            }
            attempts += 1;
            if attempts >= self.pacing.max_completion_polls {
                return Err(DrrpError::PollTimeout { attempts }.into());
            }
            sleep(self.pacing.completion_poll).await;
        }
    }

    /// Fetch all armed frames, discarding exactly the one at index 0.
    async fn retrieve_frames(&mut self) -> Result<Vec<RawFrame>> {
        let mut frames = Vec::with_capacity(self.burst.frame_count());
        for index in 0..self.burst.armed_count() {
            let frame = self.camera.frame(index).await?;
            sleep(self.burst.settle()).await;
            if index == 0 {
                // Leading frame of a fresh burst is a sensor warm-up
                // artifact; drop it, keep 1..=frame_count.
                debug!("discarding priming frame");
                continue;
            }
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Advance both stages in the fixed 1:5 ratio and leave the camera in a
    /// clean stopped state for the next arming.
    async fn advance(&mut self) -> Result<()> {
        let increment = self.plan.increment_deg();
        self.primary
            .move_relative(increment)
            .await
            .with_context(|| format!("primary stage '{}'", self.primary.id()))?;
        self.secondary
            .move_relative(SECONDARY_RATIO * increment)
            .await
            .with_context(|| format!("secondary stage '{}'", self.secondary.id()))?;
        self.camera.stop().await.context("stopping the camera")?;
        Ok(())
    }

    fn set_state(&mut self, state: SequencerState) {
        debug!("sequencer state: {}", state.as_str());
        self.state = state;
    }
}

fn is_poll_timeout(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<DrrpError>(),
        Some(DrrpError::PollTimeout { .. })
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::mock::{MockBurstCamera, MockStage};
    use crate::storage::MemorySink;
    use std::time::Duration;

    fn fast_pacing() -> PacingSettings {
        PacingSettings {
            completion_poll: Duration::from_millis(1),
            max_completion_polls: 4,
            burst_retries: 1,
        }
    }

    fn make_sequencer(
        plan: SweepPlan,
        frames: usize,
        camera: MockBurstCamera,
    ) -> (CaptureSequencer, MockStage, MockStage, MemorySink) {
        let primary = MockStage::new("primary");
        let secondary = MockStage::new("secondary");
        let sink = MemorySink::new();
        let burst = BurstSpec::new(frames, Duration::from_micros(10)).unwrap();
        let sequencer = CaptureSequencer::new(
            Box::new(camera),
            Box::new(primary.clone()),
            Box::new(secondary.clone()),
            Box::new(sink.clone()),
            plan,
            burst,
            fast_pacing(),
        );
        (sequencer, primary, secondary, sink)
    }

    #[tokio::test]
    async fn test_single_capture_sweep() {
        let plan = SweepPlan::new(0.0, 5.0).unwrap();
        let camera = MockBurstCamera::new("cam", 4, 4);
        let (mut sequencer, _, _, sink) = make_sequencer(plan, 2, camera);

        assert_eq!(sequencer.state(), SequencerState::Idle);
        let report = sequencer.run().await.unwrap();
        assert_eq!(report.capture_paths.len(), 1);
        assert_eq!(sequencer.state(), SequencerState::Done);

        let units = sink.written();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].frames.len(), 2);
        assert_eq!(units[0].step_index, 0);
    }

    #[tokio::test]
    async fn test_arm_fault_is_fatal() {
        let plan = SweepPlan::new(10.0, 5.0).unwrap();
        let camera = MockBurstCamera::new("cam", 4, 4);
        camera.fail_arm();
        let (mut sequencer, primary, _, sink) = make_sequencer(plan, 2, camera);

        let err = sequencer.run().await.unwrap_err();
        assert!(err.to_string().contains("step 0"));
        assert_eq!(sequencer.state(), SequencerState::Failed);
        assert!(sink.written().is_empty());
        assert!(primary.relative_moves().is_empty());
    }

    #[tokio::test]
    async fn test_poll_timeout_retries_once_then_fails() {
        let plan = SweepPlan::new(0.0, 5.0).unwrap();
        // Every burst misses its completion bound.
        let camera = MockBurstCamera::new("cam", 4, 4).with_unfinished_bursts(u32::MAX);
        let handle = camera.clone();
        let (mut sequencer, _, _, sink) = make_sequencer(plan, 2, camera);

        let err = sequencer.run().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DrrpError>(),
            Some(DrrpError::PollTimeout { attempts: 4 })
        ));
        assert_eq!(sequencer.state(), SequencerState::Failed);
        // Original attempt plus exactly one retry, each polling to the bound.
        assert_eq!(handle.poll_counts(), vec![4, 4]);
        assert!(sink.written().is_empty());
    }

    #[tokio::test]
    async fn test_poll_timeout_recovers_on_retry() {
        let plan = SweepPlan::new(0.0, 5.0).unwrap();
        // First burst never finishes; the re-armed one completes.
        let camera = MockBurstCamera::new("cam", 4, 4).with_unfinished_bursts(1);
        let handle = camera.clone();
        let (mut sequencer, _, _, sink) = make_sequencer(plan, 2, camera);

        sequencer.run().await.unwrap();
        assert_eq!(handle.bursts_started(), 2);
        assert_eq!(sink.written().len(), 1);
    }

    #[tokio::test]
    async fn test_stage_fault_during_advance_aborts() {
        let plan = SweepPlan::new(20.0, 5.0).unwrap();
        let camera = MockBurstCamera::new("cam", 4, 4);
        let (mut sequencer, primary, _, sink) = make_sequencer(plan, 2, camera);
        primary.fail_after_moves(2);

        let err = sequencer.run().await.unwrap_err();
        // The alternate format renders the whole context chain.
        assert!(format!("{err:#}").contains("advancing stages after step 2"));
        assert_eq!(sequencer.state(), SequencerState::Failed);
        // Steps 0..=2 persisted before the third advance failed.
        assert_eq!(sink.written().len(), 3);
    }
}
