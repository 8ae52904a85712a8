//! End-to-end sweep properties, run against the mock instruments.

use drrp_daq::config::PacingSettings;
use drrp_daq::core::{BurstSpec, SequencerState, SweepPlan, SECONDARY_RATIO};
use drrp_daq::error::DrrpError;
use drrp_daq::instrument::{MockBurstCamera, MockStage};
use drrp_daq::sequencer::CaptureSequencer;
use drrp_daq::storage::MemorySink;
use std::time::Duration;

fn fast_pacing(max_completion_polls: u32) -> PacingSettings {
    PacingSettings {
        completion_poll: Duration::from_millis(1),
        max_completion_polls,
        burst_retries: 1,
    }
}

struct Rig {
    sequencer: CaptureSequencer,
    camera: MockBurstCamera,
    primary: MockStage,
    secondary: MockStage,
    sink: MemorySink,
}

fn rig(total_angle: f64, increment: f64, frames: usize, camera: MockBurstCamera) -> Rig {
    let plan = SweepPlan::new(total_angle, increment).unwrap();
    let burst = BurstSpec::new(frames, Duration::from_micros(10)).unwrap();
    let primary = MockStage::new("primary");
    let secondary = MockStage::new("secondary");
    let sink = MemorySink::new();
    let sequencer = CaptureSequencer::new(
        Box::new(camera.clone()),
        Box::new(primary.clone()),
        Box::new(secondary.clone()),
        Box::new(sink.clone()),
        plan,
        burst,
        fast_pacing(4),
    );
    Rig {
        sequencer,
        camera,
        primary,
        secondary,
        sink,
    }
}

#[tokio::test]
async fn full_sweep_captures_at_every_step_with_held_positions() {
    // 15 degrees in 5-degree steps, 3 frames kept per burst.
    let mut rig = rig(15.0, 5.0, 3, MockBurstCamera::new("cam", 8, 8));

    let report = rig.sequencer.run().await.unwrap();
    assert_eq!(report.capture_paths.len(), 4);
    assert_eq!(rig.sequencer.state(), SequencerState::Done);

    let units = rig.sink.written();
    assert_eq!(units.len(), 4);

    let positions1: Vec<f64> = units.iter().map(|u| u.position1_deg).collect();
    let positions2: Vec<f64> = units.iter().map(|u| u.position2_deg).collect();
    assert_eq!(positions1, vec![0.0, 5.0, 10.0, 15.0]);
    assert_eq!(positions2, vec![0.0, 25.0, 50.0, 75.0]);

    for (step, unit) in units.iter().enumerate() {
        assert_eq!(unit.step_index, step);
        assert_eq!(unit.frames.len(), 3);
        // The priming frame (index 0) is discarded; the stack starts at 1.
        assert_eq!(unit.frames[0].frame_number, 1);
        assert_eq!(unit.frames[2].frame_number, 3);
    }
}

#[tokio::test]
async fn exactly_one_leading_frame_is_discarded_for_any_burst_size() {
    for frames in 1..=5 {
        let mut rig = rig(0.0, 5.0, frames, MockBurstCamera::new("cam", 4, 4));
        rig.sequencer.run().await.unwrap();

        let units = rig.sink.written();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].frames.len(), frames);
        let numbers: Vec<usize> = units[0].frames.iter().map(|f| f.frame_number).collect();
        let expected: Vec<usize> = (1..=frames).collect();
        assert_eq!(numbers, expected, "burst of {frames} frames");
    }
}

#[tokio::test]
async fn secondary_moves_exactly_five_times_the_primary_every_step() {
    let mut rig = rig(180.0, 10.0, 2, MockBurstCamera::new("cam", 4, 4));
    rig.sequencer.run().await.unwrap();

    // floor(180 / 10) + 1 = 19 captures, one advance after each.
    assert_eq!(rig.sink.written().len(), 19);

    let primary_moves = rig.primary.relative_moves();
    let secondary_moves = rig.secondary.relative_moves();
    assert_eq!(primary_moves.len(), 19);
    assert_eq!(secondary_moves.len(), 19);
    for (p, s) in primary_moves.iter().zip(&secondary_moves) {
        assert_eq!(*p, 10.0);
        assert_eq!(*s, SECONDARY_RATIO * 10.0);
    }
}

#[tokio::test]
async fn camera_is_stopped_after_every_step() {
    let mut rig = rig(20.0, 5.0, 2, MockBurstCamera::new("cam", 4, 4));
    rig.sequencer.run().await.unwrap();
    assert_eq!(rig.camera.stop_count(), 5);
}

#[tokio::test]
async fn completion_poll_is_bounded_when_burst_never_finishes() {
    let camera = MockBurstCamera::new("cam", 4, 4).with_unfinished_bursts(u32::MAX);
    let mut rig = rig(0.0, 5.0, 2, camera);

    let err = rig.sequencer.run().await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DrrpError>(),
        Some(DrrpError::PollTimeout { attempts: 4 })
    ));
    assert_eq!(rig.sequencer.state(), SequencerState::Failed);

    // One original attempt plus one retry, each bounded at 4 polls.
    assert_eq!(rig.camera.poll_counts(), vec![4, 4]);
    assert!(rig.sink.written().is_empty());
    // The failed step never advances the stages.
    assert!(rig.primary.relative_moves().is_empty());
    assert!(rig.secondary.relative_moves().is_empty());
}

#[tokio::test]
async fn burst_timeout_recovers_when_the_retry_completes() {
    let camera = MockBurstCamera::new("cam", 4, 4).with_unfinished_bursts(1);
    let mut rig = rig(0.0, 5.0, 2, camera);

    rig.sequencer.run().await.unwrap();
    assert_eq!(rig.camera.bursts_started(), 2);
    assert_eq!(rig.sink.written().len(), 1);
}

#[tokio::test]
async fn arm_fault_aborts_the_whole_sweep_with_no_output() {
    let camera = MockBurstCamera::new("cam", 4, 4);
    camera.fail_arm();
    let mut rig = rig(15.0, 5.0, 3, camera);

    let err = rig.sequencer.run().await.unwrap_err();
    assert!(err.to_string().contains("step 0"));
    assert_eq!(rig.sequencer.state(), SequencerState::Failed);
    assert!(rig.sink.written().is_empty());
    assert!(rig.primary.relative_moves().is_empty());
}

#[tokio::test]
async fn stage_fault_while_advancing_aborts_instead_of_skipping() {
    let camera = MockBurstCamera::new("cam", 4, 4);
    let mut rig = rig(30.0, 10.0, 2, camera);
    rig.secondary.fail_after_moves(1);

    let err = rig.sequencer.run().await.unwrap_err();
    // The alternate format renders the whole context chain.
    assert!(format!("{err:#}").contains("advancing stages after step 1"));
    assert_eq!(rig.sequencer.state(), SequencerState::Failed);

    // Steps 0 and 1 were persisted before the second advance failed; the
    // sweep never continues past a stage fault, so angular metadata and
    // physical positions cannot diverge.
    assert_eq!(rig.sink.written().len(), 2);
    assert_eq!(rig.primary.relative_moves().len(), 2);
    assert_eq!(rig.secondary.relative_moves().len(), 1);
}
