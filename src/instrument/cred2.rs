//! First Light C-RED 2 camera driver.
//!
//! The C-RED 2 splits across two links: a serial command interface for
//! configuration (frame rate, integration time, sensor cooling, conversion
//! gain) and a frame-grabber link that moves pixel data. This driver owns
//! the serial side in full; the grabber side is reached through the
//! [`FrameGrabberLink`] trait so the vendor SDK binding can be injected by
//! the caller and simulated in tests.
//!
//! Serial commands follow the camera's CLI: queries take the `raw` suffix
//! and answer with a bare number (`"tint raw"` -> `"0.001"`), setters use
//! `set <parameter> <value>`.

use crate::adapters::HardwareAdapter;
use crate::config::SENSOR_SETPOINT_RANGE_C;
use crate::core::{BurstCamera, InstrumentState, RawFrame};
use crate::error::DrrpError;
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

/// Sensor conversion gain setting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConversionGain {
    /// Largest full-well capacity; used for the bright DRRP beam.
    Low,
    /// Intermediate.
    Medium,
    /// Lowest read noise.
    High,
}

impl ConversionGain {
    fn as_str(&self) -> &'static str {
        match self {
            ConversionGain::Low => "low",
            ConversionGain::Medium => "medium",
            ConversionGain::High => "high",
        }
    }
}

/// Frame-grabber boundary.
///
/// Implementations wrap the vendor acquisition SDK; the driver only needs
/// arm/start/poll/fetch/stop. [`SimulatedGrabber`](crate::instrument::mock::SimulatedGrabber)
/// provides an off-hardware implementation.
#[async_trait]
pub trait FrameGrabberLink: Send + Sync {
    /// Configure the grabber to capture exactly `frames` frames.
    async fn arm_frames(&mut self, frames: usize) -> Result<()>;

    /// Begin the configured burst asynchronously.
    async fn start(&mut self) -> Result<()>;

    /// Non-blocking burst-completion poll.
    async fn is_finished(&mut self) -> Result<bool>;

    /// Retrieve one captured frame by index.
    async fn fetch(&mut self, index: usize) -> Result<RawFrame>;

    /// Halt acquisition. Idempotent.
    async fn stop(&mut self) -> Result<()>;
}

/// C-RED 2 camera: serial control link plus injected grabber link.
pub struct Cred2Camera {
    id: String,
    adapter: Box<dyn HardwareAdapter>,
    link: Box<dyn FrameGrabberLink>,
    state: InstrumentState,

    exposure: Duration,
    frame_rate_hz: f64,
    setpoint_c: Option<f64>,
    cooling_poll: Duration,
    cooling_max_polls: u32,

    armed: Option<usize>,
}

impl Cred2Camera {
    /// Create a camera handle over `adapter` (control) and `link` (frames).
    pub fn new(
        id: impl Into<String>,
        adapter: Box<dyn HardwareAdapter>,
        link: Box<dyn FrameGrabberLink>,
        cooling_poll: Duration,
        cooling_max_polls: u32,
    ) -> Self {
        Self {
            id: id.into(),
            adapter,
            link,
            state: InstrumentState::Disconnected,
            exposure: Duration::from_millis(1),
            frame_rate_hz: 0.0,
            setpoint_c: None,
            cooling_poll,
            cooling_max_polls,
            armed: None,
        }
    }

    /// Connect the control link and read back the current timing state.
    pub async fn initialize(&mut self) -> Result<()> {
        if self.state != InstrumentState::Disconnected {
            return Err(DrrpError::Camera(format!(
                "camera '{}' already initialized",
                self.id
            ))
            .into());
        }

        self.state = InstrumentState::Connecting;
        if let Err(e) = self.adapter.connect().await {
            self.state = InstrumentState::Error;
            return Err(e);
        }

        self.frame_rate_hz = self.query_float("fps raw").await?;
        let tint_s = self.query_float("tint raw").await?;
        self.exposure = Duration::from_secs_f64(tint_s);
        self.state = InstrumentState::Ready;

        info!(
            "C-RED 2 '{}' ready: {:.1} fps, tint {:.3} ms",
            self.id,
            self.frame_rate_hz,
            self.exposure.as_secs_f64() * 1e3
        );
        Ok(())
    }

    /// Stop any burst and release the control link.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.state = InstrumentState::ShuttingDown;
        self.link.stop().await?;
        self.adapter.disconnect().await?;
        self.state = InstrumentState::Disconnected;
        info!("C-RED 2 '{}' shut down", self.id);
        Ok(())
    }

    /// Query a command that answers with a bare number.
    async fn query_float(&mut self, command: &str) -> Result<f64> {
        let response = self
            .adapter
            .query(command)
            .await
            .map_err(|e| DrrpError::Camera(format!("'{command}' failed: {e}")))?;
        response.trim().parse::<f64>().map_err(|e| {
            DrrpError::Camera(format!("unparseable response '{response}' to '{command}': {e}"))
                .into()
        })
    }

    /// Set the acquisition frame rate and read back the applied value.
    pub async fn set_frame_rate(&mut self, hz: f64) -> Result<()> {
        if hz <= 0.0 {
            return Err(DrrpError::Camera(format!("invalid frame rate {hz}")).into());
        }
        self.adapter
            .send(&format!("set fps {hz}"))
            .await
            .map_err(|e| DrrpError::Camera(format!("setting fps failed: {e}")))?;
        self.frame_rate_hz = self.query_float("fps raw").await?;
        info!("C-RED 2 '{}' fps set to {:.1}", self.id, self.frame_rate_hz);
        Ok(())
    }

    /// Set the integration time, validated against the device-reported range.
    pub async fn set_exposure(&mut self, exposure: Duration) -> Result<()> {
        let min_s = self.query_float("mintint raw").await?;
        let max_s = self.query_float("maxtint raw").await?;
        let requested_s = exposure.as_secs_f64();

        if requested_s < min_s || requested_s > max_s {
            return Err(DrrpError::Camera(format!(
                "tint {:.3} ms outside supported range {:.3}..{:.3} ms",
                requested_s * 1e3,
                min_s * 1e3,
                max_s * 1e3
            ))
            .into());
        }

        self.adapter
            .send(&format!("set tint {requested_s}"))
            .await
            .map_err(|e| DrrpError::Camera(format!("setting tint failed: {e}")))?;
        let applied_s = self.query_float("tint raw").await?;
        self.exposure = Duration::from_secs_f64(applied_s);
        info!(
            "C-RED 2 '{}' tint set to {:.3} ms",
            self.id,
            applied_s * 1e3
        );
        Ok(())
    }

    /// Select the sensor conversion gain.
    pub async fn set_conversion_gain(&mut self, gain: ConversionGain) -> Result<()> {
        self.adapter
            .send(&format!("set sensibility {}", gain.as_str()))
            .await
            .map_err(|e| DrrpError::Camera(format!("setting conversion gain failed: {e}")))?;
        debug!("C-RED 2 '{}' conversion gain {}", self.id, gain.as_str());
        Ok(())
    }

    /// Program the sensor cooling setpoint.
    pub async fn set_sensor_setpoint(&mut self, setpoint_c: f64) -> Result<()> {
        let (lo, hi) = SENSOR_SETPOINT_RANGE_C;
        if setpoint_c < lo || setpoint_c > hi {
            return Err(DrrpError::Camera(format!(
                "setpoint {setpoint_c} C outside supported range {lo} C to {hi} C"
            ))
            .into());
        }
        self.adapter
            .send(&format!("set temperatures snake {setpoint_c:.2}"))
            .await
            .map_err(|e| DrrpError::Camera(format!("setting sensor setpoint failed: {e}")))?;
        self.setpoint_c = Some(setpoint_c);
        info!("C-RED 2 '{}' cooling to {:.2} C", self.id, setpoint_c);
        Ok(())
    }

    /// Read the current sensor temperature in degrees Celsius.
    pub async fn sensor_temperature(&mut self) -> Result<f64> {
        self.query_float("temperatures snake raw").await
    }

    /// Poll the sensor temperature until it converges on the programmed
    /// setpoint, bounded by the configured poll budget.
    pub async fn wait_for_setpoint(&mut self, tolerance_c: f64) -> Result<()> {
        let setpoint = self.setpoint_c.ok_or_else(|| {
            DrrpError::Camera("no sensor setpoint programmed before convergence wait".to_string())
        })?;

        for _ in 0..self.cooling_max_polls {
            let temperature = self.sensor_temperature().await?;
            if (temperature - setpoint).abs() < tolerance_c {
                info!(
                    "C-RED 2 '{}' sensor settled at {:.2} C",
                    self.id, temperature
                );
                return Ok(());
            }
            info!(
                "C-RED 2 '{}' sensor at {:.2} C, waiting for {:.2} C",
                self.id, temperature, setpoint
            );
            tokio::time::sleep(self.cooling_poll).await;
        }

        Err(DrrpError::Camera(format!(
            "sensor did not reach {setpoint:.2} C within {} polls",
            self.cooling_max_polls
        ))
        .into())
    }

    fn require_ready(&self) -> Result<()> {
        if self.state != InstrumentState::Ready {
            return Err(DrrpError::Camera(format!(
                "camera '{}' not ready (state {:?})",
                self.id, self.state
            ))
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl BurstCamera for Cred2Camera {
    fn id(&self) -> &str {
        &self.id
    }

    async fn arm(&mut self, frames: usize) -> Result<()> {
        self.require_ready()?;
        if frames < 1 {
            return Err(DrrpError::Camera(format!(
                "cannot arm for {frames} frames, at least 1 required"
            ))
            .into());
        }
        self.link
            .arm_frames(frames)
            .await
            .map_err(|e| DrrpError::Camera(format!("arming for {frames} frames failed: {e}")))?;
        self.armed = Some(frames);
        debug!("C-RED 2 '{}' armed for {} frames", self.id, frames);
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        self.require_ready()?;
        if self.armed.is_none() {
            return Err(
                DrrpError::Camera("start requested before the camera was armed".to_string()).into(),
            );
        }
        self.link
            .start()
            .await
            .map_err(|e| DrrpError::Camera(format!("starting burst failed: {e}")).into())
    }

    async fn is_burst_finished(&mut self) -> Result<bool> {
        self.link.is_finished().await
    }

    async fn frame(&mut self, index: usize) -> Result<RawFrame> {
        let count = self.armed.ok_or_else(|| {
            DrrpError::Camera("frame requested with no burst armed".to_string())
        })?;
        if index >= count {
            return Err(DrrpError::FrameIndex { index, count }.into());
        }
        self.link.fetch(index).await
    }

    async fn stop(&mut self) -> Result<()> {
        self.link.stop().await?;
        self.armed = None;
        Ok(())
    }

    fn exposure(&self) -> Duration {
        self.exposure
    }

    fn frame_rate_hz(&self) -> f64 {
        self.frame_rate_hz
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockAdapter;
    use crate::instrument::mock::SimulatedGrabber;

    fn camera_with(adapter: MockAdapter) -> Cred2Camera {
        Cred2Camera::new(
            "test_cam",
            Box::new(adapter),
            Box::new(SimulatedGrabber::new(8, 8)),
            Duration::from_millis(1),
            4,
        )
    }

    async fn ready_camera(adapter: &MockAdapter) -> Cred2Camera {
        adapter.push_response("600.0"); // fps raw
        adapter.push_response("0.001"); // tint raw
        let mut camera = camera_with(adapter.clone());
        camera.initialize().await.unwrap();
        camera
    }

    #[tokio::test]
    async fn test_initialize_reads_back_timing() {
        let adapter = MockAdapter::new();
        let camera = ready_camera(&adapter).await;
        assert_eq!(camera.frame_rate_hz(), 600.0);
        assert_eq!(camera.exposure(), Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_exposure_outside_device_range_is_rejected() {
        let adapter = MockAdapter::new();
        let mut camera = ready_camera(&adapter).await;

        adapter.push_response("0.0001"); // mintint raw
        adapter.push_response("0.01"); // maxtint raw
        let err = camera
            .set_exposure(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("outside supported range"));
    }

    #[tokio::test]
    async fn test_setpoint_range_is_enforced() {
        let adapter = MockAdapter::new();
        let mut camera = ready_camera(&adapter).await;
        assert!(camera.set_sensor_setpoint(-80.0).await.is_err());
        assert!(camera.set_sensor_setpoint(25.0).await.is_err());
        assert!(camera.set_sensor_setpoint(-15.0).await.is_ok());
    }

    #[tokio::test]
    async fn test_cooling_convergence_polls_until_within_tolerance() {
        let adapter = MockAdapter::new();
        let mut camera = ready_camera(&adapter).await;
        camera.set_sensor_setpoint(-15.0).await.unwrap();

        adapter.push_response("10.0");
        adapter.push_response("-5.0");
        adapter.push_response("-14.9");
        camera.wait_for_setpoint(0.3).await.unwrap();
    }

    #[tokio::test]
    async fn test_cooling_convergence_is_bounded() {
        let adapter = MockAdapter::new();
        let mut camera = ready_camera(&adapter).await;
        camera.set_sensor_setpoint(-15.0).await.unwrap();

        for _ in 0..4 {
            adapter.push_response("10.0"); // never converges
        }
        let err = camera.wait_for_setpoint(0.3).await.unwrap_err();
        assert!(err.to_string().contains("did not reach"));
    }

    #[tokio::test]
    async fn test_arm_rejects_zero_frames() {
        let adapter = MockAdapter::new();
        let mut camera = ready_camera(&adapter).await;
        assert!(camera.arm(0).await.is_err());
    }

    #[tokio::test]
    async fn test_start_requires_arm() {
        let adapter = MockAdapter::new();
        let mut camera = ready_camera(&adapter).await;
        let err = camera.start().await.unwrap_err();
        assert!(err.to_string().contains("before the camera was armed"));
    }

    #[tokio::test]
    async fn test_frame_index_is_bounded() {
        let adapter = MockAdapter::new();
        let mut camera = ready_camera(&adapter).await;
        camera.arm(2).await.unwrap();
        camera.start().await.unwrap();

        assert!(camera.frame(0).await.is_ok());
        let err = camera.frame(2).await.unwrap_err();
        let drrp = err.downcast_ref::<DrrpError>().unwrap();
        assert!(matches!(drrp, DrrpError::FrameIndex { index: 2, count: 2 }));
    }
}
