//! Layered application configuration.
//!
//! Settings are assembled from three sources, later ones overriding earlier
//! ones:
//!
//! 1. Built-in defaults (the values below)
//! 2. An optional TOML file passed on the command line
//! 3. Environment variables prefixed with `DRRP_` (e.g.
//!    `DRRP_SWEEP__INCREMENT_DEG=5`)
//!
//! Durations are written in humantime notation (`"1s"`, `"500ms"`).
//! `Settings::new` validates the merged result; semantic problems surface as
//! [`DrrpError::Configuration`] before any hardware is touched.

use crate::error::{AppResult, DrrpError};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Supported sensor cooling range of the camera, degrees Celsius.
pub const SENSOR_SETPOINT_RANGE_C: (f64, f64) = (-55.0, 20.0);

/// Top-level application settings.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Angular sweep parameters.
    pub sweep: SweepSettings,
    /// Camera connection and acquisition parameters.
    pub camera: CameraSettings,
    /// Rotation stage connection parameters.
    pub stages: StageSettings,
    /// Sequencer pacing and retry policy.
    pub sequencer: PacingSettings,
    /// Capture output location and naming.
    pub storage: StorageSettings,
}

/// Angular sweep parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct SweepSettings {
    /// Full sweep extent of the primary stage, degrees.
    pub total_angle_deg: f64,
    /// Primary stage advance per step, degrees.
    pub increment_deg: f64,
    /// Frames retained per capture.
    pub frames_per_burst: usize,
}

/// Camera connection and acquisition parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct CameraSettings {
    /// Serial port of the camera control link.
    pub port: String,
    /// Baud rate of the control link.
    pub baud_rate: u32,
    /// Acquisition frame rate, Hz.
    pub frame_rate_hz: f64,
    /// Integration time per frame.
    #[serde(with = "humantime_serde")]
    pub exposure: Duration,
    /// Sensor cooling setpoint, degrees Celsius.
    pub setpoint_c: f64,
    /// Convergence tolerance around the setpoint, degrees Celsius.
    pub setpoint_tolerance_c: f64,
    /// Interval between cooling convergence polls.
    #[serde(with = "humantime_serde")]
    pub cooling_poll: Duration,
    /// Bound on cooling convergence polls before giving up.
    pub cooling_max_polls: u32,
}

/// Rotation stage connection parameters. Each mount usually has its own
/// serial port; mounts daisy-chained on one RS-485 bus share a port and are
/// distinguished by their bus addresses.
#[derive(Debug, Clone, Deserialize)]
pub struct StageSettings {
    /// Serial port of the primary (polarizer) mount.
    pub primary_port: String,
    /// Serial port of the secondary (retarder) mount.
    pub secondary_port: String,
    /// Baud rate of the stage links.
    pub baud_rate: u32,
    /// Bus address of the primary mount.
    pub primary_address: u8,
    /// Bus address of the secondary mount.
    pub secondary_address: u8,
    /// Interval between motion-status polls while a move is in flight.
    #[serde(with = "humantime_serde")]
    pub move_poll: Duration,
    /// Bound on motion-status polls before a move is declared failed.
    pub move_max_polls: u32,
}

/// Sequencer pacing and retry policy.
#[derive(Debug, Clone, Deserialize)]
pub struct PacingSettings {
    /// Interval between burst-completion polls.
    #[serde(with = "humantime_serde")]
    pub completion_poll: Duration,
    /// Bound on burst-completion polls per attempt.
    pub max_completion_polls: u32,
    /// How many times a timed-out burst is retried before the sweep fails.
    pub burst_retries: u32,
}

impl Default for PacingSettings {
    fn default() -> Self {
        Self {
            completion_poll: Duration::from_secs(1),
            max_completion_polls: 10,
            burst_retries: 1,
        }
    }
}

/// Capture output location and naming.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    /// Directory capture files are written into (created if missing).
    pub output_dir: PathBuf,
    /// Leading component of every capture filename.
    pub prefix: String,
}

impl Settings {
    /// Load settings from defaults, an optional TOML file, and `DRRP_`
    /// environment overrides, then validate the merged result.
    pub fn new(path: Option<&Path>) -> AppResult<Self> {
        let mut builder = Config::builder()
            .set_default("sweep.total_angle_deg", 180.0)?
            .set_default("sweep.increment_deg", 10.0)?
            .set_default("sweep.frames_per_burst", 10)?
            .set_default("camera.port", "/dev/ttyUSB0")?
            .set_default("camera.baud_rate", 115_200)?
            .set_default("camera.frame_rate_hz", 600.0)?
            .set_default("camera.exposure", "1ms")?
            .set_default("camera.setpoint_c", -15.0)?
            .set_default("camera.setpoint_tolerance_c", 0.3)?
            .set_default("camera.cooling_poll", "5s")?
            .set_default("camera.cooling_max_polls", 240)?
            .set_default("stages.primary_port", "/dev/ttyUSB1")?
            .set_default("stages.secondary_port", "/dev/ttyUSB2")?
            .set_default("stages.baud_rate", 9600)?
            .set_default("stages.primary_address", 0)?
            .set_default("stages.secondary_address", 0)?
            .set_default("stages.move_poll", "200ms")?
            .set_default("stages.move_max_polls", 300)?
            .set_default("sequencer.completion_poll", "1s")?
            .set_default("sequencer.max_completion_polls", 10)?
            .set_default("sequencer.burst_retries", 1)?
            .set_default("storage.output_dir", "./captures")?
            .set_default("storage.prefix", "drrp")?;

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(Environment::with_prefix("DRRP").separator("__"));

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check semantic constraints that plain deserialization cannot express.
    pub fn validate(&self) -> AppResult<()> {
        if !self.sweep.increment_deg.is_finite() || self.sweep.increment_deg <= 0.0 {
            return Err(DrrpError::Configuration(format!(
                "sweep.increment_deg must be positive, got {}",
                self.sweep.increment_deg
            )));
        }
        if !self.sweep.total_angle_deg.is_finite() || self.sweep.total_angle_deg < 0.0 {
            return Err(DrrpError::Configuration(format!(
                "sweep.total_angle_deg must be non-negative, got {}",
                self.sweep.total_angle_deg
            )));
        }
        if self.sweep.frames_per_burst < 1 {
            return Err(DrrpError::Configuration(
                "sweep.frames_per_burst must be at least 1".to_string(),
            ));
        }
        if self.camera.frame_rate_hz <= 0.0 {
            return Err(DrrpError::Configuration(format!(
                "camera.frame_rate_hz must be positive, got {}",
                self.camera.frame_rate_hz
            )));
        }
        if self.camera.exposure.is_zero() {
            return Err(DrrpError::Configuration(
                "camera.exposure must be non-zero".to_string(),
            ));
        }
        let (lo, hi) = SENSOR_SETPOINT_RANGE_C;
        if self.camera.setpoint_c < lo || self.camera.setpoint_c > hi {
            return Err(DrrpError::Configuration(format!(
                "camera.setpoint_c must be within {lo} C to {hi} C, got {}",
                self.camera.setpoint_c
            )));
        }
        if self.stages.primary_port == self.stages.secondary_port
            && self.stages.primary_address == self.stages.secondary_address
        {
            return Err(DrrpError::Configuration(
                "stages sharing one bus must use distinct addresses".to_string(),
            ));
        }
        if self.sequencer.max_completion_polls < 1 {
            return Err(DrrpError::Configuration(
                "sequencer.max_completion_polls must be at least 1".to_string(),
            ));
        }
        if self.storage.prefix.is_empty() {
            return Err(DrrpError::Configuration(
                "storage.prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::new(None).unwrap();
        assert_eq!(settings.sequencer.max_completion_polls, 10);
        assert_eq!(settings.sequencer.completion_poll, Duration::from_secs(1));
        assert_ne!(settings.stages.primary_port, settings.stages.secondary_port);
    }

    #[test]
    fn test_validation_rejects_zero_increment() {
        let mut settings = Settings::new(None).unwrap();
        settings.sweep.increment_deg = 0.0;
        assert!(matches!(
            settings.validate(),
            Err(DrrpError::Configuration(_))
        ));
    }

    #[test]
    fn test_validation_rejects_setpoint_out_of_range() {
        let mut settings = Settings::new(None).unwrap();
        settings.camera.setpoint_c = -80.0;
        assert!(settings.validate().is_err());
        settings.camera.setpoint_c = 25.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_ambiguous_shared_bus() {
        let mut settings = Settings::new(None).unwrap();
        settings.stages.secondary_port = settings.stages.primary_port.clone();
        settings.stages.secondary_address = settings.stages.primary_address;
        assert!(settings.validate().is_err());

        // Distinct addresses make a shared bus legal.
        settings.stages.secondary_address = settings.stages.primary_address + 1;
        assert!(settings.validate().is_ok());
    }
}
