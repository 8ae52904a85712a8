//! Thorlabs Elliptec ELL14 rotation mount driver.
//!
//! One `Ell14Stage` owns a single mount on an RS-485 multidrop bus; the two
//! sweep stages are two instances with different bus addresses. Moves use
//! synchronous-wait semantics: the call returns only once the mount reports
//! motion finished, enforced by a bounded status poll.
//!
//! ## Elliptec Protocol
//!
//! RS-485 multidrop: `<address><command>[data]<CR>`
//! - Address: single hex digit (0-F)
//! - Commands: `gp` (get position), `ma` (move absolute), `ho` (home),
//!   `gs` (get status), `in` (info)
//! - Response: `<address><status><data><CR>`

use crate::adapters::HardwareAdapter;
use crate::core::{InstrumentState, RotationStage};
use crate::error::DrrpError;
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

/// ELL14 encoder resolution: 143360 counts = 360 degrees.
const COUNTS_PER_ROTATION: f64 = 143_360.0;

/// Status code reported while a move or homing sequence is in flight.
const STATUS_BUSY: u8 = 0x09;

/// A single ELL14 rotation mount on a shared serial bus.
pub struct Ell14Stage {
    id: String,
    address: u8,
    adapter: Box<dyn HardwareAdapter>,
    state: InstrumentState,

    /// Angle reported at the end of the most recent motion, degrees.
    last_position_deg: f64,

    /// Interval between status polls while waiting for motion to finish.
    move_poll: Duration,
    /// Bound on status polls before the move is declared failed.
    move_max_polls: u32,
}

impl Ell14Stage {
    /// Create a stage handle for the mount at `address` on `adapter`'s bus.
    pub fn new(
        id: impl Into<String>,
        address: u8,
        adapter: Box<dyn HardwareAdapter>,
        move_poll: Duration,
        move_max_polls: u32,
    ) -> Self {
        Self {
            id: id.into(),
            address,
            adapter,
            state: InstrumentState::Disconnected,
            last_position_deg: 0.0,
            move_poll,
            move_max_polls,
        }
    }

    /// Connect the bus and verify the mount responds.
    pub async fn initialize(&mut self) -> Result<()> {
        if self.state != InstrumentState::Disconnected {
            return Err(DrrpError::Actuator(format!(
                "stage '{}' already initialized",
                self.id
            ))
            .into());
        }

        self.state = InstrumentState::Connecting;
        if let Err(e) = self.adapter.connect().await {
            self.state = InstrumentState::Error;
            return Err(e);
        }

        match self.send_command("in").await {
            Ok(info) => {
                info!("ELL14 '{}' (address {}): {}", self.id, self.address, info);
            }
            Err(e) => {
                self.state = InstrumentState::Error;
                return Err(DrrpError::Actuator(format!(
                    "device {} not responding: {e}",
                    self.address
                ))
                .into());
            }
        }

        self.last_position_deg = self.read_position_degrees().await?;
        self.state = InstrumentState::Ready;
        Ok(())
    }

    /// Release the bus.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.state = InstrumentState::ShuttingDown;
        self.adapter.disconnect().await?;
        self.state = InstrumentState::Disconnected;
        info!("ELL14 '{}' shut down", self.id);
        Ok(())
    }

    /// Send a command to this mount and validate the response addressing.
    ///
    /// Elliptec protocol: `<addr><cmd>[data]\r`
    async fn send_command(&mut self, command: &str) -> Result<String> {
        let cmd = format!("{:X}{}", self.address, command);
        let response = self
            .adapter
            .query(&cmd)
            .await
            .map_err(|e| DrrpError::Actuator(format!("device {}: {e}", self.address)))?;

        if !response.starts_with(&format!("{:X}", self.address)) {
            return Err(DrrpError::Actuator(format!(
                "response address mismatch for device {}: {response}",
                self.address
            ))
            .into());
        }

        Ok(response)
    }

    fn degrees_from_counts(raw: u32) -> f64 {
        (raw as f64 / COUNTS_PER_ROTATION) * 360.0
    }

    fn counts_from_degrees(degrees: f64) -> u32 {
        let normalized = degrees.rem_euclid(360.0);
        ((normalized / 360.0) * COUNTS_PER_ROTATION).round() as u32
    }

    /// Parse a `PO` position response into degrees.
    fn parse_position(&self, response: &str) -> Result<f64> {
        // Response format: "0PO12345678" (address, "PO", 8 hex digits).
        if response.len() < 11 || &response[1..3] != "PO" {
            return Err(DrrpError::Actuator(format!(
                "invalid position response from device {}: {response}",
                self.address
            ))
            .into());
        }

        let raw = u32::from_str_radix(&response[3..11], 16).map_err(|e| {
            DrrpError::Actuator(format!(
                "unparseable position '{}' from device {}: {e}",
                &response[3..11],
                self.address
            ))
        })?;

        Ok(Self::degrees_from_counts(raw))
    }

    /// Query the mount for its current angle.
    async fn read_position_degrees(&mut self) -> Result<f64> {
        let response = self.send_command("gp").await?;
        self.parse_position(&response)
    }

    /// Poll the mount status until it reports idle, bounded by
    /// `move_max_polls`. This is what gives moves their blocking semantics.
    async fn wait_motion_idle(&mut self) -> Result<()> {
        for _ in 0..self.move_max_polls {
            let response = self.send_command("gs").await?;
            // Response format: "0GS00" (address, "GS", 2 hex status digits).
            if response.len() < 5 || &response[1..3] != "GS" {
                return Err(DrrpError::Actuator(format!(
                    "invalid status response from device {}: {response}",
                    self.address
                ))
                .into());
            }
            let code = u8::from_str_radix(&response[3..5], 16).map_err(|e| {
                DrrpError::Actuator(format!(
                    "unparseable status from device {}: {e}",
                    self.address
                ))
            })?;

            match code {
                0 => return Ok(()),
                STATUS_BUSY => {
                    tokio::time::sleep(self.move_poll).await;
                }
                other => {
                    return Err(DrrpError::Actuator(format!(
                        "device {} reported fault status {other:#04x}",
                        self.address
                    ))
                    .into());
                }
            }
        }

        Err(DrrpError::Actuator(format!(
            "device {} did not report motion finished within {} polls",
            self.address, self.move_max_polls
        ))
        .into())
    }

    fn require_ready(&self) -> Result<()> {
        if self.state != InstrumentState::Ready {
            return Err(DrrpError::Actuator(format!(
                "stage '{}' not ready (state {:?})",
                self.id, self.state
            ))
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl RotationStage for Ell14Stage {
    fn id(&self) -> &str {
        &self.id
    }

    async fn home(&mut self) -> Result<()> {
        self.require_ready()?;

        // "ho0": home clockwise toward the reference mark.
        let response = self.send_command("ho0").await?;
        debug!("ELL14 '{}' homing, first response {response}", self.id);
        self.wait_motion_idle().await?;

        self.last_position_deg = self.read_position_degrees().await?;
        info!(
            "ELL14 '{}' homed, position {:.3} deg",
            self.id, self.last_position_deg
        );
        Ok(())
    }

    async fn move_absolute(&mut self, angle_deg: f64) -> Result<()> {
        self.require_ready()?;

        let counts = Self::counts_from_degrees(angle_deg);
        // The immediate reply to `ma` is either a position echo or a status;
        // either way the status poll below decides when the move is done and
        // surfaces any fault code.
        let _ = self.send_command(&format!("ma{counts:08X}")).await?;
        self.wait_motion_idle().await?;

        self.last_position_deg = self.read_position_degrees().await?;
        debug!(
            "ELL14 '{}' at {:.3} deg (commanded {:.3})",
            self.id, self.last_position_deg, angle_deg
        );
        Ok(())
    }

    async fn move_relative(&mut self, delta_deg: f64) -> Result<()> {
        self.require_ready()?;
        let current = self.read_position_degrees().await?;
        self.move_absolute(current + delta_deg).await
    }

    fn position(&self) -> f64 {
        self.last_position_deg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockAdapter;

    fn stage_with_adapter(adapter: MockAdapter) -> Ell14Stage {
        Ell14Stage::new(
            "test_stage",
            0,
            Box::new(adapter),
            Duration::from_millis(1),
            5,
        )
    }

    #[test]
    fn test_position_conversion() {
        // Full rotation
        let degrees = Ell14Stage::degrees_from_counts(143_360);
        assert!((degrees - 360.0).abs() < 0.01);

        // Half rotation
        let degrees = Ell14Stage::degrees_from_counts(71_680);
        assert!((degrees - 180.0).abs() < 0.01);

        assert_eq!(Ell14Stage::counts_from_degrees(90.0), 35_840);
        // Negative angles normalize into 0..360
        assert_eq!(Ell14Stage::counts_from_degrees(-90.0), 107_520);
    }

    #[tokio::test]
    async fn test_move_blocks_until_idle() {
        let adapter = MockAdapter::new();
        // initialize: info + initial position
        adapter.push_response("0IN0E1140TEST");
        adapter.push_response("0PO00000000");
        // move_absolute(90): ma echo, busy, busy, idle, final position
        adapter.push_response("0GS09");
        adapter.push_response("0GS09");
        adapter.push_response("0GS09");
        adapter.push_response("0GS00");
        adapter.push_response("0PO00008C00");

        let handle = adapter.clone();
        let mut stage = stage_with_adapter(adapter);
        stage.initialize().await.unwrap();
        stage.move_absolute(90.0).await.unwrap();

        assert!((stage.position() - 90.0).abs() < 0.01);
        let sent = handle.sent_commands();
        assert_eq!(sent[0], "0in");
        assert_eq!(sent[2], "0ma00008C00");
        // Two busy polls before the idle one
        assert_eq!(sent[3..6], ["0gs", "0gs", "0gs"]);
    }

    #[tokio::test]
    async fn test_move_poll_bound_is_finite() {
        let adapter = MockAdapter::new();
        adapter.push_response("0IN0E1140TEST");
        adapter.push_response("0PO00000000");
        // Move never reports idle.
        adapter.push_response("0GS09");
        for _ in 0..5 {
            adapter.push_response("0GS09");
        }

        let mut stage = stage_with_adapter(adapter);
        stage.initialize().await.unwrap();
        let err = stage.move_absolute(10.0).await.unwrap_err();
        assert!(err.to_string().contains("Actuator error"));
    }

    #[tokio::test]
    async fn test_fault_status_is_error() {
        let adapter = MockAdapter::new();
        adapter.push_response("0IN0E1140TEST");
        adapter.push_response("0PO00000000");
        adapter.push_response("0GS09");
        adapter.push_response("0GS02"); // mechanical timeout

        let mut stage = stage_with_adapter(adapter);
        stage.initialize().await.unwrap();
        let err = stage.move_absolute(10.0).await.unwrap_err();
        assert!(err.to_string().contains("fault status"));
    }

    #[tokio::test]
    async fn test_address_mismatch_is_error() {
        let adapter = MockAdapter::new();
        adapter.push_response("1IN0E1140TEST"); // wrong address echo

        let mut stage = stage_with_adapter(adapter);
        assert!(stage.initialize().await.is_err());
    }
}
