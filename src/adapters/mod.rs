//! Hardware adapter implementations.
//!
//! This module contains implementations of the [`HardwareAdapter`] trait,
//! providing low-level I/O abstraction between the instrument drivers and
//! their physical transport. Drivers speak their device protocol through an
//! adapter; swapping the adapter for [`MockAdapter`] makes a driver fully
//! testable off-hardware.

pub mod mock;
pub mod serial;

pub use mock::MockAdapter;
pub use serial::SerialAdapter;

use anyhow::Result;
use async_trait::async_trait;

/// Low-level command transport for an instrument.
///
/// One adapter instance is exclusively owned by one driver. `send` fires a
/// command without expecting a reply; `query` writes a command and reads one
/// delimited response line.
#[async_trait]
pub trait HardwareAdapter: Send + Sync {
    /// Transport name for diagnostics.
    fn name(&self) -> &str;

    /// Open the transport.
    async fn connect(&mut self) -> Result<()>;

    /// Close the transport. Safe to call when already closed.
    async fn disconnect(&mut self) -> Result<()>;

    /// Write a command without reading a response.
    async fn send(&mut self, command: &str) -> Result<()>;

    /// Write a command and read one delimited response line.
    async fn query(&mut self, command: &str) -> Result<String>;
}
