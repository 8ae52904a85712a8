//! Instrument drivers.
//!
//! Each driver implements the capability traits from [`crate::core`] over a
//! [`crate::adapters::HardwareAdapter`]; the mocks implement the same traits
//! in memory for tests and `--mock` runs.

pub mod cred2;
pub mod ell14;
pub mod mock;

pub use cred2::{ConversionGain, Cred2Camera, FrameGrabberLink};
pub use ell14::Ell14Stage;
pub use mock::{MockBurstCamera, MockStage, SimulatedGrabber};
