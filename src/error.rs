//! Custom error types for the application.
//!
//! This module defines the primary error type, `DrrpError`, for the entire
//! application. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the fault classes of a sweep run, from I/O and
//! configuration issues to instrument-specific problems.
//!
//! ## Error Hierarchy
//!
//! `DrrpError` is an enum that consolidates various error sources:
//!
//! - **`Config`**: Wraps errors from the `config` crate, typically related to file
//!   parsing or format issues in the configuration files.
//! - **`Configuration`**: Represents semantic errors in the configuration, such as
//!   values that parse correctly but are logically invalid (a zero angular
//!   increment, a sensor setpoint outside the supported cooling range). These are
//!   caught during the validation step.
//! - **`Io`**: Wraps standard `std::io::Error`, covering all file I/O issues.
//! - **`Actuator`**: A rotation stage failed to respond, rejected a command, or did
//!   not report motion-finished within the driver's bounded wait.
//! - **`Camera`**: The camera rejected an arm/start/configuration request.
//! - **`FrameIndex`**: A frame was requested outside the captured burst range.
//! - **`PollTimeout`**: The burst-completion poll exhausted its bounded attempt
//!   budget without observing a finished burst.
//! - **`FeatureNotEnabled`**: The code attempted to use functionality (a storage
//!   backend or the serial transport) that was not included at compile time via
//!   feature flags. This provides a clear message on how to enable it.
//!
//! By using `#[from]`, `DrrpError` can be seamlessly created from underlying error
//! types, simplifying error handling throughout the application with the `?`
//! operator.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DrrpError>;

/// The application error type covering every fault class of a sweep run.
#[derive(Error, Debug)]
pub enum DrrpError {
    /// Configuration file parsing failure.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Semantically invalid configuration value.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File or device I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stage communication or motion failure.
    #[error("Actuator error: {0}")]
    Actuator(String),

    /// Camera arm/start/configuration failure.
    #[error("Camera error: {0}")]
    Camera(String),

    /// Frame retrieval outside the captured range.
    #[error("Frame index {index} out of range for a burst of {count} frames")]
    FrameIndex {
        /// The requested frame index.
        index: usize,
        /// The number of frames the burst was armed for.
        count: usize,
    },

    /// The burst-completion poll exhausted its bounded attempt budget.
    #[error("Burst completion poll gave up after {attempts} attempts")]
    PollTimeout {
        /// How many completion polls were issued before giving up.
        attempts: u32,
    },

    /// Frame assembly or conversion failure.
    #[error("Data processing error: {0}")]
    Processing(String),

    /// Serial operation attempted on a closed port.
    #[error("Serial port not connected")]
    SerialPortNotConnected,

    /// Compile-time feature required for the requested operation is missing.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DrrpError::Actuator("stage 1 not responding".to_string());
        assert_eq!(err.to_string(), "Actuator error: stage 1 not responding");
    }

    #[test]
    fn test_frame_index_display() {
        let err = DrrpError::FrameIndex { index: 4, count: 4 };
        assert_eq!(
            err.to_string(),
            "Frame index 4 out of range for a burst of 4 frames"
        );
    }

    #[test]
    fn test_poll_timeout_display() {
        let err = DrrpError::PollTimeout { attempts: 10 };
        assert!(err.to_string().contains("after 10 attempts"));
    }
}
