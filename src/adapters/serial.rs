//! Serial adapter for RS-232/RS-485 communication.

use crate::adapters::HardwareAdapter;
use crate::error::DrrpError;
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_serial")]
use anyhow::{anyhow, Context};
#[cfg(feature = "instrument_serial")]
use std::sync::Arc;
#[cfg(feature = "instrument_serial")]
use tokio::sync::Mutex;
#[cfg(feature = "instrument_serial")]
use tracing::debug;

/// Serial adapter wrapping the `serialport` crate.
///
/// Serial I/O is synchronous; reads and writes run on Tokio's blocking
/// executor so driver code can stay async. The struct compiles with or
/// without the `instrument_serial` feature; without it, `connect` fails with
/// a feature error and no port is ever opened.
pub struct SerialAdapter {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3").
    port_name: String,

    /// Baud rate (e.g., 9600, 115200).
    baud_rate: u32,

    /// Overall read timeout for one response.
    timeout: Duration,

    /// Line terminator appended to outgoing commands.
    line_terminator: String,

    /// Response line ending character.
    response_delimiter: char,

    #[cfg(feature = "instrument_serial")]
    port: Option<Arc<Mutex<Box<dyn serialport::SerialPort>>>>,
}

impl SerialAdapter {
    /// Create a new serial adapter with default framing (`\r` both ways).
    pub fn new(port_name: String, baud_rate: u32) -> Self {
        Self {
            port_name,
            baud_rate,
            timeout: Duration::from_millis(500),
            line_terminator: "\r".to_string(),
            response_delimiter: '\r',
            #[cfg(feature = "instrument_serial")]
            port: None,
        }
    }

    /// Override the response read timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the outgoing line terminator.
    pub fn with_line_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.line_terminator = terminator.into();
        self
    }

    /// Override the response line delimiter.
    pub fn with_response_delimiter(mut self, delimiter: char) -> Self {
        self.response_delimiter = delimiter;
        self
    }
}

#[async_trait]
impl HardwareAdapter for SerialAdapter {
    fn name(&self) -> &str {
        "serial"
    }

    async fn connect(&mut self) -> Result<()> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = serialport::new(&self.port_name, self.baud_rate)
                // Short internal timeout; the overall bound is enforced below.
                .timeout(Duration::from_millis(100))
                .open()
                .with_context(|| {
                    format!(
                        "Failed to open serial port '{}' at {} baud",
                        self.port_name, self.baud_rate
                    )
                })?;

            self.port = Some(Arc::new(Mutex::new(port)));
            debug!(
                "Serial port '{}' opened at {} baud",
                self.port_name, self.baud_rate
            );
            Ok(())
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(DrrpError::FeatureNotEnabled("instrument_serial".to_string()).into())
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        #[cfg(feature = "instrument_serial")]
        {
            if self.port.take().is_some() {
                debug!("Serial port '{}' closed", self.port_name);
            }
        }
        Ok(())
    }

    async fn send(&mut self, command: &str) -> Result<()> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self
                .port
                .as_ref()
                .ok_or(DrrpError::SerialPortNotConnected)?
                .clone();
            let framed = format!("{}{}", command, self.line_terminator);
            let command_for_log = command.to_string();

            tokio::task::spawn_blocking(move || {
                use std::io::Write;

                let mut guard = port.blocking_lock();
                guard
                    .write_all(framed.as_bytes())
                    .context("Failed to write to serial port")?;
                guard.flush().context("Failed to flush serial port")?;
                debug!("Sent serial command: {}", command_for_log.trim());
                Ok(())
            })
            .await
            .context("Serial I/O task panicked")?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = command;
            Err(DrrpError::FeatureNotEnabled("instrument_serial".to_string()).into())
        }
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self
                .port
                .as_ref()
                .ok_or(DrrpError::SerialPortNotConnected)?
                .clone();
            let framed = format!("{}{}", command, self.line_terminator);
            let command_for_log = command.to_string();
            let delimiter = self.response_delimiter;
            let timeout = self.timeout;

            tokio::task::spawn_blocking(move || -> Result<String> {
                use std::io::{Read, Write};

                let mut guard = port.blocking_lock();
                guard
                    .write_all(framed.as_bytes())
                    .context("Failed to write to serial port")?;
                guard.flush().context("Failed to flush serial port")?;
                debug!("Sent serial command: {}", command_for_log.trim());

                // Read byte-by-byte until the delimiter or the overall bound.
                let mut response = String::new();
                let mut buffer = [0u8; 1];
                let start = std::time::Instant::now();

                loop {
                    if start.elapsed() > timeout {
                        return Err(anyhow!("Serial read timeout after {:?}", timeout));
                    }

                    match guard.read(&mut buffer) {
                        Ok(1) => {
                            let ch = buffer[0] as char;
                            if ch == delimiter {
                                break;
                            }
                            response.push(ch);
                        }
                        Ok(_) => {
                            return Err(anyhow!("Unexpected EOF from serial port"));
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                            // Port timeout is shorter than the overall bound.
                            continue;
                        }
                        Err(e) => {
                            return Err(anyhow!("Serial read error: {}", e));
                        }
                    }
                }

                let response = response.trim().to_string();
                debug!("Received serial response: {}", response);
                Ok(response)
            })
            .await
            .context("Serial I/O task panicked")?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = command;
            Err(DrrpError::FeatureNotEnabled("instrument_serial".to_string()).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_adapter_creation() {
        let adapter = SerialAdapter::new("/dev/ttyUSB0".to_string(), 9600);
        assert_eq!(adapter.name(), "serial");
        assert_eq!(adapter.port_name, "/dev/ttyUSB0");
        assert_eq!(adapter.baud_rate, 9600);
    }

    #[test]
    fn test_builder_overrides() {
        let adapter = SerialAdapter::new("COM3".to_string(), 115_200)
            .with_timeout(Duration::from_secs(2))
            .with_line_terminator("\r\n")
            .with_response_delimiter('\n');
        assert_eq!(adapter.timeout, Duration::from_secs(2));
        assert_eq!(adapter.line_terminator, "\r\n");
        assert_eq!(adapter.response_delimiter, '\n');
    }

    #[tokio::test]
    #[cfg(not(feature = "instrument_serial"))]
    async fn test_disabled_feature_errors() {
        let mut adapter = SerialAdapter::new("/dev/null".to_string(), 9600);
        let err = adapter.connect().await.unwrap_err();
        assert!(err.to_string().contains("instrument_serial"));
    }
}
