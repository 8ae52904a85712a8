//! Scripted adapter double for driver tests.

use crate::adapters::HardwareAdapter;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct MockState {
    connected: bool,
    sent: Vec<String>,
    responses: VecDeque<String>,
}

/// In-memory [`HardwareAdapter`] that records every command and replays a
/// scripted queue of responses. Clones share state, so a test can keep a
/// handle for assertions after moving the adapter into a driver.
#[derive(Clone, Default)]
pub struct MockAdapter {
    state: Arc<Mutex<MockState>>,
}

impl MockAdapter {
    /// Create an empty mock adapter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for a future `query`.
    pub fn push_response(&self, response: impl Into<String>) {
        self.lock().responses.push_back(response.into());
    }

    /// Every command sent so far, in order.
    pub fn sent_commands(&self) -> Vec<String> {
        self.lock().sent.clone()
    }

    #[allow(clippy::unwrap_used)]
    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl HardwareAdapter for MockAdapter {
    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(&mut self) -> Result<()> {
        self.lock().connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.lock().connected = false;
        Ok(())
    }

    async fn send(&mut self, command: &str) -> Result<()> {
        let mut state = self.lock();
        if !state.connected {
            return Err(anyhow!("mock adapter not connected"));
        }
        state.sent.push(command.to_string());
        Ok(())
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        let mut state = self.lock();
        if !state.connected {
            return Err(anyhow!("mock adapter not connected"));
        }
        state.sent.push(command.to_string());
        state
            .responses
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted response for '{command}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_adapter_replays_responses() {
        let mut adapter = MockAdapter::new();
        adapter.connect().await.unwrap();
        adapter.push_response("0PO00000000");

        let response = adapter.query("0gp").await.unwrap();
        assert_eq!(response, "0PO00000000");
        assert_eq!(adapter.sent_commands(), vec!["0gp".to_string()]);

        assert!(adapter.query("0gp").await.is_err());
    }

    #[tokio::test]
    async fn test_mock_adapter_requires_connect() {
        let mut adapter = MockAdapter::new();
        assert!(adapter.send("anything").await.is_err());
    }
}
