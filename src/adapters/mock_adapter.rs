//! Mock line adapter for testing
//!
//! This adapter stands in for a real instrument connection. It provides:
//! - Scripted replies per command, one-shot or persistent
//! - Controllable failure injection (connect, individual commands)
//! - Commands that never answer, for timeout handling
//! - Call logging for test verification

use crate::adapters::{AdapterError, LineAdapter};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// What the mock does when a command arrives.
#[derive(Debug, Clone, PartialEq)]
pub enum MockReply {
    /// Answer with this text (ignored for writes).
    Text(String),
    /// Fail the command at the transport level.
    Fail,
    /// Never complete.
    Hang,
}

#[derive(Default)]
struct MockState {
    connected: bool,
    fail_connect: bool,
    latency: Duration,
    queued: HashMap<String, VecDeque<MockReply>>,
    persistent: HashMap<String, MockReply>,
    call_log: Vec<String>,
}

/// Scripted [`LineAdapter`]. Clones share state.
///
/// # Example
///
/// ```
/// use psu_stopper::adapters::MockAdapter;
///
/// let adapter = MockAdapter::new().with_reply("*IDN?", "RIGOL TECHNOLOGIES,DP832");
/// assert!(adapter.call_log().is_empty());
/// ```
#[derive(Clone, Default)]
pub struct MockAdapter {
    state: Arc<Mutex<MockState>>,
}

impl MockAdapter {
    /// Create a disconnected mock with no scripted replies
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the log from the others.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Answer `command` with `reply` every time
    pub fn with_reply(self, command: &str, reply: &str) -> Self {
        self.set_reply(command, MockReply::Text(reply.to_string()));
        self
    }

    /// Replace the persistent behaviour for `command`
    pub fn set_reply(&self, command: &str, reply: MockReply) {
        self.lock().persistent.insert(command.to_string(), reply);
    }

    /// Queue a one-shot behaviour, used before the persistent one
    pub fn push_reply(&self, command: &str, reply: MockReply) {
        self.lock()
            .queued
            .entry(command.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Make the next `connect` calls fail
    pub fn set_fail_connect(&self, fail: bool) {
        self.lock().fail_connect = fail;
    }

    /// Delay every operation by `latency`
    pub fn with_latency(self, latency: Duration) -> Self {
        self.lock().latency = latency;
        self
    }

    /// Get the call log
    pub fn call_log(&self) -> Vec<String> {
        self.lock().call_log.clone()
    }

    /// Number of logged calls equal to `entry` (e.g. "write :OUTP CH1,OFF")
    pub fn count(&self, entry: &str) -> usize {
        self.lock().call_log.iter().filter(|c| *c == entry).count()
    }

    /// Clear the call log
    pub fn clear_log(&self) {
        self.lock().call_log.clear();
    }

    fn next_reply(&self, command: &str) -> Option<MockReply> {
        let mut state = self.lock();
        if let Some(reply) = state.queued.get_mut(command).and_then(VecDeque::pop_front) {
            return Some(reply);
        }
        state.persistent.get(command).cloned()
    }

    async fn simulate_latency(&self) {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    async fn dispatch(&self, kind: &str, command: &str) -> Result<Option<String>, AdapterError> {
        self.simulate_latency().await;
        {
            let mut state = self.lock();
            state.call_log.push(format!("{} {}", kind, command));
            if !state.connected {
                return Err(AdapterError::NotConnected);
            }
        }
        match self.next_reply(command) {
            Some(MockReply::Text(text)) => Ok(Some(text)),
            Some(MockReply::Fail) => Err(AdapterError::QueryFailed(format!(
                "Injected failure for '{}'",
                command
            ))),
            Some(MockReply::Hang) => {
                futures::future::pending::<()>().await;
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl LineAdapter for MockAdapter {
    fn info(&self) -> String {
        "MockAdapter".to_string()
    }

    async fn connect(&mut self) -> Result<(), AdapterError> {
        self.simulate_latency().await;
        let mut state = self.lock();
        state.call_log.push("connect".to_string());
        if state.fail_connect {
            return Err(AdapterError::ConnectionFailed("Injected failure".to_string()));
        }
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), AdapterError> {
        let mut state = self.lock();
        state.call_log.push("disconnect".to_string());
        state.connected = false;
        Ok(())
    }

    async fn write(&mut self, command: &str) -> Result<(), AdapterError> {
        self.dispatch("write", command)
            .await
            .map(|_| ())
            .map_err(|e| match e {
                AdapterError::QueryFailed(m) => AdapterError::SendFailed(m),
                other => other,
            })
    }

    async fn query(&mut self, command: &str) -> Result<String, AdapterError> {
        self.dispatch("query", command).await?.ok_or_else(|| {
            AdapterError::QueryFailed(format!("No scripted reply for '{}'", command))
        })
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_replies() {
        let mut adapter = MockAdapter::new().with_reply(":MEAS:VOLT? CH1", "4.000");
        adapter.push_reply(":MEAS:VOLT? CH1", MockReply::Text("3.999".into()));

        adapter.connect().await.unwrap();
        assert_eq!(adapter.query(":MEAS:VOLT? CH1").await.unwrap(), "3.999");
        assert_eq!(adapter.query(":MEAS:VOLT? CH1").await.unwrap(), "4.000");
        assert!(adapter.query(":MEAS:CURR? CH1").await.is_err());
    }

    #[tokio::test]
    async fn test_requires_connection() {
        let mut adapter = MockAdapter::new();
        assert!(matches!(
            adapter.write(":OUTP CH1,ON").await,
            Err(AdapterError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_failure_injection_and_log() {
        let mut adapter = MockAdapter::new();
        adapter.set_fail_connect(true);
        assert!(adapter.connect().await.is_err());
        adapter.set_fail_connect(false);
        adapter.connect().await.unwrap();

        adapter.push_reply(":OUTP CH1,ON", MockReply::Fail);
        assert!(matches!(
            adapter.write(":OUTP CH1,ON").await,
            Err(AdapterError::SendFailed(_))
        ));
        adapter.write(":OUTP CH1,ON").await.unwrap();
        adapter.disconnect().await.unwrap();

        assert_eq!(adapter.count("write :OUTP CH1,ON"), 2);
        assert_eq!(adapter.count("connect"), 2);
        assert_eq!(adapter.count("disconnect"), 1);
        assert!(!adapter.is_connected());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let mut a = MockAdapter::new();
        let b = a.clone();
        a.connect().await.unwrap();
        assert!(b.is_connected());
        assert_eq!(b.call_log(), vec!["connect".to_string()]);
    }
}
