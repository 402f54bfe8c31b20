//! VISA adapter for GPIB/USB/Ethernet supplies
//!
//! Supports resource strings like:
//! - "GPIB0::1::INSTR" (GPIB interface)
//! - "USB0::0x1AB1::0x0E11::DP8A123456::INSTR" (USB-TMC)
//! - "TCPIP0::192.168.1.100::INSTR" (Ethernet/LXI)

use crate::adapters::{AdapterError, LineAdapter};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[cfg(feature = "instrument_visa")]
use log::debug;
#[cfg(feature = "instrument_visa")]
use visa_rs::prelude::*;

/// An open VISA session. The resource manager must outlive the instrument.
#[cfg(feature = "instrument_visa")]
struct VisaSession {
    instrument: Instrument,
    _rm: DefaultRM,
}

#[cfg(feature = "instrument_visa")]
type SessionSlot = Arc<Mutex<Option<VisaSession>>>;
#[cfg(not(feature = "instrument_visa"))]
type SessionSlot = Arc<Mutex<Option<()>>>;

/// VISA adapter for instrument communication
///
/// Blocking visa-rs calls run on Tokio's blocking pool. Clones share the
/// session.
#[derive(Clone)]
pub struct VisaAdapter {
    /// VISA resource string (e.g., "GPIB0::1::INSTR")
    pub(crate) resource_string: String,

    /// Open timeout
    pub(crate) timeout: Duration,

    /// Line terminator for commands (typically "\n" for SCPI)
    pub(crate) line_terminator: String,

    session: SessionSlot,
}

impl VisaAdapter {
    /// Create a new VISA adapter with default settings
    pub fn new(resource_string: String) -> Self {
        Self {
            resource_string,
            timeout: Duration::from_secs(5),
            line_terminator: "\n".to_string(),
            session: Arc::new(Mutex::new(None)),
        }
    }

    /// Set the open timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set line terminator for commands
    pub fn with_line_terminator(mut self, terminator: String) -> Self {
        self.line_terminator = terminator;
        self
    }

    #[cfg(feature = "instrument_visa")]
    async fn transact(&self, command: &str, expect_reply: bool) -> Result<String, AdapterError> {
        let command_str = format!("{}{}", command, self.line_terminator);
        let command_for_log = command.to_string();
        let session = self.session.clone();

        tokio::task::spawn_blocking(move || -> Result<String, AdapterError> {
            use std::io::{BufRead, BufReader, Write};

            let mut guard = session.blocking_lock();
            let session = guard.as_mut().ok_or(AdapterError::NotConnected)?;

            session
                .instrument
                .write_all(command_str.as_bytes())
                .map_err(|e| AdapterError::SendFailed(format!("{}: {}", command_for_log, e)))?;

            if !expect_reply {
                debug!("VISA write sent: {}", command_for_log);
                return Ok(String::new());
            }

            let mut response = String::new();
            BufReader::new(&session.instrument)
                .read_line(&mut response)
                .map_err(|e| AdapterError::QueryFailed(format!("{}: {}", command_for_log, e)))?;

            let response = response.trim().to_string();
            debug!("VISA query '{}' -> '{}'", command_for_log, response);
            Ok(response)
        })
        .await
        .map_err(|e| AdapterError::QueryFailed(format!("VISA I/O task panicked: {}", e)))?
    }

    #[cfg(not(feature = "instrument_visa"))]
    async fn transact(&self, _command: &str, _expect_reply: bool) -> Result<String, AdapterError> {
        Err(AdapterError::FeatureNotEnabled("instrument_visa".to_string()))
    }
}

#[async_trait]
impl LineAdapter for VisaAdapter {
    fn info(&self) -> String {
        format!(
            "VisaAdapter({} @ {}ms timeout)",
            self.resource_string,
            self.timeout.as_millis()
        )
    }

    async fn connect(&mut self) -> Result<(), AdapterError> {
        #[cfg(feature = "instrument_visa")]
        {
            use std::ffi::CString;

            let resource = CString::new(self.resource_string.clone())
                .map_err(|e| AdapterError::InvalidConfig(e.to_string()))?;
            let timeout = self.timeout;
            let resource_for_log = self.resource_string.clone();

            let session = tokio::task::spawn_blocking(move || {
                let rm = DefaultRM::new().map_err(|e| {
                    AdapterError::ConnectionFailed(format!(
                        "Failed to create VISA resource manager: {}",
                        e
                    ))
                })?;
                let instrument = rm
                    .open(&resource.into(), AccessMode::NO_LOCK, timeout)
                    .map_err(|e| {
                        AdapterError::ConnectionFailed(format!(
                            "Failed to open VISA resource {}: {}",
                            resource_for_log, e
                        ))
                    })?;
                Ok::<_, AdapterError>(VisaSession {
                    instrument,
                    _rm: rm,
                })
            })
            .await
            .map_err(|e| AdapterError::ConnectionFailed(format!("VISA open task panicked: {}", e)))??;

            *self.session.lock().await = Some(session);
            debug!(
                "VISA resource '{}' opened with {}ms timeout",
                self.resource_string,
                self.timeout.as_millis()
            );
            Ok(())
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            Err(AdapterError::FeatureNotEnabled("instrument_visa".to_string()))
        }
    }

    async fn disconnect(&mut self) -> Result<(), AdapterError> {
        if self.session.lock().await.take().is_some() {
            log::debug!("VISA resource '{}' closed", self.resource_string);
        }
        Ok(())
    }

    async fn write(&mut self, command: &str) -> Result<(), AdapterError> {
        self.transact(command, false).await.map(|_| ())
    }

    async fn query(&mut self, command: &str) -> Result<String, AdapterError> {
        self.transact(command, true).await
    }

    fn is_connected(&self) -> bool {
        self.session.try_lock().map(|s| s.is_some()).unwrap_or(true)
    }
}
