//! Serial transport for supplies on RS-232 or USB-CDC ports.

use crate::adapters::{AdapterError, LineAdapter};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[cfg(feature = "instrument_serial")]
use log::debug;
#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;

#[cfg(feature = "instrument_serial")]
type PortSlot = Arc<Mutex<Option<Box<dyn SerialPort>>>>;
#[cfg(not(feature = "instrument_serial"))]
type PortSlot = Arc<Mutex<Option<()>>>;

/// Serial adapter for RS-232 / USB-CDC supplies
///
/// This adapter wraps the serialport crate and provides async I/O
/// using Tokio's blocking task executor for synchronous serial operations.
#[derive(Clone)]
pub struct SerialAdapter {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    port_name: String,

    /// Baud rate (e.g., 9600, 115200)
    baud_rate: u32,

    /// Overall reply timeout
    timeout: Duration,

    /// Line terminator for commands (e.g., "\n")
    line_terminator: String,

    /// Response line ending character
    response_delimiter: char,

    /// The open port, shared between clones
    port: PortSlot,
}

impl SerialAdapter {
    /// Create a new serial adapter
    ///
    /// # Arguments
    /// * `port_name` - Serial port path (e.g., "/dev/ttyUSB0", "COM3")
    /// * `baud_rate` - Communication speed (e.g., 9600, 115200)
    pub fn new(port_name: String, baud_rate: u32) -> Self {
        Self {
            port_name,
            baud_rate,
            timeout: Duration::from_secs(5),
            line_terminator: "\n".to_string(),
            response_delimiter: '\n',
            port: Arc::new(Mutex::new(None)),
        }
    }

    /// Set the reply timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set line terminator for commands
    pub fn with_line_terminator(mut self, terminator: String) -> Self {
        self.line_terminator = terminator;
        self
    }

    /// Port path, e.g. `/dev/ttyUSB0`.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    #[cfg(feature = "instrument_serial")]
    async fn transact(&self, command: &str, expect_reply: bool) -> Result<String, AdapterError> {
        let command_str = format!("{}{}", command, self.line_terminator);
        let command_for_log = command.to_string();
        let delimiter = self.response_delimiter;
        let timeout = self.timeout;
        let port = self.port.clone();

        // Execute blocking serial I/O on dedicated thread
        tokio::task::spawn_blocking(move || -> Result<String, AdapterError> {
            use std::io::{Read, Write};

            let mut guard = port.blocking_lock();
            let port = guard.as_mut().ok_or(AdapterError::NotConnected)?;

            port.write_all(command_str.as_bytes())
                .and_then(|_| port.flush())
                .map_err(|e| AdapterError::SendFailed(format!("{}: {}", command_for_log, e)))?;
            debug!("Sent serial command: {}", command_for_log);

            if !expect_reply {
                return Ok(String::new());
            }

            // Read response byte-by-byte until delimiter
            let mut response = String::new();
            let mut buffer = [0u8; 1];
            let start = std::time::Instant::now();

            loop {
                if start.elapsed() > timeout {
                    return Err(AdapterError::Timeout(timeout));
                }

                match port.read(&mut buffer) {
                    Ok(1) => {
                        let ch = buffer[0] as char;
                        if ch == delimiter {
                            break;
                        }
                        response.push(ch);
                    }
                    Ok(_) => {
                        return Err(AdapterError::QueryFailed("Unexpected EOF".to_string()));
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                        // Port timeout is shorter than our overall timeout
                        continue;
                    }
                    Err(e) => {
                        return Err(AdapterError::QueryFailed(format!(
                            "{}: {}",
                            command_for_log, e
                        )));
                    }
                }
            }

            let response = response.trim().to_string();
            debug!("Received serial response: {}", response);
            Ok(response)
        })
        .await
        .map_err(|e| AdapterError::QueryFailed(format!("Serial I/O task panicked: {}", e)))?
    }

    #[cfg(not(feature = "instrument_serial"))]
    async fn transact(&self, _command: &str, _expect_reply: bool) -> Result<String, AdapterError> {
        Err(AdapterError::FeatureNotEnabled("instrument_serial".to_string()))
    }
}

#[async_trait]
impl LineAdapter for SerialAdapter {
    fn info(&self) -> String {
        format!("SerialAdapter({} @ {} baud)", self.port_name, self.baud_rate)
    }

    async fn connect(&mut self) -> Result<(), AdapterError> {
        if self.port_name.trim().is_empty() {
            return Err(AdapterError::InvalidConfig("Port name is empty".to_string()));
        }

        #[cfg(feature = "instrument_serial")]
        {
            let port = serialport::new(&self.port_name, self.baud_rate)
                .timeout(Duration::from_millis(100)) // Internal read timeout
                .open()
                .map_err(|e| {
                    AdapterError::ConnectionFailed(format!(
                        "Failed to open serial port '{}' at {} baud: {}",
                        self.port_name, self.baud_rate, e
                    ))
                })?;

            *self.port.lock().await = Some(port);
            debug!(
                "Serial port '{}' opened at {} baud",
                self.port_name, self.baud_rate
            );
            Ok(())
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(AdapterError::FeatureNotEnabled("instrument_serial".to_string()))
        }
    }

    async fn disconnect(&mut self) -> Result<(), AdapterError> {
        if self.port.lock().await.take().is_some() {
            log::debug!("Serial port '{}' closed", self.port_name);
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
        self.port.try_lock().map(|p| p.is_some()).unwrap_or(true)
    }
}
