//! Custom error types for the application.
//!
//! Each layer of the acquisition pipeline has its own error type, built with
//! `thiserror`, so that callers can decide per layer whether a failure is fatal:
//!
//! - **`AdapterError`**: raised by line transports (serial, VISA, mock) when a
//!   port cannot be opened, a write fails or a reply does not arrive in time.
//! - **`ConnectError`**: fatal to a start attempt. No samples are produced and
//!   nothing is exported.
//! - **`ConfigError`**: the instrument rejected its setup. Fatal to the run and
//!   always followed by switching the output off.
//! - **`ReadError`**: `Parse` is recoverable (the tick is skipped), `Protocol`
//!   aborts the run.
//! - **`ExportError`**: per format; other formats are still attempted.
//! - **`StartError`** / **`StopError`**: controller-level rejections.
//! - **`SettingsError`**: persisted configuration could not be validated or saved.
//!
//! Instrument and export errors never cross the worker boundary as errors. They
//! are turned into status messages for the operator instead.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a line-oriented instrument transport.
#[derive(Error, Debug)]
pub enum AdapterError {
    /// An I/O call came before `connect` or after `disconnect`.
    #[error("Adapter is not connected")]
    NotConnected,

    /// The transport could not be opened.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// No reply within the I/O timeout.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Writing a command failed.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Writing a query or reading its reply failed.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Bad port, baud rate or resource string.
    #[error("Invalid adapter configuration: {0}")]
    InvalidConfig(String),

    /// The transport was compiled out.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

/// Failure to bring an instrument online.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The transport refused to open.
    #[error("Instrument unavailable: {0}")]
    Unavailable(String),

    /// The connect sequence exceeded its timeout.
    #[error("Instrument did not answer within {0:?}")]
    Timeout(Duration),

    /// The instrument answered, but not as expected.
    #[error("Instrument protocol error: {0}")]
    Protocol(String),
}

impl From<AdapterError> for ConnectError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Timeout(d) => ConnectError::Timeout(d),
            AdapterError::SendFailed(m) | AdapterError::QueryFailed(m) => ConnectError::Protocol(m),
            other => ConnectError::Unavailable(other.to_string()),
        }
    }
}

/// The instrument could not be armed for a run.
#[derive(Error, Debug)]
#[error("Instrument setup failed during '{step}': {source}")]
pub struct ConfigError {
    /// The setup step that failed (e.g. "apply", "ovp").
    pub step: &'static str,
    /// Transport error behind it.
    #[source]
    pub source: AdapterError,
}

/// Failure to take one sample.
#[derive(Error, Debug)]
pub enum ReadError {
    /// The reply arrived but was not a number. The run continues.
    #[error("Could not parse {quantity} reply '{reply}'")]
    Parse { quantity: &'static str, reply: String },

    /// The transport failed. The run must stop.
    #[error("Measurement query failed: {0}")]
    Protocol(#[from] AdapterError),
}

impl ReadError {
    /// Returns true if the acquisition loop may skip this tick and carry on.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ReadError::Parse { .. })
    }
}

/// Failure to write one export format.
#[derive(Error, Debug)]
pub enum ExportError {
    /// The file could not be created or written.
    #[error("I/O error writing {path:?}: {source}")]
    Io {
        /// Target file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The format's encoder rejected the data.
    #[error("Failed to encode {format}: {message}")]
    Encode {
        /// Format label, e.g. `"CSV"`.
        format: &'static str,
        /// Encoder message.
        message: String,
    },

    /// The format's feature was compiled out.
    #[error("{0} export is not available in this build")]
    FormatUnavailable(&'static str),

    /// No usable output directory.
    #[error("Export location unavailable: {0}")]
    Location(String),
}

/// A start request was refused.
#[derive(Error, Debug)]
pub enum StartError {
    /// Only one run may be active.
    #[error("A run is already active; stop it before starting a new one")]
    AlreadyRunning,

    /// The controller no longer accepts runs.
    #[error("Controller is shutting down")]
    ShuttingDown,

    /// The resource string was rejected.
    #[error("Cannot open instrument: {0}")]
    Instrument(#[from] ConnectError),
}

/// A stop request could not be honoured.
#[derive(Error, Debug)]
pub enum StopError {
    /// Nothing to stop.
    #[error("No run is active")]
    NotRunning,

    /// The actor has exited.
    #[error("Controller is no longer running")]
    ControllerUnavailable,
}

/// Persisted settings could not be validated, loaded or saved.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// A field is out of range.
    #[error("Invalid {field}: {message}")]
    Validation {
        /// Settings key.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },

    /// The file or environment could not be parsed.
    #[error("Configuration load error: {0}")]
    Load(#[from] figment::Error),

    /// Reading or writing the file failed.
    #[error("I/O error on {path:?}: {source}")]
    Io {
        /// Settings or presets file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// TOML encoding failed.
    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Preset names must contain a non-space character.
    #[error("Preset name cannot be empty")]
    EmptyPresetName,

    /// Lookup by a name that is not stored.
    #[error("No preset named '{0}'")]
    UnknownPreset(String),
}

impl SettingsError {
    pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        SettingsError::Validation {
            field,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConnectError::Unavailable("port busy".to_string());
        assert_eq!(err.to_string(), "Instrument unavailable: port busy");
    }

    #[test]
    fn test_adapter_timeout_maps_to_connect_timeout() {
        let err: ConnectError = AdapterError::Timeout(Duration::from_secs(5)).into();
        assert!(matches!(err, ConnectError::Timeout(d) if d == Duration::from_secs(5)));

        let err: ConnectError = AdapterError::ConnectionFailed("no such port".into()).into();
        assert!(matches!(err, ConnectError::Unavailable(_)));
    }

    #[test]
    fn test_read_error_recoverability() {
        let parse = ReadError::Parse {
            quantity: "voltage",
            reply: "garbage".into(),
        };
        assert!(parse.is_recoverable());

        let protocol = ReadError::Protocol(AdapterError::NotConnected);
        assert!(!protocol.is_recoverable());
    }
}
