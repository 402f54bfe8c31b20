//! Line-oriented instrument transports
//!
//! An adapter moves newline-terminated text commands to an instrument and reads
//! single-line replies back. Instrument drivers build on [`LineAdapter`] so the
//! same SCPI logic runs over serial, VISA or a scripted mock.
//!
//! Adapters are cheap to clone. Clones share one underlying connection, so a
//! second handle can still switch the output off if the first one is stuck.

pub mod mock_adapter;
pub mod serial_adapter;
pub mod visa_adapter;

pub use crate::error::AdapterError;
pub use mock_adapter::MockAdapter;
pub use serial_adapter::SerialAdapter;
pub use visa_adapter::VisaAdapter;

use async_trait::async_trait;

/// Query/response transport for text-based instruments.
#[async_trait]
pub trait LineAdapter: Send + Sync {
    /// Human-readable description of the connection.
    fn info(&self) -> String;

    /// Open the connection.
    async fn connect(&mut self) -> Result<(), AdapterError>;

    /// Close the connection. Closing a closed adapter is a no-op.
    async fn disconnect(&mut self) -> Result<(), AdapterError>;

    /// Send a command that produces no reply.
    async fn write(&mut self, command: &str) -> Result<(), AdapterError>;

    /// Send a command and return its trimmed single-line reply.
    async fn query(&mut self, command: &str) -> Result<String, AdapterError>;

    fn is_connected(&self) -> bool;
}
