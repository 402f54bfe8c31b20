//! Power-supply drivers.
//!
//! [`PowerSupply`] is the single seam between the acquisition loop and the
//! hardware. Two implementations exist:
//!
//! - [`ScpiSupply`]: SCPI over any [`crate::adapters::LineAdapter`]
//! - [`SimulatedSupply`]: a decaying-current model for dry runs and tests
//!
//! [`open_supply`] picks one from a run's [`InstrumentSelection`].

pub mod scpi_supply;
pub mod simulated;

pub use scpi_supply::{CommandSet, ScpiSupply};
pub use simulated::{FixedNoise, NoiseSource, SimulatedSupply, UniformNoise};

use crate::adapters::{SerialAdapter, VisaAdapter};
use crate::core::{InstrumentSelection, RunConfig, Sample};
use crate::error::{ConfigError, ConnectError, ReadError};
use async_trait::async_trait;
use std::time::Duration;

/// A programmable DC supply with a single monitored output.
#[async_trait]
pub trait PowerSupply: Send {
    /// Identifies the instrument in logs and status messages.
    fn name(&self) -> String;

    /// Open the connection and return the identity string.
    async fn connect(&mut self) -> Result<String, ConnectError>;

    /// Program protection, setpoints and enable the output.
    async fn configure(&mut self, config: &RunConfig) -> Result<(), ConfigError>;

    /// Take one voltage/current measurement.
    async fn read_sample(&mut self, elapsed_seconds: f64) -> Result<Sample, ReadError>;

    /// Switch the output off. Never fails; returns whether the command went through.
    async fn force_off(&mut self) -> bool;

    /// Release the connection. Safe to call more than once.
    async fn disconnect(&mut self);

    /// A second handle on the same connection, used to de-energize the output
    /// when the primary handle is stuck inside an abandoned worker.
    fn safety_handle(&self) -> Box<dyn PowerSupply>;
}

/// Where an instrument resource string points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    /// The in-process simulated supply.
    Simulated,
    /// A serial port, with any `ASRL` prefix stripped.
    Serial {
        /// Port path as the OS names it.
        port: String,
    },
    /// Passed to the VISA resource manager unchanged.
    Visa(String),
}

impl Resource {
    /// Classify a resource string.
    ///
    /// `simulate` selects the simulated supply. `ASRL<port>::INSTR`, `/dev/...`
    /// and `COMn` are opened as serial ports. Any other VISA-style string
    /// (containing `::`) goes to the VISA adapter.
    pub fn parse(resource: &str) -> Result<Self, ConnectError> {
        let resource = resource.trim();
        if resource.is_empty() {
            return Err(ConnectError::Unavailable(
                "no instrument resource configured".to_string(),
            ));
        }
        if resource.eq_ignore_ascii_case("simulate") {
            return Ok(Resource::Simulated);
        }

        let upper = resource.to_ascii_uppercase();
        if upper.starts_with("ASRL") && upper.ends_with("::INSTR") {
            let inner = &resource[4..resource.len() - "::INSTR".len()];
            return Ok(Resource::Serial {
                port: asrl_port_name(inner),
            });
        }
        if resource.starts_with("/dev/") || is_com_port(&upper) {
            return Ok(Resource::Serial {
                port: resource.to_string(),
            });
        }
        if resource.contains("::") {
            return Ok(Resource::Visa(resource.to_string()));
        }
        Err(ConnectError::Unavailable(format!(
            "unrecognised instrument resource '{}'",
            resource
        )))
    }
}

fn is_com_port(upper: &str) -> bool {
    upper
        .strip_prefix("COM")
        .map(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false)
}

/// VISA numbers serial ports from 1.
fn asrl_port_name(inner: &str) -> String {
    match inner.parse::<u32>() {
        #[cfg(windows)]
        Ok(n) => format!("COM{}", n),
        #[cfg(not(windows))]
        Ok(n) => format!("/dev/ttyS{}", n.saturating_sub(1)),
        Err(_) => inner.to_string(),
    }
}

/// Build the supply a run will talk to. Nothing is opened yet.
///
/// Adapters of either transport get the I/O timeout; the whole connect
/// sequence is bounded separately by the connect timeout.
pub fn open_supply(config: &RunConfig) -> Result<Box<dyn PowerSupply>, ConnectError> {
    let resource = match &config.instrument {
        InstrumentSelection::Simulated => Resource::Simulated,
        InstrumentSelection::Resource(r) => Resource::parse(r)?,
    };
    let io_timeout = Duration::from_millis(config.timeouts.io_timeout_ms);

    Ok(match resource {
        Resource::Simulated => Box::new(SimulatedSupply::new(config.simulation)),
        Resource::Serial { port } => Box::new(ScpiSupply::new(
            SerialAdapter::new(port, config.baud_rate).with_timeout(io_timeout),
            CommandSet::rigol_dp800(),
            &config.timeouts,
        )),
        Resource::Visa(resource) => Box::new(ScpiSupply::new(
            VisaAdapter::new(resource).with_timeout(io_timeout),
            CommandSet::rigol_dp800(),
            &config.timeouts,
        )),
    })
}
