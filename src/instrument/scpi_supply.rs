//! SCPI power-supply driver over a line adapter.

use crate::adapters::{AdapterError, LineAdapter};
use crate::config::TimeoutSettings;
use crate::core::{OperationMode, RunConfig, Sample};
use crate::error::{ConfigError, ConnectError, ReadError};
use crate::instrument::PowerSupply;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::time::Duration;

/// SCPI command templates. `{v}` and `{i}` are replaced by voltage and current.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSet {
    /// Identification query.
    pub identify: String,
    /// Sets the over-voltage protection level from `{v}`.
    pub set_ovp_level: String,
    /// Enables over-voltage protection.
    pub ovp_on: String,
    /// Disables over-voltage protection.
    pub ovp_off: String,
    /// Sets voltage and current together.
    pub apply: String,
    /// Switches the output on.
    pub output_on: String,
    /// Switches the output off.
    pub output_off: String,
    /// Query returning volts as plain text.
    pub measure_voltage: String,
    /// Query returning amps as plain text.
    pub measure_current: String,
}

impl CommandSet {
    /// Rigol DP800 series, channel 1.
    pub fn rigol_dp800() -> Self {
        Self {
            identify: "*IDN?".into(),
            set_ovp_level: ":VOLT:PROT {v}".into(),
            ovp_on: ":OUTP:OVP ON".into(),
            ovp_off: ":OUTP:OVP OFF".into(),
            apply: ":APPL CH1,{v},{i}".into(),
            output_on: ":OUTP CH1,ON".into(),
            output_off: ":OUTP CH1,OFF".into(),
            measure_voltage: ":MEAS:VOLT? CH1".into(),
            measure_current: ":MEAS:CURR? CH1".into(),
        }
    }
}

fn fill(template: &str, voltage: f64, current: f64) -> String {
    template
        .replace("{v}", &voltage.to_string())
        .replace("{i}", &current.to_string())
}

/// Supply driven by SCPI text commands.
pub struct ScpiSupply<A: LineAdapter + Clone + 'static> {
    adapter: A,
    commands: CommandSet,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl<A: LineAdapter + Clone + 'static> ScpiSupply<A> {
    /// Wrap `adapter`. Nothing is sent until `connect`.
    pub fn new(adapter: A, commands: CommandSet, timeouts: &TimeoutSettings) -> Self {
        Self {
            adapter,
            commands,
            connect_timeout: Duration::from_millis(timeouts.connect_timeout_ms),
            io_timeout: Duration::from_millis(timeouts.io_timeout_ms),
        }
    }

    /// The underlying transport.
    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    async fn send(&mut self, step: &'static str, command: String) -> Result<(), ConfigError> {
        let timeout = self.io_timeout;
        tokio::time::timeout(timeout, self.adapter.write(&command))
            .await
            .unwrap_or(Err(AdapterError::Timeout(timeout)))
            .map_err(|source| ConfigError { step, source })
    }

    async fn measure(&mut self, quantity: &'static str, command: String) -> Result<f64, ReadError> {
        let timeout = self.io_timeout;
        let reply = tokio::time::timeout(timeout, self.adapter.query(&command))
            .await
            .unwrap_or(Err(AdapterError::Timeout(timeout)))?;
        reply.trim().parse::<f64>().map_err(|_| ReadError::Parse { quantity, reply })
    }
}

#[async_trait]
impl<A: LineAdapter + Clone + 'static> PowerSupply for ScpiSupply<A> {
    fn name(&self) -> String {
        self.adapter.info()
    }

    async fn connect(&mut self) -> Result<String, ConnectError> {
        let identify = self.commands.identify.clone();
        let adapter = &mut self.adapter;
        let attempt = async move {
            adapter.connect().await?;
            adapter.query(&identify).await
        };
        let identity = match tokio::time::timeout(self.connect_timeout, attempt).await {
            Ok(reply) => reply?,
            Err(_) => return Err(ConnectError::Timeout(self.connect_timeout)),
        };
        if identity.trim().is_empty() {
            return Err(ConnectError::Protocol(
                "instrument returned an empty identity".to_string(),
            ));
        }
        info!("Connected to {}", identity);
        Ok(identity)
    }

    async fn configure(&mut self, config: &RunConfig) -> Result<(), ConfigError> {
        match config.mode {
            OperationMode::ConstantCurrent => {
                // Threshold doubles as the hardware over-voltage limit.
                let level = fill(&self.commands.set_ovp_level, config.threshold, 0.0);
                self.send("ovp", level).await?;
                let on = self.commands.ovp_on.clone();
                self.send("ovp", on).await?;
            }
            OperationMode::ConstantVoltage => {
                let off = self.commands.ovp_off.clone();
                self.send("ovp", off).await?;
            }
        }
        let apply = fill(
            &self.commands.apply,
            config.target_voltage,
            config.target_current,
        );
        self.send("apply", apply).await?;
        let on = self.commands.output_on.clone();
        self.send("output", on).await?;
        debug!(
            "{} armed: {} V, {} A, mode {}",
            self.name(),
            config.target_voltage,
            config.target_current,
            config.mode
        );
        Ok(())
    }

    async fn read_sample(&mut self, elapsed_seconds: f64) -> Result<Sample, ReadError> {
        let voltage = self
            .measure("voltage", self.commands.measure_voltage.clone())
            .await?;
        let current = self
            .measure("current", self.commands.measure_current.clone())
            .await?;
        Ok(Sample::from_measurement(elapsed_seconds, voltage, current))
    }

    async fn force_off(&mut self) -> bool {
        let command = self.commands.output_off.clone();
        let timeout = self.io_timeout;
        let result = tokio::time::timeout(timeout, self.adapter.write(&command))
            .await
            .unwrap_or(Err(AdapterError::Timeout(timeout)));
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to switch output off on {}: {}", self.name(), e);
                false
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Err(e) = self.adapter.disconnect().await {
            warn!("Error while disconnecting {}: {}", self.name(), e);
        }
    }

    fn safety_handle(&self) -> Box<dyn PowerSupply> {
        Box::new(ScpiSupply {
            adapter: self.adapter.clone(),
            commands: self.commands.clone(),
            connect_timeout: self.connect_timeout,
            io_timeout: self.io_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock_adapter::{MockAdapter, MockReply};

    fn rigol_mock() -> MockAdapter {
        MockAdapter::new()
            .with_reply("*IDN?", "RIGOL TECHNOLOGIES,DP832,DP8A0001,00.01.14")
            .with_reply(":MEAS:VOLT? CH1", "4.0012")
            .with_reply(":MEAS:CURR? CH1", "0.2500")
    }

    fn supply(adapter: &MockAdapter) -> ScpiSupply<MockAdapter> {
        ScpiSupply::new(
            adapter.clone(),
            CommandSet::rigol_dp800(),
            &TimeoutSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_cv_configuration_sequence() {
        let mock = rigol_mock();
        let mut psu = supply(&mock);
        psu.connect().await.unwrap();
        psu.configure(&RunConfig::default()).await.unwrap();

        assert_eq!(
            mock.call_log(),
            vec![
                "connect",
                "query *IDN?",
                "write :OUTP:OVP OFF",
                "write :APPL CH1,4,0.5",
                "write :OUTP CH1,ON",
            ]
        );
    }

    #[tokio::test]
    async fn test_cc_mode_programs_ovp_from_threshold() {
        let mock = rigol_mock();
        let mut psu = supply(&mock);
        psu.connect().await.unwrap();
        let cfg = RunConfig {
            mode: OperationMode::ConstantCurrent,
            threshold: 4.2,
            ..RunConfig::default()
        };
        psu.configure(&cfg).await.unwrap();

        let log = mock.call_log();
        assert_eq!(log[2], "write :VOLT:PROT 4.2");
        assert_eq!(log[3], "write :OUTP:OVP ON");
    }

    #[tokio::test]
    async fn test_empty_identity_is_protocol_error() {
        let mock = MockAdapter::new().with_reply("*IDN?", "  ");
        let mut psu = supply(&mock);
        assert!(matches!(
            psu.connect().await,
            Err(ConnectError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_failure_is_unavailable() {
        let mock = rigol_mock();
        mock.set_fail_connect(true);
        let mut psu = supply(&mock);
        assert!(matches!(
            psu.connect().await,
            Err(ConnectError::Unavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_identity_times_out() {
        let mock = MockAdapter::new();
        mock.set_reply("*IDN?", MockReply::Hang);
        let mut psu = supply(&mock);
        assert!(matches!(psu.connect().await, Err(ConnectError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_read_sample_parses_and_classifies_errors() {
        let mock = rigol_mock();
        let mut psu = supply(&mock);
        psu.connect().await.unwrap();

        let sample = psu.read_sample(2.0).await.unwrap();
        assert_eq!(sample.voltage, 4.0012);
        assert_eq!(sample.current, 0.25);

        mock.push_reply(":MEAS:VOLT? CH1", MockReply::Text("ERR".into()));
        let err = psu.read_sample(2.2).await.unwrap_err();
        assert!(err.is_recoverable());

        mock.push_reply(":MEAS:CURR? CH1", MockReply::Fail);
        let err = psu.read_sample(2.4).await.unwrap_err();
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_configure_failure_names_step() {
        let mock = rigol_mock();
        mock.push_reply(":OUTP CH1,ON", MockReply::Fail);
        let mut psu = supply(&mock);
        psu.connect().await.unwrap();
        let err = psu.configure(&RunConfig::default()).await.unwrap_err();
        assert_eq!(err.step, "output");
    }

    #[tokio::test]
    async fn test_force_off_never_errors() {
        let mock = rigol_mock();
        let mut psu = supply(&mock);
        // Not connected: the write fails but force_off only reports it.
        assert!(!psu.force_off().await);
        psu.connect().await.unwrap();
        assert!(psu.force_off().await);
        assert_eq!(mock.count("write :OUTP CH1,OFF"), 2);
    }

    #[tokio::test]
    async fn test_safety_handle_shares_connection() {
        let mock = rigol_mock();
        let mut psu = supply(&mock);
        psu.connect().await.unwrap();
        let mut safety = psu.safety_handle();
        assert!(safety.force_off().await);
        safety.disconnect().await;
        assert!(!mock.is_connected());
    }
}
