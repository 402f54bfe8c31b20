//! Core data types for the power-supply monitor.
//!
//! This module defines the values that flow through the acquisition pipeline:
//!
//! - [`Sample`]: one immutable measurement with derived power and resistance
//! - [`RunConfig`]: the frozen configuration snapshot a run works from
//! - [`RunPhase`] / [`StopReason`]: where a run is and why it ended
//!
//! # Data Flow
//!
//! ```text
//! PowerSupply --[Sample]--> SampleLog (export)
//!                      \--> SampleProducer --> SampleConsumer --> SlidingWindow (display)
//! ```

use crate::config::{SimulationSettings, TimeoutSettings};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Floor applied to the requested sample interval.
pub const MIN_UPDATE_INTERVAL_MS: u64 = 10;

/// Smallest sliding-window capacity.
pub const MIN_WINDOW_CAPACITY: usize = 10;

/// Threshold comparisons are ignored until the run is this old.
pub const SETTLING_TIME_S: f64 = 1.0;

/// A dead output only counts once the run is this old.
pub const ZERO_OUTPUT_DELAY_S: f64 = 1.0;

/// Voltage and current magnitudes below this are treated as zero output.
pub const ZERO_OUTPUT_LEVEL: f64 = 1e-3;

/// Currents at or below this magnitude yield infinite resistance.
pub const RESISTANCE_CURRENT_EPSILON: f64 = 1e-9;

/// One measurement taken from the supply.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    /// Seconds since the run started.
    pub elapsed_seconds: f64,
    /// Measured output voltage (V).
    pub voltage: f64,
    /// Measured output current (A).
    pub current: f64,
    /// `voltage * current` (W).
    pub power: f64,
    /// `voltage / current` (Ω), infinite when the current is effectively zero.
    pub resistance: f64,
}

impl Sample {
    /// Builds a sample from raw readings, deriving power and resistance.
    pub fn from_measurement(elapsed_seconds: f64, voltage: f64, current: f64) -> Self {
        let resistance = if current.abs() > RESISTANCE_CURRENT_EPSILON {
            voltage / current
        } else {
            f64::INFINITY
        };
        Self {
            elapsed_seconds,
            voltage,
            current,
            power: voltage * current,
            resistance,
        }
    }

    /// True if both voltage and current read as zero.
    pub fn is_zero_output(&self) -> bool {
        self.voltage.abs() < ZERO_OUTPUT_LEVEL && self.current.abs() < ZERO_OUTPUT_LEVEL
    }
}

/// Regulation mode of the supply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OperationMode {
    /// Constant voltage; the run stops on the measured current.
    #[default]
    #[serde(rename = "CV", alias = "cv")]
    ConstantVoltage,
    /// Constant current; the run stops on the measured voltage.
    #[serde(rename = "CC", alias = "cc")]
    ConstantCurrent,
}

impl OperationMode {
    /// Short label used in exports and status text.
    pub fn label(self) -> &'static str {
        match self {
            OperationMode::ConstantVoltage => "CV",
            OperationMode::ConstantCurrent => "CC",
        }
    }

    /// Name of the quantity the stop threshold is compared against.
    pub fn monitored_quantity(self) -> &'static str {
        match self {
            OperationMode::ConstantVoltage => "current",
            OperationMode::ConstantCurrent => "voltage",
        }
    }
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Direction of the threshold comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopComparison {
    /// Stop once the monitored value drops below the threshold.
    #[default]
    Below,
    /// Stop once the monitored value rises above the threshold.
    Above,
}

impl StopComparison {
    /// Strict comparison; equality never triggers.
    pub fn is_triggered(self, monitored: f64, threshold: f64) -> bool {
        match self {
            StopComparison::Below => monitored < threshold,
            StopComparison::Above => monitored > threshold,
        }
    }
}

impl fmt::Display for StopComparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopComparison::Below => f.write_str("below"),
            StopComparison::Above => f.write_str("above"),
        }
    }
}

/// Which export formats a run writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportSelection {
    /// Comma-separated text.
    #[default]
    Csv,
    /// Excel workbook.
    Xlsx,
    /// JSON document.
    Json,
    /// Every format.
    All,
}

impl ExportSelection {
    /// Concrete formats to attempt, in write order.
    pub fn formats(self) -> Vec<FormatKind> {
        match self {
            ExportSelection::Csv => vec![FormatKind::Csv],
            ExportSelection::Xlsx => vec![FormatKind::Xlsx],
            ExportSelection::Json => vec![FormatKind::Json],
            ExportSelection::All => vec![FormatKind::Csv, FormatKind::Xlsx, FormatKind::Json],
        }
    }
}

/// A single export file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatKind {
    /// `.csv`
    Csv,
    /// `.xlsx`
    Xlsx,
    /// `.json`
    Json,
}

impl FormatKind {
    /// File extension without the dot.
    pub fn extension(self) -> &'static str {
        match self {
            FormatKind::Csv => "csv",
            FormatKind::Xlsx => "xlsx",
            FormatKind::Json => "json",
        }
    }

    /// Name used in status messages.
    pub fn label(self) -> &'static str {
        match self {
            FormatKind::Csv => "CSV",
            FormatKind::Xlsx => "Excel",
            FormatKind::Json => "JSON",
        }
    }
}

/// Which instrument a run talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstrumentSelection {
    /// In-process simulated supply.
    Simulated,
    /// Real hardware addressed by a resource string (VISA or serial).
    Resource(String),
}

impl fmt::Display for InstrumentSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstrumentSelection::Simulated => f.write_str("simulated"),
            InstrumentSelection::Resource(r) => f.write_str(r),
        }
    }
}

/// Description of the electrochemical cell under test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CellMetadata {
    /// Anode material.
    pub anode: String,
    /// Cathode material.
    pub cathode: String,
    /// Electrolyte composition.
    pub electrolyte: String,
    /// Free text, e.g. `"1 M"`.
    pub electrolyte_molarity: String,
}

/// Immutable configuration snapshot for one run.
///
/// Built from [`crate::config::Settings::snapshot`] when a run starts and shared
/// with the acquisition worker behind an `Arc`. Fields are public so tests can
/// construct edge-case configurations directly; validation of operator input
/// happens on `Settings`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// Simulated supply or a resource string.
    pub instrument: InstrumentSelection,
    /// Decides which quantity is compared with `threshold`.
    pub mode: OperationMode,
    /// Programmed voltage in volts.
    pub target_voltage: f64,
    /// Programmed current limit in amps.
    pub target_current: f64,
    /// Compared against the monitored quantity of `mode`.
    pub threshold: f64,
    /// Direction of the threshold test.
    pub stop_comparison: StopComparison,
    /// Requested sample interval before the floor is applied.
    pub interval_ms: u64,
    /// Requested sliding-window capacity before the floor is applied.
    pub max_plot_points: usize,
    /// Formats written when the run stops.
    pub export: ExportSelection,
    /// Output directory; empty means the platform data directory.
    pub save_location: PathBuf,
    /// Copied into every export.
    pub cell: CellMetadata,
    /// Free-form run notes. `stop` may replace them.
    pub notes: String,
    /// Sound the terminal bell on auto-stop.
    pub beep_on_stop: bool,
    /// Model parameters for the simulated supply.
    pub simulation: SimulationSettings,
    /// Connect, I/O and join timeouts.
    pub timeouts: TimeoutSettings,
    /// Only used for serial resources.
    pub baud_rate: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            instrument: InstrumentSelection::Simulated,
            mode: OperationMode::ConstantVoltage,
            target_voltage: 4.0,
            target_current: 0.5,
            threshold: 0.062,
            stop_comparison: StopComparison::Below,
            interval_ms: 200,
            max_plot_points: 1000,
            export: ExportSelection::Csv,
            save_location: PathBuf::new(),
            cell: CellMetadata::default(),
            notes: String::new(),
            beep_on_stop: true,
            simulation: SimulationSettings::default(),
            timeouts: TimeoutSettings::default(),
            baud_rate: 9600,
        }
    }
}

impl RunConfig {
    /// Sample interval with the 10 ms floor applied.
    pub fn effective_interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(MIN_UPDATE_INTERVAL_MS))
    }

    /// True if the requested interval was raised to the floor.
    pub fn interval_was_clamped(&self) -> bool {
        self.interval_ms < MIN_UPDATE_INTERVAL_MS
    }

    /// Sliding-window capacity with the floor applied.
    pub fn window_capacity(&self) -> usize {
        self.max_plot_points.max(MIN_WINDOW_CAPACITY)
    }

    /// Value compared against the threshold for this run's mode.
    ///
    /// CV mode watches the current magnitude so that sink and source
    /// directions behave alike; CC mode watches the signed voltage.
    pub fn monitored_value(&self, sample: &Sample) -> f64 {
        match self.mode {
            OperationMode::ConstantVoltage => sample.current.abs(),
            OperationMode::ConstantCurrent => sample.voltage,
        }
    }
}

/// Lifecycle phase of the acquisition worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunPhase {
    /// No run, or the last one ended cleanly.
    #[default]
    Idle,
    /// Opening the transport.
    Connecting,
    /// Programming voltage, current and OVP.
    Configuring,
    /// Sampling.
    Running,
    /// Switching the output off and disconnecting.
    Stopping,
    /// The last run ended on an error.
    Failed,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunPhase::Idle => "idle",
            RunPhase::Connecting => "connecting",
            RunPhase::Configuring => "configuring",
            RunPhase::Running => "running",
            RunPhase::Stopping => "stopping",
            RunPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    /// The monitored value crossed the threshold after settling.
    ThresholdCrossed {
        quantity: &'static str,
        monitored: f64,
        threshold: f64,
        comparison: StopComparison,
    },
    /// Both voltage and current read zero after the settling delay.
    ZeroOutput,
    /// The operator (or the controller) asked the run to stop.
    UserRequested,
    /// The instrument could not be reached.
    ConnectFailed(String),
    /// The instrument rejected its setup.
    ConfigureFailed(String),
    /// A measurement query failed at the transport level.
    InstrumentFault(String),
    /// The worker panicked.
    WorkerPanicked,
    /// The worker did not exit in time and was aborted.
    Abandoned,
}

impl StopReason {
    /// True for the two automatic stop conditions.
    pub fn is_auto_stop(&self) -> bool {
        matches!(
            self,
            StopReason::ThresholdCrossed { .. } | StopReason::ZeroOutput
        )
    }

    /// True if the run ended because something went wrong.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            StopReason::ConnectFailed(_)
                | StopReason::ConfigureFailed(_)
                | StopReason::InstrumentFault(_)
                | StopReason::WorkerPanicked
                | StopReason::Abandoned
        )
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::ThresholdCrossed {
                quantity,
                monitored,
                threshold,
                comparison,
            } => write!(
                f,
                "{} {:.4} went {} threshold {:.4}",
                quantity, monitored, comparison, threshold
            ),
            StopReason::ZeroOutput => f.write_str("output dropped to zero (V and I both below 1 mV/mA)"),
            StopReason::UserRequested => f.write_str("stopped by operator"),
            StopReason::ConnectFailed(e) => write!(f, "connection failed: {}", e),
            StopReason::ConfigureFailed(e) => write!(f, "instrument setup failed: {}", e),
            StopReason::InstrumentFault(e) => write!(f, "instrument fault: {}", e),
            StopReason::WorkerPanicked => f.write_str("acquisition worker panicked"),
            StopReason::Abandoned => f.write_str("acquisition worker did not stop in time"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_derives_power_and_resistance() {
        let s = Sample::from_measurement(1.5, 4.0, 0.5);
        assert_eq!(s.power, 2.0);
        assert_eq!(s.resistance, 8.0);
        assert_eq!(s.elapsed_seconds, 1.5);
    }

    #[test]
    fn test_resistance_is_infinite_at_zero_current() {
        assert!(Sample::from_measurement(0.0, 4.0, 0.0).resistance.is_infinite());
        assert!(Sample::from_measurement(0.0, 4.0, 1e-10).resistance.is_infinite());
        assert!(Sample::from_measurement(0.0, 4.0, -1e-10).resistance.is_infinite());
        assert!(Sample::from_measurement(0.0, 4.0, 2e-9).resistance.is_finite());
    }

    #[test]
    fn test_negative_current_keeps_sign() {
        let s = Sample::from_measurement(0.0, 2.0, -0.5);
        assert_eq!(s.resistance, -4.0);
        assert_eq!(s.power, -1.0);
    }

    #[test]
    fn test_interval_floor() {
        let mut cfg = RunConfig {
            interval_ms: 5,
            ..RunConfig::default()
        };
        assert_eq!(cfg.effective_interval(), Duration::from_millis(10));
        assert!(cfg.interval_was_clamped());

        cfg.interval_ms = 10;
        assert!(!cfg.interval_was_clamped());
        cfg.interval_ms = 250;
        assert_eq!(cfg.effective_interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_window_capacity_floor() {
        let cfg = RunConfig {
            max_plot_points: 3,
            ..RunConfig::default()
        };
        assert_eq!(cfg.window_capacity(), MIN_WINDOW_CAPACITY);
    }

    #[test]
    fn test_monitored_value_follows_mode() {
        let sample = Sample::from_measurement(2.0, 3.9, -0.04);
        let cv = RunConfig::default();
        assert_eq!(cv.monitored_value(&sample), 0.04);

        let cc = RunConfig {
            mode: OperationMode::ConstantCurrent,
            ..RunConfig::default()
        };
        assert_eq!(cc.monitored_value(&sample), 3.9);
    }

    #[test]
    fn test_comparison_is_strict() {
        assert!(StopComparison::Below.is_triggered(0.05, 0.062));
        assert!(!StopComparison::Below.is_triggered(0.062, 0.062));
        assert!(StopComparison::Above.is_triggered(4.3, 4.2));
        assert!(!StopComparison::Above.is_triggered(4.2, 4.2));
    }

    #[test]
    fn test_export_selection_formats() {
        assert_eq!(ExportSelection::Json.formats(), vec![FormatKind::Json]);
        assert_eq!(ExportSelection::All.formats().len(), 3);
    }

    #[test]
    fn test_zero_output_detection() {
        assert!(Sample::from_measurement(2.0, 0.0005, -0.0002).is_zero_output());
        assert!(!Sample::from_measurement(2.0, 0.0005, 0.002).is_zero_output());
    }
}
