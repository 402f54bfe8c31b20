//! Persisted operator settings and presets, loaded with Figment.
//!
//! Settings are resolved in three layers:
//! 1. built-in defaults (`#[serde(default)]`)
//! 2. the TOML settings file
//! 3. environment variables prefixed with `PSU_STOPPER_`
//!
//! Nested tables use a double underscore in the variable name:
//!
//! ```text
//! PSU_STOPPER_VOLTAGE=3.7
//! PSU_STOPPER_SIMULATION_MODE=true
//! PSU_STOPPER_TIMEOUTS__JOIN_TIMEOUT_MS=8000
//! ```
//!
//! A missing, unreadable or malformed settings file never aborts the program;
//! [`Settings::load`] logs a warning and falls back to the defaults.

use crate::core::{
    CellMetadata, ExportSelection, InstrumentSelection, OperationMode, RunConfig, StopComparison,
};
use crate::error::SettingsError;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "PSU_STOPPER_";

const APP_DIR: &str = "psu_stopper";

/// Parameters of the simulated supply.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    /// Linear current decay in A/s.
    pub decay_rate: f64,
    /// Half-width of the uniform current noise in A.
    pub current_noise: f64,
    /// Half-width of the uniform voltage noise in V.
    pub voltage_noise: f64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            decay_rate: 0.05,
            current_noise: 0.005,
            voltage_noise: 0.0,
        }
    }
}

/// Timeouts for instrument I/O and worker shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutSettings {
    /// Bounds the whole connect and configure sequence.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Bounds each individual write or query.
    #[serde(default = "default_io_timeout")]
    pub io_timeout_ms: u64,
    /// How long `stop` waits for the worker before abandoning it.
    #[serde(default = "default_join_timeout")]
    pub join_timeout_ms: u64,
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_io_timeout() -> u64 {
    5000
}

fn default_join_timeout() -> u64 {
    5000
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            io_timeout_ms: default_io_timeout(),
            join_timeout_ms: default_join_timeout(),
        }
    }
}

/// Everything the operator can configure between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// VISA resource string or serial port path.
    pub resource_name: String,
    /// Ignore `resource_name` and use the simulated supply.
    pub simulation_mode: bool,
    /// Volts.
    pub voltage: f64,
    /// Amps.
    pub current: f64,
    /// Stop threshold in the monitored unit.
    pub threshold: f64,
    /// Direction of the threshold test.
    pub stop_condition: StopComparison,
    /// Sample interval in milliseconds.
    pub update_interval_ms: u64,
    /// Sliding-window capacity for live display.
    pub max_plot_points: usize,
    /// Empty means the platform data directory.
    pub save_location: String,
    /// Formats written on stop.
    pub export_format: ExportSelection,
    /// CV monitors current, CC monitors voltage.
    pub operation_mode: OperationMode,
    /// See [`CellMetadata`].
    pub anode: String,
    /// See [`CellMetadata`].
    pub cathode: String,
    /// See [`CellMetadata`].
    pub electrolyte: String,
    /// See [`CellMetadata`].
    pub electrolyte_molarity: String,
    /// Carried into every export.
    pub notes: String,
    /// Sound the terminal bell on auto-stop.
    pub beep_on_stop: bool,
    /// Serial resources only.
    pub baud_rate: u32,
    /// Simulated supply model.
    pub simulation: SimulationSettings,
    /// Instrument and shutdown timeouts.
    pub timeouts: TimeoutSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            resource_name: "TCPIP0::192.168.1.100::INSTR".to_string(),
            simulation_mode: false,
            voltage: 4.0,
            current: 0.5,
            threshold: 0.062,
            stop_condition: StopComparison::Below,
            update_interval_ms: 200,
            max_plot_points: 1000,
            save_location: String::new(),
            export_format: ExportSelection::Csv,
            operation_mode: OperationMode::ConstantVoltage,
            anode: String::new(),
            cathode: String::new(),
            electrolyte: String::new(),
            electrolyte_molarity: String::new(),
            notes: String::new(),
            beep_on_stop: true,
            baud_rate: 9600,
            simulation: SimulationSettings::default(),
            timeouts: TimeoutSettings::default(),
        }
    }
}

impl Settings {
    /// Platform location of the settings file.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR).join("settings.toml"))
            .unwrap_or_else(|| PathBuf::from("psu_stopper_settings.toml"))
    }

    fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load settings, propagating any error.
    pub fn try_load(path: &Path) -> Result<Self, SettingsError> {
        Ok(Self::figment(path).extract()?)
    }

    /// Load settings, falling back to defaults on any error.
    pub fn load(path: &Path) -> Self {
        match Self::try_load(path) {
            Ok(settings) => {
                debug!("Loaded settings from {}", path.display());
                settings
            }
            Err(e) => {
                warn!(
                    "Could not load settings from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Write the settings as TOML, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        write_toml(path, self)
    }

    /// Check operator input. The first offending field is reported.
    ///
    /// `update_interval_ms` and `max_plot_points` are not rejected here: a run
    /// raises them to their floors and warns once about the interval.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if !self.simulation_mode && self.resource_name.trim().is_empty() {
            return Err(SettingsError::invalid(
                "resource_name",
                "a resource is required unless simulation mode is on",
            ));
        }
        if !(self.voltage.is_finite() && self.voltage > 0.0) {
            return Err(SettingsError::invalid(
                "voltage",
                format!("must be greater than 0 V, got {}", self.voltage),
            ));
        }
        if !(self.current.is_finite() && self.current > 0.0) {
            return Err(SettingsError::invalid(
                "current",
                format!("must be greater than 0 A, got {}", self.current),
            ));
        }
        if !(self.threshold.is_finite() && self.threshold >= 0.0) {
            return Err(SettingsError::invalid(
                "threshold",
                format!("must be 0 or greater, got {}", self.threshold),
            ));
        }
        Ok(())
    }

    /// Cell description assembled from the flat fields.
    pub fn cell(&self) -> CellMetadata {
        CellMetadata {
            anode: self.anode.clone(),
            cathode: self.cathode.clone(),
            electrolyte: self.electrolyte.clone(),
            electrolyte_molarity: self.electrolyte_molarity.clone(),
        }
    }

    /// Freeze the current settings into a run configuration.
    pub fn snapshot(&self) -> RunConfig {
        let instrument = if self.simulation_mode {
            InstrumentSelection::Simulated
        } else {
            InstrumentSelection::Resource(self.resource_name.trim().to_string())
        };
        RunConfig {
            instrument,
            mode: self.operation_mode,
            target_voltage: self.voltage,
            target_current: self.current,
            threshold: self.threshold,
            stop_comparison: self.stop_condition,
            interval_ms: self.update_interval_ms,
            max_plot_points: self.max_plot_points,
            export: self.export_format,
            save_location: PathBuf::from(self.save_location.trim()),
            cell: self.cell(),
            notes: self.notes.clone(),
            beep_on_stop: self.beep_on_stop,
            simulation: self.simulation,
            timeouts: self.timeouts,
            baud_rate: self.baud_rate,
        }
    }
}

fn write_toml<T: Serialize>(path: &Path, value: &T) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| SettingsError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let text = toml::to_string_pretty(value)?;
    std::fs::write(path, text).map_err(|source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// A named subset of [`Settings`] that can be recalled later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    /// Same meaning as the [`Settings`] field of that name.
    pub resource_name: String,
    /// Volts.
    pub voltage: f64,
    /// Amps.
    pub current: f64,
    /// Stop threshold.
    pub threshold: f64,
    /// Direction of the threshold test.
    pub stop_condition: StopComparison,
    /// Formats written on stop.
    pub export_format: ExportSelection,
    /// CV or CC.
    pub operation_mode: OperationMode,
    /// Cell description.
    #[serde(default)]
    pub cell: CellMetadata,
}

impl Preset {
    /// Capture the recallable subset of `settings`.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            resource_name: settings.resource_name.clone(),
            voltage: settings.voltage,
            current: settings.current,
            threshold: settings.threshold,
            stop_condition: settings.stop_condition,
            export_format: settings.export_format,
            operation_mode: settings.operation_mode,
            cell: settings.cell(),
        }
    }

    /// Overwrite the preset's fields in `settings`, leaving the rest alone.
    pub fn apply_to(&self, settings: &mut Settings) {
        settings.resource_name = self.resource_name.clone();
        settings.voltage = self.voltage;
        settings.current = self.current;
        settings.threshold = self.threshold;
        settings.stop_condition = self.stop_condition;
        settings.export_format = self.export_format;
        settings.operation_mode = self.operation_mode;
        settings.anode = self.cell.anode.clone();
        settings.cathode = self.cell.cathode.clone();
        settings.electrolyte = self.cell.electrolyte.clone();
        settings.electrolyte_molarity = self.cell.electrolyte_molarity.clone();
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PresetFile {
    #[serde(default)]
    presets: BTreeMap<String, Preset>,
}

/// Presets persisted in their own TOML file. Every change is written through.
#[derive(Debug)]
pub struct PresetStore {
    path: PathBuf,
    presets: BTreeMap<String, Preset>,
}

impl PresetStore {
    /// `presets.toml` next to the settings file.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR).join("presets.toml"))
            .unwrap_or_else(|| PathBuf::from("psu_stopper_presets.toml"))
    }

    /// Open the store. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let presets = if path.exists() {
            Figment::new()
                .merge(Toml::file(&path))
                .extract::<PresetFile>()?
                .presets
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, presets })
    }

    /// Insert or replace a preset.
    pub fn add(&mut self, name: &str, preset: Preset) -> Result<(), SettingsError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SettingsError::EmptyPresetName);
        }
        self.presets.insert(name.to_string(), preset);
        self.save()
    }

    /// Look up a preset; surrounding whitespace in `name` is ignored.
    pub fn get(&self, name: &str) -> Option<&Preset> {
        self.presets.get(name.trim())
    }

    /// Remove a preset. Returns false if it did not exist.
    pub fn delete(&mut self, name: &str) -> Result<bool, SettingsError> {
        if self.presets.remove(name.trim()).is_none() {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    /// Preset names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.presets.keys().map(String::as_str).collect()
    }

    fn save(&self) -> Result<(), SettingsError> {
        write_toml(
            &self.path,
            &PresetFile {
                presets: self.presets.clone(),
            },
        )
    }
}
