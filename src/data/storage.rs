//! Run export writers with clean feature flag handling.
//!
//! A finished run is written once, from the complete sample log, to every
//! format the run's export selection names. Each format succeeds or fails on
//! its own.
use crate::core::{FormatKind, RunConfig, Sample};
use crate::error::ExportError;
use chrono::{DateTime, Local};
use log::{info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Column headers shared by every tabular format.
pub const COLUMNS: [&str; 5] = [
    "Time(s)",
    "Voltage(V)",
    "Current(A)",
    "Power(W)",
    "Resistance(Ω)",
];

/// Configuration values recorded alongside the data.
#[derive(Debug, Serialize)]
struct RunSettingsRecord<'a> {
    resource: String,
    operation_mode: &'static str,
    voltage_setpoint_v: f64,
    current_setpoint_a: f64,
    threshold: f64,
    monitored_quantity: &'static str,
    stop_condition: String,
    update_interval_ms: u64,
    anode: &'a str,
    cathode: &'a str,
    electrolyte: &'a str,
    electrolyte_molarity: &'a str,
}

impl<'a> RunSettingsRecord<'a> {
    fn new(config: &'a RunConfig) -> Self {
        Self {
            resource: config.instrument.to_string(),
            operation_mode: config.mode.label(),
            voltage_setpoint_v: config.target_voltage,
            current_setpoint_a: config.target_current,
            threshold: config.threshold,
            monitored_quantity: config.mode.monitored_quantity(),
            stop_condition: config.stop_comparison.to_string(),
            update_interval_ms: config.effective_interval().as_millis() as u64,
            anode: &config.cell.anode,
            cathode: &config.cell.cathode,
            electrolyte: &config.cell.electrolyte,
            electrolyte_molarity: &config.cell.electrolyte_molarity,
        }
    }
}

#[derive(Serialize)]
struct Header<'a> {
    settings: RunSettingsRecord<'a>,
    notes: &'a str,
}

/// Where a run's files go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportStem {
    /// Path without extension.
    pub path: PathBuf,
    /// True if the configured save location was empty.
    pub fell_back: bool,
}

/// Directory used when no save location is configured.
pub fn fallback_directory() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("psu_stopper")
        .join("logs")
}

/// Build `<dir>/psu_V{v}_A{i}_{YYYYmmdd_HHMMSS}` and create `<dir>` if needed.
///
/// Dots in the file name are replaced with underscores.
pub fn base_path_stem(
    config: &RunConfig,
    timestamp: DateTime<Local>,
) -> Result<ExportStem, ExportError> {
    let fell_back = config.save_location.as_os_str().is_empty();
    let dir = if fell_back {
        fallback_directory()
    } else {
        config.save_location.clone()
    };
    std::fs::create_dir_all(&dir).map_err(|source| ExportError::Io {
        path: dir.clone(),
        source,
    })?;

    let name = format!(
        "psu_V{}_A{}_{}",
        config.target_voltage,
        config.target_current,
        timestamp.format("%Y%m%d_%H%M%S")
    )
    .replace('.', "_");
    Ok(ExportStem {
        path: dir.join(name),
        fell_back,
    })
}

/// Writes a finished run to disk.
pub struct ExportPipeline;

impl ExportPipeline {
    /// Write `samples` in every selected format next to `stem`.
    ///
    /// An empty run writes nothing and returns an empty list.
    pub fn export(
        stem: &Path,
        samples: &[Sample],
        config: &RunConfig,
        notes: &str,
    ) -> Vec<(FormatKind, Result<PathBuf, ExportError>)> {
        if samples.is_empty() {
            info!("No samples recorded; nothing to export.");
            return Vec::new();
        }
        let header = Header {
            settings: RunSettingsRecord::new(config),
            notes,
        };

        config
            .export
            .formats()
            .into_iter()
            .map(|kind| {
                let path = stem.with_extension(kind.extension());
                let result = match kind {
                    FormatKind::Csv => CsvExporter::write(&path, &header, samples),
                    FormatKind::Json => write_json(&path, &header, samples),
                    FormatKind::Xlsx => XlsxExporter::write(&path, &header, samples),
                };
                match &result {
                    Ok(()) => info!("{} export written to '{}'", kind.label(), path.display()),
                    Err(e) => warn!("{} export failed: {}", kind.label(), e),
                }
                (kind, result.map(|()| path))
            })
            .collect()
    }
}

fn sample_values(s: &Sample) -> [f64; 5] {
    [
        s.elapsed_seconds,
        s.voltage,
        s.current,
        s.power,
        s.resistance,
    ]
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ExportError + '_ {
    move |source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// ============================================================================
// CSV Writer
// ============================================================================

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    pub struct CsvExporter;

    impl CsvExporter {
        pub(super) fn write(
            path: &Path,
            header: &Header<'_>,
            samples: &[Sample],
        ) -> Result<(), ExportError> {
            let mut file = File::create(path).map_err(io_error(path))?;

            let json_string =
                serde_json::to_string_pretty(header).map_err(|e| ExportError::Encode {
                    format: "CSV",
                    message: e.to_string(),
                })?;
            for line in json_string.lines() {
                file.write_all(b"# ")
                    .and_then(|_| file.write_all(line.as_bytes()))
                    .and_then(|_| file.write_all(b"\n"))
                    .map_err(io_error(path))?;
            }

            let encode = |e: csv::Error| ExportError::Encode {
                format: "CSV",
                message: e.to_string(),
            };
            let mut writer = csv::Writer::from_writer(file);
            writer.write_record(COLUMNS).map_err(encode)?;
            for s in samples {
                writer
                    .write_record(sample_values(s).iter().map(f64::to_string))
                    .map_err(encode)?;
            }
            writer.flush().map_err(io_error(path))
        }
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;

    pub struct CsvExporter;

    impl CsvExporter {
        pub(super) fn write(
            _path: &Path,
            _header: &Header<'_>,
            _samples: &[Sample],
        ) -> Result<(), ExportError> {
            Err(ExportError::FormatUnavailable("CSV"))
        }
    }
}

#[cfg(feature = "storage_csv")]
use csv_enabled::CsvExporter;

#[cfg(not(feature = "storage_csv"))]
use csv_disabled::CsvExporter;

// ============================================================================
// Excel Writer
// ============================================================================

#[cfg(feature = "storage_xlsx")]
mod xlsx_enabled {
    use super::*;
    use rust_xlsxwriter::{Workbook, XlsxError};

    fn encode(e: XlsxError) -> ExportError {
        ExportError::Encode {
            format: "Excel",
            message: e.to_string(),
        }
    }

    /// Writes a `Data` sheet plus `Settings` and `Notes` sheets.
    pub struct XlsxExporter;

    impl XlsxExporter {
        pub(super) fn write(
            path: &Path,
            header: &Header<'_>,
            samples: &[Sample],
        ) -> Result<(), ExportError> {
            let mut workbook = Workbook::new();

            let data = workbook.add_worksheet();
            data.set_name("Data").map_err(encode)?;
            for (col, name) in COLUMNS.iter().enumerate() {
                data.write_string(0, col as u16, *name).map_err(encode)?;
            }
            for (i, s) in samples.iter().enumerate() {
                let row = i as u32 + 1;
                for (col, value) in sample_values(s).into_iter().enumerate() {
                    // Excel has no infinity; the cell stays empty.
                    if value.is_finite() {
                        data.write_number(row, col as u16, value).map_err(encode)?;
                    }
                }
            }

            let settings = serde_json::to_value(&header.settings).map_err(|e| {
                ExportError::Encode {
                    format: "Excel",
                    message: e.to_string(),
                }
            })?;
            let sheet = workbook.add_worksheet();
            sheet.set_name("Settings").map_err(encode)?;
            sheet.write_string(0, 0, "Setting").map_err(encode)?;
            sheet.write_string(0, 1, "Value").map_err(encode)?;
            if let serde_json::Value::Object(fields) = settings {
                for (i, (key, value)) in fields.iter().enumerate() {
                    let row = i as u32 + 1;
                    sheet.write_string(row, 0, key.as_str()).map_err(encode)?;
                    match value {
                        serde_json::Value::Number(n) => {
                            sheet
                                .write_number(row, 1, n.as_f64().unwrap_or_default())
                                .map_err(encode)?;
                        }
                        serde_json::Value::String(text) => {
                            sheet.write_string(row, 1, text.as_str()).map_err(encode)?;
                        }
                        other => {
                            sheet.write_string(row, 1, other.to_string()).map_err(encode)?;
                        }
                    }
                }
            }

            let notes = workbook.add_worksheet();
            notes.set_name("Notes").map_err(encode)?;
            notes.write_string(0, 0, "Notes").map_err(encode)?;
            notes.write_string(1, 0, header.notes).map_err(encode)?;

            workbook.save(path).map_err(encode)
        }
    }
}

#[cfg(not(feature = "storage_xlsx"))]
mod xlsx_disabled {
    use super::*;

    pub struct XlsxExporter;

    impl XlsxExporter {
        pub(super) fn write(
            _path: &Path,
            _header: &Header<'_>,
            _samples: &[Sample],
        ) -> Result<(), ExportError> {
            Err(ExportError::FormatUnavailable("Excel"))
        }
    }
}

#[cfg(feature = "storage_xlsx")]
use xlsx_enabled::XlsxExporter;

#[cfg(not(feature = "storage_xlsx"))]
use xlsx_disabled::XlsxExporter;

// ============================================================================
// JSON Writer
// ============================================================================

fn json_number(value: f64) -> serde_json::Value {
    serde_json::Number::from_f64(value)
        .map(serde_json::Value::Number)
        .unwrap_or(serde_json::Value::Null)
}

fn write_json(path: &Path, header: &Header<'_>, samples: &[Sample]) -> Result<(), ExportError> {
    let data: Vec<serde_json::Value> = samples
        .iter()
        .map(|s| {
            let row: serde_json::Map<String, serde_json::Value> = COLUMNS
                .iter()
                .zip(sample_values(s))
                .map(|(k, v)| (k.to_string(), json_number(v)))
                .collect();
            serde_json::Value::Object(row)
        })
        .collect();

    let document = serde_json::json!({
        "settings": header.settings,
        "notes": header.notes,
        "data": data,
    });
    let text = serde_json::to_string_pretty(&document).map_err(|e| ExportError::Encode {
        format: "JSON",
        message: e.to_string(),
    })?;
    std::fs::write(path, text).map_err(io_error(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ExportSelection;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn samples(n: usize) -> Vec<Sample> {
        (0..n)
            .map(|i| {
                let t = i as f64 * 0.2;
                Sample::from_measurement(t, 4.0, if i == n - 1 { 0.0 } else { 0.5 - t / 20.0 })
            })
            .collect()
    }

    fn config(dir: &Path, export: ExportSelection) -> RunConfig {
        RunConfig {
            export,
            save_location: dir.to_path_buf(),
            ..RunConfig::default()
        }
    }

    #[test]
    fn test_stem_format() {
        let dir = tempdir().unwrap();
        let cfg = RunConfig {
            target_voltage: 3.7,
            target_current: 0.25,
            save_location: dir.path().join("runs"),
            ..RunConfig::default()
        };
        let ts = Local.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap();
        let stem = base_path_stem(&cfg, ts).unwrap();
        assert!(!stem.fell_back);
        assert_eq!(
            stem.path,
            dir.path().join("runs").join("psu_V3_7_A0_25_20260314_092653")
        );
        assert!(dir.path().join("runs").is_dir());
    }

    #[test]
    fn test_empty_selection_input_writes_nothing() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path(), ExportSelection::All);
        let results = ExportPipeline::export(&dir.path().join("run"), &[], &cfg, "");
        assert!(results.is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[cfg(all(feature = "storage_csv", feature = "storage_xlsx"))]
    #[test]
    fn test_all_formats_have_matching_row_counts() {
        use calamine::{open_workbook, Data, Reader, Xlsx};

        let dir = tempdir().unwrap();
        let cfg = config(dir.path(), ExportSelection::All);
        let data = samples(12);
        let results = ExportPipeline::export(&dir.path().join("run"), &data, &cfg, "cycle 3");

        assert_eq!(results.len(), 3);
        let csv_path = results[0].1.as_ref().unwrap();
        assert_eq!(results[1].0, FormatKind::Xlsx);
        let xlsx_path = results[1].1.as_ref().unwrap();
        let json_path = results[2].1.as_ref().unwrap();

        let mut workbook: Xlsx<_> = open_workbook(xlsx_path).unwrap();
        assert_eq!(workbook.sheet_names(), vec!["Data", "Settings", "Notes"]);
        let sheet = workbook.worksheet_range("Data").unwrap();
        assert_eq!(sheet.height() - 1, data.len());
        assert_eq!(
            sheet.get_value((0, 4)),
            Some(&Data::String("Resistance(Ω)".into()))
        );
        assert_eq!(sheet.get_value((2, 0)), Some(&Data::Float(0.2)));
        let settings = workbook.worksheet_range("Settings").unwrap();
        assert!(settings
            .rows()
            .any(|r| r[0] == Data::String("operation_mode".into())
                && r[1] == Data::String("CV".into())));
        let notes = workbook.worksheet_range("Notes").unwrap();
        assert_eq!(
            notes.get_value((1, 0)),
            Some(&Data::String("cycle 3".into()))
        );

        let text = std::fs::read_to_string(csv_path).unwrap();
        assert!(text.lines().any(|l| l.starts_with("# ") && l.contains("cycle 3")));
        let body: Vec<&str> = text.lines().filter(|l| !l.starts_with('#')).collect();
        assert_eq!(body[0], COLUMNS.join(","));
        assert_eq!(body.len() - 1, data.len());
        assert!(body.last().unwrap().ends_with(",inf"));

        let doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(json_path).unwrap()).unwrap();
        let rows = doc["data"].as_array().unwrap();
        assert_eq!(rows.len(), data.len());
        assert_eq!(doc["notes"], "cycle 3");
        assert_eq!(doc["settings"]["operation_mode"], "CV");
        assert!(rows.last().unwrap()["Resistance(Ω)"].is_null());
        assert_eq!(rows[1]["Time(s)"], 0.2);
    }

    #[cfg(not(feature = "storage_xlsx"))]
    #[test]
    fn test_xlsx_unavailable_without_feature() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path(), ExportSelection::Xlsx);
        let results = ExportPipeline::export(&dir.path().join("run"), &samples(3), &cfg, "");
        assert!(matches!(
            results[0],
            (FormatKind::Xlsx, Err(ExportError::FormatUnavailable(_)))
        ));
    }

    #[test]
    fn test_json_only() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path(), ExportSelection::Json);
        let results = ExportPipeline::export(&dir.path().join("run"), &samples(3), &cfg, "");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, FormatKind::Json);
        assert!(results[0].1.as_ref().unwrap().ends_with("run.json"));
    }

    #[test]
    fn test_unwritable_location_reports_error() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path(), ExportSelection::Json);
        let missing = dir.path().join("missing").join("run");
        let results = ExportPipeline::export(&missing, &samples(3), &cfg, "");
        assert!(matches!(results[0].1, Err(ExportError::Io { .. })));
    }
}
