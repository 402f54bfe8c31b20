//! Command-line front end for psu_stopper.
//!
//! `psu_stopper run` starts a monitored run with the saved settings (plus any
//! overrides), prints the live readings and stops on the configured
//! threshold, on zero output, or on Ctrl-C.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use psu_stopper::app_actor::ControllerHandle;
use psu_stopper::config::{Preset, PresetStore, Settings};
use psu_stopper::core::{ExportSelection, OperationMode, StopComparison};
use psu_stopper::data::buffer::SlidingWindow;
use psu_stopper::messages::{RunReport, Severity, StatusEvent, StatusReporter};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// How often the terminal display is refreshed.
const DISPLAY_TICK: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "psu_stopper", version, about = "Power-supply monitor with threshold auto-stop")]
struct Cli {
    /// Settings file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a run and monitor it until a stop condition or Ctrl-C
    Run(RunArgs),
    /// List serial ports that may host an instrument
    Scan,
    /// Manage saved presets
    Preset {
        #[command(subcommand)]
        action: PresetAction,
    },
    /// Inspect the settings file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Use the simulated supply
    #[arg(long, conflicts_with = "resource")]
    simulate: bool,
    /// VISA or serial resource string
    #[arg(long)]
    resource: Option<String>,
    /// Target voltage (V)
    #[arg(long)]
    voltage: Option<f64>,
    /// Target current (A)
    #[arg(long)]
    current: Option<f64>,
    /// Stop threshold (A in CV mode, V in CC mode)
    #[arg(long)]
    threshold: Option<f64>,
    #[arg(long, value_enum)]
    stop_condition: Option<ComparisonArg>,
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,
    /// Sampling interval in milliseconds (at least 10)
    #[arg(long, value_parser = clap::value_parser!(u64).range(10..))]
    interval_ms: Option<u64>,
    #[arg(long, value_enum)]
    format: Option<FormatArg>,
    #[arg(long)]
    notes: Option<String>,
    /// Directory for exported data
    #[arg(long)]
    save_location: Option<String>,
    /// Apply a saved preset before the other overrides
    #[arg(long)]
    preset: Option<String>,
}

#[derive(Subcommand)]
enum PresetAction {
    /// List preset names
    List,
    /// Save the current settings under a name
    Save { name: String },
    /// Apply a preset to the saved settings
    Load { name: String },
    /// Delete a preset
    Delete { name: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective settings as TOML
    Show,
    /// Print the settings file location
    Path,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Cv,
    Cc,
}

impl From<ModeArg> for OperationMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Cv => OperationMode::ConstantVoltage,
            ModeArg::Cc => OperationMode::ConstantCurrent,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ComparisonArg {
    Below,
    Above,
}

impl From<ComparisonArg> for StopComparison {
    fn from(arg: ComparisonArg) -> Self {
        match arg {
            ComparisonArg::Below => StopComparison::Below,
            ComparisonArg::Above => StopComparison::Above,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Csv,
    Xlsx,
    Json,
    All,
}

impl From<FormatArg> for ExportSelection {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Csv => ExportSelection::Csv,
            FormatArg::Xlsx => ExportSelection::Xlsx,
            FormatArg::Json => ExportSelection::Json,
            FormatArg::All => ExportSelection::All,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("psu_stopper=info")),
        )
        .init();

    let cli = Cli::parse();
    let settings_path = cli.config.unwrap_or_else(Settings::default_path);

    match cli.command {
        Command::Run(args) => run(&settings_path, args).await,
        Command::Scan => scan(),
        Command::Preset { action } => preset(&settings_path, action),
        Command::Config { action } => {
            match action {
                ConfigAction::Show => {
                    let settings = Settings::load(&settings_path);
                    print!("{}", toml::to_string_pretty(&settings)?);
                }
                ConfigAction::Path => println!("{}", settings_path.display()),
            }
            Ok(())
        }
    }
}

fn apply_overrides(settings: &mut Settings, args: &RunArgs) -> Result<()> {
    if let Some(name) = &args.preset {
        let store = PresetStore::open(PresetStore::default_path())?;
        let preset = store
            .get(name)
            .with_context(|| format!("no preset named '{}'", name))?;
        preset.apply_to(settings);
    }
    if args.simulate {
        settings.simulation_mode = true;
    }
    if let Some(resource) = &args.resource {
        settings.resource_name = resource.clone();
        settings.simulation_mode = resource.trim().eq_ignore_ascii_case("simulate");
    }
    if let Some(v) = args.voltage {
        settings.voltage = v;
    }
    if let Some(i) = args.current {
        settings.current = i;
    }
    if let Some(t) = args.threshold {
        settings.threshold = t;
    }
    if let Some(c) = args.stop_condition {
        settings.stop_condition = c.into();
    }
    if let Some(m) = args.mode {
        settings.operation_mode = m.into();
    }
    if let Some(ms) = args.interval_ms {
        settings.update_interval_ms = ms;
    }
    if let Some(f) = args.format {
        settings.export_format = f.into();
    }
    if let Some(notes) = &args.notes {
        settings.notes = notes.clone();
    }
    if let Some(dir) = &args.save_location {
        settings.save_location = dir.clone();
    }
    Ok(())
}

async fn run(settings_path: &Path, args: RunArgs) -> Result<()> {
    let mut settings = Settings::load(settings_path);
    apply_overrides(&mut settings, &args)?;
    settings.validate()?;
    if let Err(e) = settings.save(settings_path) {
        log::warn!("Could not save settings: {}", e);
    }

    let config = settings.snapshot();
    let mut window = SlidingWindow::new(config.window_capacity());
    let monitored = config.mode.monitored_quantity();

    let (status_tx, mut status_rx) = mpsc::unbounded_channel();
    let (controller, actor) = ControllerHandle::spawn(StatusReporter::new(status_tx));
    let mut consumer = controller.start(config).await?;

    println!("Monitoring {}. Press Ctrl-C to stop.", monitored);
    let mut tick = tokio::time::interval(DISPLAY_TICK);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                println!();
                log::info!("Stop requested from the terminal");
                break;
            }
            event = status_rx.recv() => match event {
                Some(StatusEvent::Message { severity, text }) => print_status(severity, &text),
                Some(StatusEvent::AutoStopTriggered { reason }) => {
                    println!();
                    println!("AUTO-STOP: {}", reason);
                    break;
                }
                Some(StatusEvent::WorkerFinished) | None => break,
            },
            _ = tick.tick() => {
                if let Some(sample) = consumer.drain_one() {
                    window.append(&sample);
                }
                if let Some(s) = window.latest() {
                    print!(
                        "\r t={:8.2} s  V={:8.4} V  I={:8.4} A  P={:8.4} W  R={:10.3} Ohm   ",
                        s.elapsed_seconds, s.voltage, s.current, s.power, s.resistance
                    );
                    use std::io::Write;
                    let _ = std::io::stdout().flush();
                }
            }
        }
    }

    let report = controller.stop(None).await;
    // Drain the remaining status messages from the stop sequence.
    while let Ok(event) = status_rx.try_recv() {
        if let StatusEvent::Message { severity, text } = event {
            print_status(severity, &text);
        }
    }
    controller.shutdown().await;
    let _ = actor.await;

    let report = report?;
    print_report(&report);
    if !report.de_energized {
        bail!("the supply output could not be confirmed off");
    }
    Ok(())
}

fn print_status(severity: Severity, text: &str) {
    if severity == Severity::Debug {
        return;
    }
    println!();
    println!("[{}] {}", severity, text);
}

fn print_report(report: &RunReport) {
    println!("Stop reason: {}", report.stop_reason);
    println!("Samples recorded: {}", report.samples);
    for export in &report.exports {
        match &export.result {
            Ok(path) => println!("  {:<6} {}", export.format.label(), path.display()),
            Err(e) => println!("  {:<6} failed: {}", export.format.label(), e),
        }
    }
}

#[cfg(feature = "instrument_serial")]
fn scan() -> Result<()> {
    let ports = serialport::available_ports().context("listing serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found. Use --simulate for a dry run.");
    }
    for port in ports {
        println!("{}", port.port_name);
    }
    Ok(())
}

#[cfg(not(feature = "instrument_serial"))]
fn scan() -> Result<()> {
    bail!("serial support not compiled in; rebuild with --features instrument_serial")
}

fn preset(settings_path: &Path, action: PresetAction) -> Result<()> {
    let mut store = PresetStore::open(PresetStore::default_path())?;
    match action {
        PresetAction::List => {
            let names = store.names();
            if names.is_empty() {
                println!("No presets saved.");
            }
            for name in names {
                println!("{}", name);
            }
        }
        PresetAction::Save { name } => {
            let settings = Settings::load(settings_path);
            store.add(&name, Preset::from_settings(&settings))?;
            println!("Saved preset '{}'", name.trim());
        }
        PresetAction::Load { name } => {
            let preset = store
                .get(&name)
                .with_context(|| format!("no preset named '{}'", name))?;
            let mut settings = Settings::load(settings_path);
            preset.apply_to(&mut settings);
            settings.save(settings_path)?;
            println!("Loaded preset '{}'", name.trim());
        }
        PresetAction::Delete { name } => {
            if store.delete(&name)? {
                println!("Deleted preset '{}'", name.trim());
            } else {
                bail!("no preset named '{}'", name);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(argv: &[&str]) -> Result<RunArgs, clap::Error> {
        let mut full = vec!["psu_stopper", "run"];
        full.extend_from_slice(argv);
        Cli::try_parse_from(full).map(|cli| match cli.command {
            Command::Run(args) => args,
            _ => unreachable!("parsed a run command"),
        })
    }

    #[test]
    fn test_simulate_conflicts_with_resource() {
        let err = run_args(&["--simulate", "--resource", "COM3"])
            .err()
            .unwrap();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
        assert!(run_args(&["--simulate"]).is_ok());
        assert!(run_args(&["--resource", "COM3"]).is_ok());
    }

    #[test]
    fn test_interval_flag_below_floor_rejected() {
        assert!(run_args(&["--interval-ms", "5"]).is_err());
        assert_eq!(
            run_args(&["--interval-ms", "10"]).unwrap().interval_ms,
            Some(10)
        );
    }

    #[test]
    fn test_persisted_short_interval_still_runs() {
        let mut settings = Settings {
            simulation_mode: true,
            update_interval_ms: 1,
            ..Settings::default()
        };
        apply_overrides(&mut settings, &run_args(&[]).unwrap()).unwrap();
        assert!(settings.validate().is_ok());
        assert!(settings.snapshot().interval_was_clamped());
    }

    #[test]
    fn test_resource_override_leaves_simulation() {
        let mut settings = Settings {
            simulation_mode: true,
            ..Settings::default()
        };
        apply_overrides(&mut settings, &run_args(&["--resource", "COM3"]).unwrap()).unwrap();
        assert!(!settings.simulation_mode);
        assert_eq!(settings.resource_name, "COM3");
    }
}
