//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use psu_stopper::adapters::MockAdapter;
use psu_stopper::config::TimeoutSettings;
use psu_stopper::core::{InstrumentSelection, RunConfig, Sample};
use psu_stopper::error::{ConfigError, ConnectError, ReadError};
use psu_stopper::instrument::{CommandSet, PowerSupply, ScpiSupply};
use psu_stopper::messages::{Severity, StatusEvent, StatusReporter};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

pub const MEAS_VOLT: &str = ":MEAS:VOLT? CH1";
pub const MEAS_CURR: &str = ":MEAS:CURR? CH1";
pub const OUTPUT_OFF: &str = "write :OUTP CH1,OFF";

/// A DP832 answering identity and measurement queries with fixed values.
pub fn rigol_mock(volts: &str, amps: &str) -> MockAdapter {
    MockAdapter::new()
        .with_reply("*IDN?", "RIGOL TECHNOLOGIES,DP832,DP8A0001,00.01.14")
        .with_reply(MEAS_VOLT, volts)
        .with_reply(MEAS_CURR, amps)
}

pub fn scpi_supply(adapter: &MockAdapter, timeouts: TimeoutSettings) -> Box<dyn PowerSupply> {
    Box::new(ScpiSupply::new(
        adapter.clone(),
        CommandSet::rigol_dp800(),
        &timeouts,
    ))
}

/// Simulated CV run with no noise, writing into `dir`.
pub fn sim_config(dir: &Path) -> RunConfig {
    let mut config = RunConfig {
        instrument: InstrumentSelection::Simulated,
        save_location: dir.to_path_buf(),
        beep_on_stop: false,
        ..RunConfig::default()
    };
    config.simulation.current_noise = 0.0;
    config
}

/// Status reporter plus the receiving end of its events.
pub fn status_channel() -> (StatusReporter, mpsc::UnboundedReceiver<StatusEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (StatusReporter::new(tx), rx)
}

/// Everything queued on `rx` right now.
pub fn drain_events(rx: &mut mpsc::UnboundedReceiver<StatusEvent>) -> Vec<StatusEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Message texts of the given severity.
pub fn messages(events: &[StatusEvent], wanted: Severity) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            StatusEvent::Message { severity, text } if *severity == wanted => Some(text.clone()),
            _ => None,
        })
        .collect()
}

/// Call counters for [`PanickingSupply`].
#[derive(Debug, Default)]
pub struct Calls {
    pub force_off: AtomicUsize,
    pub disconnect: AtomicUsize,
}

impl Calls {
    pub fn force_off(&self) -> usize {
        self.force_off.load(Ordering::SeqCst)
    }

    pub fn disconnect(&self) -> usize {
        self.disconnect.load(Ordering::SeqCst)
    }
}

/// Supply whose `read_sample` panics on the given tick.
pub struct PanickingSupply {
    pub calls: Arc<Calls>,
    pub panic_on_read: usize,
    reads: usize,
}

impl PanickingSupply {
    pub fn new(panic_on_read: usize) -> Self {
        Self {
            calls: Arc::new(Calls::default()),
            panic_on_read,
            reads: 0,
        }
    }
}

#[async_trait]
impl PowerSupply for PanickingSupply {
    fn name(&self) -> String {
        "panicking".to_string()
    }

    async fn connect(&mut self) -> Result<String, ConnectError> {
        Ok("TEST,PANIC,0,0".to_string())
    }

    async fn configure(&mut self, _config: &RunConfig) -> Result<(), ConfigError> {
        Ok(())
    }

    async fn read_sample(&mut self, elapsed_seconds: f64) -> Result<Sample, ReadError> {
        self.reads += 1;
        if self.reads == self.panic_on_read {
            panic!("measurement driver blew up");
        }
        Ok(Sample::from_measurement(elapsed_seconds, 4.0, 0.4))
    }

    async fn force_off(&mut self) -> bool {
        self.calls.force_off.fetch_add(1, Ordering::SeqCst);
        true
    }

    async fn disconnect(&mut self) {
        self.calls.disconnect.fetch_add(1, Ordering::SeqCst);
    }

    fn safety_handle(&self) -> Box<dyn PowerSupply> {
        Box::new(PanickingSupply {
            calls: self.calls.clone(),
            panic_on_read: 0,
            reads: 0,
        })
    }
}

/// Supply whose measurements never complete.
///
/// `dropped` is set when the primary handle is dropped, so tests can tell
/// whether an aborted worker has really finished. Safety handles do not
/// report their own drop.
pub struct HangingSupply {
    pub calls: Arc<Calls>,
    pub dropped: Arc<AtomicBool>,
    tracks_drop: bool,
}

impl HangingSupply {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Calls::default()),
            dropped: Arc::new(AtomicBool::new(false)),
            tracks_drop: true,
        }
    }

    pub fn was_dropped(flag: &AtomicBool) -> bool {
        flag.load(Ordering::SeqCst)
    }
}

impl Drop for HangingSupply {
    fn drop(&mut self) {
        if self.tracks_drop {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl PowerSupply for HangingSupply {
    fn name(&self) -> String {
        "hanging".to_string()
    }

    async fn connect(&mut self) -> Result<String, ConnectError> {
        Ok("TEST,HANG,0,0".to_string())
    }

    async fn configure(&mut self, _config: &RunConfig) -> Result<(), ConfigError> {
        Ok(())
    }

    async fn read_sample(&mut self, _elapsed_seconds: f64) -> Result<Sample, ReadError> {
        futures::future::pending().await
    }

    async fn force_off(&mut self) -> bool {
        self.calls.force_off.fetch_add(1, Ordering::SeqCst);
        true
    }

    async fn disconnect(&mut self) {
        self.calls.disconnect.fetch_add(1, Ordering::SeqCst);
    }

    fn safety_handle(&self) -> Box<dyn PowerSupply> {
        Box::new(HangingSupply {
            calls: self.calls.clone(),
            dropped: self.dropped.clone(),
            tracks_drop: false,
        })
    }
}
