//! Actor-based run controller
//!
//! [`RunController`] owns at most one acquisition worker. It starts runs from a
//! frozen [`RunConfig`], stops them with a bounded join, de-energizes the
//! supply through a safety handle if the worker hangs, and exports the run's
//! samples once the worker is gone.
//!
//! [`ControllerActor`] wraps the controller in a single async task that
//! processes [`ControllerCommand`]s sequentially, so start and stop requests
//! from different places never interleave. [`ControllerHandle`] is the
//! client side.

use crate::acquisition::{AcquisitionLoop, RunOutcome, StopFlag};
use crate::core::{RunConfig, RunPhase, StopReason};
use crate::data::buffer::{sample_channel, SampleConsumer, SampleLog};
use crate::data::storage::{base_path_stem, ExportPipeline};
use crate::error::{ExportError, StartError, StopError};
use crate::instrument::{open_supply, PowerSupply};
use crate::messages::{ControllerCommand, ControllerStatus, ExportRecord, RunReport, StatusReporter};
use chrono::Local;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

/// Bookkeeping for the run in progress.
struct ActiveRun {
    task: JoinHandle<RunOutcome>,
    stop: StopFlag,
    log: SampleLog,
    safety: Box<dyn PowerSupply>,
    phase: watch::Receiver<RunPhase>,
    config: Arc<RunConfig>,
}

/// Starts, stops and exports runs. At most one run is active at a time.
pub struct RunController {
    status: StatusReporter,
    active: Option<ActiveRun>,
    shutting_down: bool,
}

impl RunController {
    /// An idle controller reporting through `status`.
    pub fn new(status: StatusReporter) -> Self {
        Self {
            status,
            active: None,
            shutting_down: false,
        }
    }

    /// True from a successful `start` until the matching `stop` returns.
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Current worker phase, `Idle` when no run is active.
    pub fn phase(&self) -> RunPhase {
        self.active
            .as_ref()
            .map(|run| *run.phase.borrow())
            .unwrap_or(RunPhase::Idle)
    }

    /// True once the active worker has exited on its own.
    pub fn worker_exited(&self) -> bool {
        self.active
            .as_ref()
            .map(|run| run.task.is_finished())
            .unwrap_or(false)
    }

    /// Start a run on the instrument named by `config`.
    pub fn start(&mut self, config: RunConfig) -> Result<SampleConsumer, StartError> {
        self.check_can_start()?;
        let supply = open_supply(&config).map_err(|e| {
            self.status.error(format!("Cannot open instrument: {}", e));
            StartError::Instrument(e)
        })?;
        self.start_with_supply(config, supply)
    }

    /// Start a run on an already constructed supply.
    pub fn start_with_supply(
        &mut self,
        config: RunConfig,
        supply: Box<dyn PowerSupply>,
    ) -> Result<SampleConsumer, StartError> {
        self.check_can_start()?;

        let config = Arc::new(config);
        let safety = supply.safety_handle();
        let (producer, consumer) = sample_channel();
        let worker = AcquisitionLoop::new(config.clone(), supply, producer)
            .with_status(self.status.clone());

        let log = worker.sample_log();
        let stop = worker.stop_flag();
        let phase = worker.phase();
        let task = tokio::spawn(worker.run());

        info!("Run started on {}", config.instrument);
        self.active = Some(ActiveRun {
            task,
            stop,
            log,
            safety,
            phase,
            config,
        });
        Ok(consumer)
    }

    fn check_can_start(&self) -> Result<(), StartError> {
        if self.shutting_down {
            return Err(StartError::ShuttingDown);
        }
        if self.active.is_some() {
            return Err(StartError::AlreadyRunning);
        }
        Ok(())
    }

    /// Stop the active run, wait for the worker, export and report.
    ///
    /// `notes` replaces the notes captured when the run started.
    pub async fn stop(&mut self, notes: Option<String>) -> Result<RunReport, StopError> {
        let run = self.active.take().ok_or(StopError::NotRunning)?;
        run.stop.request();

        let join_timeout = Duration::from_millis(run.config.timeouts.join_timeout_ms);
        let mut task = run.task;
        let mut safety = run.safety;

        // Wait for graceful shutdown
        let (stop_reason, de_energized) = match tokio::time::timeout(join_timeout, &mut task).await
        {
            Ok(Ok(outcome)) => {
                info!(
                    "Acquisition worker stopped ({}), {} samples",
                    outcome.stop_reason, outcome.samples_recorded
                );
                (outcome.stop_reason, outcome.output_off)
            }
            Ok(Err(e)) => {
                warn!("Acquisition worker failed during shutdown: {}", e);
                let off = safety_shutdown(&self.status, safety.as_mut(), &run.config).await;
                (StopReason::WorkerPanicked, off)
            }
            Err(_) => {
                warn!(
                    "Acquisition worker did not stop within {:?}, aborting",
                    join_timeout
                );
                task.abort();
                // The worker may be mid-tick on another thread; let it unwind
                // before its log is taken.
                let _ = (&mut task).await;
                let off = safety_shutdown(&self.status, safety.as_mut(), &run.config).await;
                (StopReason::Abandoned, off)
            }
        };

        let samples = run.log.take();
        let sample_count = samples.len();
        let notes = notes.unwrap_or_else(|| run.config.notes.clone());
        let exports = export_run(&self.status, run.config.clone(), samples, notes).await;

        self.status.info(format!("Run ended: {}", stop_reason));
        Ok(RunReport {
            stop_reason,
            samples: sample_count,
            exports,
            de_energized,
        })
    }

    /// Refuse new runs and stop the active one, if any.
    pub async fn shutdown(&mut self) -> Option<RunReport> {
        self.shutting_down = true;
        if self.active.is_none() {
            return None;
        }
        self.stop(None).await.ok()
    }
}

/// Switch the output off through the safety handle, bounded by the I/O timeout.
async fn safety_shutdown(
    status: &StatusReporter,
    safety: &mut dyn PowerSupply,
    config: &RunConfig,
) -> bool {
    let io_timeout = Duration::from_millis(config.timeouts.io_timeout_ms);
    let off = tokio::time::timeout(io_timeout, safety.force_off())
        .await
        .unwrap_or(false);
    if tokio::time::timeout(io_timeout, safety.disconnect())
        .await
        .is_err()
    {
        warn!("Safety disconnect timed out after {:?}", io_timeout);
    }
    if off {
        status
            .warning("Worker was unresponsive; output switched off through the safety connection");
    } else {
        status.error(
            "Worker was unresponsive and the output could not be switched off. Switch it off manually.",
        );
    }
    off
}

async fn export_run(
    status: &StatusReporter,
    config: Arc<RunConfig>,
    samples: Vec<crate::core::Sample>,
    notes: String,
) -> Vec<ExportRecord> {
    if samples.is_empty() {
        status.info("No data recorded; nothing to export.");
        return Vec::new();
    }

    let reporter = status.clone();
    let formats = config.export.formats();
    let task = tokio::task::spawn_blocking(move || {
        let stem = base_path_stem(&config, Local::now())?;
        if stem.fell_back {
            reporter.warning(format!(
                "No save location set; saving to {}",
                stem.path
                    .parent()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
            ));
        }
        Ok::<_, ExportError>(ExportPipeline::export(&stem.path, &samples, &config, &notes))
    });

    let results = match task.await {
        Ok(Ok(results)) => results,
        Ok(Err(e)) => {
            let message = e.to_string();
            formats
                .into_iter()
                .map(|kind| (kind, Err(ExportError::Location(message.clone()))))
                .collect()
        }
        Err(e) => {
            status.error(format!("Export task panicked: {}", e));
            return Vec::new();
        }
    };

    results
        .into_iter()
        .map(|(format, result)| {
            match &result {
                Ok(path) => status
                    .success(format!("{} data saved to {}", format.label(), path.display())),
                Err(e @ ExportError::FormatUnavailable(_)) => status.warning(e.to_string()),
                Err(e) => status
                    .error(format!("{} export failed: {}", format.label(), e)),
            }
            ExportRecord { format, result }
        })
        .collect()
}

/// Actor that owns the [`RunController`]
pub struct ControllerActor {
    controller: RunController,
}

impl ControllerActor {
    /// Create the actor; call [`ControllerActor::run`] to process commands.
    pub fn new(status: StatusReporter) -> Self {
        Self {
            controller: RunController::new(status),
        }
    }

    /// Runs the actor event loop, processing commands until shutdown
    pub async fn run(mut self, mut command_rx: mpsc::Receiver<ControllerCommand>) {
        info!("ControllerActor started");

        while let Some(command) = command_rx.recv().await {
            match command {
                ControllerCommand::Start { config, response } => {
                    let result = self.controller.start(config);
                    let _ = response.send(result);
                }

                ControllerCommand::Stop { notes, response } => {
                    let result = self.controller.stop(notes).await;
                    let _ = response.send(result);
                }

                ControllerCommand::Status { response } => {
                    let _ = response.send(ControllerStatus {
                        active: self.controller.is_active(),
                        phase: self.controller.phase(),
                    });
                }

                ControllerCommand::Shutdown { response } => {
                    info!("Shutdown command received");
                    let report = self.controller.shutdown().await;
                    let _ = response.send(report);
                    break; // Exit event loop
                }
            }
        }

        // Channel closed without an explicit shutdown
        if self.controller.is_active() {
            let _ = self.controller.shutdown().await;
        }
        info!("ControllerActor shutting down");
    }
}

/// Client side of a running [`ControllerActor`].
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<ControllerCommand>,
}

impl ControllerHandle {
    /// Spawn a controller actor on the current runtime.
    pub fn spawn(status: StatusReporter) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(32);
        let task = tokio::spawn(ControllerActor::new(status).run(rx));
        (Self { tx }, task)
    }

    /// Start a run. The returned consumer receives every logged sample.
    pub async fn start(&self, config: RunConfig) -> Result<SampleConsumer, StartError> {
        let (cmd, rx) = ControllerCommand::start(config);
        if self.tx.send(cmd).await.is_err() {
            return Err(StartError::ShuttingDown);
        }
        rx.await.unwrap_or(Err(StartError::ShuttingDown))
    }

    /// Stop the active run and export it.
    ///
    /// `Some(notes)` replaces the notes captured at start.
    pub async fn stop(&self, notes: Option<String>) -> Result<RunReport, StopError> {
        let (cmd, rx) = ControllerCommand::stop(notes);
        if self.tx.send(cmd).await.is_err() {
            return Err(StopError::ControllerUnavailable);
        }
        rx.await.unwrap_or(Err(StopError::ControllerUnavailable))
    }

    /// `None` once the actor has exited.
    pub async fn status(&self) -> Option<ControllerStatus> {
        let (cmd, rx) = ControllerCommand::status();
        self.tx.send(cmd).await.ok()?;
        rx.await.ok()
    }

    /// Stop any active run and end the actor. Returns that run's report.
    pub async fn shutdown(&self) -> Option<RunReport> {
        let (cmd, rx) = ControllerCommand::shutdown();
        self.tx.send(cmd).await.ok()?;
        rx.await.ok().flatten()
    }
}
