//! Message types for actor-based communication
//!
//! This module defines the commands sent to the [`crate::app_actor::ControllerActor`]
//! and the status events the controller and its acquisition worker publish
//! back to the operator interface.

use crate::core::{FormatKind, RunConfig, RunPhase, StopReason};
use crate::data::buffer::SampleConsumer;
use crate::error::{ExportError, StartError, StopError};
use log::{debug, error, info, warn};
use std::fmt;
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};

/// Importance of a status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Diagnostic detail.
    Debug,
    /// Routine progress.
    Info,
    /// An operation completed.
    Success,
    /// Something the operator should check.
    Warning,
    /// An operation failed.
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Success => "SUCCESS",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Events published to the operator interface.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    /// Free-form progress or diagnostic text.
    Message { severity: Severity, text: String },
    /// A stop condition fired. The output has already been switched off.
    AutoStopTriggered { reason: StopReason },
    /// The acquisition worker has exited and released the instrument.
    WorkerFinished,
}

/// Sending half for status events. Every event is mirrored to the log.
#[derive(Clone)]
pub struct StatusReporter {
    tx: mpsc::UnboundedSender<StatusEvent>,
}

impl StatusReporter {
    /// Report into `tx`. Events are dropped silently once the receiver is gone.
    pub fn new(tx: mpsc::UnboundedSender<StatusEvent>) -> Self {
        Self { tx }
    }

    /// A reporter whose events only reach the log.
    pub fn log_only() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    /// Log `text` at the level matching `severity` and forward it.
    pub fn message(&self, severity: Severity, text: impl Into<String>) {
        let text = text.into();
        match severity {
            Severity::Debug => debug!("{}", text),
            Severity::Info | Severity::Success => info!("{}", text),
            Severity::Warning => warn!("{}", text),
            Severity::Error => error!("{}", text),
        }
        let _ = self.tx.send(StatusEvent::Message { severity, text });
    }

    /// Shorthand for [`Severity::Debug`].
    pub fn debug(&self, text: impl Into<String>) {
        self.message(Severity::Debug, text);
    }

    /// Shorthand for [`Severity::Info`].
    pub fn info(&self, text: impl Into<String>) {
        self.message(Severity::Info, text);
    }

    /// Shorthand for [`Severity::Success`].
    pub fn success(&self, text: impl Into<String>) {
        self.message(Severity::Success, text);
    }

    /// Shorthand for [`Severity::Warning`].
    pub fn warning(&self, text: impl Into<String>) {
        self.message(Severity::Warning, text);
    }

    /// Shorthand for [`Severity::Error`].
    pub fn error(&self, text: impl Into<String>) {
        self.message(Severity::Error, text);
    }

    /// Announce that a stop condition ended the run.
    pub fn auto_stop(&self, reason: StopReason) {
        warn!("Auto-stop triggered: {}", reason);
        let _ = self.tx.send(StatusEvent::AutoStopTriggered { reason });
    }

    /// Sent once per run, after the Stopping sequence.
    pub fn worker_finished(&self) {
        debug!("Acquisition worker finished");
        let _ = self.tx.send(StatusEvent::WorkerFinished);
    }
}

/// Outcome of one export format.
#[derive(Debug)]
pub struct ExportRecord {
    /// Format attempted.
    pub format: FormatKind,
    /// Path written, or why nothing was.
    pub result: Result<PathBuf, ExportError>,
}

/// Everything known about a run once it has been stopped.
#[derive(Debug)]
pub struct RunReport {
    /// Why the run ended.
    pub stop_reason: StopReason,
    /// Number of samples in the run's log.
    pub samples: usize,
    /// One entry per attempted format.
    pub exports: Vec<ExportRecord>,
    /// True if the output was confirmed off.
    pub de_energized: bool,
}

/// Snapshot of the controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerStatus {
    /// A run has started and not yet been stopped.
    pub active: bool,
    /// Worker phase, `Idle` without a run.
    pub phase: RunPhase,
}

/// Commands that can be sent to the ControllerActor
#[derive(Debug)]
pub enum ControllerCommand {
    /// Start a run with a frozen configuration
    Start {
        config: RunConfig,
        response: oneshot::Sender<Result<SampleConsumer, StartError>>,
    },

    /// Stop the active run, export it, and report
    Stop {
        notes: Option<String>,
        response: oneshot::Sender<Result<RunReport, StopError>>,
    },

    /// Query whether a run is active and its phase
    Status {
        response: oneshot::Sender<ControllerStatus>,
    },

    /// Stop any active run and exit the actor loop
    Shutdown {
        response: oneshot::Sender<Option<RunReport>>,
    },
}

impl ControllerCommand {
    /// Helper to create a Start command
    pub fn start(
        config: RunConfig,
    ) -> (Self, oneshot::Receiver<Result<SampleConsumer, StartError>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Start {
                config,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a Stop command
    pub fn stop(notes: Option<String>) -> (Self, oneshot::Receiver<Result<RunReport, StopError>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Stop { notes, response: tx }, rx)
    }

    /// Helper to create a Status command
    pub fn status() -> (Self, oneshot::Receiver<ControllerStatus>) {
        let (tx, rx) = oneshot::channel();
        (Self::Status { response: tx }, rx)
    }

    /// Helper to create a Shutdown command
    pub fn shutdown() -> (Self, oneshot::Receiver<Option<RunReport>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}
