//! The acquisition worker: connect, arm, sample, stop.
//!
//! One [`AcquisitionLoop`] drives one run from start to finish. It owns the
//! supply handle, appends every sample to the run's [`SampleLog`], hands a copy
//! to the display through the [`SampleProducer`] and checks the stop
//! conditions after each measurement.
//!
//! # Phases
//!
//! ```text
//! Idle -> Connecting -> Configuring -> Running -> Stopping -> Idle
//!             \              \             \          \
//!              +--------------+-------------+----------> Failed
//! ```
//!
//! The Stopping phase always runs, exactly once, however the run ended
//! (auto-stop, operator stop, instrument fault or a panic inside a tick). It
//! makes sure the output is off and the connection is released.

use crate::alert::{alert_for, Alert};
use crate::core::{
    RunConfig, RunPhase, Sample, StopReason, SETTLING_TIME_S, ZERO_OUTPUT_DELAY_S,
};
use crate::data::buffer::{SampleLog, SampleProducer};
use crate::instrument::PowerSupply;
use crate::messages::StatusReporter;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

#[derive(Debug, Default)]
struct StopFlagInner {
    requested: AtomicBool,
    notify: Notify,
}

/// Cooperative cancellation shared between the controller and the worker.
#[derive(Debug, Clone, Default)]
pub struct StopFlag {
    inner: Arc<StopFlagInner>,
}

impl StopFlag {
    /// A flag with no stop requested.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the worker to stop after its current tick.
    pub fn request(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        self.inner.notify.notify_one();
    }

    /// True once [`StopFlag::request`] has been called on any clone.
    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Resolves once a stop has been requested.
    pub async fn wait(&self) {
        while !self.is_requested() {
            self.inner.notify.notified().await;
        }
    }
}

/// What the worker reports when it exits.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    /// Why the run ended.
    pub stop_reason: StopReason,
    /// `Failed` if the run ended on an error, otherwise `Idle`.
    pub final_phase: RunPhase,
    /// Samples in the run's log.
    pub samples_recorded: usize,
    /// False only if the output may still be energized.
    pub output_off: bool,
}

/// Decide whether `sample` ends the run.
///
/// Zero output is checked first so that a tripped supply stops the run even
/// when the threshold would never fire. Both checks wait for the settling time.
pub fn evaluate_stop(config: &RunConfig, sample: &Sample) -> Option<StopReason> {
    if sample.elapsed_seconds > ZERO_OUTPUT_DELAY_S && sample.is_zero_output() {
        return Some(StopReason::ZeroOutput);
    }
    if sample.elapsed_seconds > SETTLING_TIME_S {
        let monitored = config.monitored_value(sample);
        if config.stop_comparison.is_triggered(monitored, config.threshold) {
            return Some(StopReason::ThresholdCrossed {
                quantity: config.mode.monitored_quantity(),
                monitored,
                threshold: config.threshold,
                comparison: config.stop_comparison,
            });
        }
    }
    None
}

#[derive(Debug, Default)]
struct OutputState {
    /// Configuration was attempted, so the output may be on.
    engaged: bool,
    /// A switch-off command was acknowledged.
    confirmed_off: bool,
}

/// One run's acquisition worker.
pub struct AcquisitionLoop {
    config: Arc<RunConfig>,
    supply: Box<dyn PowerSupply>,
    log: SampleLog,
    producer: SampleProducer,
    stop: StopFlag,
    status: StatusReporter,
    alert: Box<dyn Alert>,
    phase: watch::Sender<RunPhase>,
}

impl AcquisitionLoop {
    /// Build a worker for one run.
    ///
    /// The alert follows `config.beep_on_stop` and status goes to the log
    /// until [`AcquisitionLoop::with_status`] replaces it. Nothing touches the
    /// supply before [`AcquisitionLoop::run`].
    pub fn new(
        config: Arc<RunConfig>,
        supply: Box<dyn PowerSupply>,
        producer: SampleProducer,
    ) -> Self {
        let alert = alert_for(config.beep_on_stop);
        let (phase, _) = watch::channel(RunPhase::Idle);
        Self {
            config,
            supply,
            log: SampleLog::new(),
            producer,
            stop: StopFlag::new(),
            status: StatusReporter::log_only(),
            alert,
            phase,
        }
    }

    /// Route status events to `status` as well as the log.
    pub fn with_status(mut self, status: StatusReporter) -> Self {
        self.status = status;
        self
    }

    /// Replace the operator cue played on auto-stop.
    pub fn with_alert(mut self, alert: Box<dyn Alert>) -> Self {
        self.alert = alert;
        self
    }

    /// Handle on this run's sample log.
    pub fn sample_log(&self) -> SampleLog {
        self.log.clone()
    }

    /// Flag that asks this worker to stop.
    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    /// Subscribe to phase changes.
    pub fn phase(&self) -> watch::Receiver<RunPhase> {
        self.phase.subscribe()
    }

    fn set_phase(&self, phase: RunPhase) {
        log::debug!("Acquisition phase: {}", phase);
        self.phase.send_replace(phase);
    }

    /// Run to completion.
    pub async fn run(mut self) -> RunOutcome {
        let mut output = OutputState::default();

        let stop_reason = match AssertUnwindSafe(self.drive(&mut output))
            .catch_unwind()
            .await
        {
            Ok(reason) => reason,
            Err(_) => {
                self.status.error("Acquisition worker panicked; shutting the output down");
                StopReason::WorkerPanicked
            }
        };

        self.set_phase(RunPhase::Stopping);
        if output.engaged && !output.confirmed_off {
            output.confirmed_off = self.supply.force_off().await;
        }
        self.supply.disconnect().await;

        if output.engaged {
            if output.confirmed_off {
                self.status.success("Power supply output de-energized");
            } else {
                self.status.error(format!(
                    "Could not confirm that {} is off. Switch the output off manually.",
                    self.supply.name()
                ));
            }
        }

        let final_phase = if stop_reason.is_failure() {
            RunPhase::Failed
        } else {
            RunPhase::Idle
        };
        self.set_phase(final_phase);

        let outcome = RunOutcome {
            stop_reason,
            final_phase,
            samples_recorded: self.log.len(),
            output_off: !output.engaged || output.confirmed_off,
        };
        self.status.worker_finished();
        outcome
    }

    async fn drive(&mut self, output: &mut OutputState) -> StopReason {
        self.set_phase(RunPhase::Connecting);
        self.status
            .info(format!("Connecting to {}...", self.supply.name()));
        match self.supply.connect().await {
            Ok(identity) => self.status.success(format!("Connected: {}", identity)),
            Err(e) => {
                self.status.error(format!("Connection failed: {}", e));
                return StopReason::ConnectFailed(e.to_string());
            }
        }
        if self.stop.is_requested() {
            return StopReason::UserRequested;
        }

        self.set_phase(RunPhase::Configuring);
        output.engaged = true;
        if let Err(e) = self.supply.configure(&self.config).await {
            self.status.error(format!("Failed to configure instrument: {}", e));
            return StopReason::ConfigureFailed(e.to_string());
        }
        let cfg = &self.config;
        self.status.info(format!(
            "Output on: {} V, {} A ({} mode). Stopping when {} goes {} {}.",
            cfg.target_voltage,
            cfg.target_current,
            cfg.mode,
            cfg.mode.monitored_quantity(),
            cfg.stop_comparison,
            cfg.threshold
        ));

        self.set_phase(RunPhase::Running);
        if cfg.interval_was_clamped() {
            self.status.warning(format!(
                "Update interval {} ms is below the minimum; using {} ms",
                cfg.interval_ms,
                cfg.effective_interval().as_millis()
            ));
        }
        self.sample_loop(output).await
    }

    async fn sample_loop(&mut self, output: &mut OutputState) -> StopReason {
        let interval = self.config.effective_interval();
        let start = Instant::now();

        loop {
            if self.stop.is_requested() {
                return StopReason::UserRequested;
            }

            let tick_start = Instant::now();
            let elapsed = tick_start.duration_since(start).as_secs_f64();

            match self.supply.read_sample(elapsed).await {
                Ok(sample) => {
                    self.log.append(sample);
                    self.producer.push(sample);

                    if let Some(reason) = evaluate_stop(&self.config, &sample) {
                        output.confirmed_off = self.supply.force_off().await;
                        self.alert.notify();
                        self.status.auto_stop(reason.clone());
                        return reason;
                    }
                }
                Err(e) if e.is_recoverable() => {
                    self.status.warning(format!("Skipping sample at {:.2} s: {}", elapsed, e));
                }
                Err(e) => {
                    self.status.error(format!("Lost contact with instrument: {}", e));
                    return StopReason::InstrumentFault(e.to_string());
                }
            }

            let remaining = interval.saturating_sub(tick_start.elapsed());
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                _ = self.stop.wait() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{OperationMode, StopComparison};

    fn at(t: f64, v: f64, i: f64) -> Sample {
        Sample::from_measurement(t, v, i)
    }

    #[test]
    fn test_threshold_waits_for_settling() {
        let cfg = RunConfig::default();
        assert_eq!(evaluate_stop(&cfg, &at(0.4, 4.0, 0.01)), None);
        assert_eq!(evaluate_stop(&cfg, &at(1.0, 4.0, 0.01)), None);
        assert!(matches!(
            evaluate_stop(&cfg, &at(1.2, 4.0, 0.01)),
            Some(StopReason::ThresholdCrossed { quantity: "current", .. })
        ));
    }

    #[test]
    fn test_cv_uses_current_magnitude() {
        let cfg = RunConfig::default();
        assert_eq!(evaluate_stop(&cfg, &at(3.0, 4.0, -0.3)), None);
        assert!(evaluate_stop(&cfg, &at(3.0, 4.0, -0.05)).is_some());
    }

    #[test]
    fn test_cc_above_watches_voltage() {
        let cfg = RunConfig {
            mode: OperationMode::ConstantCurrent,
            stop_comparison: StopComparison::Above,
            threshold: 4.2,
            ..RunConfig::default()
        };
        assert_eq!(evaluate_stop(&cfg, &at(5.0, 4.1, 0.5)), None);
        assert!(matches!(
            evaluate_stop(&cfg, &at(5.0, 4.25, 0.5)),
            Some(StopReason::ThresholdCrossed { quantity: "voltage", .. })
        ));
    }

    #[test]
    fn test_zero_output_takes_priority() {
        let cfg = RunConfig {
            mode: OperationMode::ConstantCurrent,
            stop_comparison: StopComparison::Above,
            threshold: 4.2,
            ..RunConfig::default()
        };
        assert_eq!(evaluate_stop(&cfg, &at(1.0, 0.0, 0.0)), None);
        assert_eq!(
            evaluate_stop(&cfg, &at(1.01, 0.0, 0.0)),
            Some(StopReason::ZeroOutput)
        );

        // A CV/Below threshold would also fire here; zero output wins.
        let cv = RunConfig::default();
        assert_eq!(
            evaluate_stop(&cv, &at(2.0, 0.0, 0.0)),
            Some(StopReason::ZeroOutput)
        );
    }

    #[tokio::test]
    async fn test_stop_flag_wakes_waiter() {
        let flag = StopFlag::new();
        let waiter = flag.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        flag.request();
        handle.await.unwrap();
        assert!(flag.is_requested());
        // Already requested: returns immediately.
        flag.wait().await;
    }
}
