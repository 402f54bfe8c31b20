//! Simulated power supply.
//!
//! Models a cell that draws a linearly decaying current at a fixed voltage:
//!
//! ```text
//! I(t) = max(0, I_set - decay_rate * t + noise_i)
//! V(t) = V_set + noise_v
//! ```
//!
//! With the defaults a 0.5 A run falls under a 0.062 A threshold after about
//! nine seconds.

use crate::config::SimulationSettings;
use crate::core::{RunConfig, Sample};
use crate::error::{ConfigError, ConnectError, ReadError};
use crate::instrument::PowerSupply;
use async_trait::async_trait;
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Source of measurement noise.
pub trait NoiseSource: Send {
    /// A value in `[-amplitude, amplitude]`.
    fn next(&mut self, amplitude: f64) -> f64;
}

/// Uniformly distributed noise.
pub struct UniformNoise {
    rng: StdRng,
}

impl UniformNoise {
    /// Seeded from OS entropy.
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Reproducible sequence.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for UniformNoise {
    fn default() -> Self {
        Self::new()
    }
}

impl NoiseSource for UniformNoise {
    fn next(&mut self, amplitude: f64) -> f64 {
        let a = amplitude.abs();
        if !a.is_normal() {
            return 0.0;
        }
        self.rng.gen_range(-a..=a)
    }
}

/// Always returns the same fraction of the amplitude.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedNoise {
    /// Fraction in `[-1, 1]`.
    pub fraction: f64,
}

impl FixedNoise {
    /// No noise at all.
    pub fn zero() -> Self {
        Self { fraction: 0.0 }
    }
}

impl NoiseSource for FixedNoise {
    fn next(&mut self, amplitude: f64) -> f64 {
        self.fraction.clamp(-1.0, 1.0) * amplitude.abs()
    }
}

/// In-process supply whose current falls linearly at `decay_rate` amps per
/// second from the programmed limit, never below zero.
///
/// Voltage reads back the programmed target plus noise. With the output off
/// both channels read zero.
pub struct SimulatedSupply {
    params: SimulationSettings,
    noise: Box<dyn NoiseSource>,
    target_voltage: f64,
    target_current: f64,
    connected: bool,
    output_on: Arc<AtomicBool>,
}

impl SimulatedSupply {
    /// Simulated supply with uniform noise.
    pub fn new(params: SimulationSettings) -> Self {
        Self::with_noise(params, Box::new(UniformNoise::new()))
    }

    /// Simulated supply with a caller-chosen noise source.
    pub fn with_noise(params: SimulationSettings, noise: Box<dyn NoiseSource>) -> Self {
        Self {
            params,
            noise,
            target_voltage: 0.0,
            target_current: 0.0,
            connected: false,
            output_on: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether the output is currently switched on.
    pub fn output_enabled(&self) -> bool {
        self.output_on.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PowerSupply for SimulatedSupply {
    fn name(&self) -> String {
        "Simulated supply".to_string()
    }

    async fn connect(&mut self) -> Result<String, ConnectError> {
        self.connected = true;
        Ok("SIMULATED,PSU,0,1.0".to_string())
    }

    async fn configure(&mut self, config: &RunConfig) -> Result<(), ConfigError> {
        self.target_voltage = config.target_voltage;
        self.target_current = config.target_current;
        self.output_on.store(true, Ordering::SeqCst);
        debug!(
            "Simulated output on: {} V, {} A",
            self.target_voltage, self.target_current
        );
        Ok(())
    }

    async fn read_sample(&mut self, elapsed_seconds: f64) -> Result<Sample, ReadError> {
        if !self.output_enabled() {
            return Ok(Sample::from_measurement(elapsed_seconds, 0.0, 0.0));
        }
        let noise_i = self.noise.next(self.params.current_noise);
        let noise_v = self.noise.next(self.params.voltage_noise);
        let current =
            (self.target_current - self.params.decay_rate * elapsed_seconds + noise_i).max(0.0);
        let voltage = self.target_voltage + noise_v;
        Ok(Sample::from_measurement(elapsed_seconds, voltage, current))
    }

    async fn force_off(&mut self) -> bool {
        self.output_on.store(false, Ordering::SeqCst);
        true
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    fn safety_handle(&self) -> Box<dyn PowerSupply> {
        Box::new(SimulatedSupply {
            params: self.params,
            noise: Box::new(FixedNoise::zero()),
            target_voltage: self.target_voltage,
            target_current: self.target_current,
            connected: self.connected,
            output_on: self.output_on.clone(),
        })
    }
}
