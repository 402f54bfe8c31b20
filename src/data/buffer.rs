//! Sample buffering between the acquisition worker and its consumers.
//!
//! Three buffers with different lifetimes and owners:
//!
//! - [`sample_channel`]: unbounded handoff queue, worker to display
//! - [`SlidingWindow`]: fixed-capacity series for live plotting, owned by the display
//! - [`SampleLog`]: every sample of one run, the only source for export

use crate::core::{Sample, MIN_WINDOW_CAPACITY};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Create the worker-to-display handoff queue.
pub fn sample_channel() -> (SampleProducer, SampleConsumer) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SampleProducer { tx }, SampleConsumer { rx })
}

/// Worker side of the handoff queue.
#[derive(Debug, Clone)]
pub struct SampleProducer {
    tx: mpsc::UnboundedSender<Sample>,
}

impl SampleProducer {
    /// Never blocks. Samples pushed after the consumer is gone are dropped.
    pub fn push(&self, sample: Sample) {
        let _ = self.tx.send(sample);
    }
}

/// Display side of the handoff queue.
#[derive(Debug)]
pub struct SampleConsumer {
    rx: mpsc::UnboundedReceiver<Sample>,
}

impl SampleConsumer {
    /// Take at most one queued sample without waiting.
    pub fn drain_one(&mut self) -> Option<Sample> {
        self.rx.try_recv().ok()
    }

    /// Move up to `max` queued samples into `window`. Returns how many moved.
    pub fn drain_into(&mut self, window: &mut SlidingWindow, max: usize) -> usize {
        let mut moved = 0;
        while moved < max {
            match self.drain_one() {
                Some(sample) => {
                    window.append(&sample);
                    moved += 1;
                }
                None => break,
            }
        }
        moved
    }

    /// Wait for the next sample. `None` once the worker is gone and the queue is empty.
    pub async fn recv(&mut self) -> Option<Sample> {
        self.rx.recv().await
    }
}

/// Rolling per-quantity history for live display.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    capacity: usize,
    time: VecDeque<f64>,
    voltage: VecDeque<f64>,
    current: VecDeque<f64>,
    power: VecDeque<f64>,
    resistance: VecDeque<f64>,
}

impl SlidingWindow {
    /// Capacity is raised to at least [`MIN_WINDOW_CAPACITY`].
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_WINDOW_CAPACITY);
        Self {
            capacity,
            time: VecDeque::with_capacity(capacity),
            voltage: VecDeque::with_capacity(capacity),
            current: VecDeque::with_capacity(capacity),
            power: VecDeque::with_capacity(capacity),
            resistance: VecDeque::with_capacity(capacity),
        }
    }

    /// Maximum number of points kept.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Points currently held.
    pub fn len(&self) -> usize {
        self.check_lock_step();
        self.time.len()
    }

    /// True when [`len`](Self::len) is zero.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append one sample, evicting the oldest when full.
    pub fn append(&mut self, sample: &Sample) {
        if self.time.len() == self.capacity {
            self.time.pop_front();
            self.voltage.pop_front();
            self.current.pop_front();
            self.power.pop_front();
            self.resistance.pop_front();
        }
        self.time.push_back(sample.elapsed_seconds);
        self.voltage.push_back(sample.voltage);
        self.current.push_back(sample.current);
        self.power.push_back(sample.power);
        self.resistance.push_back(sample.resistance);
        self.check_lock_step();
    }

    /// Drop every point but keep the capacity.
    pub fn clear(&mut self) {
        self.time.clear();
        self.voltage.clear();
        self.current.clear();
        self.power.clear();
        self.resistance.clear();
    }

    /// Most recent sample, rebuilt from the series.
    pub fn latest(&self) -> Option<Sample> {
        Some(Sample {
            elapsed_seconds: *self.time.back()?,
            voltage: *self.voltage.back()?,
            current: *self.current.back()?,
            power: *self.power.back()?,
            resistance: *self.resistance.back()?,
        })
    }

    /// Elapsed seconds, oldest first. The other series line up with it.
    pub fn time(&self) -> &VecDeque<f64> {
        &self.time
    }

    /// Volts.
    pub fn voltage(&self) -> &VecDeque<f64> {
        &self.voltage
    }

    /// Amps.
    pub fn current(&self) -> &VecDeque<f64> {
        &self.current
    }

    /// Watts.
    pub fn power(&self) -> &VecDeque<f64> {
        &self.power
    }

    /// Ohms. Infinite where the current was effectively zero.
    pub fn resistance(&self) -> &VecDeque<f64> {
        &self.resistance
    }

    fn check_lock_step(&self) {
        let n = self.time.len();
        assert!(
            self.voltage.len() == n
                && self.current.len() == n
                && self.power.len() == n
                && self.resistance.len() == n,
            "sliding window series out of lock-step"
        );
    }
}

/// Append-only record of every sample in one run.
///
/// Cloning gives another handle to the same log. The worker appends; the
/// controller takes the contents once the worker has exited or been abandoned.
#[derive(Debug, Clone, Default)]
pub struct SampleLog {
    samples: Arc<Mutex<Vec<Sample>>>,
}

impl SampleLog {
    /// An empty log.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Sample>> {
        self.samples.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Record a sample. A poisoned lock is recovered rather than lost.
    pub fn append(&self, sample: Sample) {
        self.lock().push(sample);
    }

    /// Samples recorded so far.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when [`len`](Self::len) is zero.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return everything recorded so far.
    pub fn take(&self) -> Vec<Sample> {
        std::mem::take(&mut *self.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(t: f64) -> Sample {
        Sample::from_measurement(t, 4.0, 0.5 - t / 100.0)
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut window = SlidingWindow::new(10);
        for i in 0..15 {
            window.append(&sample(i as f64));
        }
        assert_eq!(window.len(), 10);
        assert_eq!(window.time().front(), Some(&5.0));
        assert_eq!(window.latest().unwrap().elapsed_seconds, 14.0);
        for series in [
            window.voltage(),
            window.current(),
            window.power(),
            window.resistance(),
        ] {
            assert_eq!(series.len(), 10);
        }
    }

    #[test]
    fn test_window_capacity_floor() {
        let mut window = SlidingWindow::new(3);
        assert_eq!(window.capacity(), MIN_WINDOW_CAPACITY);
        for i in 0..20 {
            window.append(&sample(i as f64));
        }
        assert_eq!(window.len(), MIN_WINDOW_CAPACITY);
        assert_eq!(SlidingWindow::new(250).capacity(), 250);
    }

    #[test]
    fn test_window_clear() {
        let mut window = SlidingWindow::new(10);
        window.append(&sample(0.0));
        window.clear();
        assert!(window.is_empty());
        assert!(window.latest().is_none());
    }

    #[test]
    #[should_panic(expected = "lock-step")]
    fn test_mismatched_series_panics() {
        let mut window = SlidingWindow::new(10);
        window.append(&sample(0.0));
        window.power.pop_back();
        window.len();
    }

    #[tokio::test]
    async fn test_channel_drains_one_at_a_time() {
        let (producer, mut consumer) = sample_channel();
        producer.push(sample(0.0));
        producer.push(sample(0.2));

        assert_eq!(consumer.drain_one().unwrap().elapsed_seconds, 0.0);
        assert_eq!(consumer.drain_one().unwrap().elapsed_seconds, 0.2);
        assert!(consumer.drain_one().is_none());
    }

    #[tokio::test]
    async fn test_drain_into_respects_limit() {
        let (producer, mut consumer) = sample_channel();
        for i in 0..5 {
            producer.push(sample(i as f64));
        }
        let mut window = SlidingWindow::new(10);
        assert_eq!(consumer.drain_into(&mut window, 3), 3);
        assert_eq!(consumer.drain_into(&mut window, 10), 2);
        assert_eq!(window.len(), 5);
    }

    #[test]
    fn test_push_after_consumer_dropped() {
        let (producer, consumer) = sample_channel();
        drop(consumer);
        producer.push(sample(1.0));
    }

    #[test]
    fn test_sample_log_take_empties() {
        let log = SampleLog::new();
        let handle = log.clone();
        handle.append(sample(0.0));
        handle.append(sample(0.2));
        assert_eq!(log.len(), 2);
        assert_eq!(log.take().len(), 2);
        assert!(handle.is_empty());
    }
}
