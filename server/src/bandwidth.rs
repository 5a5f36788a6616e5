//! Throughput metering
//!
//! The send and receive paths add to two byte counters. A background task
//! swaps both counters to zero once per window and publishes the result in
//! kB/s (1 kB = 1024 bytes). Published samples are plain atomics, so readers
//! never block the network tasks.

use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

/// Value reported before the first window completes
pub const NO_SAMPLE: f64 = -1.0;

#[derive(Debug)]
pub struct BandwidthMeter {
    sent: AtomicU64,
    received: AtomicU64,
    up: AtomicU64,
    down: AtomicU64,
}

impl BandwidthMeter {
    pub fn new() -> Self {
        Self {
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            up: AtomicU64::new(NO_SAMPLE.to_bits()),
            down: AtomicU64::new(NO_SAMPLE.to_bits()),
        }
    }

    pub fn record_sent(&self, bytes: usize) {
        self.sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Closes the current window and publishes `(up, down)` in kB/s.
    pub fn sample(&self, elapsed: Duration) -> (f64, f64) {
        let seconds = elapsed.as_secs_f64();
        if seconds <= 0.0 {
            return (self.up(), self.down());
        }

        let sent = self.sent.swap(0, Ordering::AcqRel);
        let received = self.received.swap(0, Ordering::AcqRel);

        let up = sent as f64 / 1024.0 / seconds;
        let down = received as f64 / 1024.0 / seconds;
        self.up.store(up.to_bits(), Ordering::Release);
        self.down.store(down.to_bits(), Ordering::Release);

        (up, down)
    }

    /// Most recent upload rate in kB/s, or [`NO_SAMPLE`]
    pub fn up(&self) -> f64 {
        f64::from_bits(self.up.load(Ordering::Acquire))
    }

    /// Most recent download rate in kB/s, or [`NO_SAMPLE`]
    pub fn down(&self) -> f64 {
        f64::from_bits(self.down.load(Ordering::Acquire))
    }

    /// Discards pending counts and published samples.
    pub fn reset(&self) {
        self.sent.store(0, Ordering::Release);
        self.received.store(0, Ordering::Release);
        self.up.store(NO_SAMPLE.to_bits(), Ordering::Release);
        self.down.store(NO_SAMPLE.to_bits(), Ordering::Release);
    }
}

impl Default for BandwidthMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns the task that samples `meter` every `period` until shutdown.
pub fn spawn_sampler(
    meter: Arc<BandwidthMeter>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Skip the first tick since it fires immediately
        ticker.tick().await;
        let mut last_sample = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let (up, down) = meter.sample(now - last_sample);
                    last_sample = now;
                    debug!("Bandwidth: up {:.2} kB/s, down {:.2} kB/s", up, down);
                }
            }
        }

        debug!("Bandwidth sampler stopped");
    })
}
