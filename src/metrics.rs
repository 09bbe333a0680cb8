//! Throughput counters and totals of the telemetry path.
use std::time::{Duration, Instant};

/// Counts events and turns them into a rate once per window.
#[derive(Debug, Clone)]
pub struct Throughput {
    window: Duration,
    window_start: Instant,
    count: u64,
    last_rate: f64,
}

impl Throughput {
    pub fn new(window: Duration, now: Instant) -> Self {
        Throughput {
            window,
            window_start: now,
            count: 0,
            last_rate: 0.0,
        }
    }

    /// Counts one event.
    ///
    /// Returns the rate in events per second when the current window has elapsed, the count
    /// starts over with a new window in that case.
    pub fn record(&mut self, now: Instant) -> Option<f64> {
        self.count += 1;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.window || elapsed.as_secs_f64() <= 0.0 {
            return None;
        }
        self.last_rate = self.count as f64 / elapsed.as_secs_f64();
        self.count = 0;
        self.window_start = now;
        Some(self.last_rate)
    }

    /// Rate computed at the end of the last completed window.
    pub fn last_rate(&self) -> f64 {
        self.last_rate
    }

    pub fn reset(&mut self, now: Instant) {
        self.window_start = now;
        self.count = 0;
        self.last_rate = 0.0;
    }
}

/// State of the telemetry path, owned by the telemetry writer.
#[derive(Debug, Clone)]
pub struct Metrics {
    pub readings: Throughput,
    pub detections: Throughput,
    /// Readings written directly to the database.
    pub stored: u64,
    /// Readings appended to the fallback queue.
    pub queued: u64,
    /// Queued readings forwarded to the database.
    pub forwarded: u64,
    /// Readings neither stored nor queued.
    pub lost: u64,
    /// Detection events discarded after a failed write.
    pub detections_dropped: u64,
}

impl Metrics {
    pub fn new(window: Duration) -> Self {
        let now = Instant::now();
        Metrics {
            readings: Throughput::new(window, now),
            detections: Throughput::new(window, now),
            stored: 0,
            queued: 0,
            forwarded: 0,
            lost: 0,
            detections_dropped: 0,
        }
    }

    pub fn reset(&mut self) {
        let now = Instant::now();
        self.readings.reset(now);
        self.detections.reset(now);
        self.stored = 0;
        self.queued = 0;
        self.forwarded = 0;
        self.lost = 0;
        self.detections_dropped = 0;
    }

    pub fn log_summary(&self) {
        log::info!(target: "telemetryd::metrics",
                   "Readings stored: {}, queued: {}, forwarded: {}, lost: {} ({:.2}/s); detections dropped: {} ({:.2}/s)",
                   self.stored, self.queued, self.forwarded, self.lost, self.readings.last_rate(),
                   self.detections_dropped, self.detections.last_rate());
    }
}
