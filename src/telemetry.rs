//! Module for storing telemetry records in the durable sink.
//!
//! Readings are written directly to the sink. When that fails they are appended to the local
//! fallback queue, which is forwarded after the next successful direct write. Detection events
//! have no fallback, a failed write discards them.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::{self, Instant};

use crate::cache::FallbackQueue;
use crate::metrics::Metrics;
use crate::record::{DetectionEvent, Reading, Telemetry};
use crate::sink::{DurableSink, SinkError, SinkSession};

/// Interval between two metric summaries in the log.
const SUMMARY_INTERVAL: time::Duration = time::Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What happened to a reading handed to the writer.
pub enum StoreOutcome {
    /// Written to the sink. `forwarded` queued readings followed it.
    Stored { forwarded: usize },
    /// The sink failed, the reading waits in the fallback queue.
    Queued,
    /// The sink failed and the fallback queue could not be written.
    Lost,
}

/// Single owner of the durable sink and the fallback queue.
pub struct TelemetryWriter<S: DurableSink> {
    sink: S,
    queue: FallbackQueue,
    metrics: Metrics,
}

/// Opens a session, applies `write` and commits. Any failure rolls the session back.
fn write_once<S, F>(sink: &mut S, write: F) -> Result<(), SinkError>
    where S: DurableSink,
          F: FnOnce(&mut S::Session) -> Result<(), SinkError>
{
    let mut session = sink.open()?;
    match write(&mut session) {
        Ok(()) => session.commit(),
        Err(err) => {
            if let Err(rollback_err) = session.rollback() {
                log::debug!(target: "telemetryd::db", "Rollback failed: \'{}\'", rollback_err);
            }
            Err(err)
        }
    }
}

impl<S: DurableSink> TelemetryWriter<S> {
    pub fn new(sink: S, queue: FallbackQueue, metrics: Metrics) -> Self {
        TelemetryWriter { sink, queue, metrics }
    }

    pub fn queue(&self) -> &FallbackQueue {
        &self.queue
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn metrics_mut(&mut self) -> &mut Metrics {
        &mut self.metrics
    }

    /// Stores a reading in the sink or, if that fails, in the fallback queue.
    ///
    /// The sink is tried exactly once. After a successful write the fallback queue is drained.
    pub fn store_reading(&mut self, reading: Reading) -> StoreOutcome {
        if let Some(rate) = self.metrics.readings.record(Instant::now()) {
            log::info!(target: "telemetryd::metrics", "Reading throughput: {:.2} samples/s", rate);
        }

        match write_once(&mut self.sink, |session| session.insert_reading(&reading)) {
            Ok(()) => {
                self.metrics.stored += 1;
                log::info!(target: "telemetryd::db", "Stored reading from \'{}\'", reading.timestamp());
                let forwarded = self.drain();
                StoreOutcome::Stored { forwarded }
            }
            Err(err) => {
                log::warn!(target: "telemetryd::db", "Could not store reading, caching it locally: \'{}\'", err);
                match self.queue.append(reading) {
                    Ok(_) => {
                        self.metrics.queued += 1;
                        StoreOutcome::Queued
                    }
                    Err(err) => {
                        self.metrics.lost += 1;
                        log::error!(target: "telemetryd::cache", "Could not write reading to the cache, it is lost: \'{}\'", err);
                        StoreOutcome::Lost
                    }
                }
            }
        }
    }

    /// Forwards queued readings to the sink, oldest first.
    ///
    /// Stops at the first reading the sink rejects. All readings inserted before it are
    /// committed in one transaction and removed from the queue, the rest stays queued in
    /// order. A crash between the commit and the queue rewrite forwards those readings again.
    ///
    /// # Returns
    ///
    /// The number of readings removed from the queue.
    pub fn drain(&mut self) -> usize {
        let entries = self.queue.load();
        if entries.is_empty() {
            return 0;
        }

        log::info!(target: "telemetryd::cache", "Forwarding {} cached readings", entries.len());
        let mut session = match self.sink.open() {
            Ok(session) => session,
            Err(err) => {
                log::warn!(target: "telemetryd::cache", "Database still unavailable, forwarding skipped: \'{}\'", err);
                return 0;
            }
        };

        let mut flushed = 0;
        for entry in entries.iter() {
            match session.insert_reading(entry) {
                Ok(()) => flushed += 1,
                Err(err) => {
                    log::warn!(target: "telemetryd::cache", "Cached reading {} could not be forwarded, stopping after {} readings: \'{}\'", flushed + 1, flushed, err);
                    break;
                }
            }
        }

        if flushed == 0 {
            if let Err(err) = session.rollback() {
                log::debug!(target: "telemetryd::db", "Rollback failed: \'{}\'", err);
            }
            return 0;
        }

        if let Err(err) = session.commit() {
            log::warn!(target: "telemetryd::cache", "Could not commit forwarded readings, keeping them cached: \'{}\'", err);
            return 0;
        }

        let remaining = &entries[flushed..];
        if let Err(err) = self.queue.store(remaining) {
            log::error!(target: "telemetryd::cache", "Forwarded readings could not be removed from the cache and will be sent again: \'{}\'", err);
        }
        self.metrics.forwarded += flushed as u64;
        log::info!(target: "telemetryd::cache", "Forwarded {} cached readings, {} remaining", flushed, remaining.len());
        flushed
    }

    /// Stores a detection event in the sink.
    ///
    /// Returns `false` if the write failed. The event is discarded in that case.
    pub fn store_detection(&mut self, event: &DetectionEvent) -> bool {
        if let Some(rate) = self.metrics.detections.record(Instant::now()) {
            log::info!(target: "telemetryd::metrics", "Detection throughput: {:.2} events/s", rate);
        }

        match write_once(&mut self.sink, |session| session.insert_detection(event)) {
            Ok(()) => {
                log::info!(target: "telemetryd::db", "Stored detection \'{}\' with {} objects", event.label, event.count);
                true
            }
            Err(err) => {
                self.metrics.detections_dropped += 1;
                log::error!(target: "telemetryd::db", "Could not store detection \'{}\', discarding it: \'{}\'", event.label, err);
                false
            }
        }
    }

    pub fn handle(&mut self, record: Telemetry) {
        match record {
            Telemetry::Reading(reading) => {
                if let StoreOutcome::Stored { forwarded } = self.store_reading(reading) {
                    log::debug!(target: "telemetryd::db", "Reading stored, {} cached readings followed", forwarded);
                }
            }
            Telemetry::Detection(event) => {
                self.store_detection(&event);
            }
        }
    }
}

/// Thread function for the telemetry writer.
///
/// Moves all records in the receive channel to the sink until `thread_finish` is set or the
/// channel is closed. The writer is the only user of the fallback queue file.
///
/// # Arguments
///
/// * `rx` - The channel to receive the records to store from.
///
/// * `thread_finish` - Indicates that the thread should finish operation and should return.
///
/// * `writer` - The writer owning the sink and the fallback queue.
///
pub fn telemetry_thread<S: DurableSink>(rx: Receiver<Telemetry>, thread_finish: Arc<AtomicBool>, mut writer: TelemetryWriter<S>)
{
    log::info!(target: "telemetryd", "Telemetry writer started, caching up to {} readings in \'{}\'",
               writer.queue().capacity(), writer.queue().path().display());
    let timeout = time::Duration::from_millis(100);
    let mut last_summary = Instant::now();

    while !thread_finish.load(Ordering::SeqCst) {
        if last_summary.elapsed() >= SUMMARY_INTERVAL {
            writer.metrics().log_summary();
            writer.metrics_mut().reset();
            last_summary = Instant::now();
        }

        let record = match rx.recv_timeout(timeout) {
            Ok(record) => record,
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                log::warn!(target: "telemetryd", "Telemetry channel closed!");
                break;
            }
        };

        writer.handle(record);
    }

    // Records already accepted from the socket are stored or queued before returning.
    let mut pending = 0;
    while let Ok(record) = rx.try_recv() {
        writer.handle(record);
        pending += 1;
    }
    if pending > 0 {
        log::info!(target: "telemetryd", "Handled {} pending records before shutdown", pending);
    }

    writer.metrics().log_summary();
}
