//! Concurrent metric aggregation for a test run.
//!
//! Counters are atomics and latency distributions are hdrhistogram
//! instances behind per-metric mutexes in a `DashMap`, so many virtual
//! users can record concurrently without losing samples; a reader only
//! blocks a writer for the duration of one histogram clone.
//!
//! Percentiles come from `hdrhistogram` configured with 3 significant
//! digits, which bounds the relative error of any reported quantile to
//! at most 0.1%.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;
use hdrhistogram::Histogram;

/// Latency of every request, and the per-operation sub-metrics derived
/// from it via [`op_duration_metric`].
pub const REQ_DURATION: &str = "http_req_duration";
/// Fraction of requests that failed (transport error or failed check).
pub const REQ_FAILED: &str = "http_req_failed";
/// Fraction of check predicates that passed.
pub const CHECKS: &str = "checks";
/// Completed script iterations across all virtual users.
pub const ITERATIONS: &str = "iterations";

pub fn op_duration_metric(operation: &str) -> String {
    format!("{}{{op:{}}}", REQ_DURATION, operation)
}

/// Outcome of one scripted request. Created by a virtual user, written
/// once into the collector, immutable afterwards.
#[derive(Debug, Clone)]
pub struct RequestSample {
    pub operation: String,
    /// None when the request failed before a status line arrived.
    pub status: Option<u16>,
    pub latency: Duration,
    pub body_bytes: u64,
    pub success: bool,
}

#[derive(Debug)]
struct DurationCell {
    count: AtomicU64,
    sum_micros: AtomicU64,
    min_micros: AtomicU64,
    max_micros: AtomicU64,
    histogram: Mutex<Histogram<u64>>,
}

fn new_histogram() -> Histogram<u64> {
    Histogram::new(3).unwrap_or_else(|_| {
        tracing::error!("failed to create histogram, using reduced precision");
        Histogram::new(2).expect("failed to create fallback histogram")
    })
}

impl DurationCell {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            sum_micros: AtomicU64::new(0),
            min_micros: AtomicU64::new(u64::MAX),
            max_micros: AtomicU64::new(0),
            histogram: Mutex::new(new_histogram()),
        }
    }

    fn record(&self, micros: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
        self.min_micros.fetch_min(micros, Ordering::Relaxed);
        self.max_micros.fetch_max(micros, Ordering::Relaxed);
        let mut hist = self.histogram.lock().unwrap_or_else(|e| e.into_inner());
        let _ = hist.record(micros);
    }

    fn stats(&self) -> DurationStats {
        let count = self.count.load(Ordering::Relaxed);
        DurationStats {
            count,
            sum_micros: self.sum_micros.load(Ordering::Relaxed),
            min_micros: if count == 0 {
                0
            } else {
                self.min_micros.load(Ordering::Relaxed)
            },
            max_micros: self.max_micros.load(Ordering::Relaxed),
            histogram: self
                .histogram
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct Collector {
    durations: DashMap<String, DurationCell>,
    requests_total: AtomicU64,
    requests_failed: AtomicU64,
    checks_passed: AtomicU64,
    checks_failed: AtomicU64,
    iterations: AtomicU64,
    bytes_received: AtomicU64,
    vus_started: AtomicU64,
    live_vus: AtomicU64,
    aborted: AtomicU64,
    degraded: AtomicU64,
    errors: DashMap<String, u64>,
}

impl Default for DurationCell {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one latency value under `metric`. Safe under concurrent
    /// calls from many virtual users; no samples are lost.
    pub fn record_duration(&self, metric: &str, latency: Duration) {
        let micros = latency.as_micros() as u64;
        if let Some(cell) = self.durations.get(metric) {
            cell.record(micros);
            return;
        }
        self.durations
            .entry(metric.to_string())
            .or_default()
            .record(micros);
    }

    pub fn record_sample(&self, sample: &RequestSample) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if !sample.success {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes_received
            .fetch_add(sample.body_bytes, Ordering::Relaxed);
        self.record_duration(REQ_DURATION, sample.latency);
        self.record_duration(&op_duration_metric(&sample.operation), sample.latency);
    }

    pub fn record_check(&self, passed: bool) {
        if passed {
            self.checks_passed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.checks_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_iteration(&self) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, message: impl Into<String>) {
        *self.errors.entry(message.into()).or_insert(0) += 1;
    }

    /// Virtual users force-cancelled at the drain deadline. Kept apart
    /// from success/failure counts so they do not pollute the error rate.
    pub fn record_aborted(&self, n: u64) {
        self.aborted.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_degraded(&self) {
        self.degraded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn vu_started(&self) {
        self.vus_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_live_vus(&self, n: u64) {
        self.live_vus.store(n, Ordering::Relaxed);
    }

    /// Immutable view of the aggregates, usable while recording continues.
    pub fn snapshot(&self, elapsed: Duration) -> Snapshot {
        Snapshot {
            elapsed,
            durations: self
                .durations
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().stats()))
                .collect(),
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            checks_passed: self.checks_passed.load(Ordering::Relaxed),
            checks_failed: self.checks_failed.load(Ordering::Relaxed),
            iterations: self.iterations.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            vus_started: self.vus_started.load(Ordering::Relaxed),
            live_vus: self.live_vus.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            errors: self
                .errors
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DurationStats {
    pub count: u64,
    pub sum_micros: u64,
    pub min_micros: u64,
    pub max_micros: u64,
    pub histogram: Histogram<u64>,
}

impl DurationStats {
    pub fn mean_micros(&self) -> f64 {
        self.histogram.mean()
    }

    pub fn stdev_micros(&self) -> f64 {
        self.histogram.stdev()
    }

    pub fn quantile_micros(&self, quantile: f64) -> u64 {
        self.histogram.value_at_quantile(quantile)
    }
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub elapsed: Duration,
    pub durations: HashMap<String, DurationStats>,
    pub requests_total: u64,
    pub requests_failed: u64,
    pub checks_passed: u64,
    pub checks_failed: u64,
    pub iterations: u64,
    pub bytes_received: u64,
    pub vus_started: u64,
    pub live_vus: u64,
    pub aborted: u64,
    pub degraded: u64,
    pub errors: HashMap<String, u64>,
}

impl Snapshot {
    pub fn duration(&self, metric: &str) -> Option<&DurationStats> {
        self.durations.get(metric)
    }

    pub fn error_rate(&self) -> f64 {
        if self.requests_total == 0 {
            0.0
        } else {
            self.requests_failed as f64 / self.requests_total as f64
        }
    }

    /// Fraction of check predicates that passed; 1.0 when none ran.
    pub fn check_rate(&self) -> f64 {
        let total = self.checks_passed + self.checks_failed;
        if total == 0 {
            1.0
        } else {
            self.checks_passed as f64 / total as f64
        }
    }

    pub fn requests_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.requests_total as f64 / secs
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn sample(operation: &str, success: bool) -> RequestSample {
        RequestSample {
            operation: operation.to_string(),
            status: Some(if success { 200 } else { 500 }),
            latency: Duration::from_micros(250),
            body_bytes: 64,
            success,
        }
    }

    #[test]
    fn concurrent_recording_loses_no_samples() {
        const THREADS: u64 = 8;
        const SAMPLES: u64 = 1000;

        let collector = Arc::new(Collector::new());
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let collector = collector.clone();
                thread::spawn(move || {
                    for _ in 0..SAMPLES {
                        collector.record_sample(&sample("ping", true));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = collector.snapshot(Duration::from_secs(1));
        assert_eq!(snapshot.requests_total, THREADS * SAMPLES);
        assert_eq!(
            snapshot.duration(REQ_DURATION).unwrap().count,
            THREADS * SAMPLES
        );
        assert_eq!(
            snapshot.duration(&op_duration_metric("ping")).unwrap().count,
            THREADS * SAMPLES
        );
    }

    #[test]
    fn snapshot_while_recording() {
        let collector = Collector::new();
        collector.record_sample(&sample("ping", true));
        let first = collector.snapshot(Duration::from_secs(1));
        collector.record_sample(&sample("ping", false));
        let second = collector.snapshot(Duration::from_secs(2));

        assert_eq!(first.requests_total, 1);
        assert_eq!(second.requests_total, 2);
        assert_eq!(second.requests_failed, 1);
    }

    #[test]
    fn error_rate_and_check_rate() {
        let collector = Collector::new();
        assert_eq!(collector.snapshot(Duration::ZERO).error_rate(), 0.0);
        assert_eq!(collector.snapshot(Duration::ZERO).check_rate(), 1.0);

        collector.record_sample(&sample("ping", true));
        collector.record_sample(&sample("ping", false));
        collector.record_check(true);
        collector.record_check(true);
        collector.record_check(false);

        let snapshot = collector.snapshot(Duration::from_secs(1));
        assert_eq!(snapshot.error_rate(), 0.5);
        assert!((snapshot.check_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn duration_stats_track_bounds() {
        let collector = Collector::new();
        collector.record_duration(REQ_DURATION, Duration::from_micros(100));
        collector.record_duration(REQ_DURATION, Duration::from_micros(300));

        let snapshot = collector.snapshot(Duration::from_secs(1));
        let stats = snapshot.duration(REQ_DURATION).unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.min_micros, 100);
        assert_eq!(stats.max_micros, 300);
        assert_eq!(stats.sum_micros, 400);
    }

    #[test]
    fn aborted_counts_stay_out_of_the_error_rate() {
        let collector = Collector::new();
        collector.record_aborted(3);
        let snapshot = collector.snapshot(Duration::from_secs(1));
        assert_eq!(snapshot.aborted, 3);
        assert_eq!(snapshot.requests_total, 0);
        assert_eq!(snapshot.error_rate(), 0.0);
    }
}
