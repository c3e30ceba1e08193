use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Verdict for one configured threshold expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdVerdict {
    pub metric: String,
    pub expression: String,
    pub observed: f64,
    pub passed: bool,
}

/// Machine-readable run summary emitted by `stampede --output json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonSummary {
    pub elapsed_secs: f64,
    pub iterations: u64,
    pub vus_started: u64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub error_rate: f64,
    pub checks_passed: u64,
    pub checks_failed: u64,
    pub total_bytes: u64,
    pub requests_per_sec: f64,
    pub latency_mean_ms: f64,
    pub latency_stdev_ms: f64,
    pub latency_max_ms: f64,
    pub latency_p50_ms: f64,
    pub latency_p75_ms: f64,
    pub latency_p90_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub aborted_vus: u64,
    pub degraded_vus: u64,
    pub errors: HashMap<String, u64>,
    pub thresholds: Vec<ThresholdVerdict>,
    pub passed: bool,
}
