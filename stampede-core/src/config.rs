use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::script::Operation;
use crate::stats::{op_duration_metric, CHECKS, ITERATIONS, REQ_DURATION, REQ_FAILED};
use crate::threshold;

/// A complete test plan: target, ramp stages, thresholds and the script.
/// Immutable for the lifetime of a run.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestPlan {
    pub base_url: String,
    #[serde(default)]
    pub options: Options,
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub thresholds: BTreeMap<String, Vec<String>>,
    pub script: Vec<Operation>,
}

/// One time-bounded segment of the load ramp. Desired concurrency moves
/// linearly from the previous stage's target (0 before the first stage)
/// to `target` across `duration_secs`.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Stage {
    pub duration_secs: u64,
    pub target: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Options {
    /// How often the scheduler reconciles live VUs against the ramp.
    pub control_interval_ms: u64,
    /// Grace period for in-flight operations after ramp end; VUs still
    /// running past it are force-cancelled and counted as aborted.
    pub drain_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Consecutive failed abort-iteration operations before a VU is
    /// marked degraded and stops restarting.
    pub auth_failure_limit: u32,
    /// Consecutive transport errors on one operation before a VU is
    /// marked degraded.
    pub transport_streak_limit: u32,
    pub http2: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            control_interval_ms: 1000,
            drain_timeout_ms: 5000,
            request_timeout_ms: 30_000,
            auth_failure_limit: 3,
            transport_streak_limit: 5,
            http2: false,
        }
    }
}

/// Kind of value a metric aggregates, used to validate threshold
/// expressions against the metric they reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Duration,
    Rate,
    Counter,
}

impl TestPlan {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    /// Parses a plan after expanding `${env:NAME}` placeholders, then
    /// validates it so configuration errors surface before the run.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let expanded = expand_env(raw)?;
        let plan: TestPlan = serde_yaml::from_str(&expanded)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn total_duration(&self) -> Duration {
        Duration::from_secs(self.stages.iter().map(|s| s.duration_secs).sum())
    }

    /// Kind of `metric` if the plan can resolve it: the built-in metrics
    /// plus one latency sub-metric per scripted operation.
    pub fn metric_kind(&self, metric: &str) -> Option<MetricKind> {
        match metric {
            REQ_DURATION => Some(MetricKind::Duration),
            REQ_FAILED | CHECKS => Some(MetricKind::Rate),
            ITERATIONS => Some(MetricKind::Counter),
            other => self
                .script
                .iter()
                .any(|op| op_duration_metric(&op.name) == other)
                .then_some(MetricKind::Duration),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(Error::Config("at least one stage is required".into()));
        }
        if let Some(stage) = self.stages.iter().find(|s| s.duration_secs == 0) {
            return Err(Error::Config(format!(
                "stage duration must be positive (target {})",
                stage.target
            )));
        }
        if self.options.control_interval_ms == 0 {
            return Err(Error::Config("control_interval_ms must be positive".into()));
        }
        if self.script.is_empty() {
            return Err(Error::Config("script must contain at least one operation".into()));
        }
        let mut seen = HashSet::new();
        for op in &self.script {
            if op.name.is_empty() {
                return Err(Error::Config("operation name must not be empty".into()));
            }
            if !seen.insert(op.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate operation name {:?}",
                    op.name
                )));
            }
        }
        // Unknown metrics and malformed expressions fail here, before
        // any virtual user starts.
        threshold::compile(self)?;
        Ok(())
    }
}

fn expand_env(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${env:") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 6..];
        let end = after
            .find('}')
            .ok_or_else(|| Error::Config("unterminated ${env:...} placeholder".into()))?;
        let name = &after[..end];
        let value = std::env::var(name).map_err(|_| Error::EnvVar(name.to_string()))?;
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
