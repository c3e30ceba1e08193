//! SLA threshold parsing and evaluation.
//!
//! Expressions follow the `agg cmp value` shape of the plan file, e.g.
//! `p(95)<500`, `rate<0.01`, `avg>=10`. Duration aggregates are in
//! milliseconds; rates are 0..1 fractions. Parsing and metric resolution
//! happen at plan load so a bad threshold aborts before the run starts;
//! evaluation is a pure function of a metrics snapshot.

use regex::Regex;

use crate::config::{MetricKind, TestPlan};
use crate::error::{Error, Result};
use crate::stats::{Snapshot, CHECKS, REQ_FAILED};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregate {
    Percentile(f64),
    Avg,
    Min,
    Max,
    Count,
    Rate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparator {
    fn holds(&self, observed: f64, bound: f64) -> bool {
        match self {
            Comparator::Lt => observed < bound,
            Comparator::Le => observed <= bound,
            Comparator::Gt => observed > bound,
            Comparator::Ge => observed >= bound,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Threshold {
    pub metric: String,
    pub expression: String,
    kind: MetricKind,
    agg: Aggregate,
    cmp: Comparator,
    value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub metric: String,
    pub expression: String,
    pub observed: f64,
    pub passed: bool,
}

/// Resolves and parses every threshold in the plan. Any unknown metric,
/// malformed expression, or aggregate/metric mismatch is a configuration
/// error.
pub fn compile(plan: &TestPlan) -> Result<Vec<Threshold>> {
    let mut thresholds = Vec::new();
    for (metric, expressions) in &plan.thresholds {
        let kind = plan.metric_kind(metric).ok_or_else(|| {
            Error::Config(format!("threshold references unknown metric {:?}", metric))
        })?;
        for expression in expressions {
            let (agg, cmp, value) = parse_expression(expression)
                .ok_or_else(|| {
                    Error::Config(format!(
                        "invalid threshold expression {:?} for metric {:?}",
                        expression, metric
                    ))
                })?;
            check_kind(metric, kind, agg, expression)?;
            thresholds.push(Threshold {
                metric: metric.clone(),
                expression: expression.clone(),
                kind,
                agg,
                cmp,
                value,
            });
        }
    }
    Ok(thresholds)
}

fn check_kind(metric: &str, kind: MetricKind, agg: Aggregate, expression: &str) -> Result<()> {
    let compatible = match kind {
        MetricKind::Duration => !matches!(agg, Aggregate::Rate),
        MetricKind::Rate => matches!(agg, Aggregate::Rate),
        MetricKind::Counter => matches!(agg, Aggregate::Count),
    };
    if compatible {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "aggregate in {:?} does not apply to metric {:?}",
            expression, metric
        )))
    }
}

fn parse_expression(expression: &str) -> Option<(Aggregate, Comparator, f64)> {
    let re = Regex::new(
        r"^\s*(p\((\d+(?:\.\d+)?)\)|avg|min|max|rate|count)\s*(<=|>=|<|>)\s*(\d+(?:\.\d+)?)\s*$",
    )
    .unwrap();
    let caps = re.captures(expression)?;

    let agg = match caps.get(1)?.as_str() {
        "avg" => Aggregate::Avg,
        "min" => Aggregate::Min,
        "max" => Aggregate::Max,
        "rate" => Aggregate::Rate,
        "count" => Aggregate::Count,
        _ => {
            let p: f64 = caps.get(2)?.as_str().parse().ok()?;
            if p <= 0.0 || p >= 100.0 {
                return None;
            }
            Aggregate::Percentile(p)
        }
    };
    let cmp = match caps.get(3)?.as_str() {
        "<" => Comparator::Lt,
        "<=" => Comparator::Le,
        ">" => Comparator::Gt,
        ">=" => Comparator::Ge,
        _ => return None,
    };
    let value: f64 = caps.get(4)?.as_str().parse().ok()?;
    Some((agg, cmp, value))
}

/// Pure: the same snapshot and thresholds always yield the same results.
pub fn evaluate(snapshot: &Snapshot, thresholds: &[Threshold]) -> Vec<Evaluation> {
    thresholds
        .iter()
        .map(|t| {
            let observed = observe(snapshot, t);
            Evaluation {
                metric: t.metric.clone(),
                expression: t.expression.clone(),
                observed,
                passed: t.cmp.holds(observed, t.value),
            }
        })
        .collect()
}

fn observe(snapshot: &Snapshot, threshold: &Threshold) -> f64 {
    match threshold.kind {
        MetricKind::Rate => match threshold.metric.as_str() {
            REQ_FAILED => snapshot.error_rate(),
            CHECKS => snapshot.check_rate(),
            _ => 0.0,
        },
        MetricKind::Counter => snapshot.iterations as f64,
        MetricKind::Duration => {
            let Some(stats) = snapshot.duration(&threshold.metric) else {
                return 0.0;
            };
            match threshold.agg {
                Aggregate::Percentile(p) => stats.quantile_micros(p / 100.0) as f64 / 1000.0,
                Aggregate::Avg => stats.mean_micros() / 1000.0,
                Aggregate::Min => stats.min_micros as f64 / 1000.0,
                Aggregate::Max => stats.max_micros as f64 / 1000.0,
                Aggregate::Count => stats.count as f64,
                Aggregate::Rate => 0.0,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TestPlan;
    use crate::stats::{Collector, RequestSample, REQ_DURATION};
    use std::time::Duration;

    fn plan_with_thresholds(thresholds: &str) -> TestPlan {
        let yaml = format!(
            r#"
base_url: http://localhost:8000
stages:
  - duration_secs: 5
    target: 2
thresholds:
{thresholds}
script:
  - name: ping
    path: /ping
"#
        );
        TestPlan::from_yaml(&yaml).unwrap()
    }

    fn snapshot_with(successes: u64, failures: u64, latency_ms: u64) -> Snapshot {
        let collector = Collector::new();
        for i in 0..successes + failures {
            collector.record_sample(&RequestSample {
                operation: "ping".into(),
                status: Some(200),
                latency: Duration::from_millis(latency_ms),
                body_bytes: 10,
                success: i < successes,
            });
        }
        collector.snapshot(Duration::from_secs(5))
    }

    #[test]
    fn parses_the_expression_grammar() {
        assert_eq!(
            parse_expression("p(95)<500"),
            Some((Aggregate::Percentile(95.0), Comparator::Lt, 500.0))
        );
        assert_eq!(
            parse_expression("rate<0.01"),
            Some((Aggregate::Rate, Comparator::Lt, 0.01))
        );
        assert_eq!(
            parse_expression(" avg >= 10 "),
            Some((Aggregate::Avg, Comparator::Ge, 10.0))
        );
        assert_eq!(parse_expression("p(0)<5"), None);
        assert_eq!(parse_expression("p(100)<5"), None);
        assert_eq!(parse_expression("median<5"), None);
        assert_eq!(parse_expression("p(95)"), None);
    }

    #[test]
    fn compile_rejects_rate_on_duration_metric() {
        let plan = plan_with_thresholds("  http_req_duration: [\"rate<0.5\"]");
        let err = compile(&plan).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn compile_rejects_percentile_on_rate_metric() {
        let plan = plan_with_thresholds("  http_req_failed: [\"p(95)<500\"]");
        assert!(compile(&plan).is_err());
    }

    #[test]
    fn evaluates_error_rate() {
        let plan = plan_with_thresholds("  http_req_failed: [\"rate<0.5\"]");
        let thresholds = compile(&plan).unwrap();

        let passing = snapshot_with(9, 1, 20);
        let results = evaluate(&passing, &thresholds);
        assert!(results[0].passed);
        assert!((results[0].observed - 0.1).abs() < 1e-9);

        let failing = snapshot_with(1, 9, 20);
        let results = evaluate(&failing, &thresholds);
        assert!(!results[0].passed);
    }

    #[test]
    fn evaluates_latency_percentile_in_milliseconds() {
        let plan = plan_with_thresholds("  http_req_duration: [\"p(95)<500\", \"avg<500\"]");
        let thresholds = compile(&plan).unwrap();
        let snapshot = snapshot_with(10, 0, 20);
        let results = evaluate(&snapshot, &thresholds);
        assert_eq!(results.len(), 2);
        for result in &results {
            assert!(result.passed, "{result:?}");
            assert!(result.observed > 10.0 && result.observed < 30.0, "{result:?}");
        }
    }

    #[test]
    fn empty_snapshot_passes_upper_bound_thresholds() {
        let plan = plan_with_thresholds("  http_req_duration: [\"p(95)<500\"]");
        let thresholds = compile(&plan).unwrap();
        let snapshot = Collector::new().snapshot(Duration::ZERO);
        assert!(snapshot.duration(REQ_DURATION).is_none());
        assert!(evaluate(&snapshot, &thresholds)[0].passed);
    }

    #[test]
    fn evaluate_is_idempotent() {
        let plan = plan_with_thresholds(
            "  http_req_duration: [\"p(95)<500\"]\n  http_req_failed: [\"rate<0.5\"]",
        );
        let thresholds = compile(&plan).unwrap();
        let snapshot = snapshot_with(5, 5, 20);
        let first = evaluate(&snapshot, &thresholds);
        let second = evaluate(&snapshot, &thresholds);
        assert_eq!(first, second);
    }
}
