use std::collections::BTreeMap;
use std::fmt::Write;

use console::style;
use humanize_bytes::humanize_bytes_binary;

use crate::stats::{Snapshot, REQ_DURATION};
use crate::threshold::Evaluation;

/// Renders the final summary. Deterministic for a given snapshot and
/// evaluation list; the process exit code is derived from [`passed`].
pub fn render(snapshot: &Snapshot, evaluations: &[Evaluation]) -> String {
    let mut out = String::new();
    let elapsed_secs = snapshot.elapsed.as_secs_f64();

    let _ = writeln!(out, "  Thread Stats   Avg      Stdev     Max");
    match snapshot.duration(REQ_DURATION) {
        Some(stats) => {
            let _ = writeln!(
                out,
                "    Latency   {:>8} {:>8} {:>8}",
                fmt_micros(stats.mean_micros()),
                fmt_micros(stats.stdev_micros()),
                fmt_micros(stats.max_micros as f64),
            );
            let _ = writeln!(out, "  Latency Distribution");
            for quantile in &[50.0, 75.0, 90.0, 95.0, 99.0] {
                let value = stats.quantile_micros(quantile / 100.0);
                let _ = writeln!(out, "     {:.0}%   {:>8}", quantile, fmt_micros(value as f64));
            }
        }
        None => {
            let _ = writeln!(out, "    Latency          -        -        -");
        }
    }

    let _ = writeln!(
        out,
        "  {} requests in {:.2}s, {} read",
        snapshot.requests_total,
        elapsed_secs,
        humanize_bytes_binary!(snapshot.bytes_received),
    );
    let _ = writeln!(
        out,
        "  Iterations: {}   Checks: {}/{} passed",
        snapshot.iterations,
        snapshot.checks_passed,
        snapshot.checks_passed + snapshot.checks_failed,
    );
    let _ = writeln!(out, "Requests/sec: {:.2}", snapshot.requests_per_sec());
    let transfer = if elapsed_secs > 0.0 {
        (snapshot.bytes_received as f64 / elapsed_secs) as u64
    } else {
        0
    };
    let _ = writeln!(out, "Transfer/sec: {}", humanize_bytes_binary!(transfer));

    if !snapshot.errors.is_empty() {
        let _ = writeln!(out, "Errors:");
        let sorted: BTreeMap<_, _> = snapshot.errors.iter().collect();
        for (message, count) in sorted {
            let _ = writeln!(out, "  {} - {}", message, count);
        }
    }
    if snapshot.aborted > 0 || snapshot.degraded > 0 {
        let _ = writeln!(
            out,
            "  Aborted VUs: {}   Degraded VUs: {}",
            snapshot.aborted, snapshot.degraded,
        );
    }

    if !evaluations.is_empty() {
        let _ = writeln!(out, "Thresholds");
        for evaluation in evaluations {
            let mark = if evaluation.passed {
                style("✓").green()
            } else {
                style("✗").red()
            };
            let _ = writeln!(
                out,
                "  {} {}: {} (observed {:.4})",
                mark, evaluation.metric, evaluation.expression, evaluation.observed,
            );
        }
    }

    let verdict = if passed(evaluations) {
        style("PASS").green().bold()
    } else {
        style("FAIL").red().bold()
    };
    let _ = writeln!(out, "Result: {}", verdict);

    out
}

pub fn passed(evaluations: &[Evaluation]) -> bool {
    evaluations.iter().all(|e| e.passed)
}

fn fmt_micros(micros: f64) -> String {
    if micros >= 1_000_000.0 {
        format!("{:.2}s", micros / 1_000_000.0)
    } else if micros >= 1_000.0 {
        format!("{:.2}ms", micros / 1_000.0)
    } else {
        format!("{:.2}us", micros)
    }
}
