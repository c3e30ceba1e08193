use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use mimalloc::MiMalloc;
use tracing::error;

use stampede_api::{JsonSummary, ThresholdVerdict};
use stampede_core::{render, run_once, run_test, Snapshot, TestOutcome, TestPlan, REQ_DURATION};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

mod cli;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = cli::Args::parse();

    let mut plan = match TestPlan::from_file(&args.plan) {
        Ok(plan) => plan,
        Err(e) => {
            error!("invalid test plan: {e}");
            return ExitCode::from(2);
        }
    };
    if let Some(url) = args.url {
        plan.base_url = url;
    }

    if args.output == cli::OutputFormat::Text {
        println!(
            "Running {}s test @ {}",
            plan.total_duration().as_secs(),
            plan.base_url
        );
        println!(
            "  {} stages, peak {} VUs, {} operations",
            plan.stages.len(),
            plan.stages.iter().map(|s| s.target).max().unwrap_or(0),
            plan.script.len(),
        );
    }

    let result = if args.once {
        run_once(plan).await
    } else {
        let pb = if args.output == cli::OutputFormat::Text {
            let pb = ProgressBar::new(plan.total_duration().as_secs());
            pb.set_style(
                ProgressStyle::with_template(
                    "{spinner:.green} {msg} [{elapsed_precise}] [{bar:40.cyan/blue}]",
                )
                .unwrap()
                .progress_chars("=>-"),
            );
            Some(pb)
        } else {
            None
        };

        let pb_clone = pb.clone();
        let mut last_requests = 0u64;
        let mut last_elapsed = Duration::ZERO;
        let result = run_test(
            plan,
            Some(move |snapshot: Snapshot| {
                if let Some(pb) = &pb_clone {
                    let interval_secs = (snapshot.elapsed - last_elapsed).as_secs_f64();
                    let current_rps = if interval_secs > 0.0 {
                        (snapshot.requests_total - last_requests) as f64 / interval_secs
                    } else {
                        0.0
                    };
                    last_requests = snapshot.requests_total;
                    last_elapsed = snapshot.elapsed;

                    pb.set_position(snapshot.elapsed.as_secs());
                    pb.set_message(format!(
                        "VUs: {} | RPS: {:.0} | failed: {}",
                        snapshot.live_vus, current_rps, snapshot.requests_failed,
                    ));
                }
            }),
        )
        .await;

        if let Some(pb) = pb {
            pb.finish_with_message("Done!");
        }
        result
    };

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("test run failed: {e}");
            return ExitCode::from(2);
        }
    };

    match args.output {
        cli::OutputFormat::Text => {
            print!("{}", render(&outcome.snapshot, &outcome.evaluations));
        }
        cli::OutputFormat::Json => {
            println!("{}", serde_json::to_string(&summarize(&outcome)).unwrap());
        }
    }

    if outcome.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

fn summarize(outcome: &TestOutcome) -> JsonSummary {
    let snapshot = &outcome.snapshot;
    let latency = snapshot.duration(REQ_DURATION);
    let quantile_ms = |q: f64| {
        latency
            .map(|stats| stats.quantile_micros(q) as f64 / 1000.0)
            .unwrap_or(0.0)
    };

    JsonSummary {
        elapsed_secs: snapshot.elapsed.as_secs_f64(),
        iterations: snapshot.iterations,
        vus_started: snapshot.vus_started,
        total_requests: snapshot.requests_total,
        failed_requests: snapshot.requests_failed,
        error_rate: snapshot.error_rate(),
        checks_passed: snapshot.checks_passed,
        checks_failed: snapshot.checks_failed,
        total_bytes: snapshot.bytes_received,
        requests_per_sec: snapshot.requests_per_sec(),
        latency_mean_ms: latency.map(|s| s.mean_micros() / 1000.0).unwrap_or(0.0),
        latency_stdev_ms: latency.map(|s| s.stdev_micros() / 1000.0).unwrap_or(0.0),
        latency_max_ms: latency.map(|s| s.max_micros as f64 / 1000.0).unwrap_or(0.0),
        latency_p50_ms: quantile_ms(0.50),
        latency_p75_ms: quantile_ms(0.75),
        latency_p90_ms: quantile_ms(0.90),
        latency_p95_ms: quantile_ms(0.95),
        latency_p99_ms: quantile_ms(0.99),
        aborted_vus: snapshot.aborted,
        degraded_vus: snapshot.degraded,
        errors: snapshot.errors.clone(),
        thresholds: outcome
            .evaluations
            .iter()
            .map(|e| ThresholdVerdict {
                metric: e.metric.clone(),
                expression: e.expression.clone(),
                observed: e.observed,
                passed: e.passed,
            })
            .collect(),
        passed: outcome.passed(),
    }
}
