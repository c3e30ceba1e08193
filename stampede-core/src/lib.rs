use std::sync::Arc;

mod config;
mod error;
mod report;
mod response;
mod runner;
mod scheduler;
mod script;
mod stats;
mod threshold;

pub use config::{MetricKind, Options, Stage, TestPlan};
pub use error::{Error, Result};
pub use report::{passed, render};
pub use response::Response;
pub use runner::{Session, VuExit};
pub use script::{Check, Extract, FailAction, Method, Operation};
pub use stats::{
    op_duration_metric, Collector, DurationStats, RequestSample, Snapshot, CHECKS, ITERATIONS,
    REQ_DURATION, REQ_FAILED,
};
pub use threshold::{Evaluation, Threshold};

/// Everything a finished run produces: the final metrics snapshot and the
/// verdict for each configured threshold.
#[derive(Debug, Clone)]
pub struct TestOutcome {
    pub snapshot: Snapshot,
    pub evaluations: Vec<Evaluation>,
}

impl TestOutcome {
    /// Overall verdict: logical AND of every threshold evaluation.
    pub fn passed(&self) -> bool {
        report::passed(&self.evaluations)
    }
}

/// Runs the full staged load test. `on_progress` is invoked once per
/// control interval with a live snapshot.
pub async fn run_test<F>(plan: TestPlan, on_progress: Option<F>) -> Result<TestOutcome>
where
    F: FnMut(Snapshot) + Send + 'static,
{
    let thresholds = threshold::compile(&plan)?;
    let collector = Arc::new(Collector::new());
    let snapshot = scheduler::run(plan, collector, on_progress).await?;
    let evaluations = threshold::evaluate(&snapshot, &thresholds);
    Ok(TestOutcome {
        snapshot,
        evaluations,
    })
}

/// Executes the script once with a single virtual user. Useful as a
/// smoke run before a full ramp.
pub async fn run_once(plan: TestPlan) -> Result<TestOutcome> {
    use tokio_util::sync::CancellationToken;

    let thresholds = threshold::compile(&plan)?;
    let collector = Arc::new(Collector::new());
    let client = runner::build_client(&plan.options)?;
    let start = tokio::time::Instant::now();

    let plan = Arc::new(plan);
    collector.vu_started();
    runner::run_vu(
        plan,
        client,
        collector.clone(),
        CancellationToken::new(),
        1,
        runner::ExecutionMode::Once,
    )
    .await;

    let snapshot = collector.snapshot(start.elapsed());
    let evaluations = threshold::evaluate(&snapshot, &thresholds);
    Ok(TestOutcome {
        snapshot,
        evaluations,
    })
}
