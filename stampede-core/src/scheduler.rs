use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Stage, TestPlan};
use crate::error::Result;
use crate::runner::{self, ExecutionMode, VuExit};
use crate::stats::{Collector, Snapshot};

/// Desired number of live virtual users at `elapsed`: piecewise-linear
/// between stage boundaries, ramping from the previous stage's target
/// (0 before the first stage).
pub(crate) fn target_at(stages: &[Stage], elapsed: Duration) -> u64 {
    let mut start = Duration::ZERO;
    let mut previous = 0u64;
    for stage in stages {
        let length = Duration::from_secs(stage.duration_secs);
        let end = start + length;
        if elapsed < end {
            let progress = (elapsed - start).as_secs_f64() / length.as_secs_f64();
            let from = previous as f64;
            let to = stage.target as f64;
            return (from + (to - from) * progress).round() as u64;
        }
        start = end;
        previous = stage.target;
    }
    stages.last().map(|s| s.target).unwrap_or(0)
}

/// Drives the ramp: spawns and retires virtual users every control
/// interval, then drains them at ramp end. Users still running at the
/// drain deadline are force-cancelled and surface in the aborted count.
pub(crate) async fn run<F>(
    plan: TestPlan,
    collector: Arc<Collector>,
    mut on_progress: Option<F>,
) -> Result<Snapshot>
where
    F: FnMut(Snapshot) + Send + 'static,
{
    let plan = Arc::new(plan);
    let total = plan.total_duration();
    let start = Instant::now();
    let root = CancellationToken::new();

    let mut set: JoinSet<VuExit> = JoinSet::new();
    // Tokens in spawn order; scale-down retires the newest users first.
    let mut tokens: Vec<CancellationToken> = Vec::new();
    let mut vu_counter: u64 = 0;
    let mut live: u64 = 0;
    // Degraded users keep occupying their slot so the ramp does not
    // immediately replace them with a fresh user.
    let mut degraded_slots: u64 = 0;

    let mut interval = time::interval(Duration::from_millis(plan.options.control_interval_ms));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        stages = plan.stages.len(),
        duration_secs = total.as_secs(),
        "starting load ramp"
    );

    loop {
        interval.tick().await;
        let elapsed = start.elapsed();
        if elapsed >= total {
            break;
        }

        while let Some(result) = set.try_join_next() {
            reap(result, &collector, &mut live, &mut degraded_slots);
        }

        let target = target_at(&plan.stages, elapsed);
        let effective = live + degraded_slots;

        if effective < target {
            for _ in 0..target - effective {
                vu_counter += 1;
                let vu_id = vu_counter;
                let client = runner::build_client(&plan.options)?;
                let token = root.child_token();
                tokens.push(token.clone());
                let plan = plan.clone();
                let collector = collector.clone();
                collector.vu_started();
                set.spawn(async move {
                    runner::run_vu(plan, client, collector, token, vu_id, ExecutionMode::Looping)
                        .await
                });
                live += 1;
            }
            debug!(desired = target, live, "scaled up");
        } else if effective > target {
            let mut to_stop = effective - target;
            // Degraded slots are already idle; release them first.
            let released = to_stop.min(degraded_slots);
            degraded_slots -= released;
            to_stop -= released;
            for token in tokens.iter().rev() {
                if to_stop == 0 {
                    break;
                }
                if !token.is_cancelled() {
                    token.cancel();
                    to_stop -= 1;
                }
            }
            debug!(desired = target, live, "scaling down");
        }

        collector.set_live_vus(live);
        if let Some(callback) = &mut on_progress {
            callback(collector.snapshot(elapsed));
        }
    }

    info!(live, "ramp complete, draining virtual users");
    root.cancel();

    let drain = Duration::from_millis(plan.options.drain_timeout_ms);
    let deadline = Instant::now() + drain;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match time::timeout(remaining, set.join_next()).await {
            Ok(Some(result)) => reap(result, &collector, &mut live, &mut degraded_slots),
            Ok(None) => break,
            Err(_) => break,
        }
    }

    let leftover = set.len();
    if leftover > 0 {
        warn!(leftover, "drain timeout expired, aborting remaining virtual users");
        set.abort_all();
        while let Some(result) = set.join_next().await {
            reap(result, &collector, &mut live, &mut degraded_slots);
        }
    }

    collector.set_live_vus(0);
    Ok(collector.snapshot(start.elapsed()))
}

fn reap(
    result: std::result::Result<VuExit, tokio::task::JoinError>,
    collector: &Collector,
    live: &mut u64,
    degraded_slots: &mut u64,
) {
    *live = live.saturating_sub(1);
    match result {
        Ok(VuExit::Stopped) => {}
        Ok(VuExit::Degraded) => *degraded_slots += 1,
        Err(e) if e.is_cancelled() => collector.record_aborted(1),
        Err(e) => warn!("virtual user task failed: {e}"),
    }
}
