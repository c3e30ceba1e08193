use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::{Options, TestPlan};
use crate::error::{Error, Result};
use crate::response::Response;
use crate::script::{substitute, substitute_value, FailAction, Operation};
use crate::stats::{Collector, RequestSample};

/// Per-virtual-user state. Owned exclusively by one runner task and never
/// shared, so auth lifecycles stay independent across users.
#[derive(Debug)]
pub struct Session {
    pub vu_id: u64,
    pub iteration: u64,
    vars: HashMap<String, String>,
}

impl Session {
    pub fn new(vu_id: u64) -> Self {
        Self {
            vu_id,
            iteration: 0,
            vars: HashMap::new(),
        }
    }

    pub fn set(&mut self, name: String, value: String) {
        self.vars.insert(name, value);
    }

    pub fn vars(&self) -> &HashMap<String, String> {
        &self.vars
    }
}

/// Why a virtual user's loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VuExit {
    Stopped,
    Degraded,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum ExecutionMode {
    Looping,
    Once,
}

enum OpOutcome {
    Success,
    Failed { transport: bool },
}

pub(crate) fn build_client(options: &Options) -> Result<Client> {
    let builder = Client::builder()
        // One connection per VU: single idle slot and no cross-VU pooling
        .pool_max_idle_per_host(1)
        .tcp_nodelay(true)
        .no_proxy()
        .timeout(Duration::from_millis(options.request_timeout_ms));
    let builder = if options.http2 {
        builder.http2_prior_knowledge()
    } else {
        builder.http1_only()
    };
    builder.build().map_err(Error::from)
}

/// Runs the script in a loop until the token fires. The token is checked
/// between operations and at each iteration top, never mid-request, so a
/// signalled user finishes its in-flight operation and stops.
pub(crate) async fn run_vu(
    plan: Arc<TestPlan>,
    client: Client,
    collector: Arc<Collector>,
    token: CancellationToken,
    vu_id: u64,
    mode: ExecutionMode,
) -> VuExit {
    let mut session = Session::new(vu_id);
    let mut abort_failures: u32 = 0;
    let mut transport_streaks: HashMap<String, u32> = HashMap::new();

    'iterations: loop {
        if token.is_cancelled() {
            return VuExit::Stopped;
        }
        session.iteration += 1;
        collector.record_iteration();

        for op in &plan.script {
            if token.is_cancelled() {
                return VuExit::Stopped;
            }

            let outcome = execute_operation(&plan, &client, &collector, &mut session, op).await;

            match outcome {
                OpOutcome::Success => {
                    transport_streaks.remove(&op.name);
                    if op.on_fail == FailAction::AbortIteration {
                        abort_failures = 0;
                    }
                }
                OpOutcome::Failed { transport } => {
                    if transport {
                        let streak = transport_streaks.entry(op.name.clone()).or_insert(0);
                        *streak += 1;
                        if *streak >= plan.options.transport_streak_limit {
                            warn!(
                                vu = vu_id,
                                operation = %op.name,
                                streak = *streak,
                                "virtual user degraded after consecutive transport errors"
                            );
                            collector.record_degraded();
                            return VuExit::Degraded;
                        }
                    } else {
                        transport_streaks.remove(&op.name);
                    }

                    if op.on_fail == FailAction::AbortIteration {
                        abort_failures += 1;
                        if abort_failures >= plan.options.auth_failure_limit {
                            warn!(
                                vu = vu_id,
                                operation = %op.name,
                                failures = abort_failures,
                                "virtual user degraded after consecutive auth failures"
                            );
                            collector.record_degraded();
                            return VuExit::Degraded;
                        }
                        // Short-circuit: skip the rest of this iteration,
                        // retry from the top after the pause.
                        if !think(op.think_time_ms, &token).await {
                            return VuExit::Stopped;
                        }
                        if let ExecutionMode::Once = mode {
                            return VuExit::Stopped;
                        }
                        continue 'iterations;
                    }
                }
            }

            if !think(op.think_time_ms, &token).await {
                return VuExit::Stopped;
            }
        }

        if let ExecutionMode::Once = mode {
            return VuExit::Stopped;
        }
    }
}

/// Returns false if the stop signal fired during the pause.
async fn think(ms: u64, token: &CancellationToken) -> bool {
    if ms == 0 {
        return !token.is_cancelled();
    }
    tokio::select! {
        _ = sleep(Duration::from_millis(ms)) => true,
        _ = token.cancelled() => false,
    }
}

async fn execute_operation(
    plan: &TestPlan,
    client: &Client,
    collector: &Collector,
    session: &mut Session,
    op: &Operation,
) -> OpOutcome {
    let request = match build_request(plan, client, session, op) {
        Ok(request) => request,
        Err(message) => {
            collector.record_error(message);
            collector.record_sample(&failed_sample(op, None, Duration::ZERO));
            return OpOutcome::Failed { transport: false };
        }
    };

    let start = Instant::now();
    let result = request.send().await;
    let latency = start.elapsed();

    let raw = match result {
        Ok(raw) => raw,
        Err(e) => {
            collector.record_error(classify_transport(&e));
            collector.record_sample(&failed_sample(op, None, latency));
            return OpOutcome::Failed { transport: true };
        }
    };

    let response = match Response::read(raw).await {
        Ok(response) => response,
        Err(e) => {
            collector.record_error(format!("Response processing error: {}", e));
            collector.record_sample(&failed_sample(op, None, start.elapsed()));
            return OpOutcome::Failed { transport: true };
        }
    };

    let mut success = true;
    for check in &op.checks {
        let passed = check.passes(&response);
        collector.record_check(passed);
        if !passed {
            success = false;
            collector.record_error(format!("check failed: {} ({})", check.describe(), op.name));
        }
    }

    if success {
        if let Some(extract) = &op.extract {
            match extract.apply(&response) {
                Some(value) => session.set(extract.var.clone(), value),
                None => {
                    success = false;
                    collector.record_error(format!(
                        "extract failed: field {:?} not found ({})",
                        extract.field, op.name
                    ));
                }
            }
        }
    }

    collector.record_sample(&RequestSample {
        operation: op.name.clone(),
        status: Some(response.status()),
        latency,
        body_bytes: response.total_size() as u64,
        success,
    });

    if success {
        OpOutcome::Success
    } else {
        OpOutcome::Failed { transport: false }
    }
}

fn failed_sample(op: &Operation, status: Option<u16>, latency: Duration) -> RequestSample {
    RequestSample {
        operation: op.name.clone(),
        status,
        latency,
        body_bytes: 0,
        success: false,
    }
}

fn build_request(
    plan: &TestPlan,
    client: &Client,
    session: &Session,
    op: &Operation,
) -> std::result::Result<reqwest::RequestBuilder, String> {
    let path = substitute(&op.path, session.vars())?;
    let url = if path.starts_with("http") {
        path
    } else {
        format!("{}{}", plan.base_url, path)
    };

    let mut request = client.request(op.method.as_reqwest(), &url);
    for (key, value) in &op.headers {
        request = request.header(key, substitute(value, session.vars())?);
    }
    if let Some(body) = &op.body {
        request = request.json(&substitute_value(body, session.vars())?);
    }
    Ok(request)
}

fn classify_transport(error: &reqwest::Error) -> String {
    if error.is_timeout() {
        "Request timeout".to_string()
    } else if error.is_connect() {
        format!("Connection error: {}", error)
    } else {
        format!("Request error: {}", error)
    }
}
