use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};

use stampede_core::{run_once, run_test, Error, Snapshot, TestPlan};

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn short_plan(base: &str, thresholds: &str, script: &str) -> String {
    format!(
        r#"
base_url: {base}
options:
  control_interval_ms: 100
  drain_timeout_ms: 2000
stages:
  - duration_secs: 1
    target: 2
  - duration_secs: 1
    target: 2
thresholds:
{thresholds}
script:
{script}
"#
    )
}

#[tokio::test]
async fn always_successful_script_passes_error_rate_threshold() {
    let app = Router::new().route("/ping", get(|| async { "pong" }));
    let base = serve(app).await;

    let yaml = short_plan(
        &base,
        "  http_req_failed: [\"rate<0.5\"]",
        r#"
  - name: ping
    path: /ping
    checks:
      - status_is: 200
    think_time_ms: 10
"#,
    );
    let plan = TestPlan::from_yaml(&yaml).unwrap();
    let outcome = run_test(plan, None::<fn(Snapshot)>).await.unwrap();

    assert!(outcome.snapshot.requests_total > 0);
    assert_eq!(outcome.snapshot.error_rate(), 0.0);
    assert_eq!(outcome.snapshot.aborted, 0);
    assert_eq!(outcome.evaluations.len(), 1);
    assert!(outcome.evaluations[0].passed);
    assert!(outcome.passed());
}

#[tokio::test]
async fn failing_checks_fail_the_error_rate_threshold() {
    let app = Router::new().route(
        "/ping",
        get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
    );
    let base = serve(app).await;

    let yaml = short_plan(
        &base,
        "  http_req_failed: [\"rate<0.5\"]",
        r#"
  - name: ping
    path: /ping
    checks:
      - status_is: 200
    think_time_ms: 10
"#,
    );
    let plan = TestPlan::from_yaml(&yaml).unwrap();
    let outcome = run_test(plan, None::<fn(Snapshot)>).await.unwrap();

    assert!(outcome.snapshot.requests_total > 0);
    assert_eq!(outcome.snapshot.error_rate(), 1.0);
    assert!(!outcome.evaluations[0].passed);
    assert_eq!(outcome.evaluations[0].observed, 1.0);
    assert!(!outcome.passed());
}

#[tokio::test]
async fn unknown_threshold_metric_aborts_before_any_request() {
    let hits = Arc::new(AtomicU64::new(0));
    let state = hits.clone();
    let app = Router::new().route(
        "/ping",
        get(|State(hits): State<Arc<AtomicU64>>| async move {
            hits.fetch_add(1, Ordering::SeqCst);
            "pong"
        }),
    )
    .with_state(state);
    let base = serve(app).await;

    let yaml = short_plan(
        &base,
        "  p99_banana: [\"p(99)<100\"]",
        r#"
  - name: ping
    path: /ping
"#,
    );

    // Loading the plan fails fast.
    let err = TestPlan::from_yaml(&yaml).unwrap_err();
    assert!(matches!(err, Error::Config(_)), "{err}");
    assert!(err.to_string().contains("p99_banana"));

    // Even a hand-built plan that skipped validation fails before the
    // scheduler spawns anything.
    let plan: TestPlan = serde_yaml::from_str(&yaml).unwrap();
    let err = run_test(plan, None::<fn(Snapshot)>).await.unwrap_err();
    assert!(err.is_config());
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failed_login_short_circuits_the_iteration() {
    let data_hits = Arc::new(AtomicU64::new(0));
    let state = data_hits.clone();
    let app = Router::new()
        .route(
            "/api/auth/login/",
            post(|| async { (StatusCode::UNAUTHORIZED, "bad credentials") }),
        )
        .route(
            "/api/data",
            get(|State(hits): State<Arc<AtomicU64>>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                "data"
            }),
        )
        .with_state(state);
    let base = serve(app).await;

    let yaml = format!(
        r#"
base_url: {base}
stages:
  - duration_secs: 1
    target: 1
script:
  - name: login
    method: POST
    path: /api/auth/login/
    checks:
      - status_is: 200
    on_fail: abort-iteration
    think_time_ms: 0
  - name: fetch_data
    path: /api/data
    checks:
      - status_is: 200
    think_time_ms: 0
"#
    );
    let plan = TestPlan::from_yaml(&yaml).unwrap();
    let outcome = run_once(plan).await.unwrap();

    assert_eq!(data_hits.load(Ordering::SeqCst), 0);
    assert_eq!(outcome.snapshot.requests_total, 1);
    assert_eq!(outcome.snapshot.requests_failed, 1);
}

#[tokio::test]
async fn session_token_flows_from_login_to_authed_requests() {
    let app = Router::new()
        .route(
            "/api/auth/login/",
            post(|| async { Json(serde_json::json!({"token": "abc123"})) }),
        )
        .route(
            "/api/users/",
            get(|headers: HeaderMap| async move {
                let authed = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    == Some("Token abc123");
                if authed {
                    Json(serde_json::json!({"results": []})).into_response()
                } else {
                    StatusCode::UNAUTHORIZED.into_response()
                }
            }),
        );
    let base = serve(app).await;

    let yaml = format!(
        r#"
base_url: {base}
stages:
  - duration_secs: 1
    target: 1
script:
  - name: login
    method: POST
    path: /api/auth/login/
    headers:
      Content-Type: application/json
    body:
      username: testuser
      password: testpass123
    checks:
      - status_is: 200
      - json_has: token
    extract:
      field: token
      var: token
    on_fail: abort-iteration
    think_time_ms: 0
  - name: list_users
    path: /api/users/
    headers:
      Authorization: Token ${{token}}
    checks:
      - status_is: 200
      - json_has: results
    think_time_ms: 0
"#
    );
    let plan = TestPlan::from_yaml(&yaml).unwrap();
    let outcome = run_once(plan).await.unwrap();

    assert_eq!(outcome.snapshot.requests_total, 2);
    assert_eq!(outcome.snapshot.requests_failed, 0);
    assert_eq!(outcome.snapshot.error_rate(), 0.0);
    assert_eq!(outcome.snapshot.checks_failed, 0);
    assert_eq!(outcome.snapshot.checks_passed, 4);
}

#[tokio::test]
async fn repeated_auth_failures_degrade_the_virtual_user() {
    let login_hits = Arc::new(AtomicU64::new(0));
    let state = login_hits.clone();
    let app = Router::new()
        .route(
            "/api/auth/login/",
            post(|State(hits): State<Arc<AtomicU64>>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                (StatusCode::UNAUTHORIZED, "bad credentials")
            }),
        )
        .with_state(state);
    let base = serve(app).await;

    let yaml = format!(
        r#"
base_url: {base}
options:
  control_interval_ms: 100
  auth_failure_limit: 2
stages:
  - duration_secs: 2
    target: 1
script:
  - name: login
    method: POST
    path: /api/auth/login/
    checks:
      - status_is: 200
    on_fail: abort-iteration
    think_time_ms: 10
"#
    );
    let plan = TestPlan::from_yaml(&yaml).unwrap();
    let outcome = run_test(plan, None::<fn(Snapshot)>).await.unwrap();

    // The degraded user stops retrying and is not replaced.
    assert_eq!(outcome.snapshot.degraded, 1);
    assert_eq!(outcome.snapshot.vus_started, 1);
    assert_eq!(login_hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn drain_timeout_zero_aborts_in_flight_users() {
    let app = Router::new().route(
        "/hang",
        get(|| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            "late"
        }),
    );
    let base = serve(app).await;

    let yaml = format!(
        r#"
base_url: {base}
options:
  control_interval_ms: 100
  drain_timeout_ms: 0
  request_timeout_ms: 60000
stages:
  - duration_secs: 1
    target: 3
script:
  - name: hang
    path: /hang
    checks:
      - status_is: 200
    think_time_ms: 0
"#
    );
    let plan = TestPlan::from_yaml(&yaml).unwrap();
    let outcome = run_test(plan, None::<fn(Snapshot)>).await.unwrap();

    // Force-cancelled users surface only in the aborted count.
    assert!(outcome.snapshot.aborted >= 1);
    assert_eq!(outcome.snapshot.aborted, outcome.snapshot.vus_started);
    assert_eq!(outcome.snapshot.requests_total, 0);
    assert_eq!(outcome.snapshot.requests_failed, 0);
    assert_eq!(outcome.snapshot.error_rate(), 0.0);
}
