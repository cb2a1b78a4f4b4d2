
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use jobplacer::config::SchedulerConfig;
use jobplacer::dashboard::{router, DashboardState};
use test_harness::{settle, TestScheduler};

fn create_test_app(s: &TestScheduler) -> Router {
    router(DashboardState {
        handle: s.handle.clone(),
    })
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

fn config() -> SchedulerConfig {
    SchedulerConfig::new().with_job_is_running_on_successful_start(true)
}

#[tokio::test(start_paused = true)]
async fn test_list_jobs_empty() {
    let s = TestScheduler::spawn(config());
    let (status, json) = get_json(create_test_app(&s), "/api/jobs").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, Value::Array(vec![]));
}

#[tokio::test(start_paused = true)]
async fn test_list_jobs_with_timings() {
    let s = TestScheduler::spawn(config());
    s.add_executors(&[1], 10.0).await;
    s.add_jobs(1, 2, 1.0, Duration::ZERO).await;
    settle(Duration::from_secs(3)).await;

    let (status, json) = get_json(create_test_app(&s), "/api/jobs").await;

    assert_eq!(status, StatusCode::OK);
    let jobs = json.as_array().unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0]["id"], "1");
    assert_eq!(jobs[0]["job_name"], "J1");
    assert_eq!(jobs[0]["executor_name"], "Wrk1");
    assert_eq!(jobs[0]["start_count"], 1);
    assert!(jobs[0]["runned"].as_f64().unwrap() >= 2.9);
}

#[tokio::test(start_paused = true)]
async fn test_list_executors() {
    let s = TestScheduler::spawn(config());
    s.add_executors(&[1, 2], 10.0).await;
    s.add_jobs(1, 4, 2.0, Duration::ZERO).await;
    settle(Duration::from_millis(100)).await;

    let (status, json) = get_json(create_test_app(&s), "/api/executors").await;

    assert_eq!(status, StatusCode::OK);
    let executors = json.as_array().unwrap();
    assert_eq!(executors.len(), 2);
    assert_eq!(executors[0]["name"], "Wrk1");
    assert_eq!(executors[0]["capacity"], 10.0);
    assert_eq!(executors[0]["alive"], true);
    let running: u64 = executors
        .iter()
        .map(|e| e["running"].as_u64().unwrap())
        .sum();
    let load: f64 = executors.iter().map(|e| e["load"].as_f64().unwrap()).sum();
    assert_eq!(running, 4);
    assert_eq!(load, 8.0);
}

#[tokio::test(start_paused = true)]
async fn test_health_reports_counts() {
    let s = TestScheduler::spawn(config().with_executor_alive_duration(Duration::from_secs(1)));
    s.add_executors(&[1, 2], 10.0).await;
    s.add_jobs(1, 3, 1.0, Duration::ZERO).await;

    let (status, json) = get_json(create_test_app(&s), "/api/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["jobs"], 3);
    assert_eq!(json["executors"], 2);
    assert_eq!(json["alive_executors"], 2);

    // No keepalives: both executors age out.
    settle(Duration::from_secs(2)).await;
    let (_, json) = get_json(create_test_app(&s), "/api/health").await;
    assert_eq!(json["alive_executors"], 0);
}

#[tokio::test(start_paused = true)]
async fn test_health_reports_draining() {
    let s = TestScheduler::spawn(config());
    s.handle.shutdown();

    let (status, json) = get_json(create_test_app(&s), "/api/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "draining");
}

#[tokio::test(start_paused = true)]
async fn test_unknown_route_is_not_found() {
    let s = TestScheduler::spawn(config());
    let response = create_test_app(&s)
        .oneshot(
            Request::builder()
                .uri("/api/nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
