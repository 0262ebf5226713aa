
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use jobwarden::dashboard::{router, DashboardState};
use jobwarden::scheduler::JobRequest;
use test_harness::{assert_eventually, TestScheduler};

const TIMEOUT: Duration = Duration::from_secs(10);

/// Create a test app over a running scheduler
fn create_test_app(scheduler: &TestScheduler) -> Router {
    router(DashboardState {
        scheduler: scheduler.handle.clone(),
    })
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_list_jobs_empty() {
    let scheduler = TestScheduler::start();
    let app = create_test_app(&scheduler);

    let response = app.oneshot(get("/api/jobs")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert!(json.as_array().unwrap().is_empty());

    scheduler.stop().await;
}

#[tokio::test]
async fn test_submit_job_and_read_results() {
    let scheduler = TestScheduler::start();
    let app = create_test_app(&scheduler);

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/jobs",
            json!({"name": "Kit", "command": "echo 'ok: built'", "lock_keys": ["kit"]}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["success"], true);
    assert!(json["job_id"].as_str().is_some());
    assert!(json["error"].is_null());

    assert!(scheduler.wait_for_completion("Kit", TIMEOUT).await.is_some());

    let response = app.clone().oneshot(get("/api/completions/Kit")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let record = body_json(response).await;
    assert_eq!(record["job_name"], "Kit");
    assert_eq!(record["return_code"], 0);

    let response = app.oneshot(get("/api/console/Kit")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let lines = body_json(response).await;
    let lines = lines.as_array().unwrap();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["text"], "ok: built");
    assert_eq!(lines[0]["color"], "lightgreen");
    assert_eq!(lines[0]["job_id"], json["job_id"]);

    scheduler.stop().await;
}

#[tokio::test]
async fn test_submit_argv_job() {
    let scheduler = TestScheduler::start();
    let app = create_test_app(&scheduler);

    let response = app
        .oneshot(post_json(
            "/api/jobs",
            json!({"name": "argv", "argv": ["sh", "-c", "exit 5"]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let record = scheduler.wait_for_completion("argv", TIMEOUT).await.unwrap();
    assert_eq!(record.return_code, 5);

    scheduler.stop().await;
}

#[tokio::test]
async fn test_submit_job_requires_exactly_one_command_form() {
    let scheduler = TestScheduler::start();
    let app = create_test_app(&scheduler);

    for body in [
        json!({"name": "none"}),
        json!({"name": "both", "command": "true", "argv": ["true"]}),
        json!({"name": "empty", "argv": []}),
    ] {
        let response = app.clone().oneshot(post_json("/api/jobs", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["success"], false);
        assert!(json["error"].as_str().is_some());
    }

    scheduler.stop().await;
}

#[tokio::test]
async fn test_list_jobs_shows_submitted_jobs() {
    let scheduler = TestScheduler::start();
    let app = create_test_app(&scheduler);

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/jobs",
            json!({"name": "Join", "command": "sleep 30", "lock_keys": ["10.0.0.5"]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    assert_eventually(
        || async { scheduler.running_names().await == vec!["Join".to_string()] },
        TIMEOUT,
        "submitted job should be listed",
    )
    .await;

    let response = app.clone().oneshot(get("/api/jobs")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let jobs = json.as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["name"], "Join");
    assert_eq!(jobs[0]["command"], "sleep 30");

    let response = app
        .oneshot(post_json("/api/jobs/kill", json!({"name": "Join"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let record = scheduler.wait_for_completion("Join", TIMEOUT).await.unwrap();
    assert_eq!(record.return_code, -9);

    scheduler.stop().await;
}

#[tokio::test]
async fn test_completion_not_found() {
    let scheduler = TestScheduler::start();
    let app = create_test_app(&scheduler);

    let response = app.oneshot(get("/api/completions/unknown")).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert!(json["error"].as_str().unwrap().contains("unknown"));

    scheduler.stop().await;
}

#[tokio::test]
async fn test_clear_console() {
    let scheduler = TestScheduler::start();
    let app = create_test_app(&scheduler);

    scheduler
        .handle
        .submit(JobRequest::shell("chatty", "echo a; echo b; echo c"))
        .unwrap();
    assert!(scheduler.wait_for_completion("chatty", TIMEOUT).await.is_some());

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::DELETE)
                .uri("/api/console/chatty")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["removed"], 3);

    let response = app.oneshot(get("/api/console/chatty")).await.unwrap();
    assert!(body_json(response).await.as_array().unwrap().is_empty());

    scheduler.stop().await;
}

#[tokio::test]
async fn test_console_stream_is_event_stream() {
    let scheduler = TestScheduler::start();
    let app = create_test_app(&scheduler);

    let response = app.oneshot(get("/api/stream/console")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap();
    assert!(content_type.starts_with("text/event-stream"));

    scheduler.stop().await;
}
