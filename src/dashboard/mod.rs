//! Optional HTTP status API over a running scheduler.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::scheduler::{JobCommand, JobRequest, SchedulerHandle};
use crate::store::ConsoleLine;

#[derive(Clone)]
pub struct DashboardState {
    pub scheduler: SchedulerHandle,
}

#[derive(Debug, Deserialize)]
struct SubmitJobRequest {
    name: String,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    argv: Option<Vec<String>>,
    #[serde(default)]
    lock_keys: Vec<String>,
    #[serde(default)]
    working_directory: Option<PathBuf>,
    #[serde(default)]
    silent: bool,
}

#[derive(Serialize)]
struct SubmitJobResponse {
    success: bool,
    job_id: Option<String>,
    error: Option<String>,
}

impl SubmitJobResponse {
    fn rejected(status: StatusCode, error: impl Into<String>) -> (StatusCode, Json<Self>) {
        (
            status,
            Json(Self {
                success: false,
                job_id: None,
                error: Some(error.into()),
            }),
        )
    }
}

#[derive(Debug, Deserialize)]
struct KillJobRequest {
    name: String,
}

#[derive(Serialize)]
struct ClearConsoleResponse {
    removed: usize,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, error: impl std::fmt::Display) -> axum::response::Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/jobs", get(list_jobs_handler).post(submit_job_handler))
        .route("/api/jobs/kill", post(kill_job_handler))
        .route(
            "/api/console/{job_name}",
            get(console_handler).delete(clear_console_handler),
        )
        .route("/api/stream/console", get(console_stream_handler))
        .route("/api/completions/{job_name}", get(completion_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn list_jobs_handler(State(state): State<DashboardState>) -> axum::response::Response {
    match state.scheduler.list_running().await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e),
    }
}

async fn submit_job_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<SubmitJobRequest>,
) -> impl IntoResponse {
    let command = match (payload.command, payload.argv) {
        (Some(command), None) => JobCommand::shell(command),
        (None, Some(argv)) if !argv.is_empty() => JobCommand::Exec(argv),
        _ => {
            return SubmitJobResponse::rejected(
                StatusCode::BAD_REQUEST,
                "Exactly one of `command` or a non-empty `argv` is required",
            )
        }
    };

    let job_name = payload.name.clone();
    let mut request = JobRequest::new(payload.name, command)
        .lock_keys(payload.lock_keys)
        .silent(payload.silent)
        .on_output(move |line: &ConsoleLine| {
            tracing::info!(job_name = %job_name, color = %line.color, "{}", line.text);
        });
    if let Some(dir) = payload.working_directory {
        request = request.working_directory(dir);
    }

    match state.scheduler.submit(request) {
        Ok(job_id) => (
            StatusCode::OK,
            Json(SubmitJobResponse {
                success: true,
                job_id: Some(job_id.to_string()),
                error: None,
            }),
        ),
        Err(e) => SubmitJobResponse::rejected(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

async fn kill_job_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<KillJobRequest>,
) -> axum::response::Response {
    match state.scheduler.kill(payload.name) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e),
    }
}

async fn console_handler(
    State(state): State<DashboardState>,
    Path(job_name): Path<String>,
) -> axum::response::Response {
    match state.scheduler.console_lines(&job_name).await {
        Ok(lines) => Json(lines).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn clear_console_handler(
    State(state): State<DashboardState>,
    Path(job_name): Path<String>,
) -> axum::response::Response {
    match state.scheduler.clear_console(&job_name).await {
        Ok(removed) => Json(ClearConsoleResponse { removed }).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn completion_handler(
    State(state): State<DashboardState>,
    Path(job_name): Path<String>,
) -> axum::response::Response {
    match state.scheduler.completion(&job_name).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            format!("No completion recorded for {}", job_name),
        ),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn console_stream_handler(
    State(state): State<DashboardState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.scheduler.subscribe_console()).filter_map(|message| {
        match message {
            Ok(line) => match Event::default().event("console").json_data(&line) {
                Ok(event) => Some(Ok(event)),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to encode console event");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "Console stream subscriber lagged");
                None
            }
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("keepalive"),
    )
}
