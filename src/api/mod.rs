use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::bridge::Bridge;
use crate::error::GridError;
use crate::job::{JobHandle, LifecycleState, TrackedJob};
use crate::submit::SubmitRequest;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub master_alive: bool,
    pub accepting_notifications: bool,
    pub tracked_jobs: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub success: bool,
    pub job_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub job_id: String,
    pub state: LifecycleState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResponse {
    pub job_id: String,
    pub state: LifecycleState,
    pub name: Option<String>,
    pub queue_error: Option<String>,
    pub updated_at: String,
}

impl From<TrackedJob> for JobResponse {
    fn from(job: TrackedJob) -> Self {
        Self {
            job_id: job.handle.to_string(),
            state: job.state,
            name: job.name,
            queue_error: job.queue_error,
            updated_at: job.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Deserialize)]
struct ListQuery {
    filter: Option<String>,
}

#[derive(Deserialize)]
struct KillQuery {
    user: Option<String>,
    #[serde(default)]
    force: bool,
}

fn error_response(status: StatusCode, err: &GridError) -> axum::response::Response {
    (
        status,
        Json(ErrorResponse {
            error: err.to_wire(),
        }),
    )
        .into_response()
}

fn status_for(err: &GridError) -> StatusCode {
    match err {
        GridError::InvalidRequest(_) | GridError::Parse(_) | GridError::InvalidArgument(_) => {
            StatusCode::BAD_REQUEST
        }
        GridError::MasterUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        GridError::UnsupportedMethod(_) => StatusCode::NOT_IMPLEMENTED,
        GridError::SubmissionFailed { .. } | GridError::CommandFailed(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn router(bridge: Arc<Bridge>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/jobs", get(list_jobs_handler).post(submit_job_handler))
        .route("/api/jobs/{id}", get(job_status_handler).delete(kill_job_handler))
        .route("/api/jobs/{id}/finished", get(finished_job_handler))
        .route("/api/events", post(event_handler))
        .route("/api/preferences", post(preferences_handler))
        .layer(cors)
        .with_state(bridge)
}

pub async fn run_api(addr: SocketAddr, bridge: Arc<Bridge>, shutdown: CancellationToken) {
    let app = router(bridge);

    tracing::info!(addr = %addr, "Starting API server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind API server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "API server failed");
    }
}

async fn health_handler(State(bridge): State<Arc<Bridge>>) -> impl IntoResponse {
    Json(HealthResponse {
        master_alive: bridge.is_alive(),
        accepting_notifications: bridge.gate.is_open(),
        tracked_jobs: bridge.tracker.read().await.len(),
    })
}

async fn list_jobs_handler(
    State(bridge): State<Arc<Bridge>>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let jobs: Vec<JobResponse> = bridge
        .list_jobs(query.filter.as_deref())
        .await
        .into_iter()
        .map(JobResponse::from)
        .collect();
    Json(jobs)
}

async fn submit_job_handler(
    State(bridge): State<Arc<Bridge>>,
    Json(payload): Json<SubmitRequest>,
) -> impl IntoResponse {
    match bridge.submit(payload).await {
        Ok(job_id) => (
            StatusCode::OK,
            Json(SubmitResponse {
                success: true,
                job_id: Some(job_id),
                error: None,
            }),
        ),
        Err(e) => (
            status_for(&e),
            Json(SubmitResponse {
                success: false,
                job_id: None,
                error: Some(e.to_wire()),
            }),
        ),
    }
}

async fn job_status_handler(
    State(bridge): State<Arc<Bridge>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let handle: JobHandle = match id.parse() {
        Ok(handle) => handle,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &e),
    };
    let state = bridge.job_status(&handle).await;
    Json(StatusResponse {
        job_id: handle.to_string(),
        state,
    })
    .into_response()
}

async fn finished_job_handler(
    State(bridge): State<Arc<Bridge>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let handle: JobHandle = match id.parse() {
        Ok(handle) => handle,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &e),
    };
    match bridge.finished(&handle).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("no finished record for job {}", handle),
            }),
        )
            .into_response(),
        Err(e) => error_response(status_for(&e), &e),
    }
}

async fn kill_job_handler(
    State(bridge): State<Arc<Bridge>>,
    Path(id): Path<String>,
    Query(query): Query<KillQuery>,
) -> axum::response::Response {
    if let Err(e) = id.parse::<JobHandle>() {
        return error_response(StatusCode::BAD_REQUEST, &e);
    }
    match bridge.kill(&id, query.user.as_deref(), query.force).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(status_for(&e), &e),
    }
}

async fn event_handler(State(bridge): State<Arc<Bridge>>, body: String) -> axum::response::Response {
    match bridge.ingest_raw(&body) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => error_response(status_for(&e), &e),
    }
}

async fn preferences_handler(
    State(bridge): State<Arc<Bridge>>,
    Json(prefs): Json<HashMap<String, String>>,
) -> axum::response::Response {
    match bridge.apply_preferences(&prefs).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(status_for(&e), &e),
    }
}
