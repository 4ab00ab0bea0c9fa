use std::convert::Infallible;
use std::net::SocketAddr;

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
use serde::Serialize;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::error::FarmError;
use crate::pool::SupervisorHandle;
use crate::scheduler::{JobId, JobSpec, SlotId};

#[derive(Clone)]
pub struct DashboardState {
    pub supervisor: SupervisorHandle,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitJobResponse {
    success: bool,
    job_id: Option<JobId>,
    error: Option<String>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/pool", get(pool_handler))
        .route("/api/jobs", get(list_jobs_handler).post(submit_job_handler))
        .route("/api/workers/{id}/terminate", post(terminate_worker_handler))
        .route("/api/events", get(events_handler))
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

fn status_for(error: &FarmError) -> StatusCode {
    match error {
        FarmError::InvalidJob(_) => StatusCode::BAD_REQUEST,
        FarmError::WorkerNotFound(_) => StatusCode::NOT_FOUND,
        FarmError::SupervisorClosed => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: FarmError) -> (StatusCode, Json<ErrorResponse>) {
    (
        status_for(&error),
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

async fn pool_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    match state.supervisor.snapshot().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn list_jobs_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    match state.supervisor.pending_jobs().await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn submit_job_handler(
    State(state): State<DashboardState>,
    Json(spec): Json<JobSpec>,
) -> impl IntoResponse {
    match state.supervisor.submit(spec).await {
        Ok(job) => (
            StatusCode::OK,
            Json(SubmitJobResponse {
                success: true,
                job_id: Some(job.id),
                error: None,
            }),
        ),
        Err(e) => (
            status_for(&e),
            Json(SubmitJobResponse {
                success: false,
                job_id: None,
                error: Some(e.to_string()),
            }),
        ),
    }
}

async fn terminate_worker_handler(
    State(state): State<DashboardState>,
    Path(slot_id): Path<SlotId>,
) -> impl IntoResponse {
    match state.supervisor.terminate_worker(slot_id).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn events_handler(
    State(state): State<DashboardState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.supervisor.subscribe()).filter_map(|event| {
        // Lagged receivers just skip what they missed.
        let event = event.ok()?;
        Event::default().event(event.name()).json_data(&event).ok().map(Ok)
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
