use std::net::SocketAddr;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::scheduler::{ExecutorDebug, Id, JobDebug, SchedulerHandle};

#[derive(Clone)]
pub struct DashboardState<I: Id> {
    pub handle: SchedulerHandle<I>,
}

#[derive(Serialize)]
struct JobResponse {
    id: String,
    #[serde(flatten)]
    timings: JobDebug,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    jobs: usize,
    executors: usize,
    alive_executors: usize,
}

/// Routes served by the dashboard, without CORS.
pub fn router<I: Id>(state: DashboardState<I>) -> Router {
    Router::new()
        .route("/api/jobs", get(list_jobs_handler::<I>))
        .route("/api/executors", get(list_executors_handler::<I>))
        .route("/api/health", get(health_handler::<I>))
        .with_state(state)
}

pub async fn run_dashboard<I: Id>(addr: SocketAddr, state: DashboardState<I>) {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = router(state).layer(cors);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn list_jobs_handler<I: Id>(State(state): State<DashboardState<I>>) -> impl IntoResponse {
    let mut jobs: Vec<JobResponse> = state
        .handle
        .debug_snapshot()
        .await
        .into_iter()
        .map(|(id, timings)| JobResponse {
            id: id.to_string(),
            timings,
        })
        .collect();
    jobs.sort_by(|a, b| a.id.cmp(&b.id));

    Json(jobs)
}

async fn list_executors_handler<I: Id>(
    State(state): State<DashboardState<I>>,
) -> Json<Vec<ExecutorDebug>> {
    Json(state.handle.executor_snapshot().await)
}

async fn health_handler<I: Id>(State(state): State<DashboardState<I>>) -> impl IntoResponse {
    let executors = state.handle.executor_snapshot().await;
    let jobs = state.handle.debug_snapshot().await;
    let live_jobs = jobs.values().filter(|d| d.phase().is_some()).count();

    Json(HealthResponse {
        status: if state.handle.is_shutting_down() {
            "draining"
        } else {
            "ok"
        },
        jobs: live_jobs,
        executors: executors.len(),
        alive_executors: executors.iter().filter(|e| e.alive).count(),
    })
}
