use std::net::SocketAddr;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::device::pool::summarize;
use crate::error::FleetError;
use crate::scheduler::CommandScheduler;

#[derive(Clone)]
pub struct DashboardState {
    pub scheduler: CommandScheduler,
}

#[derive(Serialize)]
struct QueueStatusResponse {
    ready: usize,
    sleeping: usize,
    executing: usize,
    shutting_down: bool,
    last_exit_code: String,
    handover_state: String,
    watched_files: Vec<String>,
}

#[derive(Serialize)]
struct DevicesResponse {
    available: usize,
    allocated: usize,
    unavailable: usize,
    devices: Vec<crate::device::DeviceDescriptor>,
}

#[derive(Deserialize)]
struct AddCommandRequest {
    args: Vec<String>,
}

#[derive(Serialize)]
struct AddCommandResponse {
    success: bool,
    command_id: Option<u64>,
    error: Option<String>,
}

#[derive(Serialize)]
struct StopInvocationResponse {
    success: bool,
    error: Option<String>,
}

/// Build the dashboard API.
pub fn router(scheduler: CommandScheduler) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/queue", get(queue_status_handler))
        .route("/api/commands", get(list_commands_handler))
        .route("/api/commands", post(add_command_handler))
        .route("/api/trackers", get(list_trackers_handler))
        .route("/api/invocations", get(list_invocations_handler))
        .route("/api/invocations/{id}/stop", post(stop_invocation_handler))
        .route("/api/devices", get(list_devices_handler))
        .layer(cors)
        .with_state(DashboardState { scheduler })
}

pub async fn run_dashboard(addr: SocketAddr, scheduler: CommandScheduler) {
    let app = router(scheduler);

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

async fn queue_status_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let scheduler = &state.scheduler;
    Json(QueueStatusResponse {
        ready: scheduler.ready_command_count().await,
        sleeping: scheduler.sleeping_command_count().await,
        executing: scheduler.executing_command_count().await,
        shutting_down: scheduler.is_shutting_down().await,
        last_exit_code: scheduler.last_invocation_exit_code().to_string(),
        handover_state: scheduler.handover_state().to_string(),
        watched_files: scheduler
            .watched_command_files()
            .iter()
            .map(|p| p.display().to_string())
            .collect(),
    })
}

async fn list_commands_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(state.scheduler.all_commands().await)
}

async fn list_trackers_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(state.scheduler.command_trackers().await)
}

async fn list_invocations_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(state.scheduler.invocations().await)
}

async fn list_devices_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    use crate::device::DeviceAllocationState;

    let devices = state.scheduler.devices();
    let summary = summarize(&devices);
    let count = |s: DeviceAllocationState| summary.get(&s).copied().unwrap_or(0);
    Json(DevicesResponse {
        available: count(DeviceAllocationState::Available),
        allocated: count(DeviceAllocationState::Allocated),
        unavailable: count(DeviceAllocationState::Unavailable),
        devices,
    })
}

async fn add_command_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<AddCommandRequest>,
) -> impl IntoResponse {
    match state.scheduler.add_command(&payload.args).await {
        Ok(id) => (
            StatusCode::OK,
            Json(AddCommandResponse {
                success: true,
                command_id: Some(id),
                error: None,
            }),
        ),
        Err(e) => {
            let status = match e {
                FleetError::ShutDown => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::BAD_REQUEST,
            };
            (
                status,
                Json(AddCommandResponse {
                    success: false,
                    command_id: None,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

async fn stop_invocation_handler(
    State(state): State<DashboardState>,
    Path(id): Path<u64>,
) -> impl IntoResponse {
    match state.scheduler.stop_invocation(id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(StopInvocationResponse {
                success: true,
                error: None,
            }),
        ),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(StopInvocationResponse {
                success: false,
                error: Some(e.to_string()),
            }),
        ),
    }
}
