use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use serde_json::json;

use crate::controller::RunController;
use crate::flows::FlowKind;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub controller: Arc<RunController>,
}

pub type SharedState = Arc<AppState>;

// ── Response payload types ────────────────────────────────────────────

#[derive(Serialize)]
pub struct FlowInfo {
    pub flow: FlowKind,
    pub steps: &'static [&'static str],
}

impl From<FlowKind> for FlowInfo {
    fn from(flow: FlowKind) -> Self {
        Self {
            flow,
            steps: flow.steps(),
        }
    }
}

// ── Error handling ────────────────────────────────────────────────────

pub enum HttpError {
    NotFound(String),
    BadRequest(String),
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            HttpError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            HttpError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/flows", get(list_flows))
        .route("/api/flows/{flow}/steps", get(flow_steps))
        .route("/api/runs/active", get(active_run))
        .route("/api/runs/cancel", post(cancel_run))
        .route("/api/snapshot", get(snapshot))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_flows() -> Json<Vec<FlowInfo>> {
    Json(FlowKind::ALL.iter().copied().map(FlowInfo::from).collect())
}

async fn flow_steps(Path(flow): Path<String>) -> Result<Json<FlowInfo>, HttpError> {
    let kind = FlowKind::from_str(&flow).map_err(|e| HttpError::NotFound(e.to_string()))?;
    Ok(Json(kind.into()))
}

async fn active_run(State(state): State<SharedState>) -> impl IntoResponse {
    Json(json!({ "active": state.controller.active_run() }))
}

async fn cancel_run(State(state): State<SharedState>) -> impl IntoResponse {
    let cancelled = state.controller.cancel();
    Json(json!({ "cancelled": cancelled }))
}

async fn snapshot(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.controller.store().current())
}
