//! REST API handlers.
//!
//! Each handler calls into the shared `Engine` and returns JSON responses.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tracing::warn;

use steer_balancer::{BalancerError, ControlsUpdate};
use steer_core::epoch_millis;
use steer_state::BackendId;

use crate::ApiState;

/// Default and maximum page size for `/events`.
const DEFAULT_EVENT_LIMIT: usize = 100;
const MAX_EVENT_LIMIT: usize = 1_000;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn balancer_error(e: BalancerError) -> axum::response::Response {
    let status = match &e {
        BalancerError::InvalidSetting(_) => StatusCode::BAD_REQUEST,
        BalancerError::SessionContended(_) | BalancerError::SessionMoved(_) => StatusCode::CONFLICT,
        BalancerError::LastResort(_) | BalancerError::State(_) => {
            warn!(error = %e, "request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(&e.to_string(), status).into_response()
}

// ── Sessions ───────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionCreated {
    pub session_id: String,
}

/// POST /api/v1/sessions
pub async fn create_session(State(state): State<ApiState>) -> impl IntoResponse {
    match state.engine.on_new_session(epoch_millis()) {
        Ok(session_id) => (StatusCode::CREATED, ApiResponse::ok(SessionCreated { session_id })).into_response(),
        Err(e) => balancer_error(e),
    }
}

/// GET /api/v1/sessions/{id}/streams/{key}
pub async fn route_request(
    State(state): State<ApiState>,
    Path((id, key)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.engine.on_request(&id, &key, epoch_millis()) {
        Ok(outcome) => ApiResponse::ok(outcome).into_response(),
        Err(e) => balancer_error(e),
    }
}

/// Body of a cutover update.
#[derive(Debug, Serialize, Deserialize)]
pub struct CutoverRequest {
    pub backend_id: BackendId,
    pub segment: String,
}

/// PUT /api/v1/sessions/{id}/streams/{key}/cutover
pub async fn record_cutover(
    State(state): State<ApiState>,
    Path((id, key)): Path<(String, String)>,
    Json(req): Json<CutoverRequest>,
) -> impl IntoResponse {
    if state.engine.registry().find(&req.backend_id).is_none() {
        return error_response("backend not found", StatusCode::NOT_FOUND).into_response();
    }
    match state
        .engine
        .record_last_segment(&id, &key, &req.backend_id, &req.segment, epoch_millis())
    {
        Ok(()) => ApiResponse::ok("recorded").into_response(),
        Err(e) => balancer_error(e),
    }
}

// ── Backends & cost ────────────────────────────────────────────

/// GET /api/v1/backends
pub async fn list_backends(State(state): State<ApiState>) -> impl IntoResponse {
    let ranking = state.engine.registry().snapshot();
    ApiResponse::ok((*ranking).clone())
}

/// Cost figures and the settings that shape them.
#[derive(Debug, Serialize, Deserialize)]
pub struct CostView {
    pub current_cost: f64,
    pub cost_ceiling: Option<f64>,
    pub minimum_cost: Option<f64>,
    pub maximum_cost: f64,
    pub trigger_ratio: f64,
    pub set_ratio: f64,
}

/// GET /api/v1/cost
pub async fn get_cost(State(state): State<ApiState>) -> impl IntoResponse {
    let ranking = state.engine.registry().snapshot();
    let settings = state.engine.controls().current();
    ApiResponse::ok(CostView {
        current_cost: ranking.current_cost,
        cost_ceiling: ranking.cost_ceiling,
        minimum_cost: ranking.minimum_cost,
        maximum_cost: settings.maximum_cost,
        trigger_ratio: settings.trigger_ratio,
        set_ratio: settings.set_ratio,
    })
}

// ── Controls ───────────────────────────────────────────────────

/// GET /api/v1/controls
pub async fn get_controls(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.engine.controls().current())
}

/// PUT /api/v1/controls
pub async fn update_controls(
    State(state): State<ApiState>,
    Json(update): Json<ControlsUpdate>,
) -> impl IntoResponse {
    match state.engine.controls().apply(&update) {
        Ok(settings) => ApiResponse::ok(settings).into_response(),
        Err(e) => balancer_error(e),
    }
}

// ── Events ─────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
}

/// GET /api/v1/events
pub async fn list_events(
    State(state): State<ApiState>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT).min(MAX_EVENT_LIMIT);
    match state.engine.store().list_recent_events(limit) {
        Ok(events) => ApiResponse::ok(events).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}
