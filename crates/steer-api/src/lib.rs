//! steer-api — REST API for Steer.
//!
//! Exposes the selection path and the administrative controls of a running
//! [`Engine`](steer_balancer::Engine) as JSON over HTTP.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/sessions` | Start a session |
//! | GET | `/api/v1/sessions/{id}/streams/{key}` | Route one playlist request |
//! | PUT | `/api/v1/sessions/{id}/streams/{key}/cutover` | Record the last segment served |
//! | GET | `/api/v1/backends` | Current ranking and statuses |
//! | GET | `/api/v1/cost` | Blended cost and ceiling |
//! | GET | `/api/v1/controls` | Current settings |
//! | PUT | `/api/v1/controls` | Change settings |
//! | GET | `/api/v1/events` | Recent events, newest first |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post, put};
use steer_balancer::Engine;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<Engine>,
}

/// Build the complete API router.
pub fn build_router(engine: Arc<Engine>) -> Router {
    let api_state = ApiState { engine };

    let api_routes = Router::new()
        .route("/sessions", post(handlers::create_session))
        .route("/sessions/{id}/streams/{key}", get(handlers::route_request))
        .route("/sessions/{id}/streams/{key}/cutover", put(handlers::record_cutover))
        .route("/backends", get(handlers::list_backends))
        .route("/cost", get(handlers::get_cost))
        .route("/controls", get(handlers::get_controls).put(handlers::update_controls))
        .route("/events", get(handlers::list_events))
        .with_state(api_state);

    Router::new().nest("/api/v1", api_routes)
}
