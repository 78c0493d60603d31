//! Health check endpoints for the booking server.

use super::state::AppState;
use axum::{Json, extract::State, http::StatusCode};
use slotbook_runtime::{HealthCheck, HealthReport};
use slotbook_web::handlers::health::{ReadinessResponse, readiness_response};

pub use slotbook_web::handlers::health::health_check;

/// Readiness check endpoint.
///
/// Reports the booking store and the socket transport. Returns 503 once the
/// store is shutting down.
///
/// ```bash
/// curl http://localhost:8080/ready
/// ```
#[allow(clippy::unused_async)]
pub async fn readiness_check(State(state): State<AppState>) -> (StatusCode, Json<ReadinessResponse>) {
    let open = state.active_connections();
    let limit = state.config.websocket.max_connections;

    let transport = if open >= limit {
        HealthCheck::degraded("websocket", "connection limit reached")
    } else {
        HealthCheck::healthy("websocket")
    }
    .with_metadata("connections", open.to_string())
    .with_metadata("max_connections", limit.to_string());

    readiness_response(&HealthReport::new(vec![state.service.store().health(), transport]))
}
