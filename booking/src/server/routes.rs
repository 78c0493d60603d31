//! Router configuration for the booking server.

use super::health::{health_check, readiness_check};
use super::state::AppState;
use crate::api::{appointments, payments, providers, slots, websocket};
use axum::{
    Router,
    routing::{get, post, put},
};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the complete Axum router.
///
/// - `/health`, `/ready`
/// - `/api/...` booking commands and queries
/// - `/ws` channel transport
pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        // Calendar source
        .route("/providers", post(providers::register_provider))
        .route("/providers/:id/availability", put(providers::set_availability))
        .route("/providers/:id/slots", get(providers::list_slots))
        .route("/providers/:id/slots/week", get(providers::list_week))
        // Slot locks
        .route("/slots/lock", post(slots::lock_slot))
        .route("/slots/unlock", post(slots::unlock_slot))
        .route("/slots/status", get(slots::slot_status))
        // Appointments
        .route("/appointments", post(appointments::create_appointment))
        .route("/appointments/:id", get(appointments::get_appointment))
        .route("/appointments/:id/cancel", post(appointments::cancel_appointment))
        .route("/appointments/:id/confirm", post(appointments::confirm_appointment))
        .route("/appointments/:id/payments", post(appointments::initiate_payment))
        // Payments
        .route("/payments/verify", post(payments::verify_payment))
        .route("/payments/:id", get(payments::get_payment))
        .route(
            "/payments/:id/offline-confirmation",
            post(payments::confirm_offline_payment),
        );

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/ws", get(websocket::connect))
        .nest("/api", api_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
