//! API endpoints for the booking engine.
//!
//! Handlers are organized by resource:
//! - Providers: calendar snapshots and derived slots
//! - Slots: lock, unlock, status
//! - Appointments: booking lifecycle
//! - Payments: gateway callbacks and offline settlement
//! - WebSocket: the channel transport

pub mod appointments;
pub mod payments;
pub mod providers;
pub mod slots;
pub mod websocket;

use crate::aggregates::BookingAction;
use slotbook_web::AppError;

/// Error for an answer the handler did not expect.
pub(crate) fn unexpected(answer: &BookingAction) -> AppError {
    tracing::error!(?answer, "Unexpected answer from booking store");
    AppError::internal("Unexpected answer from booking store")
}
