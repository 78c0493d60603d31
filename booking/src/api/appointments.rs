//! Appointment endpoints.
//!
//! - POST /api/appointments - Begin booking a slot (acquires the slot lock)
//! - GET /api/appointments/:id - Appointment with its status history
//! - POST /api/appointments/:id/cancel - Cancel (patient or provider)
//! - POST /api/appointments/:id/confirm - Explicit confirmation (settled payments only)
//! - POST /api/appointments/:id/payments - Start paying, online or offline
//!
//! # State Machine
//!
//! ```text
//! draft → slot-locked → payment-pending → payment-verified → confirmed
//!              ↓               ↓
//!          cancelled     failed / expired / cancelled
//! ```

use super::unexpected;
use crate::aggregates::{Appointment, BookingAction, CheckoutOrder, Payment, PaymentMethod};
use crate::server::state::AppState;
use crate::types::{Actor, AppointmentId, ConsultationType, PatientId, ProviderId, ReasonCode, hhmm};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use slotbook_web::AppError;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request to book a slot.
#[derive(Debug, Deserialize)]
pub struct CreateAppointmentRequest {
    /// Provider
    pub provider_id: ProviderId,
    /// Patient
    pub patient_id: PatientId,
    /// Date
    pub date: NaiveDate,
    /// Slot start, `HH:MM`
    #[serde(with = "hhmm")]
    pub time: NaiveTime,
    /// Consultation type, online by default
    #[serde(default = "default_consultation_type")]
    pub consultation_type: ConsultationType,
}

const fn default_consultation_type() -> ConsultationType {
    ConsultationType::Online
}

/// Appointment with its payment record.
#[derive(Debug, Serialize)]
pub struct AppointmentResponse {
    /// Appointment
    pub appointment: Appointment,
    /// Payment, once payment has started
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment: Option<Payment>,
}

/// Request to cancel.
#[derive(Debug, Deserialize)]
pub struct CancelAppointmentRequest {
    /// Who is cancelling: the patient or the provider
    pub actor: Actor,
    /// Must match the actor (`patient_cancelled` / `provider_cancelled`) when given
    pub reason: Option<ReasonCode>,
}

impl CancelAppointmentRequest {
    /// Reason recorded in the status history.
    ///
    /// Internal actors and their reasons (expiry, payment failures) are
    /// written by the engine itself and cannot be claimed over HTTP.
    fn recorded_reason(&self) -> Result<ReasonCode, AppError> {
        let reason = match self.actor {
            Actor::Patient(_) => ReasonCode::PatientCancelled,
            Actor::Provider(_) => ReasonCode::ProviderCancelled,
            Actor::Gateway | Actor::Reaper | Actor::System => {
                return Err(AppError::validation(
                    "Only a patient or provider can cancel an appointment",
                ));
            },
        };

        match self.reason {
            Some(requested) if requested != reason => Err(AppError::validation(format!(
                "Reason {requested:?} does not match actor"
            ))),
            _ => Ok(reason),
        }
    }
}

/// Request to start paying.
#[derive(Debug, Deserialize)]
pub struct InitiatePaymentRequest {
    /// Online checkout or pay at clinic
    pub method: PaymentMethod,
}

/// Payment started.
#[derive(Debug, Serialize)]
pub struct InitiatePaymentResponse {
    /// Appointment
    pub appointment_id: AppointmentId,
    /// Payment record
    pub payment: Payment,
    /// Checkout details (online)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<CheckoutOrder>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Begin booking a slot.
///
/// Acquires (or re-uses) the patient's lock on the slot and returns the
/// appointment in `slot-locked`.
///
/// ```bash
/// curl -X POST http://localhost:8080/api/appointments \
///   -H "Content-Type: application/json" \
///   -d '{"provider_id":"<id>","patient_id":"<id>","date":"2025-01-06","time":"10:00"}'
/// ```
///
/// # Errors
///
/// - `LOCK_CONFLICT` / `SLOT_OCCUPIED` (409) if the slot is taken
/// - `PROVIDER_UNAVAILABLE` (409) if the provider is offline
/// - `SLOT_NOT_OFFERED` (422) if the time is not on the calendar
pub async fn create_appointment(
    State(state): State<AppState>,
    Json(request): Json<CreateAppointmentRequest>,
) -> Result<(StatusCode, Json<Appointment>), AppError> {
    let appointment_id = AppointmentId::new();

    match state
        .service
        .dispatch(|correlation_id| BookingAction::BeginBooking {
            correlation_id,
            appointment_id,
            provider_id: request.provider_id,
            patient_id: request.patient_id,
            date: request.date,
            time: request.time,
            consultation_type: request.consultation_type,
        })
        .await?
    {
        BookingAction::AppointmentUpdated { appointment, .. } => {
            Ok((StatusCode::CREATED, Json(appointment)))
        },
        other => Err(unexpected(&other)),
    }
}

/// Appointment with status history and payment.
///
/// # Errors
///
/// Returns `AppError::not_found` for an unknown appointment.
pub async fn get_appointment(
    State(state): State<AppState>,
    Path(appointment_id): Path<AppointmentId>,
) -> Result<Json<AppointmentResponse>, AppError> {
    state
        .service
        .query(|s| {
            s.appointments.get(&appointment_id).map(|appointment| AppointmentResponse {
                appointment: appointment.clone(),
                payment: appointment
                    .payment_id
                    .and_then(|id| s.payments.get(&id))
                    .cloned(),
            })
        })
        .await
        .map(Json)
        .ok_or_else(|| AppError::not_found("Appointment", appointment_id))
}

/// Cancel an appointment.
///
/// A held lock is released and a settled payment is refunded.
///
/// # Errors
///
/// - `INVALID_TRANSITION` (409) from a terminal status
/// - `VALIDATION_ERROR` (422) if the actor is not a party, is an internal
///   actor, or the reason does not match the actor
pub async fn cancel_appointment(
    State(state): State<AppState>,
    Path(appointment_id): Path<AppointmentId>,
    Json(request): Json<CancelAppointmentRequest>,
) -> Result<Json<Appointment>, AppError> {
    let reason = request.recorded_reason()?;

    match state
        .service
        .dispatch(|correlation_id| BookingAction::CancelAppointment {
            correlation_id,
            appointment_id,
            actor: request.actor,
            reason,
        })
        .await?
    {
        BookingAction::AppointmentUpdated { appointment, .. } => Ok(Json(appointment)),
        other => Err(unexpected(&other)),
    }
}

/// Confirm an appointment whose payment is settled.
///
/// # Errors
///
/// `INVALID_TRANSITION` (409) unless the appointment is `payment-verified`.
pub async fn confirm_appointment(
    State(state): State<AppState>,
    Path(appointment_id): Path<AppointmentId>,
) -> Result<Json<Appointment>, AppError> {
    match state
        .service
        .dispatch(|correlation_id| BookingAction::ConfirmAppointment {
            correlation_id,
            appointment_id,
        })
        .await?
    {
        BookingAction::AppointmentUpdated { appointment, .. } => Ok(Json(appointment)),
        other => Err(unexpected(&other)),
    }
}

/// Start paying for a `slot-locked` appointment.
///
/// Online payments come back with checkout details; offline payments with a
/// receipt number and payment token.
///
/// # Errors
///
/// - `LOCK_EXPIRED` (409) if the slot lock ran out
/// - `OFFLINE_NOT_ALLOWED` (403) for offline payment with a provider that does not accept it
/// - `GATEWAY_ERROR` (502) if the order could not be created
pub async fn initiate_payment(
    State(state): State<AppState>,
    Path(appointment_id): Path<AppointmentId>,
    Json(request): Json<InitiatePaymentRequest>,
) -> Result<(StatusCode, Json<InitiatePaymentResponse>), AppError> {
    let response = match state
        .service
        .dispatch(|correlation_id| BookingAction::InitiatePayment {
            correlation_id,
            appointment_id,
            method: request.method,
        })
        .await?
    {
        BookingAction::PaymentOrderReady {
            appointment_id,
            payment,
            order,
            ..
        } => InitiatePaymentResponse {
            appointment_id,
            payment,
            order: Some(order),
        },
        BookingAction::OfflinePaymentRegistered {
            appointment,
            payment,
            ..
        } => InitiatePaymentResponse {
            appointment_id: appointment.id,
            payment,
            order: None,
        },
        other => return Err(unexpected(&other)),
    };

    Ok((StatusCode::CREATED, Json(response)))
}
