//! Payment endpoints.
//!
//! - POST /api/payments/verify - Gateway checkout callback
//! - GET /api/payments/:id - Payment record
//! - POST /api/payments/:id/offline-confirmation - Provider collected a pay-at-clinic payment
//!
//! # Verification
//!
//! The callback carries `order_id`, `payment_id` and a hex
//! `HMAC-SHA256(secret, "{order_id}|{payment_id}")`. A bad signature or a
//! mismatched amount fails the payment and the appointment; a valid one
//! confirms the appointment.

use super::unexpected;
use crate::aggregates::{Appointment, BookingAction, Payment};
use crate::server::state::AppState;
use crate::types::{Money, PaymentId};
use axum::{
    Json,
    extract::{Path, State},
};
use serde::{Deserialize, Serialize};
use slotbook_web::AppError;

/// Gateway checkout callback.
///
/// Accepts the gateway's own field names as aliases.
#[derive(Debug, Deserialize)]
pub struct VerifyPaymentRequest {
    /// Gateway order id
    #[serde(alias = "razorpay_order_id")]
    pub gateway_order_id: String,
    /// Gateway payment id
    #[serde(alias = "razorpay_payment_id")]
    pub gateway_payment_id: String,
    /// Hex HMAC signature
    #[serde(alias = "razorpay_signature")]
    pub signature: String,
    /// Amount in minor units, if reported
    pub amount: Option<Money>,
}

/// Provider acknowledgement of an offline payment.
#[derive(Debug, Deserialize)]
pub struct OfflineConfirmationRequest {
    /// Who collected the payment
    pub collected_by: String,
    /// Receipt photo reference or note
    pub proof: Option<String>,
}

/// Settled payment and confirmed appointment.
#[derive(Debug, Serialize)]
pub struct SettlementResponse {
    /// Appointment, now `confirmed`
    pub appointment: Appointment,
    /// Payment, now `verified`
    pub payment: Payment,
}

/// Verify a gateway callback.
///
/// A replayed callback is rejected and confirms nothing. A genuine callback
/// for an appointment that was already cancelled or expired is refunded.
///
/// # Errors
///
/// - `SIGNATURE_MISMATCH` / `AMOUNT_MISMATCH` (400); the payment is failed
/// - `ORDER_NOT_FOUND` (404) for an order this engine did not create
/// - `INVALID_TRANSITION` (409) for a replayed or late callback
pub async fn verify_payment(
    State(state): State<AppState>,
    Json(request): Json<VerifyPaymentRequest>,
) -> Result<Json<SettlementResponse>, AppError> {
    match state
        .service
        .dispatch(|correlation_id| BookingAction::VerifyPayment {
            correlation_id,
            gateway_order_id: request.gateway_order_id,
            gateway_payment_id: request.gateway_payment_id,
            signature: request.signature,
            amount: request.amount,
        })
        .await?
    {
        BookingAction::PaymentVerified {
            appointment,
            payment,
            ..
        } => Ok(Json(SettlementResponse {
            appointment,
            payment,
        })),
        other => Err(unexpected(&other)),
    }
}

/// Payment record.
///
/// # Errors
///
/// Returns `AppError::not_found` for an unknown payment.
pub async fn get_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<PaymentId>,
) -> Result<Json<Payment>, AppError> {
    state
        .service
        .query(|s| s.payments.get(&payment_id).cloned())
        .await
        .map(Json)
        .ok_or_else(|| AppError::not_found("Payment", payment_id))
}

/// Record that the provider collected an offline payment.
///
/// # Errors
///
/// - `NOT_FOUND` (404) for an unknown payment
/// - `INVALID_TRANSITION` (409) if the appointment is no longer awaiting payment
pub async fn confirm_offline_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<PaymentId>,
    Json(request): Json<OfflineConfirmationRequest>,
) -> Result<Json<SettlementResponse>, AppError> {
    match state
        .service
        .dispatch(|correlation_id| BookingAction::ConfirmOfflinePayment {
            correlation_id,
            payment_id,
            collected_by: request.collected_by,
            proof: request.proof,
        })
        .await?
    {
        BookingAction::PaymentVerified {
            appointment,
            payment,
            ..
        } => Ok(Json(SettlementResponse {
            appointment,
            payment,
        })),
        other => Err(unexpected(&other)),
    }
}
