//! Slot lock endpoints.
//!
//! HTTP counterpart of the `lock_slot` / `unlock_slot` socket messages:
//! - POST /api/slots/lock - Claim a slot for a patient
//! - POST /api/slots/unlock - Give a claimed slot back
//! - GET /api/slots/status - Whether a slot is locked or booked

use super::unexpected;
use crate::aggregates::{BookingAction, SlotLock};
use crate::server::state::AppState;
use crate::types::{AppointmentId, PatientId, ProviderId, SlotKey, hhmm};
use axum::{
    Json,
    extract::{Query, State},
};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use slotbook_web::AppError;

/// A slot and the patient acting on it.
#[derive(Debug, Deserialize)]
pub struct SlotRequest {
    /// Provider
    pub provider_id: ProviderId,
    /// Patient
    pub patient_id: PatientId,
    /// Date
    pub date: NaiveDate,
    /// Slot start, `HH:MM`
    #[serde(with = "hhmm")]
    pub time: NaiveTime,
}

impl SlotRequest {
    const fn slot(&self) -> SlotKey {
        SlotKey::new(self.provider_id, self.date, self.time)
    }
}

/// Granted lock.
#[derive(Debug, Serialize)]
pub struct LockResponse {
    /// Always `true`; refusals are errors
    pub granted: bool,
    /// The lock
    pub lock: SlotLock,
}

/// Release result.
#[derive(Debug, Serialize)]
pub struct UnlockResponse {
    /// Whether a lock held by the patient was removed
    pub released: bool,
}

/// Status query.
#[derive(Debug, Deserialize)]
pub struct SlotStatusQuery {
    /// Provider
    pub provider_id: ProviderId,
    /// Date
    pub date: NaiveDate,
    /// Slot start, `HH:MM`
    pub time: String,
}

/// Slot status.
#[derive(Debug, Serialize)]
pub struct SlotStatusResponse {
    /// Slot
    pub slot: SlotKey,
    /// Unexpired lock present
    pub locked: bool,
    /// Lock expiry, while locked
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Appointment occupying the slot
    #[serde(skip_serializing_if = "Option::is_none")]
    pub appointment_id: Option<AppointmentId>,
}

/// Claim a slot.
///
/// Repeating the request while the lock is held returns the original expiry.
///
/// # Errors
///
/// - `LOCK_CONFLICT` (409) if another patient holds the slot
/// - `SLOT_OCCUPIED` (409) if an appointment already owns it
/// - `REQUEST_TIMEOUT` (408) if the coordinator did not answer in time
pub async fn lock_slot(
    State(state): State<AppState>,
    Json(request): Json<SlotRequest>,
) -> Result<Json<LockResponse>, AppError> {
    let slot = request.slot();

    match state
        .service
        .dispatch(|correlation_id| BookingAction::AcquireSlotLock {
            correlation_id,
            slot,
            holder: request.patient_id,
        })
        .await?
    {
        BookingAction::SlotLockGranted { lock, .. } => Ok(Json(LockResponse {
            granted: true,
            lock,
        })),
        BookingAction::SlotLockDenied { error, .. } => Err(error.into()),
        other => Err(unexpected(&other)),
    }
}

/// Give a slot back.
///
/// Releasing a slot the patient does not hold answers `released: false`.
///
/// # Errors
///
/// Returns `AppError` if the store does not answer.
pub async fn unlock_slot(
    State(state): State<AppState>,
    Json(request): Json<SlotRequest>,
) -> Result<Json<UnlockResponse>, AppError> {
    let slot = request.slot();

    match state
        .service
        .dispatch(|correlation_id| BookingAction::ReleaseSlotLock {
            correlation_id,
            slot,
            holder: request.patient_id,
        })
        .await?
    {
        BookingAction::SlotLockReleased { released, .. } => Ok(Json(UnlockResponse { released })),
        other => Err(unexpected(&other)),
    }
}

/// Whether a slot is locked or booked.
///
/// ```bash
/// curl "http://localhost:8080/api/slots/status?provider_id=<id>&date=2025-01-06&time=10:00"
/// ```
///
/// # Errors
///
/// Returns `AppError::validation` for a malformed time.
pub async fn slot_status(
    State(state): State<AppState>,
    Query(query): Query<SlotStatusQuery>,
) -> Result<Json<SlotStatusResponse>, AppError> {
    let time = hhmm::parse(&query.time)
        .map_err(|_| AppError::validation(format!("Invalid time: {}", query.time)))?;
    let slot = SlotKey::new(query.provider_id, query.date, time);
    let now = state.service.now();

    let response = state
        .service
        .query(|s| SlotStatusResponse {
            slot,
            locked: s.is_locked(&slot, now),
            expires_at: s.locks.active(&slot, now).map(|lock| lock.expires_at),
            appointment_id: s.slot_index.get(&slot).copied(),
        })
        .await;

    Ok(Json(response))
}
