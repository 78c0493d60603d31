//! Provider calendar endpoints.
//!
//! The booking engine keeps a snapshot of each provider's weekly schedule,
//! fees and online flag. Slots are derived from it on every read:
//! - POST /api/providers - Register or replace a provider snapshot
//! - PUT /api/providers/:id/availability - Turn bookings on or off
//! - GET /api/providers/:id/slots - Bookable slots for one date
//! - GET /api/providers/:id/slots/week - Bookable slots for a run of dates

use super::unexpected;
use crate::aggregates::BookingAction;
use crate::calendar::{CalendarSlot, ConsultationFees, Provider, WeeklySchedule, weekly_slots};
use crate::error::BookingError;
use crate::server::state::AppState;
use crate::types::{ConsultationType, ProviderId};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use slotbook_web::AppError;
use std::collections::BTreeMap;

/// Longest range `list_week` will derive
pub const MAX_DAYS: u32 = 31;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Provider snapshot as submitted by the calendar source.
#[derive(Debug, Deserialize)]
pub struct RegisterProviderRequest {
    /// Existing provider to replace; a new id is assigned when absent
    pub id: Option<ProviderId>,
    /// Display name
    pub name: String,
    /// Weekly template; Mon-Fri 09:00-17:00 with a lunch break when absent
    #[serde(default)]
    pub schedule: WeeklySchedule,
    /// Fees per consultation type
    pub fees: ConsultationFees,
    /// Offered consultation types
    #[serde(default = "default_consultation_types")]
    pub consultation_types: Vec<ConsultationType>,
    /// Accepting bookings
    #[serde(default = "default_true")]
    pub is_online: bool,
    /// Accepts pay-at-clinic
    #[serde(default)]
    pub allows_deferred_settlement: bool,
}

fn default_consultation_types() -> Vec<ConsultationType> {
    vec![ConsultationType::Online, ConsultationType::InPerson]
}

const fn default_true() -> bool {
    true
}

/// Online flag update.
#[derive(Debug, Deserialize)]
pub struct AvailabilityRequest {
    /// Accepting bookings
    pub is_online: bool,
}

/// Query for one date.
#[derive(Debug, Deserialize)]
pub struct SlotsQuery {
    /// Date
    pub date: NaiveDate,
    /// Consultation type, online by default
    pub consultation_type: Option<ConsultationType>,
}

/// Query for a range of dates.
#[derive(Debug, Deserialize)]
pub struct WeekQuery {
    /// First date
    pub start: NaiveDate,
    /// Number of dates, 7 by default
    pub days: Option<u32>,
    /// Consultation type, online by default
    pub consultation_type: Option<ConsultationType>,
}

/// Slots for one date.
#[derive(Debug, Serialize)]
pub struct SlotsResponse {
    /// Provider
    pub provider_id: ProviderId,
    /// Date
    pub date: NaiveDate,
    /// Consultation type
    pub consultation_type: ConsultationType,
    /// Bookable slots; `locked` ones are mid-booking
    pub slots: Vec<CalendarSlot>,
}

/// Slots for a range of dates.
#[derive(Debug, Serialize)]
pub struct WeekResponse {
    /// Provider
    pub provider_id: ProviderId,
    /// Consultation type
    pub consultation_type: ConsultationType,
    /// Slots by date
    pub days: BTreeMap<NaiveDate, Vec<CalendarSlot>>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Register or replace a provider snapshot.
///
/// ```bash
/// curl -X POST http://localhost:8080/api/providers \
///   -H "Content-Type: application/json" \
///   -d '{"name":"Dr. X","fees":{"online":50000,"in_person":80000}}'
/// ```
///
/// # Errors
///
/// Returns `AppError::validation` for an invalid schedule.
pub async fn register_provider(
    State(state): State<AppState>,
    Json(request): Json<RegisterProviderRequest>,
) -> Result<(StatusCode, Json<Provider>), AppError> {
    let provider = Provider {
        id: request.id.unwrap_or_default(),
        name: request.name,
        schedule: request.schedule,
        fees: request.fees,
        consultation_types: request.consultation_types,
        is_online: request.is_online,
        allows_deferred_settlement: request.allows_deferred_settlement,
    };

    match state
        .service
        .dispatch(|correlation_id| BookingAction::RegisterProvider {
            correlation_id,
            provider,
        })
        .await?
    {
        BookingAction::ProviderSaved { provider, .. } => {
            Ok((StatusCode::CREATED, Json(provider)))
        },
        other => Err(unexpected(&other)),
    }
}

/// Turn bookings on or off.
///
/// Existing locks and appointments are unaffected.
///
/// # Errors
///
/// Returns `AppError::not_found` for an unknown provider.
pub async fn set_availability(
    State(state): State<AppState>,
    Path(provider_id): Path<ProviderId>,
    Json(request): Json<AvailabilityRequest>,
) -> Result<Json<Provider>, AppError> {
    match state
        .service
        .dispatch(|correlation_id| BookingAction::SetProviderAvailability {
            correlation_id,
            provider_id,
            is_online: request.is_online,
        })
        .await?
    {
        BookingAction::ProviderSaved { provider, .. } => Ok(Json(provider)),
        other => Err(unexpected(&other)),
    }
}

/// Bookable slots for one date.
///
/// Occupied slots are left out; slots under an active lock are listed with
/// `locked: true`.
///
/// ```bash
/// curl "http://localhost:8080/api/providers/<id>/slots?date=2025-01-06&consultation_type=in-person"
/// ```
///
/// # Errors
///
/// Returns `AppError::not_found` for an unknown provider.
pub async fn list_slots(
    State(state): State<AppState>,
    Path(provider_id): Path<ProviderId>,
    Query(query): Query<SlotsQuery>,
) -> Result<Json<SlotsResponse>, AppError> {
    let consultation_type = query.consultation_type.unwrap_or(ConsultationType::Online);
    let now = state.service.now();

    let slots = state
        .service
        .query(|s| s.available_slots(provider_id, query.date, consultation_type, now))
        .await?;

    Ok(Json(SlotsResponse {
        provider_id,
        date: query.date,
        consultation_type,
        slots,
    }))
}

/// Bookable slots for `days` consecutive dates.
///
/// # Errors
///
/// - `AppError::validation` if `days` is 0 or above [`MAX_DAYS`]
/// - `AppError::not_found` for an unknown provider
pub async fn list_week(
    State(state): State<AppState>,
    Path(provider_id): Path<ProviderId>,
    Query(query): Query<WeekQuery>,
) -> Result<Json<WeekResponse>, AppError> {
    let days = query.days.unwrap_or(7);
    if days == 0 || days > MAX_DAYS {
        return Err(AppError::validation(format!("days must be between 1 and {MAX_DAYS}")));
    }
    let consultation_type = query.consultation_type.unwrap_or(ConsultationType::Online);
    let now = state.service.now();

    let days = state
        .service
        .query(|s| {
            let provider = s
                .providers
                .get(&provider_id)
                .ok_or(BookingError::ProviderNotFound { provider_id })?;
            Ok::<_, BookingError>(weekly_slots(
                provider,
                query.start,
                days,
                consultation_type,
                |slot| s.is_occupied(slot),
                |slot| s.is_locked(slot, now),
            ))
        })
        .await?;

    Ok(Json(WeekResponse {
        provider_id,
        consultation_type,
        days,
    }))
}
