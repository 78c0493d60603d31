//! Business metrics for the booking engine.
//!
//! # Exported Metrics
//!
//! ## Counters
//! - `slotbook_slot_locks_total{outcome}` - Lock requests by outcome (granted, reacquired, conflict, occupied)
//! - `slotbook_appointments_total{status}` - Appointment transitions by target status
//! - `slotbook_payments_total{status}` - Payments by status
//! - `slotbook_payment_amount_minor_total` - Settled amount in minor units
//! - `slotbook_payment_refunds_minor_total` - Refunded amount in minor units
//! - `slotbook_reaper_sweeps_total` - Reaper sweeps run
//! - `slotbook_reaper_released_total{kind}` - Locks and appointments reclaimed by the reaper
//!
//! ## Gauges
//! - `slotbook_active_slot_locks` - Locks currently in the table
//! - `slotbook_ws_connections` - Open WebSocket connections
//!
//! ## Histograms
//! - `slotbook_booking_duration_seconds` - Time from booking start to settlement

use crate::aggregates::{AppointmentStatus, PaymentStatus, ReapReport};
use crate::types::Money;
use metrics::{describe_counter, describe_gauge, describe_histogram};

/// Register metric descriptions.
///
/// Call once at startup, before anything is recorded.
pub fn register_business_metrics() {
    describe_counter!(
        "slotbook_slot_locks_total",
        "Slot lock requests by outcome (granted, reacquired, conflict, occupied)"
    );
    describe_gauge!(
        "slotbook_active_slot_locks",
        "Slot locks currently held, expired ones included until reclaimed"
    );
    describe_counter!(
        "slotbook_appointments_total",
        "Appointment status transitions by target status"
    );
    describe_counter!("slotbook_payments_total", "Payments by status");
    describe_counter!(
        "slotbook_payment_amount_minor_total",
        "Total settled payment amount in minor currency units"
    );
    describe_counter!(
        "slotbook_payment_refunds_minor_total",
        "Total refunded amount in minor currency units"
    );
    describe_histogram!(
        "slotbook_booking_duration_seconds",
        "Time from booking start to payment settlement"
    );
    describe_counter!("slotbook_reaper_sweeps_total", "Expiry reaper sweeps run");
    describe_counter!(
        "slotbook_reaper_released_total",
        "Locks and appointments reclaimed by the expiry reaper"
    );
    describe_gauge!("slotbook_ws_connections", "Open WebSocket connections");

    tracing::info!("Business metrics registered");
}

/// Record a lock request outcome
pub fn record_lock_outcome(outcome: &'static str) {
    metrics::counter!("slotbook_slot_locks_total", "outcome" => outcome).increment(1);
}

/// Set the lock table size
#[allow(clippy::cast_precision_loss)]
pub fn set_active_locks(count: usize) {
    metrics::gauge!("slotbook_active_slot_locks").set(count as f64);
}

/// Record an appointment entering `status`
pub fn record_appointment_status(status: AppointmentStatus) {
    metrics::counter!("slotbook_appointments_total", "status" => status.as_str()).increment(1);
}

/// Record a payment entering `status`
pub fn record_payment_status(status: PaymentStatus) {
    metrics::counter!("slotbook_payments_total", "status" => status.as_str()).increment(1);
}

/// Record a settled payment.
///
/// # Arguments
///
/// * `amount` - Settled amount
/// * `booking_duration` - Time since the booking started
#[allow(clippy::cast_precision_loss)]
pub fn record_payment_verified(amount: Money, booking_duration: chrono::Duration) {
    record_payment_status(PaymentStatus::Verified);
    metrics::counter!("slotbook_payment_amount_minor_total").increment(amount.minor());
    let secs = booking_duration.num_milliseconds() as f64 / 1000.0;
    metrics::histogram!("slotbook_booking_duration_seconds").record(secs);
    tracing::debug!(amount = amount.minor(), secs, "Recorded payment_verified metric");
}

/// Record a refund
pub fn record_payment_refunded(amount: Money) {
    record_payment_status(PaymentStatus::Refunded);
    metrics::counter!("slotbook_payment_refunds_minor_total").increment(amount.minor());
}

/// Record what a reaper sweep reclaimed
pub fn record_reaper_sweep(report: &ReapReport) {
    metrics::counter!("slotbook_reaper_sweeps_total").increment(1);
    metrics::counter!("slotbook_reaper_released_total", "kind" => "lock")
        .increment(report.locks_released as u64);
    metrics::counter!("slotbook_reaper_released_total", "kind" => "appointment")
        .increment(report.appointments_expired as u64);
}

/// Set the open WebSocket connection count
#[allow(clippy::cast_precision_loss)]
pub fn set_ws_connections(count: usize) {
    metrics::gauge!("slotbook_ws_connections").set(count as f64);
}
