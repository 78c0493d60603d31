//! Appointment lifecycle.
//!
//! ```text
//! draft            ──LockAcquired──────────────> slot-locked
//! slot-locked      ──PaymentInitiated──────────> payment-pending
//! payment-pending  ──PaymentVerified───────────> payment-verified
//! payment-verified ──Confirm (settled)─────────> confirmed
//! slot-locked      ──Cancel | LockLost─────────> cancelled
//! payment-pending  ──PaymentFailed | Cancel────> cancelled
//! confirmed        ──Cancel────────────────────> cancelled
//! any non-terminal ──Expire (reaper)───────────> expired
//! ```
//!
//! [`next_status`] is the whole transition table; anything it does not list
//! is rejected.

use crate::error::BookingError;
use crate::types::{
    Actor, AppointmentId, ConsultationType, PatientId, PaymentId, ProviderId, ReasonCode, SlotKey,
    hhmm,
};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where an appointment is in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AppointmentStatus {
    /// Created, no lock yet
    Draft,
    /// Backed by the patient's slot lock
    SlotLocked,
    /// Payment started; the appointment itself occupies the slot
    PaymentPending,
    /// Settlement recorded
    PaymentVerified,
    /// Booked
    Confirmed,
    /// Cancelled by a party or by a failed payment
    Cancelled,
    /// Timed out
    Expired,
}

impl AppointmentStatus {
    /// `confirmed`, `cancelled` or `expired`
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::Cancelled | Self::Expired)
    }

    /// Statuses in which the appointment is the slot's exclusion record
    #[must_use]
    pub const fn occupies_slot(self) -> bool {
        matches!(
            self,
            Self::PaymentPending | Self::PaymentVerified | Self::Confirmed
        )
    }

    /// Wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::SlotLocked => "slot-locked",
            Self::PaymentPending => "payment-pending",
            Self::PaymentVerified => "payment-verified",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What drives a transition
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionEvent {
    /// The patient's lock was granted
    LockAcquired,
    /// Payment started; lock handed over to the appointment
    PaymentInitiated,
    /// Settlement recorded
    PaymentVerified,
    /// Gateway reported failure or verification failed
    PaymentFailed,
    /// Booking confirmed
    Confirm,
    /// A party cancelled
    Cancel,
    /// The backing lock is gone
    LockLost,
    /// Timed out
    Expire,
}

impl TransitionEvent {
    /// Wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LockAcquired => "lock_acquired",
            Self::PaymentInitiated => "payment_initiated",
            Self::PaymentVerified => "payment_verified",
            Self::PaymentFailed => "payment_failed",
            Self::Confirm => "confirm",
            Self::Cancel => "cancel",
            Self::LockLost => "lock_lost",
            Self::Expire => "expire",
        }
    }
}

impl fmt::Display for TransitionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The transition table.
#[must_use]
pub const fn next_status(
    from: AppointmentStatus,
    event: TransitionEvent,
) -> Option<AppointmentStatus> {
    use AppointmentStatus as S;
    use TransitionEvent as E;

    match (from, event) {
        (S::Draft, E::LockAcquired) => Some(S::SlotLocked),
        (S::SlotLocked, E::PaymentInitiated) => Some(S::PaymentPending),
        (S::PaymentPending, E::PaymentVerified) => Some(S::PaymentVerified),
        (S::PaymentPending, E::PaymentFailed | E::Cancel)
        | (S::SlotLocked, E::Cancel | E::LockLost)
        | (S::Confirmed, E::Cancel) => Some(S::Cancelled),
        (S::PaymentVerified, E::Confirm) => Some(S::Confirmed),
        (S::Draft | S::SlotLocked | S::PaymentPending | S::PaymentVerified, E::Expire) => {
            Some(S::Expired)
        },
        _ => None,
    }
}

/// Proof that the appointment has been paid for
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Settlement {
    /// Gateway callback with a valid signature
    GatewayVerified {
        /// Gateway payment id
        gateway_payment_id: String,
    },
    /// Provider acknowledged collecting payment at the clinic
    OfflineAccepted {
        /// Who collected it
        collected_by: String,
    },
}

/// One entry of the audit trail
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    /// Previous status
    pub from: AppointmentStatus,
    /// New status
    pub to: AppointmentStatus,
    /// Event that caused it
    pub event: TransitionEvent,
    /// Who caused it
    pub actor: Actor,
    /// Why, if there is more to say than the event
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<ReasonCode>,
    /// When
    pub at: DateTime<Utc>,
}

/// A booking of one provider slot by one patient
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    /// Appointment ID
    pub id: AppointmentId,
    /// Provider
    pub provider_id: ProviderId,
    /// Patient
    pub patient_id: PatientId,
    /// Date
    pub date: NaiveDate,
    /// Slot start
    #[serde(with = "hhmm")]
    pub time: NaiveTime,
    /// Consultation type
    pub consultation_type: ConsultationType,
    /// Payment record, once payment has started
    pub payment_id: Option<PaymentId>,
    /// Current status
    pub status: AppointmentStatus,
    /// Append-only audit trail
    pub status_history: Vec<StatusChange>,
    /// Settlement, once recorded
    pub settlement: Option<Settlement>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Time of the latest transition
    pub status_changed_at: DateTime<Utc>,
    /// Expiry of the backing lock while `slot-locked`
    pub lock_expires_at: Option<DateTime<Utc>>,
}

impl Appointment {
    /// A `draft` appointment
    #[must_use]
    pub const fn draft(
        id: AppointmentId,
        slot: SlotKey,
        patient_id: PatientId,
        consultation_type: ConsultationType,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            provider_id: slot.provider_id,
            patient_id,
            date: slot.date,
            time: slot.time,
            consultation_type,
            payment_id: None,
            status: AppointmentStatus::Draft,
            status_history: Vec::new(),
            settlement: None,
            created_at: now,
            status_changed_at: now,
            lock_expires_at: None,
        }
    }

    /// The slot this appointment is for
    #[must_use]
    pub const fn slot(&self) -> SlotKey {
        SlotKey::new(self.provider_id, self.date, self.time)
    }

    /// Whether `actor` is a party to this appointment (or the system)
    #[must_use]
    pub fn is_party(&self, actor: Actor) -> bool {
        match actor {
            Actor::Patient(patient_id) => patient_id == self.patient_id,
            Actor::Provider(provider_id) => provider_id == self.provider_id,
            Actor::Gateway | Actor::Reaper | Actor::System => true,
        }
    }

    /// Apply `event`, recording it in the history.
    ///
    /// `Confirm` also requires a recorded settlement.
    ///
    /// # Errors
    ///
    /// [`BookingError::InvalidTransition`] if the table has no entry for the
    /// current status and `event`; the appointment is left unchanged.
    pub fn transition(
        &mut self,
        event: TransitionEvent,
        actor: Actor,
        reason: Option<ReasonCode>,
        at: DateTime<Utc>,
    ) -> Result<StatusChange, BookingError> {
        let from = self.status;
        let to = next_status(from, event)
            .filter(|_| event != TransitionEvent::Confirm || self.settlement.is_some())
            .ok_or(BookingError::InvalidTransition {
                appointment_id: self.id,
                from,
                event,
            })?;

        let change = StatusChange {
            from,
            to,
            event,
            actor,
            reason,
            at,
        };

        self.status = to;
        self.status_changed_at = at;
        if from == AppointmentStatus::SlotLocked {
            self.lock_expires_at = None;
        }
        self.status_history.push(change.clone());

        Ok(change)
    }
}
