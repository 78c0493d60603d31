//! The booking reducer.
//!
//! One reducer owns every piece of shared booking state: the provider
//! calendar snapshot, the slot lock table, appointments and payments. The
//! store applies actions one at a time, so each command below is a single
//! check-and-set against that state.
//!
//! Commands carry a [`CorrelationId`]. The reducer answers every command
//! with exactly one result action carrying the same id, emitted from an
//! effect so that callers using `send_and_wait_for` see it:
//!
//! ```text
//! AcquireSlotLock   ──> SlotLockGranted | SlotLockDenied
//! ReleaseSlotLock   ──> SlotLockReleased
//! BeginBooking      ──> AppointmentUpdated | CommandRejected
//! InitiatePayment   ──> PaymentOrderReady | OfflinePaymentRegistered | CommandRejected
//! VerifyPayment     ──> PaymentVerified | CommandRejected
//! ReapExpired       ──> ReapCompleted
//! ```
//!
//! Result actions are no-ops when fed back into the reducer.

use super::appointment::{Appointment, AppointmentStatus, Settlement, StatusChange, TransitionEvent};
use super::payment::{Payment, PaymentMethod, PaymentStatus, PaymentVerifier, quote_fee};
use super::slot_lock::{Acquisition, SlotLock, SlotLockTable};
use crate::calendar::{CalendarSlot, Provider, derive_slots};
use crate::error::BookingError;
use crate::fanout::{Fanout, FanoutEvent, Room};
use crate::metrics;
use crate::payment_gateway::{GatewayOrder, OrderRequest, PaymentGateway};
use crate::types::{
    Actor, AppointmentId, ConsultationType, CorrelationId, Currency, HolderId, Money, PatientId,
    PaymentId, ProviderId, ReasonCode, SlotKey,
};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use slotbook_core::{SmallVec, async_effect, delay, effect::Effect, environment::Clock, reducer::Reducer};
use std::collections::HashMap;
use std::sync::Arc;

// ============================================================================
// State
// ============================================================================

/// Everything the booking engine knows
#[derive(Clone, Debug, Default)]
pub struct BookingState {
    /// Provider calendar snapshots
    pub providers: HashMap<ProviderId, Provider>,
    /// Slot locks
    pub locks: SlotLockTable,
    /// Appointments by ID
    pub appointments: HashMap<AppointmentId, Appointment>,
    /// Slots occupied by an appointment from `payment-pending` onward
    pub slot_index: HashMap<SlotKey, AppointmentId>,
    /// Payments by ID
    pub payments: HashMap<PaymentId, Payment>,
    /// Gateway order id to payment
    pub orders: HashMap<String, PaymentId>,
    /// Last rejection, for diagnostics
    pub last_error: Option<BookingError>,
}

impl BookingState {
    /// Creates an empty state
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an appointment occupies `slot`
    #[must_use]
    pub fn is_occupied(&self, slot: &SlotKey) -> bool {
        self.slot_index.contains_key(slot)
    }

    /// Whether `slot` has an unexpired lock at `now`
    #[must_use]
    pub fn is_locked(&self, slot: &SlotKey, now: DateTime<Utc>) -> bool {
        self.locks.is_locked(slot, now)
    }

    /// Bookable slots for a provider and date.
    ///
    /// # Errors
    ///
    /// [`BookingError::ProviderNotFound`] for an unknown provider.
    pub fn available_slots(
        &self,
        provider_id: ProviderId,
        date: NaiveDate,
        consultation_type: ConsultationType,
        now: DateTime<Utc>,
    ) -> Result<Vec<CalendarSlot>, BookingError> {
        let provider = self
            .providers
            .get(&provider_id)
            .ok_or(BookingError::ProviderNotFound { provider_id })?;

        Ok(derive_slots(
            provider,
            date,
            consultation_type,
            |slot| self.is_occupied(slot),
            |slot| self.is_locked(slot, now),
        ))
    }
}

// ============================================================================
// Environment
// ============================================================================

/// Tunables carried in the environment
#[derive(Clone, Debug)]
pub struct BookingPolicy {
    /// Slot lock lifetime, fixed from the first grant
    pub lock_ttl: Duration,
    /// How long an online payment may stay pending
    pub payment_grace: Duration,
    /// How long an offline payment may stay pending
    pub offline_settlement_window: Duration,
    /// Payment currency
    pub currency: Currency,
    /// Share of the in-person fee charged up front
    pub convenience_fee_percent: u32,
    /// Public gateway key handed to checkout
    pub key_id: String,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::minutes(10),
            payment_grace: Duration::minutes(15),
            offline_settlement_window: Duration::hours(24),
            currency: Currency::inr(),
            convenience_fee_percent: 5,
            key_id: "rzp_test_key".to_string(),
        }
    }
}

impl BookingPolicy {
    /// How long a `payment-pending` appointment paid with `method` may wait
    #[must_use]
    pub const fn grace_for(&self, method: PaymentMethod) -> Duration {
        match method {
            PaymentMethod::Online => self.payment_grace,
            PaymentMethod::Offline => self.offline_settlement_window,
        }
    }
}

/// Environment dependencies for the booking reducer
#[derive(Clone)]
pub struct BookingEnvironment {
    /// Clock for timestamps and expiry checks
    pub clock: Arc<dyn Clock>,
    /// Payment gateway
    pub gateway: Arc<dyn PaymentGateway>,
    /// Callback signature check
    pub verifier: PaymentVerifier,
    /// Room fan-out
    pub fanout: Fanout,
    /// Tunables
    pub policy: BookingPolicy,
}

impl BookingEnvironment {
    /// Creates a new `BookingEnvironment`
    #[must_use]
    pub fn new(
        clock: Arc<dyn Clock>,
        gateway: Arc<dyn PaymentGateway>,
        verifier: PaymentVerifier,
        fanout: Fanout,
        policy: BookingPolicy,
    ) -> Self {
        Self {
            clock,
            gateway,
            verifier,
            fanout,
            policy,
        }
    }
}

// ============================================================================
// Actions
// ============================================================================

/// Checkout details for an online payment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutOrder {
    /// Gateway order id
    pub order_id: String,
    /// Amount in minor units
    pub amount: Money,
    /// Currency
    pub currency: Currency,
    /// Public gateway key
    pub key_id: String,
    /// Merchant receipt reference
    pub receipt: String,
}

/// What one reaper sweep did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReapReport {
    /// Expired locks removed
    pub locks_released: usize,
    /// Appointments moved to `expired`
    pub appointments_expired: usize,
}

impl ReapReport {
    /// Nothing was reclaimed
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.locks_released == 0 && self.appointments_expired == 0
    }
}

/// Actions for the booking reducer
#[derive(Clone, Debug)]
pub enum BookingAction {
    // ========== Provider calendar ==========
    /// Register or replace a provider snapshot
    RegisterProvider {
        /// Correlation ID
        correlation_id: CorrelationId,
        /// Snapshot
        provider: Provider,
    },
    /// Turn bookings on or off for a provider
    SetProviderAvailability {
        /// Correlation ID
        correlation_id: CorrelationId,
        /// Provider
        provider_id: ProviderId,
        /// Accepting bookings
        is_online: bool,
    },

    // ========== Slot locks ==========
    /// Claim a slot for a patient
    AcquireSlotLock {
        /// Correlation ID
        correlation_id: CorrelationId,
        /// Slot
        slot: SlotKey,
        /// Claiming patient
        holder: HolderId,
    },
    /// Give a claimed slot back
    ReleaseSlotLock {
        /// Correlation ID
        correlation_id: CorrelationId,
        /// Slot
        slot: SlotKey,
        /// Holding patient
        holder: HolderId,
    },
    /// Scheduled re-check of one granted lock
    ExpireSlotLock {
        /// Slot
        slot: SlotKey,
        /// Holder at grant time
        holder: HolderId,
        /// Grant time, to tell re-grants apart
        acquired_at: DateTime<Utc>,
    },

    // ========== Appointments ==========
    /// Start booking a slot
    BeginBooking {
        /// Correlation ID
        correlation_id: CorrelationId,
        /// New appointment ID
        appointment_id: AppointmentId,
        /// Provider
        provider_id: ProviderId,
        /// Patient
        patient_id: PatientId,
        /// Date
        date: NaiveDate,
        /// Slot start
        time: NaiveTime,
        /// Consultation type
        consultation_type: ConsultationType,
    },
    /// Start paying for a slot-locked appointment
    InitiatePayment {
        /// Correlation ID
        correlation_id: CorrelationId,
        /// Appointment
        appointment_id: AppointmentId,
        /// Online or offline
        method: PaymentMethod,
    },
    /// Gateway payment callback
    VerifyPayment {
        /// Correlation ID
        correlation_id: CorrelationId,
        /// Gateway order id
        gateway_order_id: String,
        /// Gateway payment id
        gateway_payment_id: String,
        /// Hex HMAC signature
        signature: String,
        /// Amount, if the callback reports one
        amount: Option<Money>,
    },
    /// Provider acknowledges collecting an offline payment
    ConfirmOfflinePayment {
        /// Correlation ID
        correlation_id: CorrelationId,
        /// Payment
        payment_id: PaymentId,
        /// Who collected it
        collected_by: String,
        /// Proof of collection
        proof: Option<String>,
    },
    /// Cancel an appointment
    CancelAppointment {
        /// Correlation ID
        correlation_id: CorrelationId,
        /// Appointment
        appointment_id: AppointmentId,
        /// Who is cancelling
        actor: Actor,
        /// Why
        reason: ReasonCode,
    },
    /// Explicit confirmation request
    ConfirmAppointment {
        /// Correlation ID
        correlation_id: CorrelationId,
        /// Appointment
        appointment_id: AppointmentId,
    },
    /// Reclaim expired locks and abandoned payments
    ReapExpired {
        /// Correlation ID
        correlation_id: CorrelationId,
    },

    // ========== Gateway feedback ==========
    /// Order created at the gateway
    GatewayOrderCreated {
        /// Correlation ID of the `InitiatePayment`
        correlation_id: CorrelationId,
        /// Payment
        payment_id: PaymentId,
        /// Order
        order: GatewayOrder,
    },
    /// Order creation failed
    GatewayOrderFailed {
        /// Correlation ID of the `InitiatePayment`
        correlation_id: CorrelationId,
        /// Payment
        payment_id: PaymentId,
        /// Gateway error
        error: String,
    },
    /// Refund went through
    RefundCompleted {
        /// Payment
        payment_id: PaymentId,
        /// Gateway refund id
        refund_id: String,
    },
    /// Refund failed
    RefundFailed {
        /// Payment
        payment_id: PaymentId,
        /// Gateway error
        error: String,
    },

    // ========== Results ==========
    /// Provider snapshot stored
    ProviderSaved {
        /// Correlation ID
        correlation_id: CorrelationId,
        /// Stored snapshot
        provider: Provider,
    },
    /// Lock granted (new or idempotent re-grant)
    SlotLockGranted {
        /// Correlation ID
        correlation_id: CorrelationId,
        /// The lock
        lock: SlotLock,
    },
    /// Lock refused
    SlotLockDenied {
        /// Correlation ID
        correlation_id: CorrelationId,
        /// Slot
        slot: SlotKey,
        /// Requesting patient
        holder: HolderId,
        /// Why
        error: BookingError,
    },
    /// Release processed
    SlotLockReleased {
        /// Correlation ID
        correlation_id: CorrelationId,
        /// Slot
        slot: SlotKey,
        /// Requesting patient
        holder: HolderId,
        /// Whether a lock was removed
        released: bool,
    },
    /// Appointment after a successful command
    AppointmentUpdated {
        /// Correlation ID
        correlation_id: CorrelationId,
        /// Appointment
        appointment: Appointment,
    },
    /// Online payment ready for checkout
    PaymentOrderReady {
        /// Correlation ID
        correlation_id: CorrelationId,
        /// Appointment
        appointment_id: AppointmentId,
        /// Payment
        payment: Payment,
        /// Checkout details
        order: CheckoutOrder,
    },
    /// Offline payment registered
    OfflinePaymentRegistered {
        /// Correlation ID
        correlation_id: CorrelationId,
        /// Appointment
        appointment: Appointment,
        /// Payment, with receipt number and token
        payment: Payment,
    },
    /// Payment settled and appointment confirmed
    PaymentVerified {
        /// Correlation ID
        correlation_id: CorrelationId,
        /// Confirmed appointment
        appointment: Appointment,
        /// Verified payment
        payment: Payment,
    },
    /// Command refused
    CommandRejected {
        /// Correlation ID
        correlation_id: CorrelationId,
        /// Why
        error: BookingError,
    },
    /// Reaper sweep finished
    ReapCompleted {
        /// Correlation ID
        correlation_id: CorrelationId,
        /// What was reclaimed
        report: ReapReport,
    },
}

impl BookingAction {
    /// Correlation ID, for actions that carry one
    #[must_use]
    pub const fn correlation_id(&self) -> Option<CorrelationId> {
        match self {
            Self::RegisterProvider { correlation_id, .. }
            | Self::SetProviderAvailability { correlation_id, .. }
            | Self::AcquireSlotLock { correlation_id, .. }
            | Self::ReleaseSlotLock { correlation_id, .. }
            | Self::BeginBooking { correlation_id, .. }
            | Self::InitiatePayment { correlation_id, .. }
            | Self::VerifyPayment { correlation_id, .. }
            | Self::ConfirmOfflinePayment { correlation_id, .. }
            | Self::CancelAppointment { correlation_id, .. }
            | Self::ConfirmAppointment { correlation_id, .. }
            | Self::ReapExpired { correlation_id }
            | Self::GatewayOrderCreated { correlation_id, .. }
            | Self::GatewayOrderFailed { correlation_id, .. }
            | Self::ProviderSaved { correlation_id, .. }
            | Self::SlotLockGranted { correlation_id, .. }
            | Self::SlotLockDenied { correlation_id, .. }
            | Self::SlotLockReleased { correlation_id, .. }
            | Self::AppointmentUpdated { correlation_id, .. }
            | Self::PaymentOrderReady { correlation_id, .. }
            | Self::OfflinePaymentRegistered { correlation_id, .. }
            | Self::PaymentVerified { correlation_id, .. }
            | Self::CommandRejected { correlation_id, .. }
            | Self::ReapCompleted { correlation_id, .. } => Some(*correlation_id),
            Self::ExpireSlotLock { .. }
            | Self::RefundCompleted { .. }
            | Self::RefundFailed { .. } => None,
        }
    }

    /// Whether this is the answer to a command
    #[must_use]
    pub const fn is_result(&self) -> bool {
        matches!(
            self,
            Self::ProviderSaved { .. }
                | Self::SlotLockGranted { .. }
                | Self::SlotLockDenied { .. }
                | Self::SlotLockReleased { .. }
                | Self::AppointmentUpdated { .. }
                | Self::PaymentOrderReady { .. }
                | Self::OfflinePaymentRegistered { .. }
                | Self::PaymentVerified { .. }
                | Self::CommandRejected { .. }
                | Self::ReapCompleted { .. }
        )
    }

    /// Whether this is the answer to the command with `correlation_id`
    #[must_use]
    pub fn answers(&self, correlation_id: CorrelationId) -> bool {
        self.is_result() && self.correlation_id() == Some(correlation_id)
    }
}

// ============================================================================
// Effect collection
// ============================================================================

/// Collects fan-out events and effects while a command is reduced.
#[derive(Default)]
struct Outbox {
    events: Vec<(Room, FanoutEvent)>,
    effects: SmallVec<[Effect<BookingAction>; 4]>,
}

impl Outbox {
    fn publish(&mut self, room: Room, event: FanoutEvent) {
        self.events.push((room, event));
    }

    fn slot_unlocked(&mut self, slot: SlotKey) {
        self.publish(Room::Provider(slot.provider_id), FanoutEvent::unlocked(slot));
    }

    fn status_changed(&mut self, appointment: &Appointment, change: &StatusChange) {
        let event = FanoutEvent::status_updated(appointment, change);
        self.publish(Room::Appointment(appointment.id), event.clone());
        self.publish(Room::Provider(appointment.provider_id), event.clone());
        self.publish(Room::Patient(appointment.patient_id), event);
        metrics::record_appointment_status(change.to);
    }

    fn effect(&mut self, effect: Effect<BookingAction>) {
        self.effects.push(effect);
    }

    fn reply(&mut self, action: BookingAction) {
        self.effects.push(async_effect! { Some(action) });
    }

    fn finish(mut self, fanout: &Fanout) -> SmallVec<[Effect<BookingAction>; 4]> {
        if !self.events.is_empty() {
            let fanout = fanout.clone();
            let events = std::mem::take(&mut self.events);
            self.effects.insert(
                0,
                async_effect! {
                    fanout.publish_all(events).await;
                    None
                },
            );
        }
        self.effects
    }
}

fn cancel_order_effect(env: &BookingEnvironment, order_id: String) -> Effect<BookingAction> {
    let gateway = Arc::clone(&env.gateway);
    async_effect! {
        if let Err(error) = gateway.cancel_order(&order_id).await {
            tracing::warn!(order_id = %order_id, %error, "Failed to cancel gateway order");
        }
        None
    }
}

fn refund_effect(
    env: &BookingEnvironment,
    payment_id: PaymentId,
    gateway_payment_id: String,
    amount: Money,
) -> Effect<BookingAction> {
    let gateway = Arc::clone(&env.gateway);
    async_effect! {
        Some(match gateway.refund_payment(&gateway_payment_id, amount).await {
            Ok(refund_id) => BookingAction::RefundCompleted {
                payment_id,
                refund_id,
            },
            Err(error) => BookingAction::RefundFailed {
                payment_id,
                error: error.to_string(),
            },
        })
    }
}

/// Drop the occupancy record for `slot` if `appointment_id` holds it.
fn vacate(
    slot_index: &mut HashMap<SlotKey, AppointmentId>,
    out: &mut Outbox,
    slot: SlotKey,
    appointment_id: AppointmentId,
) {
    if slot_index.get(&slot) == Some(&appointment_id) {
        slot_index.remove(&slot);
        out.slot_unlocked(slot);
    }
}

// ============================================================================
// Reducer
// ============================================================================

/// Reducer for slot locks, appointments and payments
#[derive(Clone, Debug, Default)]
pub struct BookingReducer;

impl BookingReducer {
    /// Creates a new `BookingReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// The provider must exist, be online and offer a slot starting at `slot.time`.
    fn check_slot<'a>(state: &'a BookingState, slot: &SlotKey) -> Result<&'a Provider, BookingError> {
        let provider_id = slot.provider_id;
        let provider = state
            .providers
            .get(&provider_id)
            .ok_or(BookingError::ProviderNotFound { provider_id })?;

        if !provider.is_online {
            return Err(BookingError::ProviderUnavailable { provider_id });
        }
        if !provider.has_slot_at(slot.date, slot.time) {
            return Err(BookingError::SlotNotOffered { slot: *slot });
        }
        Ok(provider)
    }

    /// A lock already removed from the table: announce it and expire the
    /// appointment it was backing. Returns whether an appointment expired.
    fn reclaim_lock(
        state: &mut BookingState,
        out: &mut Outbox,
        lock: &SlotLock,
        now: DateTime<Utc>,
    ) -> bool {
        let slot = lock.slot();
        out.slot_unlocked(slot);
        tracing::info!(slot = %slot, holder = %lock.holder_id, "Reclaimed expired slot lock");

        let Some(appointment) = lock
            .appointment_id
            .and_then(|id| state.appointments.get_mut(&id))
        else {
            return false;
        };
        if appointment.status != AppointmentStatus::SlotLocked {
            return false;
        }

        match appointment.transition(
            TransitionEvent::Expire,
            Actor::Reaper,
            Some(ReasonCode::LockExpired),
            now,
        ) {
            Ok(change) => {
                out.status_changed(appointment, &change);
                true
            },
            Err(_) => false,
        }
    }

    /// Insert-if-absent on the lock table, after occupancy and calendar checks.
    fn try_acquire(
        state: &mut BookingState,
        env: &BookingEnvironment,
        out: &mut Outbox,
        slot: SlotKey,
        holder: HolderId,
        now: DateTime<Utc>,
    ) -> Result<Acquisition, BookingError> {
        Self::check_slot(state, &slot)?;

        if state.is_occupied(&slot) {
            metrics::record_lock_outcome("occupied");
            return Err(BookingError::SlotOccupied { slot });
        }

        if let Some(stale) = state.locks.take_expired(&slot, now) {
            Self::reclaim_lock(state, out, &stale, now);
        }

        let acquisition = state
            .locks
            .acquire(slot, holder, now, env.policy.lock_ttl)
            .inspect_err(|_| metrics::record_lock_outcome("conflict"))?;

        if let Acquisition::Granted(lock) = &acquisition {
            metrics::record_lock_outcome("granted");
            out.publish(Room::Provider(slot.provider_id), FanoutEvent::locked(lock));
            out.effect(delay! {
                duration: env.policy.lock_ttl.to_std().unwrap_or_default(),
                action: BookingAction::ExpireSlotLock {
                    slot,
                    holder,
                    acquired_at: lock.acquired_at,
                }
            });
            tracing::debug!(slot = %slot, holder = %holder, expires_at = %lock.expires_at, "Slot lock granted");
        } else {
            metrics::record_lock_outcome("reacquired");
        }

        Ok(acquisition)
    }

    fn register_provider(
        state: &mut BookingState,
        out: &mut Outbox,
        correlation_id: CorrelationId,
        provider: Provider,
    ) -> Result<(), BookingError> {
        provider.validate().map_err(BookingError::Validation)?;

        tracing::info!(provider_id = %provider.id, name = %provider.name, "Provider registered");
        state.providers.insert(provider.id, provider.clone());
        out.reply(BookingAction::ProviderSaved {
            correlation_id,
            provider,
        });
        Ok(())
    }

    fn set_provider_availability(
        state: &mut BookingState,
        out: &mut Outbox,
        correlation_id: CorrelationId,
        provider_id: ProviderId,
        is_online: bool,
        now: DateTime<Utc>,
    ) -> Result<(), BookingError> {
        let provider = state
            .providers
            .get_mut(&provider_id)
            .ok_or(BookingError::ProviderNotFound { provider_id })?;

        if provider.is_online != is_online {
            provider.is_online = is_online;
            tracing::info!(provider_id = %provider_id, is_online, "Provider availability changed");
            out.publish(
                Room::Provider(provider_id),
                FanoutEvent::ProviderStatusUpdated {
                    provider_id,
                    is_online,
                    changed_at: now,
                },
            );
        }
        out.reply(BookingAction::ProviderSaved {
            correlation_id,
            provider: provider.clone(),
        });
        Ok(())
    }

    fn acquire_slot_lock(
        state: &mut BookingState,
        env: &BookingEnvironment,
        out: &mut Outbox,
        correlation_id: CorrelationId,
        slot: SlotKey,
        holder: HolderId,
        now: DateTime<Utc>,
    ) {
        match Self::try_acquire(state, env, out, slot, holder, now) {
            Ok(acquisition) => out.reply(BookingAction::SlotLockGranted {
                correlation_id,
                lock: acquisition.lock().clone(),
            }),
            Err(error) => {
                tracing::info!(slot = %slot, holder = %holder, %error, "Slot lock denied");
                out.publish(
                    Room::Patient(holder),
                    FanoutEvent::lock_failed(slot, error.reason()),
                );
                out.reply(BookingAction::SlotLockDenied {
                    correlation_id,
                    slot,
                    holder,
                    error,
                });
            },
        }
    }

    fn release_slot_lock(
        state: &mut BookingState,
        out: &mut Outbox,
        correlation_id: CorrelationId,
        slot: SlotKey,
        holder: HolderId,
        now: DateTime<Utc>,
    ) {
        let lock = state.locks.release(&slot, holder, now);
        let released = lock.is_some();

        if let Some(lock) = lock {
            out.slot_unlocked(slot);
            tracing::debug!(slot = %slot, holder = %holder, "Slot lock released");

            if let Some(appointment) = lock
                .appointment_id
                .and_then(|id| state.appointments.get_mut(&id))
                .filter(|a| a.status == AppointmentStatus::SlotLocked)
            {
                if let Ok(change) = appointment.transition(
                    TransitionEvent::Cancel,
                    Actor::Patient(holder),
                    Some(ReasonCode::LockReleased),
                    now,
                ) {
                    out.status_changed(appointment, &change);
                }
            }
        }

        out.reply(BookingAction::SlotLockReleased {
            correlation_id,
            slot,
            holder,
            released,
        });
    }

    fn expire_slot_lock(
        state: &mut BookingState,
        out: &mut Outbox,
        slot: SlotKey,
        holder: HolderId,
        acquired_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        let due = state.locks.get(&slot).is_some_and(|lock| {
            lock.holder_id == holder && lock.acquired_at == acquired_at && !lock.is_active_at(now)
        });

        if due {
            if let Some(lock) = state.locks.remove(&slot) {
                Self::reclaim_lock(state, out, &lock, now);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn begin_booking(
        state: &mut BookingState,
        env: &BookingEnvironment,
        out: &mut Outbox,
        correlation_id: CorrelationId,
        appointment_id: AppointmentId,
        slot: SlotKey,
        patient_id: PatientId,
        consultation_type: ConsultationType,
        now: DateTime<Utc>,
    ) -> Result<(), BookingError> {
        if state.appointments.contains_key(&appointment_id) {
            return Err(BookingError::Validation(format!(
                "Appointment {appointment_id} already exists"
            )));
        }

        let provider = Self::check_slot(state, &slot)?;
        if !provider.offers(consultation_type) {
            return Err(BookingError::SlotNotOffered { slot });
        }

        let acquisition = Self::try_acquire(state, env, out, slot, patient_id, now)
            .inspect_err(|error| {
                out.publish(
                    Room::Patient(patient_id),
                    FanoutEvent::lock_failed(slot, error.reason()),
                );
            })?;

        if let Some(existing) = acquisition.lock().appointment_id {
            let in_progress = state
                .appointments
                .get(&existing)
                .is_some_and(|a| a.status == AppointmentStatus::SlotLocked);
            if in_progress {
                return Err(BookingError::Validation(format!(
                    "Slot {slot} already has booking {existing} in progress"
                )));
            }
        }

        let mut appointment =
            Appointment::draft(appointment_id, slot, patient_id, consultation_type, now);
        let change = appointment.transition(
            TransitionEvent::LockAcquired,
            Actor::Patient(patient_id),
            None,
            now,
        )?;
        appointment.lock_expires_at = Some(acquisition.lock().expires_at);

        if let Some(lock) = state.locks.get_mut(&slot) {
            lock.appointment_id = Some(appointment_id);
        }

        tracing::info!(
            appointment_id = %appointment_id,
            slot = %slot,
            patient_id = %patient_id,
            "Booking started"
        );

        out.status_changed(&appointment, &change);
        state.appointments.insert(appointment_id, appointment.clone());
        out.reply(BookingAction::AppointmentUpdated {
            correlation_id,
            appointment,
        });
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    fn initiate_payment(
        state: &mut BookingState,
        env: &BookingEnvironment,
        out: &mut Outbox,
        correlation_id: CorrelationId,
        appointment_id: AppointmentId,
        method: PaymentMethod,
        now: DateTime<Utc>,
    ) -> Result<(), BookingError> {
        let appointment = state
            .appointments
            .get_mut(&appointment_id)
            .ok_or(BookingError::AppointmentNotFound { appointment_id })?;

        if appointment.status != AppointmentStatus::SlotLocked {
            return Err(BookingError::InvalidTransition {
                appointment_id,
                from: appointment.status,
                event: TransitionEvent::PaymentInitiated,
            });
        }

        let slot = appointment.slot();
        let patient_id = appointment.patient_id;

        let lock_held = state
            .locks
            .active(&slot, now)
            .is_some_and(|lock| lock.holder_id == patient_id);

        if !lock_held {
            let stale_own_lock = state
                .locks
                .get(&slot)
                .is_some_and(|lock| lock.holder_id == patient_id);
            if stale_own_lock {
                state.locks.remove(&slot);
                out.slot_unlocked(slot);
            }

            let change = appointment.transition(
                TransitionEvent::LockLost,
                Actor::System,
                Some(ReasonCode::LockExpired),
                now,
            )?;
            out.status_changed(appointment, &change);
            return Err(BookingError::LockExpired { slot });
        }

        let provider = state
            .providers
            .get(&slot.provider_id)
            .ok_or(BookingError::ProviderNotFound {
                provider_id: slot.provider_id,
            })?;

        if method == PaymentMethod::Offline && !provider.allows_deferred_settlement {
            return Err(BookingError::OfflineSettlementNotAllowed {
                provider_id: provider.id,
            });
        }

        let amount = quote_fee(
            &provider.fees,
            appointment.consultation_type,
            env.policy.convenience_fee_percent,
        )
        .ok_or_else(|| BookingError::Validation("Fee out of range".to_string()))?;

        let currency = env.policy.currency.clone();
        let payment = match method {
            PaymentMethod::Online => Payment::online(appointment_id, amount, currency.clone(), now),
            PaymentMethod::Offline => Payment::offline(
                appointment_id,
                amount,
                currency.clone(),
                now,
                &mut rand::thread_rng(),
            ),
        };

        // Hand-over: the appointment replaces the lock as the slot's exclusion record.
        let change = appointment.transition(
            TransitionEvent::PaymentInitiated,
            Actor::Patient(patient_id),
            None,
            now,
        )?;
        appointment.payment_id = Some(payment.id);
        state.locks.remove(&slot);
        state.slot_index.insert(slot, appointment_id);
        out.status_changed(appointment, &change);

        metrics::record_payment_status(PaymentStatus::Initiated);
        tracing::info!(
            appointment_id = %appointment_id,
            payment_id = %payment.id,
            amount = amount.minor(),
            ?method,
            "Payment initiated"
        );

        match method {
            PaymentMethod::Online => {
                let gateway = Arc::clone(&env.gateway);
                let payment_id = payment.id;
                let request = OrderRequest {
                    amount,
                    currency,
                    receipt: payment.receipt.clone(),
                };
                out.effect(Effect::Future(Box::pin(async move {
                    Some(match gateway.create_order(request).await {
                        Ok(order) => BookingAction::GatewayOrderCreated {
                            correlation_id,
                            payment_id,
                            order,
                        },
                        Err(error) => BookingAction::GatewayOrderFailed {
                            correlation_id,
                            payment_id,
                            error: error.to_string(),
                        },
                    })
                })));
            },
            PaymentMethod::Offline => out.reply(BookingAction::OfflinePaymentRegistered {
                correlation_id,
                appointment: appointment.clone(),
                payment: payment.clone(),
            }),
        }

        state.payments.insert(payment.id, payment);
        Ok(())
    }

    fn gateway_order_created(
        state: &mut BookingState,
        env: &BookingEnvironment,
        out: &mut Outbox,
        correlation_id: CorrelationId,
        payment_id: PaymentId,
        order: GatewayOrder,
    ) -> Result<(), BookingError> {
        let payment = state
            .payments
            .get_mut(&payment_id)
            .ok_or(BookingError::PaymentNotFound { payment_id })?;

        payment.gateway_order_id = Some(order.id.clone());
        state.orders.insert(order.id.clone(), payment_id);

        let appointment_id = payment.appointment_id;
        let status = state
            .appointments
            .get(&appointment_id)
            .map(|a| a.status)
            .ok_or(BookingError::AppointmentNotFound { appointment_id })?;

        if payment.status != PaymentStatus::Initiated || status != AppointmentStatus::PaymentPending {
            // Cancelled or expired while the order was being created.
            out.effect(cancel_order_effect(env, order.id));
            return Err(BookingError::InvalidTransition {
                appointment_id,
                from: status,
                event: TransitionEvent::PaymentInitiated,
            });
        }

        out.reply(BookingAction::PaymentOrderReady {
            correlation_id,
            appointment_id,
            payment: payment.clone(),
            order: CheckoutOrder {
                order_id: order.id,
                amount: order.amount,
                currency: order.currency,
                key_id: env.policy.key_id.clone(),
                receipt: order.receipt,
            },
        });
        Ok(())
    }

    fn gateway_order_failed(
        state: &mut BookingState,
        out: &mut Outbox,
        payment_id: PaymentId,
        error: String,
        now: DateTime<Utc>,
    ) -> Result<(), BookingError> {
        let payment = state
            .payments
            .get_mut(&payment_id)
            .ok_or(BookingError::PaymentNotFound { payment_id })?;
        payment.fail(ReasonCode::GatewayError);
        metrics::record_payment_status(PaymentStatus::Failed);

        if let Some(appointment) = state
            .appointments
            .get_mut(&payment.appointment_id)
            .filter(|a| a.status == AppointmentStatus::PaymentPending)
        {
            let change = appointment.transition(
                TransitionEvent::PaymentFailed,
                Actor::Gateway,
                Some(ReasonCode::GatewayError),
                now,
            )?;
            vacate(&mut state.slot_index, out, appointment.slot(), appointment.id);
            out.status_changed(appointment, &change);
        }

        tracing::warn!(payment_id = %payment_id, %error, "Gateway order creation failed");
        Err(BookingError::Gateway(error))
    }

    #[allow(clippy::too_many_arguments, clippy::too_many_lines)]
    fn verify_payment(
        state: &mut BookingState,
        env: &BookingEnvironment,
        out: &mut Outbox,
        correlation_id: CorrelationId,
        gateway_order_id: String,
        gateway_payment_id: String,
        signature: &str,
        amount: Option<Money>,
        now: DateTime<Utc>,
    ) -> Result<(), BookingError> {
        let payment_id = *state
            .orders
            .get(&gateway_order_id)
            .ok_or_else(|| BookingError::OrderNotFound {
                gateway_order_id: gateway_order_id.clone(),
            })?;
        let payment = state
            .payments
            .get_mut(&payment_id)
            .ok_or(BookingError::PaymentNotFound { payment_id })?;
        let appointment_id = payment.appointment_id;
        let appointment = state
            .appointments
            .get_mut(&appointment_id)
            .ok_or(BookingError::AppointmentNotFound { appointment_id })?;

        let signature_ok = env
            .verifier
            .verify(&gateway_order_id, &gateway_payment_id, signature);
        let amount_ok = amount.is_none_or(|received| received == payment.amount);

        if !signature_ok || !amount_ok {
            let (reason, error) = if signature_ok {
                (
                    ReasonCode::AmountMismatch,
                    BookingError::AmountMismatch {
                        expected: payment.amount,
                        received: amount.unwrap_or_default(),
                    },
                )
            } else {
                (
                    ReasonCode::SignatureMismatch,
                    BookingError::SignatureMismatch {
                        gateway_order_id: gateway_order_id.clone(),
                    },
                )
            };

            tracing::warn!(
                payment_id = %payment_id,
                appointment_id = %appointment_id,
                gateway_order_id = %gateway_order_id,
                %error,
                "Payment verification failed"
            );

            if payment.status == PaymentStatus::Initiated
                && appointment.status == AppointmentStatus::PaymentPending
            {
                payment.fail(reason);
                metrics::record_payment_status(PaymentStatus::Failed);
                let change = appointment.transition(
                    TransitionEvent::PaymentFailed,
                    Actor::Gateway,
                    Some(reason),
                    now,
                )?;
                vacate(&mut state.slot_index, out, appointment.slot(), appointment_id);
                out.status_changed(appointment, &change);
                out.effect(cancel_order_effect(env, gateway_order_id));
            }

            return Err(error);
        }

        if payment.status == PaymentStatus::Initiated
            && appointment.status == AppointmentStatus::PaymentPending
        {
            payment.status = PaymentStatus::Verified;
            payment.gateway_payment_id = Some(gateway_payment_id.clone());
            payment.verified_at = Some(now);
            appointment.settlement = Some(Settlement::GatewayVerified { gateway_payment_id });

            let verified = appointment.transition(
                TransitionEvent::PaymentVerified,
                Actor::Gateway,
                None,
                now,
            )?;
            out.status_changed(appointment, &verified);
            let confirmed =
                appointment.transition(TransitionEvent::Confirm, Actor::Gateway, None, now)?;
            out.status_changed(appointment, &confirmed);

            metrics::record_payment_verified(payment.amount, now - appointment.created_at);
            tracing::info!(
                appointment_id = %appointment_id,
                payment_id = %payment_id,
                "Payment verified, appointment confirmed"
            );

            out.reply(BookingAction::PaymentVerified {
                correlation_id,
                appointment: appointment.clone(),
                payment: payment.clone(),
            });
            return Ok(());
        }

        // Genuine but late: the appointment can no longer be honoured.
        if payment.is_refundable_if_paid() {
            tracing::warn!(
                payment_id = %payment_id,
                appointment_id = %appointment_id,
                status = %appointment.status,
                "Late payment callback, refunding"
            );
            payment.status = PaymentStatus::Verified;
            payment.gateway_payment_id = Some(gateway_payment_id.clone());
            payment.verified_at = Some(now);
            out.effect(refund_effect(env, payment_id, gateway_payment_id, payment.amount));
        }

        Err(BookingError::InvalidTransition {
            appointment_id,
            from: appointment.status,
            event: TransitionEvent::PaymentVerified,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn confirm_offline_payment(
        state: &mut BookingState,
        out: &mut Outbox,
        correlation_id: CorrelationId,
        payment_id: PaymentId,
        collected_by: &str,
        proof: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), BookingError> {
        let collected_by = collected_by.trim();
        if collected_by.is_empty() {
            return Err(BookingError::Validation(
                "collected_by must not be empty".to_string(),
            ));
        }

        let payment = state
            .payments
            .get_mut(&payment_id)
            .ok_or(BookingError::PaymentNotFound { payment_id })?;
        if payment.method != PaymentMethod::Offline {
            return Err(BookingError::Validation(format!(
                "Payment {payment_id} is not an offline payment"
            )));
        }

        let appointment_id = payment.appointment_id;
        let appointment = state
            .appointments
            .get_mut(&appointment_id)
            .ok_or(BookingError::AppointmentNotFound { appointment_id })?;

        if payment.status != PaymentStatus::Initiated
            || appointment.status != AppointmentStatus::PaymentPending
        {
            return Err(BookingError::InvalidTransition {
                appointment_id,
                from: appointment.status,
                event: TransitionEvent::PaymentVerified,
            });
        }

        let provider_id = appointment.provider_id;
        let allowed = state
            .providers
            .get(&provider_id)
            .is_some_and(|p| p.allows_deferred_settlement);
        if !allowed {
            return Err(BookingError::OfflineSettlementNotAllowed { provider_id });
        }

        payment.status = PaymentStatus::Verified;
        payment.verified_at = Some(now);
        if let Some(offline) = payment.offline.as_mut() {
            offline.collected_by = Some(collected_by.to_string());
            offline.proof = proof;
            offline.collected_at = Some(now);
        }
        appointment.settlement = Some(Settlement::OfflineAccepted {
            collected_by: collected_by.to_string(),
        });

        let actor = Actor::Provider(provider_id);
        let verified = appointment.transition(TransitionEvent::PaymentVerified, actor, None, now)?;
        out.status_changed(appointment, &verified);
        let confirmed = appointment.transition(TransitionEvent::Confirm, actor, None, now)?;
        out.status_changed(appointment, &confirmed);

        metrics::record_payment_verified(payment.amount, now - appointment.created_at);
        tracing::info!(
            appointment_id = %appointment_id,
            payment_id = %payment_id,
            collected_by,
            "Offline payment accepted, appointment confirmed"
        );

        out.reply(BookingAction::PaymentVerified {
            correlation_id,
            appointment: appointment.clone(),
            payment: payment.clone(),
        });
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn cancel_appointment(
        state: &mut BookingState,
        env: &BookingEnvironment,
        out: &mut Outbox,
        correlation_id: CorrelationId,
        appointment_id: AppointmentId,
        actor: Actor,
        reason: ReasonCode,
        now: DateTime<Utc>,
    ) -> Result<(), BookingError> {
        let appointment = state
            .appointments
            .get_mut(&appointment_id)
            .ok_or(BookingError::AppointmentNotFound { appointment_id })?;

        if !appointment.is_party(actor) {
            return Err(BookingError::Validation(format!(
                "Not a party to appointment {appointment_id}"
            )));
        }

        let from = appointment.status;
        let reason = if from == AppointmentStatus::Confirmed {
            ReasonCode::CancelledAfterConfirmation
        } else {
            reason
        };
        let change = appointment.transition(TransitionEvent::Cancel, actor, Some(reason), now)?;
        let slot = appointment.slot();

        match from {
            AppointmentStatus::SlotLocked => {
                let holds_lock = state
                    .locks
                    .get(&slot)
                    .is_some_and(|lock| lock.holder_id == appointment.patient_id);
                if holds_lock {
                    state.locks.remove(&slot);
                    out.slot_unlocked(slot);
                }
            },
            AppointmentStatus::PaymentPending | AppointmentStatus::Confirmed => {
                vacate(&mut state.slot_index, out, slot, appointment_id);

                if let Some(payment) = appointment
                    .payment_id
                    .and_then(|id| state.payments.get_mut(&id))
                {
                    match payment.status {
                        PaymentStatus::Initiated => {
                            payment.fail(reason);
                            if let Some(order_id) = payment.gateway_order_id.clone() {
                                out.effect(cancel_order_effect(env, order_id));
                            }
                        },
                        PaymentStatus::Verified => match payment.gateway_payment_id.clone() {
                            Some(gateway_payment_id) => out.effect(refund_effect(
                                env,
                                payment.id,
                                gateway_payment_id,
                                payment.amount,
                            )),
                            None => {
                                // Collected at the clinic; recorded as refunded there.
                                payment.status = PaymentStatus::Refunded;
                                payment.refund_id = Some(format!("offline_{}", payment.id));
                                metrics::record_payment_refunded(payment.amount);
                            },
                        },
                        PaymentStatus::Failed | PaymentStatus::Refunded => {},
                    }
                }
            },
            _ => {},
        }

        tracing::info!(
            appointment_id = %appointment_id,
            from = %from,
            ?reason,
            "Appointment cancelled"
        );

        out.status_changed(appointment, &change);
        out.reply(BookingAction::AppointmentUpdated {
            correlation_id,
            appointment: appointment.clone(),
        });
        Ok(())
    }

    fn confirm_appointment(
        state: &mut BookingState,
        out: &mut Outbox,
        correlation_id: CorrelationId,
        appointment_id: AppointmentId,
        now: DateTime<Utc>,
    ) -> Result<(), BookingError> {
        let appointment = state
            .appointments
            .get_mut(&appointment_id)
            .ok_or(BookingError::AppointmentNotFound { appointment_id })?;

        let change = appointment.transition(TransitionEvent::Confirm, Actor::System, None, now)?;
        out.status_changed(appointment, &change);
        out.reply(BookingAction::AppointmentUpdated {
            correlation_id,
            appointment: appointment.clone(),
        });
        Ok(())
    }

    /// Expire a `payment-pending` appointment past its grace window.
    fn expire_payment(
        state: &mut BookingState,
        env: &BookingEnvironment,
        out: &mut Outbox,
        appointment_id: AppointmentId,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(appointment) = state.appointments.get_mut(&appointment_id) else {
            return false;
        };
        let Ok(change) = appointment.transition(
            TransitionEvent::Expire,
            Actor::Reaper,
            Some(ReasonCode::PaymentTimeout),
            now,
        ) else {
            return false;
        };

        vacate(&mut state.slot_index, out, appointment.slot(), appointment_id);
        if let Some(payment) = appointment
            .payment_id
            .and_then(|id| state.payments.get_mut(&id))
        {
            if payment.fail(ReasonCode::PaymentTimeout) {
                metrics::record_payment_status(PaymentStatus::Failed);
            }
            if let Some(order_id) = payment.gateway_order_id.clone() {
                out.effect(cancel_order_effect(env, order_id));
            }
        }

        tracing::info!(appointment_id = %appointment_id, "Payment window elapsed, appointment expired");
        out.status_changed(appointment, &change);
        true
    }

    fn reap(
        state: &mut BookingState,
        env: &BookingEnvironment,
        out: &mut Outbox,
        now: DateTime<Utc>,
    ) -> ReapReport {
        let mut report = ReapReport::default();

        for lock in state.locks.expire_stale(now) {
            report.locks_released += 1;
            if Self::reclaim_lock(state, out, &lock, now) {
                report.appointments_expired += 1;
            }
        }

        let mut overdue: Vec<(DateTime<Utc>, AppointmentId)> = state
            .appointments
            .values()
            .filter(|a| a.status == AppointmentStatus::PaymentPending)
            .filter(|a| {
                let method = a
                    .payment_id
                    .and_then(|id| state.payments.get(&id))
                    .map_or(PaymentMethod::Online, |p| p.method);
                a.status_changed_at + env.policy.grace_for(method) <= now
            })
            .map(|a| (a.status_changed_at, a.id))
            .collect();
        overdue.sort();

        for (_, appointment_id) in overdue {
            if Self::expire_payment(state, env, out, appointment_id, now) {
                report.appointments_expired += 1;
            }
        }

        metrics::record_reaper_sweep(&report);
        if !report.is_empty() {
            tracing::info!(
                locks_released = report.locks_released,
                appointments_expired = report.appointments_expired,
                "Reaper sweep reclaimed expired bookings"
            );
        }
        report
    }
}

impl Reducer for BookingReducer {
    type State = BookingState;
    type Action = BookingAction;
    type Environment = BookingEnvironment;

    #[allow(clippy::too_many_lines)]
    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        if action.is_result() {
            return SmallVec::new();
        }

        let now = env.clock.now();
        let correlation_id = action.correlation_id();
        let mut out = Outbox::default();

        let result = match action {
            BookingAction::RegisterProvider {
                correlation_id,
                provider,
            } => Self::register_provider(state, &mut out, correlation_id, provider),

            BookingAction::SetProviderAvailability {
                correlation_id,
                provider_id,
                is_online,
            } => Self::set_provider_availability(
                state,
                &mut out,
                correlation_id,
                provider_id,
                is_online,
                now,
            ),

            BookingAction::AcquireSlotLock {
                correlation_id,
                slot,
                holder,
            } => {
                Self::acquire_slot_lock(state, env, &mut out, correlation_id, slot, holder, now);
                Ok(())
            },

            BookingAction::ReleaseSlotLock {
                correlation_id,
                slot,
                holder,
            } => {
                Self::release_slot_lock(state, &mut out, correlation_id, slot, holder, now);
                Ok(())
            },

            BookingAction::ExpireSlotLock {
                slot,
                holder,
                acquired_at,
            } => {
                Self::expire_slot_lock(state, &mut out, slot, holder, acquired_at, now);
                Ok(())
            },

            BookingAction::BeginBooking {
                correlation_id,
                appointment_id,
                provider_id,
                patient_id,
                date,
                time,
                consultation_type,
            } => Self::begin_booking(
                state,
                env,
                &mut out,
                correlation_id,
                appointment_id,
                SlotKey::new(provider_id, date, time),
                patient_id,
                consultation_type,
                now,
            ),

            BookingAction::InitiatePayment {
                correlation_id,
                appointment_id,
                method,
            } => Self::initiate_payment(
                state,
                env,
                &mut out,
                correlation_id,
                appointment_id,
                method,
                now,
            ),

            BookingAction::VerifyPayment {
                correlation_id,
                gateway_order_id,
                gateway_payment_id,
                signature,
                amount,
            } => Self::verify_payment(
                state,
                env,
                &mut out,
                correlation_id,
                gateway_order_id,
                gateway_payment_id,
                &signature,
                amount,
                now,
            ),

            BookingAction::ConfirmOfflinePayment {
                correlation_id,
                payment_id,
                collected_by,
                proof,
            } => Self::confirm_offline_payment(
                state,
                &mut out,
                correlation_id,
                payment_id,
                &collected_by,
                proof,
                now,
            ),

            BookingAction::CancelAppointment {
                correlation_id,
                appointment_id,
                actor,
                reason,
            } => Self::cancel_appointment(
                state,
                env,
                &mut out,
                correlation_id,
                appointment_id,
                actor,
                reason,
                now,
            ),

            BookingAction::ConfirmAppointment {
                correlation_id,
                appointment_id,
            } => Self::confirm_appointment(state, &mut out, correlation_id, appointment_id, now),

            BookingAction::ReapExpired { correlation_id } => {
                let report = Self::reap(state, env, &mut out, now);
                out.reply(BookingAction::ReapCompleted {
                    correlation_id,
                    report,
                });
                Ok(())
            },

            BookingAction::GatewayOrderCreated {
                correlation_id,
                payment_id,
                order,
            } => Self::gateway_order_created(state, env, &mut out, correlation_id, payment_id, order),

            BookingAction::GatewayOrderFailed {
                payment_id, error, ..
            } => Self::gateway_order_failed(state, &mut out, payment_id, error, now),

            BookingAction::RefundCompleted {
                payment_id,
                refund_id,
            } => {
                if let Some(payment) = state.payments.get_mut(&payment_id) {
                    payment.status = PaymentStatus::Refunded;
                    payment.refund_id = Some(refund_id);
                    metrics::record_payment_refunded(payment.amount);
                    tracing::info!(payment_id = %payment_id, "Payment refunded");
                }
                Ok(())
            },

            BookingAction::RefundFailed { payment_id, error } => {
                tracing::error!(payment_id = %payment_id, %error, "Refund failed, needs manual follow-up");
                Ok(())
            },

            // Results were filtered above
            BookingAction::ProviderSaved { .. }
            | BookingAction::SlotLockGranted { .. }
            | BookingAction::SlotLockDenied { .. }
            | BookingAction::SlotLockReleased { .. }
            | BookingAction::AppointmentUpdated { .. }
            | BookingAction::PaymentOrderReady { .. }
            | BookingAction::OfflinePaymentRegistered { .. }
            | BookingAction::PaymentVerified { .. }
            | BookingAction::CommandRejected { .. }
            | BookingAction::ReapCompleted { .. } => Ok(()),
        };

        match (result, correlation_id) {
            (Ok(()), _) => state.last_error = None,
            (Err(error), Some(correlation_id)) => {
                tracing::info!(%correlation_id, code = error.code(), %error, "Command rejected");
                state.last_error = Some(error.clone());
                out.reply(BookingAction::CommandRejected {
                    correlation_id,
                    error,
                });
            },
            (Err(error), None) => {
                tracing::warn!(%error, "Internal action failed");
                state.last_error = Some(error);
            },
        }

        metrics::set_active_locks(state.locks.len());
        out.finish(&env.fanout)
    }
}
