//! End-to-end booking flows through the store.
//!
//! Covers the full lifecycle: lock, payment, verification, confirmation,
//! and what happens when a patient walks away halfway.
//!
//! Run with: `cargo test --test booking_flow_test`

#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]
#![allow(clippy::too_many_lines)]

use chrono::{NaiveDate, NaiveTime};
use slotbook::aggregates::{
    AppointmentStatus, BookingAction, BookingEnvironment, BookingPolicy, BookingReducer,
    BookingState, CheckoutOrder, PaymentMethod, PaymentStatus, PaymentVerifier,
};
use slotbook::app::{BookingService, BookingStore, ServiceError};
use slotbook::calendar::{ConsultationFees, Provider, WeeklySchedule};
use slotbook::payment_gateway::{GatewayCall, MockPaymentGateway};
use slotbook::{
    AppointmentId, BookingError, ConsultationType, Fanout, Money, PatientId, ProviderId, SlotKey,
};
use slotbook_core::environment::Clock;
use slotbook_runtime::Store;
use slotbook_testing::{ManualClock, test_instant};
use std::sync::Arc;
use std::time::Duration;

const SECRET: &str = "flow-secret";

struct Harness {
    service: BookingService,
    clock: ManualClock,
    gateway: Arc<MockPaymentGateway>,
    provider_id: ProviderId,
}

impl Harness {
    async fn new() -> Self {
        let clock = ManualClock::starting_at(test_instant());
        let gateway = Arc::new(MockPaymentGateway::new());
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let env = BookingEnvironment::new(
            Arc::clone(&shared_clock),
            gateway.clone(),
            PaymentVerifier::new(SECRET),
            Fanout::new(),
            BookingPolicy::default(),
        );
        let store: Arc<BookingStore> =
            Arc::new(Store::new(BookingState::new(), BookingReducer::new(), env));
        let service = BookingService::new(store, shared_clock, Duration::from_secs(10));

        let provider = Provider {
            id: ProviderId::new(),
            name: "Dr. X".to_string(),
            schedule: WeeklySchedule::default(),
            fees: ConsultationFees {
                online: Money::from_minor(50_000),
                in_person: Money::from_minor(80_000),
            },
            consultation_types: vec![ConsultationType::Online, ConsultationType::InPerson],
            is_online: true,
            allows_deferred_settlement: true,
        };
        let provider_id = provider.id;
        service
            .dispatch(|correlation_id| BookingAction::RegisterProvider {
                correlation_id,
                provider,
            })
            .await
            .unwrap();

        Self {
            service,
            clock,
            gateway,
            provider_id,
        }
    }

    fn slot(&self) -> SlotKey {
        SlotKey::new(
            self.provider_id,
            NaiveDate::from_ymd_opt(2025, 1, 6).unwrap(),
            NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
        )
    }

    async fn acquire(&self, holder: PatientId) -> BookingAction {
        let slot = self.slot();
        self.service
            .dispatch(|correlation_id| BookingAction::AcquireSlotLock {
                correlation_id,
                slot,
                holder,
            })
            .await
            .unwrap()
    }

    async fn begin(
        &self,
        patient_id: PatientId,
        consultation_type: ConsultationType,
    ) -> Result<AppointmentId, ServiceError> {
        let slot = self.slot();
        let appointment_id = AppointmentId::new();
        self.service
            .dispatch(|correlation_id| BookingAction::BeginBooking {
                correlation_id,
                appointment_id,
                provider_id: slot.provider_id,
                patient_id,
                date: slot.date,
                time: slot.time,
                consultation_type,
            })
            .await
            .map(|_| appointment_id)
    }

    async fn pay_online(&self, appointment_id: AppointmentId) -> CheckoutOrder {
        match self
            .service
            .dispatch(|correlation_id| BookingAction::InitiatePayment {
                correlation_id,
                appointment_id,
                method: PaymentMethod::Online,
            })
            .await
            .unwrap()
        {
            BookingAction::PaymentOrderReady { order, .. } => order,
            other => panic!("expected checkout order, got {other:?}"),
        }
    }

    async fn verify(&self, order_id: &str, signature: String) -> Result<BookingAction, ServiceError> {
        let order_id = order_id.to_string();
        self.service
            .dispatch(|correlation_id| BookingAction::VerifyPayment {
                correlation_id,
                gateway_order_id: order_id,
                gateway_payment_id: "pay_1".to_string(),
                signature,
                amount: Some(Money::from_minor(50_000)),
            })
            .await
    }

    async fn status(&self, appointment_id: AppointmentId) -> AppointmentStatus {
        self.service
            .query(|s| s.appointments[&appointment_id].status)
            .await
    }

    async fn listed(&self) -> bool {
        let slot = self.slot();
        let now = self.clock.now();
        self.service
            .query(|s| {
                s.available_slots(slot.provider_id, slot.date, ConsultationType::Online, now)
                    .unwrap()
                    .iter()
                    .any(|listed| listed.start_time == slot.time)
            })
            .await
    }
}

/// Test 1: Dr. X, Monday 10:00
///
/// A locks, B conflicts two seconds later, A starts paying, B's retry sees
/// the slot occupied, A's payment verifies and the slot leaves the listing.
#[tokio::test]
async fn test_two_patients_one_slot() {
    println!("🧪 Test 1: Dr. X, Monday 10:00");
    let h = Harness::new().await;
    let patient_a = PatientId::new();
    let patient_b = PatientId::new();

    let BookingAction::SlotLockGranted { lock, .. } = h.acquire(patient_a).await else {
        panic!("A should get the lock");
    };
    assert_eq!(lock.expires_at, test_instant() + chrono::Duration::minutes(10));

    h.clock.advance(chrono::Duration::seconds(2));
    assert!(matches!(
        h.acquire(patient_b).await,
        BookingAction::SlotLockDenied {
            error: BookingError::LockConflict { .. },
            ..
        }
    ));

    let appointment_id = h.begin(patient_a, ConsultationType::Online).await.unwrap();
    assert_eq!(h.status(appointment_id).await, AppointmentStatus::SlotLocked);

    let order = h.pay_online(appointment_id).await;
    assert_eq!(order.amount, Money::from_minor(50_000));
    assert_eq!(h.status(appointment_id).await, AppointmentStatus::PaymentPending);

    assert!(matches!(
        h.acquire(patient_b).await,
        BookingAction::SlotLockDenied {
            error: BookingError::SlotOccupied { .. },
            ..
        }
    ));

    let signature = PaymentVerifier::new(SECRET).sign(&order.order_id, "pay_1");
    let BookingAction::PaymentVerified { appointment, payment, .. } =
        h.verify(&order.order_id, signature).await.unwrap()
    else {
        panic!("expected verified payment");
    };

    assert_eq!(appointment.status, AppointmentStatus::Confirmed);
    assert_eq!(payment.status, PaymentStatus::Verified);
    assert!(!h.listed().await);
    println!("✅ One confirmed appointment, slot gone from listing");
}

/// Test 2: Forged Callback
///
/// A bad signature fails the payment, cancels the appointment and gives the
/// slot back. The payment never confirms afterwards.
#[tokio::test]
async fn test_forged_callback_rolls_back() {
    let h = Harness::new().await;
    let patient = PatientId::new();

    let appointment_id = h.begin(patient, ConsultationType::Online).await.unwrap();
    let order = h.pay_online(appointment_id).await;

    let error = h.verify(&order.order_id, "00".repeat(32)).await.unwrap_err();
    assert!(matches!(
        error,
        ServiceError::Rejected(BookingError::SignatureMismatch { .. })
    ));
    assert_eq!(h.status(appointment_id).await, AppointmentStatus::Cancelled);
    assert!(h.listed().await);

    let signature = PaymentVerifier::new(SECRET).sign(&order.order_id, "pay_1");
    assert!(h.verify(&order.order_id, signature).await.is_err());
    assert_ne!(h.status(appointment_id).await, AppointmentStatus::Confirmed);
}

/// Test 3: Abandoned Payment
///
/// The patient never pays. After the grace window the reaper expires the
/// appointment and the slot is bookable again.
#[tokio::test]
async fn test_abandoned_payment_is_expired() {
    let h = Harness::new().await;
    let appointment_id = h.begin(PatientId::new(), ConsultationType::Online).await.unwrap();
    h.pay_online(appointment_id).await;
    assert!(!h.listed().await);

    h.clock.advance(chrono::Duration::minutes(16));
    let report = slotbook::reaper::sweep(&h.service).await.unwrap();

    assert_eq!(report.appointments_expired, 1);
    assert_eq!(h.status(appointment_id).await, AppointmentStatus::Expired);
    assert!(h.listed().await);

    let BookingAction::SlotLockGranted { .. } = h.acquire(PatientId::new()).await else {
        panic!("slot should be free again");
    };
}

/// Test 4: Pay at Clinic
///
/// Offline payment holds the slot until the provider acknowledges collection.
#[tokio::test]
async fn test_offline_settlement() {
    let h = Harness::new().await;
    let appointment_id = h.begin(PatientId::new(), ConsultationType::InPerson).await.unwrap();

    let BookingAction::OfflinePaymentRegistered { appointment, payment, .. } = h
        .service
        .dispatch(|correlation_id| BookingAction::InitiatePayment {
            correlation_id,
            appointment_id,
            method: PaymentMethod::Offline,
        })
        .await
        .unwrap()
    else {
        panic!("expected offline registration");
    };
    assert_eq!(appointment.status, AppointmentStatus::PaymentPending);
    assert!(payment.requires_settlement);
    let offline = payment.offline.clone().unwrap();
    assert!(offline.receipt_number.starts_with("OFF-20250101-"));
    assert_eq!(offline.payment_token.len(), 32);

    // Still held well past the online grace window
    h.clock.advance(chrono::Duration::hours(2));
    let report = slotbook::reaper::sweep(&h.service).await.unwrap();
    assert_eq!(report.appointments_expired, 0);

    let payment_id = payment.id;
    let BookingAction::PaymentVerified { appointment, .. } = h
        .service
        .dispatch(|correlation_id| BookingAction::ConfirmOfflinePayment {
            correlation_id,
            payment_id,
            collected_by: "front desk".to_string(),
            proof: Some("receipt-photo-1".to_string()),
        })
        .await
        .unwrap()
    else {
        panic!("expected verified payment");
    };
    assert_eq!(appointment.status, AppointmentStatus::Confirmed);
}

/// Test 5: Cancel After Confirmation
///
/// Cancelling a paid appointment refunds the gateway payment and frees the slot.
#[tokio::test]
async fn test_cancel_confirmed_refunds() {
    let h = Harness::new().await;
    let patient = PatientId::new();
    let appointment_id = h.begin(patient, ConsultationType::Online).await.unwrap();
    let order = h.pay_online(appointment_id).await;
    let signature = PaymentVerifier::new(SECRET).sign(&order.order_id, "pay_1");
    h.verify(&order.order_id, signature).await.unwrap();

    h.service
        .dispatch(|correlation_id| BookingAction::CancelAppointment {
            correlation_id,
            appointment_id,
            actor: slotbook::Actor::Patient(patient),
            reason: slotbook::ReasonCode::PatientCancelled,
        })
        .await
        .unwrap();

    assert_eq!(h.status(appointment_id).await, AppointmentStatus::Cancelled);
    assert!(h.listed().await);

    // The refund runs as an effect after the answer
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.gateway.calls().iter().any(|call| matches!(
        call,
        GatewayCall::Refund { gateway_payment_id, amount }
            if gateway_payment_id == "pay_1" && *amount == Money::from_minor(50_000)
    )));
}
