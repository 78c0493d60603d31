//! Lock TTL and expiry reaper tests.
//!
//! A lock granted at `t0` with TTL `d` is unlocked for every `t >= t0 + d`,
//! and the reaper announces it exactly once.
//!
//! Run with: `cargo test --test reaper_ttl_test`

#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use chrono::{NaiveDate, NaiveTime};
use slotbook::aggregates::{
    BookingAction, BookingEnvironment, BookingPolicy, BookingReducer, BookingState,
    PaymentVerifier,
};
use slotbook::app::{BookingService, BookingStore};
use slotbook::calendar::{ConsultationFees, Provider, WeeklySchedule};
use slotbook::payment_gateway::MockPaymentGateway;
use slotbook::{ClientId, ConsultationType, Fanout, FanoutEvent, Money, PatientId, ProviderId, Room, SlotKey};
use slotbook_core::environment::Clock;
use slotbook_runtime::Store;
use slotbook_testing::{ManualClock, test_instant};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;

struct Harness {
    service: BookingService,
    clock: ManualClock,
    fanout: Fanout,
    slot: SlotKey,
}

async fn harness() -> Harness {
    let clock = ManualClock::starting_at(test_instant());
    let fanout = Fanout::new();
    let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
    let env = BookingEnvironment::new(
        Arc::clone(&shared_clock),
        MockPaymentGateway::shared(),
        PaymentVerifier::new("secret"),
        fanout.clone(),
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
        consultation_types: vec![ConsultationType::Online],
        is_online: true,
        allows_deferred_settlement: false,
    };
    let slot = SlotKey::new(
        provider.id,
        NaiveDate::from_ymd_opt(2025, 1, 6).unwrap(),
        NaiveTime::from_hms_opt(11, 0, 0).unwrap(),
    );
    service
        .dispatch(|correlation_id| BookingAction::RegisterProvider {
            correlation_id,
            provider,
        })
        .await
        .unwrap();

    Harness {
        service,
        clock,
        fanout,
        slot,
    }
}

async fn acquire(h: &Harness, holder: PatientId) -> BookingAction {
    let slot = h.slot;
    h.service
        .dispatch(|correlation_id| BookingAction::AcquireSlotLock {
            correlation_id,
            slot,
            holder,
        })
        .await
        .unwrap()
}

async fn next_event(
    rx: &mut tokio::sync::broadcast::Receiver<(String, FanoutEvent)>,
) -> FanoutEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap()
        .1
}

/// Test 1: TTL Boundary
///
/// Locked just before `t0 + d`, unlocked exactly at it.
#[tokio::test]
async fn test_lock_expires_exactly_at_ttl() {
    let h = harness().await;
    acquire(&h, PatientId::new()).await;
    let slot = h.slot;

    h.clock.advance(chrono::Duration::minutes(10) - chrono::Duration::milliseconds(1));
    let now = h.clock.now();
    assert!(h.service.query(|s| s.is_locked(&slot, now)).await);

    h.clock.advance(chrono::Duration::milliseconds(1));
    let now = h.clock.now();
    assert!(!h.service.query(|s| s.is_locked(&slot, now)).await);
}

/// Test 2: Single Announcement
///
/// The reaper removes the expired lock and publishes one `slot:unlocked`;
/// later sweeps stay silent.
#[tokio::test]
async fn test_reaper_announces_unlock_once() {
    let h = harness().await;
    let mut rx = h
        .fanout
        .subscribe(Room::Provider(h.slot.provider_id), ClientId::new())
        .await;

    acquire(&h, PatientId::new()).await;
    assert_eq!(next_event(&mut rx).await.name(), "slot:locked");

    h.clock.advance(chrono::Duration::minutes(10));
    let first = slotbook::reaper::sweep(&h.service).await.unwrap();
    let second = slotbook::reaper::sweep(&h.service).await.unwrap();

    assert_eq!(first.locks_released, 1);
    assert!(second.is_empty());

    let FanoutEvent::SlotUnlocked { time, .. } = next_event(&mut rx).await else {
        panic!("expected slot:unlocked");
    };
    assert_eq!(time, h.slot.time);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
}

/// Test 3: No Renewal
///
/// Re-acquiring before expiry keeps the original `expires_at`; after expiry
/// the holder gets a fresh TTL.
#[tokio::test]
async fn test_reacquire_does_not_extend() {
    let h = harness().await;
    let holder = PatientId::new();

    let BookingAction::SlotLockGranted { lock: first, .. } = acquire(&h, holder).await else {
        panic!("expected grant");
    };

    h.clock.advance(chrono::Duration::minutes(5));
    let BookingAction::SlotLockGranted { lock: again, .. } = acquire(&h, holder).await else {
        panic!("expected idempotent grant");
    };
    assert_eq!(again.expires_at, first.expires_at);

    h.clock.advance(chrono::Duration::minutes(6));
    let BookingAction::SlotLockGranted { lock: fresh, .. } = acquire(&h, holder).await else {
        panic!("expected fresh grant");
    };
    assert_eq!(fresh.expires_at, h.clock.now() + chrono::Duration::minutes(10));
}

/// Test 4: Expired Lock Is Up For Grabs
///
/// Another patient can take an expired lock even before the reaper runs.
#[tokio::test]
async fn test_expired_lock_can_be_taken_before_sweep() {
    let h = harness().await;
    acquire(&h, PatientId::new()).await;

    h.clock.advance(chrono::Duration::minutes(11));
    let other = PatientId::new();

    let BookingAction::SlotLockGranted { lock, .. } = acquire(&h, other).await else {
        panic!("expected grant to the new patient");
    };
    assert_eq!(lock.holder_id, other);
}
