//! Background expiry reaper.
//!
//! Every interval the reaper sends `ReapExpired` through the store and waits
//! for the sweep's report. The sweep itself lives in the booking reducer, so
//! it is serialized with every other command.

use crate::aggregates::{BookingAction, ReapReport};
use crate::app::BookingService;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Handle on a running reaper
pub struct ReaperHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    /// Signal the reaper to stop and wait for it to finish its current sweep
    pub async fn stop(self) {
        self.stop.send_replace(true);
        if let Err(error) = self.task.await {
            tracing::warn!(%error, "Reaper task ended abnormally");
        }
    }

    /// Whether the task has exited
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Run one sweep.
///
/// Returns `None` if the store did not answer (shutdown or timeout).
pub async fn sweep(service: &BookingService) -> Option<ReapReport> {
    match service
        .dispatch(|correlation_id| BookingAction::ReapExpired { correlation_id })
        .await
    {
        Ok(BookingAction::ReapCompleted { report, .. }) => Some(report),
        Ok(other) => {
            tracing::warn!(?other, "Unexpected answer to reaper sweep");
            None
        },
        Err(error) => {
            tracing::warn!(%error, "Reaper sweep failed");
            None
        },
    }
}

/// Start the reaper. The first sweep runs after one `interval`.
#[must_use]
pub fn spawn(service: BookingService, interval: Duration) -> ReaperHandle {
    let (stop, mut stopped) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval_secs = interval.as_secs(), "Expiry reaper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if service.store().is_shutting_down() {
                        break;
                    }
                    if let Some(report) = sweep(&service).await {
                        tracing::debug!(
                            locks_released = report.locks_released,
                            appointments_expired = report.appointments_expired,
                            "Reaper sweep finished"
                        );
                    }
                }
                changed = stopped.changed() => {
                    if changed.is_err() || *stopped.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Expiry reaper stopped");
    });

    ReaperHandle { stop, task }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::aggregates::{
        BookingEnvironment, BookingPolicy, BookingReducer, BookingState, PaymentVerifier,
    };
    use crate::app::BookingStore;
    use crate::calendar::{ConsultationFees, Provider, WeeklySchedule};
    use crate::fanout::Fanout;
    use crate::payment_gateway::MockPaymentGateway;
    use crate::types::{ConsultationType, Money, PatientId, ProviderId, SlotKey};
    use chrono::{NaiveDate, NaiveTime};
    use slotbook_core::environment::Clock;
    use slotbook_testing::{ManualClock, test_instant};
    use std::sync::Arc;

    fn service(clock: &ManualClock) -> BookingService {
        let clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let env = BookingEnvironment::new(
            Arc::clone(&clock),
            MockPaymentGateway::shared(),
            PaymentVerifier::new("secret"),
            Fanout::new(),
            BookingPolicy::default(),
        );
        let store: Arc<BookingStore> =
            Arc::new(slotbook_runtime::Store::new(BookingState::new(), BookingReducer::new(), env));
        BookingService::new(store, clock, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_sweep_reclaims_expired_lock() {
        let clock = ManualClock::starting_at(test_instant());
        let service = service(&clock);
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
            NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
        );
        service
            .dispatch(|correlation_id| BookingAction::RegisterProvider {
                correlation_id,
                provider,
            })
            .await
            .unwrap();
        service
            .dispatch(|correlation_id| BookingAction::AcquireSlotLock {
                correlation_id,
                slot,
                holder: PatientId::new(),
            })
            .await
            .unwrap();

        assert_eq!(sweep(&service).await.unwrap(), ReapReport::default());

        clock.advance(chrono::Duration::minutes(10));
        let report = sweep(&service).await.unwrap();

        assert_eq!(report.locks_released, 1);
        assert!(service.query(|s| s.locks.is_empty()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_reaper_stops_on_signal() {
        let clock = ManualClock::starting_at(test_instant());
        let handle = spawn(service(&clock), Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert!(!handle.is_finished());

        handle.stop().await;
    }
}
