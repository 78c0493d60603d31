//! Application coordinator - booking engine lifecycle.

use super::services::{BookingService, BookingStore};
use crate::aggregates::{BookingEnvironment, BookingReducer, BookingState, PaymentVerifier};
use crate::config::Config;
use crate::fanout::Fanout;
use crate::payment_gateway::{MockPaymentGateway, PaymentGateway};
use crate::reaper::{self, ReaperHandle};
use slotbook_core::environment::{Clock, SystemClock};
use slotbook_runtime::{Store, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// The booking engine.
///
/// Owns the single booking store, the room fan-out shared by the reducer
/// and the socket sessions, and the expiry reaper.
pub struct BookingApp {
    service: BookingService,
    fanout: Fanout,
    config: Config,
    reaper: Mutex<Option<ReaperHandle>>,
}

impl BookingApp {
    /// Build the engine on the system clock with the in-process gateway.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_parts(config, Arc::new(SystemClock), Arc::new(MockPaymentGateway::new()))
    }

    /// Build the engine with an explicit clock and gateway
    #[must_use]
    pub fn with_parts(
        config: Config,
        clock: Arc<dyn Clock>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        tracing::info!("Initializing booking engine...");

        let fanout = Fanout::with_capacity(config.websocket.broadcast_capacity);
        let env = BookingEnvironment::new(
            Arc::clone(&clock),
            gateway,
            PaymentVerifier::new(config.payment.key_secret.clone()),
            fanout.clone(),
            config.policy(),
        );
        let store: Arc<BookingStore> = Arc::new(Store::with_broadcast_capacity(
            BookingState::new(),
            BookingReducer::new(),
            env,
            config.booking.action_broadcast_capacity,
        ));
        let service = BookingService::new(store, clock, config.booking.request_timeout());

        tracing::info!(
            lock_ttl_secs = config.booking.lock_ttl,
            payment_grace_secs = config.booking.payment_grace,
            "✓ Booking store initialized"
        );

        Self {
            service,
            fanout,
            config,
            reaper: Mutex::new(None),
        }
    }

    /// Start background tasks. Calling it twice keeps the first reaper.
    pub async fn start(&self) {
        let mut reaper = self.reaper.lock().await;
        if reaper.is_some() {
            return;
        }
        *reaper = Some(reaper::spawn(
            self.service.clone(),
            self.config.booking.reaper_interval(),
        ));
        tracing::info!("✓ Booking engine started");
    }

    /// Stop the reaper, then drain in-flight effects.
    ///
    /// # Errors
    ///
    /// [`StoreError::ShutdownTimeout`] if effects are still running after `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), StoreError> {
        if let Some(handle) = self.reaper.lock().await.take() {
            handle.stop().await;
        }
        self.service.store().shutdown(timeout).await
    }

    /// Handle for commands and queries
    #[must_use]
    pub fn service(&self) -> BookingService {
        self.service.clone()
    }

    /// Room fan-out
    #[must_use]
    pub fn fanout(&self) -> Fanout {
        self.fanout.clone()
    }

    /// Get the application configuration
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::aggregates::BookingAction;

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let app = BookingApp::new(Config::default());
        app.start().await;
        app.start().await;

        let answer = app
            .service()
            .dispatch(|correlation_id| BookingAction::ReapExpired { correlation_id })
            .await
            .unwrap();
        assert!(matches!(answer, BookingAction::ReapCompleted { .. }));

        app.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(app.service().store().is_shutting_down());
    }
}
