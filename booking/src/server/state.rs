//! Application state for the booking HTTP server.
//!
//! Contains the shared resources HTTP handlers need:
//! - Booking service (commands and queries against the store)
//! - Room fan-out (socket sessions subscribe through it)
//! - Configuration and the open-socket counter

use crate::app::{BookingApp, BookingService};
use crate::config::Config;
use crate::fanout::Fanout;
use axum::extract::FromRef;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Application state shared across all HTTP handlers.
///
/// Cloned (cheaply, via `Arc`s) for each request.
#[derive(Clone)]
pub struct AppState {
    /// Commands and queries
    pub service: BookingService,

    /// Room fan-out shared with the reducer
    pub fanout: Fanout,

    /// Configuration
    pub config: Arc<Config>,

    /// Open WebSocket connections
    pub ws_connections: Arc<AtomicUsize>,
}

impl AppState {
    /// Create a new application state from a running engine.
    #[must_use]
    pub fn new(app: &BookingApp) -> Self {
        Self {
            service: app.service(),
            fanout: app.fanout(),
            config: Arc::new(app.config().clone()),
            ws_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Open WebSocket connections
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.ws_connections.load(Ordering::Relaxed)
    }
}

impl FromRef<AppState> for BookingService {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.service.clone()
    }
}
