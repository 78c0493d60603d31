//! Slotbook - appointment slot reservation and booking coordination
//!
//! Patients race for a provider's calendar slots in real time. The engine
//! makes sure each slot ends up with at most one confirmed appointment, that
//! confirmation only follows a settled payment, and that abandoned bookings
//! give their slot back.
//!
//! # Architecture
//!
//! ```text
//!  HTTP (axum)        WebSocket sessions        Expiry reaper
//!      │                     │                        │
//!      └─────────────┬───────┴────────────────────────┘
//!                    │  send_and_wait_for(correlation id)
//!                    ▼
//!          ┌───────────────────────┐
//!          │  Store<BookingState>  │  one reducer, one write lock
//!          │  ├── slot lock table  │
//!          │  ├── appointments     │
//!          │  └── payments         │
//!          └───────────────────────┘
//!                    │ effects
//!        ┌───────────┼──────────────┐
//!        ▼           ▼              ▼
//!   Payment gateway  Lock expiry   Room fan-out ──> sockets
//! ```
//!
//! # Key Features
//!
//! ## 1. Atomic slot locks
//!
//! Acquisition is a single insert-if-absent inside the reducer. Of N
//! concurrent requests for one slot exactly one is granted; the others see
//! `LockConflict`. Locks expire a fixed TTL after the first grant.
//!
//! ## 2. Guarded booking state machine
//!
//! ```text
//! draft → slot-locked → payment-pending → payment-verified → confirmed
//! ```
//!
//! Every transition is checked against an explicit table and appended to the
//! appointment's history. Duplicate or out-of-order events are rejected.
//!
//! ## 3. Payment verification
//!
//! Gateway callbacks are checked with HMAC-SHA256 in constant time.
//! Pay-at-clinic payments are settled by the provider's acknowledgement.
//!
//! ## 4. Real-time fan-out
//!
//! Lock and status changes are published to `provider:`, `appointment:` and
//! `patient:` rooms. Fan-out is advisory: clients re-query state.
//!
//! # Usage
//!
//! See the [aggregates] module for the reducer and its tests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregates;
pub mod api;
pub mod app;
pub mod calendar;
pub mod config;
pub mod error;
pub mod fanout;
pub mod metrics;
pub mod payment_gateway;
pub mod reaper;
pub mod server;
pub mod transport;
pub mod types;

pub use aggregates::{BookingAction, BookingEnvironment, BookingReducer, BookingState};
pub use app::{BookingApp, BookingService, ServiceError};
pub use config::Config;
pub use error::BookingError;
pub use fanout::{Fanout, FanoutEvent, Room};
pub use types::*;
