//! Application wiring.
//!
//! - [`BookingApp`] builds the store, fan-out and background tasks
//! - [`BookingService`] is the request/response handle everything else uses

mod coordinator;
mod services;

pub use coordinator::BookingApp;
pub use services::{BookingService, BookingStore, ServiceError};
