//! Axum integration shared by slotbook services.
//!
//! The booking engine is a functional core (reducers behind a
//! [`Store`](slotbook_runtime::Store)); this crate is part of the imperative
//! shell around it.
//!
//! # Request Flow
//!
//! 1. **HTTP Request** arrives at an Axum handler
//! 2. **Build Action** from the extracted data, with a fresh correlation id
//! 3. **Dispatch** through `Store::send_and_wait_for`
//! 4. **Map result** (or [`AppError`]) to an HTTP response
//!
//! Real-time updates travel the other way through a [`RoomBroadcaster`].

#![forbid(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod handlers;
pub mod rooms;

// Re-export key types for convenience
pub use error::AppError;
pub use rooms::RoomBroadcaster;

/// Result type alias for web handlers.
pub type WebResult<T> = Result<T, AppError>;
