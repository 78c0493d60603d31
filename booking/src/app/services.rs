//! Request/response access to the booking store.
//!
//! HTTP handlers, socket sessions and the reaper all talk to the store
//! through [`BookingService`]:
//! 1. Stamp the command with a fresh correlation id
//! 2. `send_and_wait_for` the result action carrying that id
//! 3. Turn `CommandRejected` into an error

use crate::aggregates::{
    BookingAction, BookingEnvironment, BookingReducer, BookingState,
};
use crate::error::BookingError;
use crate::types::CorrelationId;
use chrono::{DateTime, Utc};
use slotbook_core::environment::Clock;
use slotbook_runtime::{Store, StoreError};
use slotbook_web::AppError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// The booking store
pub type BookingStore = Store<BookingState, BookingAction, BookingEnvironment, BookingReducer>;

/// Errors from [`BookingService::dispatch`]
#[derive(Error, Debug)]
pub enum ServiceError {
    /// The reducer rejected the command
    #[error(transparent)]
    Rejected(BookingError),

    /// The store failed or timed out
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ServiceError {
    /// Whether the answer did not arrive in time
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Store(StoreError::Timeout))
    }
}

impl From<ServiceError> for AppError {
    fn from(error: ServiceError) -> Self {
        match error {
            ServiceError::Rejected(error) => error.into(),
            ServiceError::Store(error) => error.into(),
        }
    }
}

/// Cheap, cloneable handle on the booking store.
#[derive(Clone)]
pub struct BookingService {
    store: Arc<BookingStore>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl BookingService {
    /// Creates a new `BookingService`
    #[must_use]
    pub fn new(store: Arc<BookingStore>, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            store,
            clock,
            timeout,
        }
    }

    /// The underlying store
    #[must_use]
    pub const fn store(&self) -> &Arc<BookingStore> {
        &self.store
    }

    /// Current time on the engine's clock
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// How long `dispatch` waits for an answer
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send a command built around a fresh correlation id and wait for its answer.
    ///
    /// # Errors
    ///
    /// - [`ServiceError::Rejected`] if the reducer answered `CommandRejected`
    /// - [`ServiceError::Store`] on timeout or shutdown
    pub async fn dispatch<F>(&self, command: F) -> Result<BookingAction, ServiceError>
    where
        F: FnOnce(CorrelationId) -> BookingAction,
    {
        let correlation_id = CorrelationId::new();
        let action = command(correlation_id);

        let answer = self
            .store
            .send_and_wait_for(action, |a| a.answers(correlation_id), self.timeout)
            .await?;

        match answer {
            BookingAction::CommandRejected { error, .. } => Err(ServiceError::Rejected(error)),
            other => Ok(other),
        }
    }

    /// Read booking state
    pub async fn query<T>(&self, f: impl FnOnce(&BookingState) -> T) -> T {
        self.store.state(f).await
    }
}
