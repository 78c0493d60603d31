//! # Slotbook Testing
//!
//! Testing utilities and helpers for slotbook reducers and stores.
//!
//! This crate provides:
//! - Mock clocks ([`FixedClock`], [`ManualClock`])
//! - The [`ReducerTest`] Given-When-Then harness
//! - Assertion helpers for effects
//!
//! ## Example
//!
//! ```ignore
//! use slotbook_testing::{ManualClock, test_clock};
//!
//! #[tokio::test]
//! async fn lock_expires() {
//!     let clock = ManualClock::starting_at(test_clock().now());
//!     let store = booking_store(clock.clone());
//!
//!     acquire(&store).await;
//!     clock.advance(chrono::Duration::minutes(10));
//!
//!     assert!(!is_locked(&store).await);
//! }
//! ```

use chrono::{DateTime, Utc};
use slotbook_core::environment::Clock;

/// Given-When-Then reducer harness
pub mod reducer_test;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, PoisonError, RwLock};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use slotbook_testing::mocks::FixedClock;
    /// use slotbook_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to
    ///
    /// Clones share the same instant, so a test can keep one handle and give
    /// another to the environment under test.
    ///
    /// ```
    /// use slotbook_testing::mocks::ManualClock;
    /// use slotbook_core::environment::Clock;
    /// use chrono::{Duration, Utc};
    ///
    /// let start = Utc::now();
    /// let clock = ManualClock::starting_at(start);
    /// let shared = clock.clone();
    ///
    /// clock.advance(Duration::minutes(10));
    /// assert_eq!(shared.now(), start + Duration::minutes(10));
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<RwLock<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Create a clock frozen at `time`
        #[must_use]
        pub fn starting_at(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(RwLock::new(time)),
            }
        }

        /// Move the clock forward (or backward, for negative durations)
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.write().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }

        /// Jump to an absolute instant
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.write().unwrap_or_else(PoisonError::into_inner) = to;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.read().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// The instant every test clock starts at: 2025-01-01 00:00:00 UTC
    #[must_use]
    pub fn test_instant() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap_or_default()
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(test_instant())
    }
}

// Re-export commonly used items
pub use mocks::{FixedClock, ManualClock, test_clock, test_instant};
pub use reducer_test::{ReducerTest, assertions};
