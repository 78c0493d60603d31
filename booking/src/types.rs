//! Domain types for appointment booking.
//!
//! Value objects and identifiers shared by the slot lock coordinator, the
//! booking state machine and the payment adapter.

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            #[doc = concat!("Creates a new random `", stringify!($name), "`")]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[doc = concat!("Create a `", stringify!($name), "` from a `Uuid`")]
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a provider (doctor)
    ProviderId
);
uuid_id!(
    /// Unique identifier for a patient
    PatientId
);
uuid_id!(
    /// Unique identifier for an appointment
    AppointmentId
);
uuid_id!(
    /// Unique identifier for a payment record
    PaymentId
);
uuid_id!(
    /// Identifier of one channel connection
    ClientId
);
uuid_id!(
    /// Ties a command to the result action that answers it
    CorrelationId
);

/// Slot locks are always held by the patient booking the slot.
pub type HolderId = PatientId;

// ============================================================================
// Slots
// ============================================================================

/// The `(provider, date, time)` tuple a lock or appointment covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotKey {
    /// Provider whose calendar the slot belongs to
    pub provider_id: ProviderId,
    /// Calendar date
    pub date: NaiveDate,
    /// Start time
    #[serde(with = "hhmm")]
    pub time: NaiveTime,
}

impl SlotKey {
    /// Creates a new `SlotKey`
    #[must_use]
    pub const fn new(provider_id: ProviderId, date: NaiveDate, time: NaiveTime) -> Self {
        Self {
            provider_id,
            date,
            time,
        }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.provider_id,
            self.date.format("%Y-%m-%d"),
            self.time.format("%H:%M")
        )
    }
}

/// Serde support for `HH:MM` clock times.
///
/// Serializes as `HH:MM`; accepts `HH:MM` or `HH:MM:SS`.
pub mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Parse `HH:MM` or `HH:MM:SS`.
    ///
    /// # Errors
    ///
    /// Returns the chrono parse error when neither format matches.
    pub fn parse(s: &str) -> Result<NaiveTime, chrono::ParseError> {
        NaiveTime::parse_from_str(s, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
    }

    /// Serialize as `HH:MM`.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&time.format("%H:%M"))
    }

    /// Deserialize from `HH:MM` or `HH:MM:SS`.
    ///
    /// # Errors
    ///
    /// Fails on any other format.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Money (minor units to avoid floating point errors)
// ============================================================================

/// Amount in minor currency units (paise for INR)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(u64);

impl Money {
    /// Creates a `Money` value from minor units
    #[must_use]
    pub const fn from_minor(minor: u64) -> Self {
        Self(minor)
    }

    /// Creates a `Money` value from major units (rupees), `None` on overflow
    #[must_use]
    pub const fn checked_from_major(major: u64) -> Option<Self> {
        match major.checked_mul(100) {
            Some(minor) => Some(Self(minor)),
            None => None,
        }
    }

    /// Returns the amount in minor units
    #[must_use]
    pub const fn minor(&self) -> u64 {
        self.0
    }

    /// Returns the whole major units (rounded down)
    #[must_use]
    pub const fn major(&self) -> u64 {
        self.0 / 100
    }

    /// Checks if the amount is zero
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Adds two amounts with overflow checking
    #[must_use]
    pub const fn checked_add(self, other: Self) -> Option<Self> {
        match self.0.checked_add(other.0) {
            Some(result) => Some(Self(result)),
            None => None,
        }
    }

    /// Subtracts two amounts (None if the result would be negative)
    #[must_use]
    pub const fn checked_sub(self, other: Self) -> Option<Self> {
        if self.0 >= other.0 {
            Some(Self(self.0 - other.0))
        } else {
            None
        }
    }

    /// `percent`% of this amount, rounded half up to the nearest minor unit
    #[must_use]
    pub const fn percent_of(self, percent: u32) -> Option<Self> {
        match self.0.checked_mul(percent as u64) {
            Some(product) => match product.checked_add(50) {
                Some(rounded) => Some(Self(rounded / 100)),
                None => None,
            },
            None => None,
        }
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.major(), self.0 % 100)
    }
}

/// ISO 4217 currency code
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Currency(String);

impl Currency {
    /// Creates a currency from its code, upper-cased
    #[must_use]
    pub fn new(code: impl AsRef<str>) -> Self {
        Self(code.as_ref().trim().to_ascii_uppercase())
    }

    /// Indian rupee
    #[must_use]
    pub fn inr() -> Self {
        Self::new("INR")
    }

    /// The currency code
    #[must_use]
    pub fn code(&self) -> &str {
        &self.0
    }
}

impl Default for Currency {
    fn default() -> Self {
        Self::inr()
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Booking vocabulary
// ============================================================================

/// How the consultation takes place
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConsultationType {
    /// Remote consultation
    Online,
    /// At the provider's clinic
    InPerson,
}

impl fmt::Display for ConsultationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => f.write_str("online"),
            Self::InPerson => f.write_str("in-person"),
        }
    }
}

/// Who caused a state change
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Actor {
    /// The patient who owns the appointment
    Patient(PatientId),
    /// The provider the appointment is with
    Provider(ProviderId),
    /// Payment gateway callback
    Gateway,
    /// Background expiry
    Reaper,
    /// Internal bookkeeping
    System,
}

/// Why a transition happened, recorded in the status history
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    /// Patient cancelled
    PatientCancelled,
    /// Provider cancelled
    ProviderCancelled,
    /// Cancelled after the booking was confirmed
    CancelledAfterConfirmation,
    /// The holder released the slot lock
    LockReleased,
    /// The slot lock ran out before payment started
    LockExpired,
    /// Gateway reported a failed payment
    PaymentFailed,
    /// Callback signature did not verify
    SignatureMismatch,
    /// Callback amount differs from the payment record
    AmountMismatch,
    /// No payment confirmation within the grace window
    PaymentTimeout,
    /// Gateway could not create the order
    GatewayError,
}
