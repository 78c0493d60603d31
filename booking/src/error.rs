//! Domain errors for booking commands.

use crate::aggregates::appointment::{AppointmentStatus, TransitionEvent};
use crate::types::{AppointmentId, Money, PaymentId, ProviderId, SlotKey};
use slotbook_web::AppError;

/// Why a booking command was rejected.
///
/// Every rejection is answered to the caller; none of them change state
/// except the payment failures described on each variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BookingError {
    /// Another patient holds an unexpired lock on the slot
    #[error("Slot {slot} is being booked by another patient")]
    LockConflict {
        /// Contested slot
        slot: SlotKey,
    },

    /// An appointment already occupies the slot
    #[error("Slot {slot} is already booked")]
    SlotOccupied {
        /// Occupied slot
        slot: SlotKey,
    },

    /// The lock backing the booking ran out
    #[error("Lock on slot {slot} has expired")]
    LockExpired {
        /// Slot whose lock expired
        slot: SlotKey,
    },

    /// The event is not legal from the appointment's current status
    #[error("Appointment {appointment_id}: {event} not allowed from {from}")]
    InvalidTransition {
        /// Appointment
        appointment_id: AppointmentId,
        /// Status at the time of the attempt
        from: AppointmentStatus,
        /// Attempted event
        event: TransitionEvent,
    },

    /// Callback signature did not verify; the payment was failed
    #[error("Payment signature verification failed for order {gateway_order_id}")]
    SignatureMismatch {
        /// Gateway order id from the callback
        gateway_order_id: String,
    },

    /// Callback amount differs from the recorded payment; the payment was failed
    #[error("Payment amount mismatch: expected {expected}, received {received}")]
    AmountMismatch {
        /// Recorded amount
        expected: Money,
        /// Amount reported by the callback
        received: Money,
    },

    /// No payment was created for this gateway order
    #[error("No payment for gateway order {gateway_order_id}")]
    OrderNotFound {
        /// Unknown gateway order id
        gateway_order_id: String,
    },

    /// The client's channel is closed
    #[error("Channel disconnected")]
    ChannelDisconnected,

    /// Unknown appointment
    #[error("Appointment {appointment_id} not found")]
    AppointmentNotFound {
        /// Appointment
        appointment_id: AppointmentId,
    },

    /// Unknown payment
    #[error("Payment {payment_id} not found")]
    PaymentNotFound {
        /// Payment
        payment_id: PaymentId,
    },

    /// Unknown provider
    #[error("Provider {provider_id} not found")]
    ProviderNotFound {
        /// Provider
        provider_id: ProviderId,
    },

    /// Provider is not accepting bookings
    #[error("Provider {provider_id} is not accepting bookings")]
    ProviderUnavailable {
        /// Provider
        provider_id: ProviderId,
    },

    /// The slot is not part of the provider's calendar
    #[error("Slot {slot} is not offered")]
    SlotNotOffered {
        /// Requested slot
        slot: SlotKey,
    },

    /// Provider does not accept pay-at-clinic settlement
    #[error("Provider {provider_id} does not accept offline payment")]
    OfflineSettlementNotAllowed {
        /// Provider
        provider_id: ProviderId,
    },

    /// Malformed command
    #[error("{0}")]
    Validation(String),

    /// Payment gateway failure
    #[error("Payment gateway error: {0}")]
    Gateway(String),
}

impl BookingError {
    /// Stable machine-readable code
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::LockConflict { .. } => "LOCK_CONFLICT",
            Self::SlotOccupied { .. } => "SLOT_OCCUPIED",
            Self::LockExpired { .. } => "LOCK_EXPIRED",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::SignatureMismatch { .. } => "SIGNATURE_MISMATCH",
            Self::AmountMismatch { .. } => "AMOUNT_MISMATCH",
            Self::OrderNotFound { .. } => "ORDER_NOT_FOUND",
            Self::ChannelDisconnected => "CHANNEL_DISCONNECTED",
            Self::AppointmentNotFound { .. }
            | Self::PaymentNotFound { .. }
            | Self::ProviderNotFound { .. } => "NOT_FOUND",
            Self::ProviderUnavailable { .. } => "PROVIDER_UNAVAILABLE",
            Self::SlotNotOffered { .. } => "SLOT_NOT_OFFERED",
            Self::OfflineSettlementNotAllowed { .. } => "OFFLINE_NOT_ALLOWED",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Gateway(_) => "GATEWAY_ERROR",
        }
    }

    /// Lower-case reason sent with a refused lock over the channel
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::LockConflict { .. } => "lock_conflict",
            Self::SlotOccupied { .. } => "slot_occupied",
            Self::SlotNotOffered { .. } => "slot_not_offered",
            Self::ProviderNotFound { .. } => "provider_not_found",
            Self::ProviderUnavailable { .. } => "provider_unavailable",
            Self::ChannelDisconnected => "channel_disconnected",
            _ => "rejected",
        }
    }
}

impl From<BookingError> for AppError {
    fn from(err: BookingError) -> Self {
        let code = err.code();
        let message = err.to_string();

        let base = match &err {
            BookingError::LockConflict { .. }
            | BookingError::SlotOccupied { .. }
            | BookingError::LockExpired { .. }
            | BookingError::InvalidTransition { .. }
            | BookingError::ProviderUnavailable { .. } => Self::conflict(message),
            BookingError::SignatureMismatch { .. } | BookingError::AmountMismatch { .. } => {
                Self::bad_request(message)
            },
            BookingError::OrderNotFound { .. }
            | BookingError::AppointmentNotFound { .. }
            | BookingError::PaymentNotFound { .. }
            | BookingError::ProviderNotFound { .. } => {
                Self::new(axum::http::StatusCode::NOT_FOUND, message, String::new())
            },
            BookingError::SlotNotOffered { .. } | BookingError::Validation(_) => {
                Self::validation(message)
            },
            BookingError::OfflineSettlementNotAllowed { .. } => Self::forbidden(message),
            BookingError::Gateway(_) => Self::bad_gateway(message),
            BookingError::ChannelDisconnected => Self::unavailable(message),
        };

        base.with_code(code)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use chrono::{NaiveDate, NaiveTime};

    fn slot() -> SlotKey {
        SlotKey::new(
            ProviderId::new(),
            NaiveDate::from_ymd_opt(2025, 1, 6).unwrap(),
            NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_http_mapping() {
        let cases = [
            (BookingError::LockConflict { slot: slot() }, StatusCode::CONFLICT, "LOCK_CONFLICT"),
            (BookingError::SlotOccupied { slot: slot() }, StatusCode::CONFLICT, "SLOT_OCCUPIED"),
            (
                BookingError::InvalidTransition {
                    appointment_id: AppointmentId::new(),
                    from: AppointmentStatus::Cancelled,
                    event: TransitionEvent::PaymentVerified,
                },
                StatusCode::CONFLICT,
                "INVALID_TRANSITION",
            ),
            (
                BookingError::SignatureMismatch {
                    gateway_order_id: "order_1".to_string(),
                },
                StatusCode::BAD_REQUEST,
                "SIGNATURE_MISMATCH",
            ),
            (
                BookingError::OrderNotFound {
                    gateway_order_id: "order_1".to_string(),
                },
                StatusCode::NOT_FOUND,
                "ORDER_NOT_FOUND",
            ),
            (
                BookingError::PaymentNotFound {
                    payment_id: PaymentId::new(),
                },
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
            ),
            (
                BookingError::OfflineSettlementNotAllowed {
                    provider_id: ProviderId::new(),
                },
                StatusCode::FORBIDDEN,
                "OFFLINE_NOT_ALLOWED",
            ),
            (
                BookingError::SlotNotOffered { slot: slot() },
                StatusCode::UNPROCESSABLE_ENTITY,
                "SLOT_NOT_OFFERED",
            ),
            (BookingError::Gateway("down".to_string()), StatusCode::BAD_GATEWAY, "GATEWAY_ERROR"),
            (
                BookingError::ChannelDisconnected,
                StatusCode::SERVICE_UNAVAILABLE,
                "CHANNEL_DISCONNECTED",
            ),
        ];

        for (error, status, code) in cases {
            let app = AppError::from(error);
            assert_eq!(app.status(), status);
            assert_eq!(app.code(), code);
        }
    }

    #[test]
    fn test_invalid_transition_message_names_states() {
        let err = BookingError::InvalidTransition {
            appointment_id: AppointmentId::new(),
            from: AppointmentStatus::Cancelled,
            event: TransitionEvent::Confirm,
        };
        let message = err.to_string();
        assert!(message.contains("cancelled"));
        assert!(message.contains("confirm"));
    }
}
