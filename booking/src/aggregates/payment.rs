//! Payment records and callback verification.
//!
//! The [`Payment`] record is the authority on monetary state; appointments
//! only point at it. Online payments are settled by a signed gateway
//! callback, offline ones by the provider acknowledging collection.

use crate::calendar::ConsultationFees;
use crate::types::{AppointmentId, ConsultationType, Currency, Money, PaymentId, ReasonCode};
use chrono::{DateTime, NaiveDate, Utc};
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// Gateway receipt references are capped at this length.
pub const MAX_RECEIPT_LEN: usize = 40;

const RECEIPT_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// How the patient pays
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Hosted gateway checkout
    Online,
    /// Pay at the clinic
    Offline,
}

/// Payment lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Awaiting settlement
    Initiated,
    /// Settled
    Verified,
    /// Failed, timed out or abandoned
    Failed,
    /// Money returned
    Refunded,
}

impl PaymentStatus {
    /// Wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Verified => "verified",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        }
    }
}

/// Pay-at-clinic details
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineDetails {
    /// `OFF-{YYYYMMDD}-{6 alphanumerics}`
    pub receipt_number: String,
    /// 32 hex chars the patient presents at the clinic
    pub payment_token: String,
    /// Who collected the payment
    pub collected_by: Option<String>,
    /// Proof of collection (receipt photo reference, note, ...)
    pub proof: Option<String>,
    /// When the provider acknowledged collection
    pub collected_at: Option<DateTime<Utc>>,
}

/// Monetary record for one appointment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    /// Payment ID
    pub id: PaymentId,
    /// Appointment being paid for
    pub appointment_id: AppointmentId,
    /// Online or offline
    pub method: PaymentMethod,
    /// Amount in minor units
    pub amount: Money,
    /// Currency
    pub currency: Currency,
    /// Gateway order, once created
    pub gateway_order_id: Option<String>,
    /// Gateway payment, once the patient paid
    pub gateway_payment_id: Option<String>,
    /// Status
    pub status: PaymentStatus,
    /// Settled outside the gateway
    pub requires_settlement: bool,
    /// Offline details
    pub offline: Option<OfflineDetails>,
    /// Merchant receipt reference
    pub receipt: String,
    /// Why the payment failed
    pub failure_reason: Option<ReasonCode>,
    /// Refund reference
    pub refund_id: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Settlement time
    pub verified_at: Option<DateTime<Utc>>,
}

impl Payment {
    /// A new online payment awaiting a gateway order
    #[must_use]
    pub fn online(
        appointment_id: AppointmentId,
        amount: Money,
        currency: Currency,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: PaymentId::new(),
            appointment_id,
            method: PaymentMethod::Online,
            amount,
            currency,
            gateway_order_id: None,
            gateway_payment_id: None,
            status: PaymentStatus::Initiated,
            requires_settlement: false,
            offline: None,
            receipt: gateway_receipt(appointment_id, now),
            failure_reason: None,
            refund_id: None,
            created_at: now,
            verified_at: None,
        }
    }

    /// A new pay-at-clinic payment with a fresh receipt number and token
    #[must_use]
    pub fn offline<R: Rng>(
        appointment_id: AppointmentId,
        amount: Money,
        currency: Currency,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Self {
        let receipt_number = offline_receipt_number(now.date_naive(), rng);
        Self {
            id: PaymentId::new(),
            appointment_id,
            method: PaymentMethod::Offline,
            amount,
            currency,
            gateway_order_id: None,
            gateway_payment_id: None,
            status: PaymentStatus::Initiated,
            requires_settlement: true,
            offline: Some(OfflineDetails {
                receipt_number: receipt_number.clone(),
                payment_token: payment_token(rng),
                collected_by: None,
                proof: None,
                collected_at: None,
            }),
            receipt: receipt_number,
            failure_reason: None,
            refund_id: None,
            created_at: now,
            verified_at: None,
        }
    }

    /// Money may have moved: still outstanding, or failed on our side
    #[must_use]
    pub const fn is_refundable_if_paid(&self) -> bool {
        matches!(self.status, PaymentStatus::Initiated | PaymentStatus::Failed)
    }

    /// Mark failed, unless already settled
    pub fn fail(&mut self, reason: ReasonCode) -> bool {
        if self.status == PaymentStatus::Initiated {
            self.status = PaymentStatus::Failed;
            self.failure_reason = Some(reason);
            true
        } else {
            false
        }
    }
}

// ============================================================================
// Fees and references
// ============================================================================

/// Amount to charge up front.
///
/// Online consultations are paid in full. In-person consultations only
/// charge a convenience fee of `convenience_fee_percent` of the in-person
/// fee; the rest is settled at the clinic.
#[must_use]
pub const fn quote_fee(
    fees: &ConsultationFees,
    consultation_type: ConsultationType,
    convenience_fee_percent: u32,
) -> Option<Money> {
    match consultation_type {
        ConsultationType::Online => Some(fees.online),
        ConsultationType::InPerson => fees.in_person.percent_of(convenience_fee_percent),
    }
}

/// `apt_{last 6 of appointment id}_{unix seconds}`, at most 40 chars.
#[must_use]
pub fn gateway_receipt(appointment_id: AppointmentId, now: DateTime<Utc>) -> String {
    let id = appointment_id.to_string();
    let tail = &id[id.len().saturating_sub(6)..];
    let mut receipt = format!("apt_{tail}_{}", now.timestamp());
    receipt.truncate(MAX_RECEIPT_LEN);
    receipt
}

/// `OFF-{YYYYMMDD}-{6 alphanumerics}`
pub fn offline_receipt_number<R: Rng>(date: NaiveDate, rng: &mut R) -> String {
    let suffix: String = (0..6)
        .map(|_| char::from(RECEIPT_ALPHABET[rng.gen_range(0..RECEIPT_ALPHABET.len())]))
        .collect();
    format!("OFF-{}-{suffix}", date.format("%Y%m%d"))
}

/// 32 lowercase hex chars
pub fn payment_token<R: Rng>(rng: &mut R) -> String {
    let bytes: [u8; 16] = rng.r#gen();
    hex::encode(bytes)
}

// ============================================================================
// Verification
// ============================================================================

/// Checks gateway callback signatures.
///
/// The expected signature is the lowercase hex HMAC-SHA256 of
/// `"{order_id}|{payment_id}"` keyed with the gateway secret.
#[derive(Clone)]
pub struct PaymentVerifier {
    secret: String,
}

impl PaymentVerifier {
    /// Verifier for a gateway secret
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// The signature a genuine callback carries
    #[must_use]
    pub fn sign(&self, gateway_order_id: &str, gateway_payment_id: &str) -> String {
        let Ok(mut mac) = HmacSha256::new_from_slice(self.secret.as_bytes()) else {
            return String::new();
        };
        mac.update(format!("{gateway_order_id}|{gateway_payment_id}").as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Constant-time comparison against the expected signature
    #[must_use]
    pub fn verify(&self, gateway_order_id: &str, gateway_payment_id: &str, signature: &str) -> bool {
        let expected = self.sign(gateway_order_id, gateway_payment_id);
        !expected.is_empty() && constant_time_eq::constant_time_eq(expected.as_bytes(), signature.as_bytes())
    }
}

impl fmt::Debug for PaymentVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaymentVerifier")
            .field("secret", &"[redacted]")
            .finish()
    }
}
