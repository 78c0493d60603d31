//! Configuration management for the booking server.
//!
//! Loads configuration from environment variables with sensible defaults.

use crate::aggregates::BookingPolicy;
use crate::types::Currency;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server
    pub server: ServerConfig,
    /// Lock and payment timing
    pub booking: BookingConfig,
    /// Payment gateway
    pub payment: PaymentConfig,
    /// WebSocket transport
    pub websocket: WebSocketConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to bind to
    pub port: u16,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Metrics server host (for Prometheus scraping)
    pub metrics_host: String,
    /// Metrics server port
    pub metrics_port: u16,
    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout: u64,
}

/// Lock and payment timing, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingConfig {
    /// Slot lock lifetime
    pub lock_ttl: u64,
    /// How long an online payment may stay pending
    pub payment_grace: u64,
    /// How long an offline payment may stay pending
    pub offline_settlement_window: u64,
    /// Interval between reaper sweeps
    pub reaper_interval: u64,
    /// How long a caller waits for a command's answer
    pub lock_request_timeout: u64,
    /// Store action broadcast buffer. Every command answer passes through
    /// it, so it bounds how many answers may be in flight at once.
    pub action_broadcast_capacity: usize,
}

/// Payment gateway configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct PaymentConfig {
    /// Public key id handed to checkout
    pub key_id: String,
    /// Shared secret for callback signatures
    pub key_secret: String,
    /// ISO currency code
    pub currency: String,
    /// Share of the in-person fee charged up front
    pub convenience_fee_percent: u32,
}

impl std::fmt::Debug for PaymentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentConfig")
            .field("key_id", &self.key_id)
            .field("key_secret", &"<redacted>")
            .field("currency", &self.currency)
            .field("convenience_fee_percent", &self.convenience_fee_percent)
            .finish()
    }
}

/// WebSocket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    /// Concurrent connection limit
    pub max_connections: usize,
    /// Ping interval in seconds
    pub ping_interval: u64,
    /// Per-room broadcast buffer
    pub broadcast_capacity: usize,
}

const DEFAULT_ACTION_BROADCAST_CAPACITY: usize = 16_384;

fn var_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn string_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Missing or unparsable values fall back to their defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            server: ServerConfig {
                host: string_or("HOST", "0.0.0.0"),
                port: var_or("PORT", 8080),
                log_level: string_or("RUST_LOG", "info"),
                metrics_host: string_or("METRICS_HOST", "0.0.0.0"),
                metrics_port: var_or("METRICS_PORT", 9090),
                shutdown_timeout: var_or("SHUTDOWN_TIMEOUT", 30),
            },
            booking: BookingConfig {
                lock_ttl: var_or("SLOT_LOCK_TTL_SECS", 600),
                payment_grace: var_or("PAYMENT_GRACE_SECS", 900),
                offline_settlement_window: var_or("OFFLINE_SETTLEMENT_SECS", 86_400),
                reaper_interval: var_or("REAPER_INTERVAL_SECS", 30),
                lock_request_timeout: var_or("LOCK_REQUEST_TIMEOUT_SECS", 10),
                action_broadcast_capacity: var_or(
                    "STORE_BROADCAST_CAPACITY",
                    DEFAULT_ACTION_BROADCAST_CAPACITY,
                ),
            },
            payment: PaymentConfig {
                key_id: string_or("PAYMENT_KEY_ID", "rzp_test_key"),
                key_secret: string_or("PAYMENT_KEY_SECRET", "dev-secret-change-in-production"),
                currency: string_or("PAYMENT_CURRENCY", "INR"),
                convenience_fee_percent: var_or("CONVENIENCE_FEE_PERCENT", 5),
            },
            websocket: WebSocketConfig {
                max_connections: var_or("WS_MAX_CONNECTIONS", 1000),
                ping_interval: var_or("WS_PING_INTERVAL_SECS", 30),
                broadcast_capacity: var_or("WS_ROOM_CAPACITY", 1000),
            },
        }
    }

    /// Reducer policy from the booking and payment sections
    #[must_use]
    pub fn policy(&self) -> BookingPolicy {
        self.booking.policy(&self.payment)
    }
}

fn seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::try_seconds(i64::try_from(secs).unwrap_or(i64::MAX))
        .unwrap_or(chrono::Duration::MAX)
}

impl BookingConfig {
    /// Build the reducer policy
    #[must_use]
    pub fn policy(&self, payment: &PaymentConfig) -> BookingPolicy {
        BookingPolicy {
            lock_ttl: seconds(self.lock_ttl),
            payment_grace: seconds(self.payment_grace),
            offline_settlement_window: seconds(self.offline_settlement_window),
            currency: Currency::new(&payment.currency),
            convenience_fee_percent: payment.convenience_fee_percent,
            key_id: payment.key_id.clone(),
        }
    }

    /// Reaper sweep interval
    #[must_use]
    pub const fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval)
    }

    /// Command answer timeout
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_request_timeout)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                log_level: "info".to_string(),
                metrics_host: "127.0.0.1".to_string(),
                metrics_port: 0,
                shutdown_timeout: 5,
            },
            booking: BookingConfig {
                lock_ttl: 600,
                payment_grace: 900,
                offline_settlement_window: 86_400,
                reaper_interval: 30,
                lock_request_timeout: 10,
                action_broadcast_capacity: DEFAULT_ACTION_BROADCAST_CAPACITY,
            },
            payment: PaymentConfig {
                key_id: "rzp_test_key".to_string(),
                key_secret: "dev-secret-change-in-production".to_string(),
                currency: "INR".to_string(),
                convenience_fee_percent: 5,
            },
            websocket: WebSocketConfig {
                max_connections: 1000,
                ping_interval: 30,
                broadcast_capacity: 1000,
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_converts_seconds() {
        let config = Config::default();
        let policy = config.policy();

        assert_eq!(policy.lock_ttl, chrono::Duration::minutes(10));
        assert_eq!(policy.payment_grace, chrono::Duration::minutes(15));
        assert_eq!(policy.offline_settlement_window, chrono::Duration::hours(24));
        assert_eq!(policy.currency.code(), "INR");
        assert_eq!(policy.key_id, "rzp_test_key");
    }

    #[test]
    fn test_secret_is_redacted() {
        let config = Config::default();
        let debug = format!("{:?}", config.payment);

        assert!(!debug.contains("dev-secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_store_buffer_is_separate_from_rooms() {
        let config = Config::default();

        assert_eq!(config.booking.action_broadcast_capacity, 16_384);
        assert!(config.booking.action_broadcast_capacity > config.websocket.broadcast_capacity);
    }

    #[test]
    fn test_huge_values_saturate() {
        assert_eq!(seconds(u64::MAX), chrono::Duration::MAX);
    }
}
