//! Payment gateway boundary.
//!
//! The booking engine only needs three gateway operations: create an order
//! the patient pays against, cancel an order nobody paid, and refund a
//! captured payment. Signature verification of callbacks happens locally
//! (see [`PaymentVerifier`](crate::aggregates::payment::PaymentVerifier)).

use crate::types::{Currency, Money};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

/// Payment gateway result
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Boxed future returned by gateway calls
pub type GatewayFuture<T> = Pin<Box<dyn Future<Output = GatewayResult<T>> + Send>>;

/// Payment gateway error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// The gateway refused the request
    #[error("Gateway rejected request: {reason}")]
    Rejected {
        /// Reason reported by the gateway
        reason: String,
    },
    /// Unknown order or payment id
    #[error("Gateway has no record of {0}")]
    NotFound(String),
    /// Gateway did not answer in time
    #[error("Gateway timeout")]
    Timeout,
}

/// Order creation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Amount in minor units
    pub amount: Money,
    /// Currency code
    pub currency: Currency,
    /// Merchant receipt reference (max 40 chars)
    pub receipt: String,
}

/// Order created at the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayOrder {
    /// Gateway order id (`order_...`)
    pub id: String,
    /// Amount in minor units
    pub amount: Money,
    /// Currency code
    pub currency: Currency,
    /// Merchant receipt reference
    pub receipt: String,
}

/// Payment gateway trait
///
/// Abstraction over hosted-checkout processors. Every call returns a boxed
/// future so implementations can be held as `Arc<dyn PaymentGateway>` inside
/// the reducer environment and driven from effects.
pub trait PaymentGateway: Send + Sync {
    /// Create an order for the patient to pay against
    ///
    /// # Errors
    ///
    /// Returns error if the gateway refuses the order
    fn create_order(&self, request: OrderRequest) -> GatewayFuture<GatewayOrder>;

    /// Cancel an unpaid order, releasing any reservation held at the gateway
    ///
    /// # Errors
    ///
    /// Returns error if the order is unknown
    fn cancel_order(&self, order_id: &str) -> GatewayFuture<()>;

    /// Refund a captured payment, returning the refund id
    ///
    /// # Errors
    ///
    /// Returns error if the refund fails
    fn refund_payment(&self, gateway_payment_id: &str, amount: Money) -> GatewayFuture<String>;
}

/// A call recorded by [`MockPaymentGateway`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    /// `create_order`
    CreateOrder(OrderRequest),
    /// `cancel_order`
    CancelOrder(String),
    /// `refund_payment`
    Refund {
        /// Gateway payment id
        gateway_payment_id: String,
        /// Refunded amount
        amount: Money,
    },
}

/// Mock payment gateway for development and tests
///
/// Succeeds by default. [`MockPaymentGateway::failing`] rejects every
/// order. Clones share the call log.
#[derive(Clone, Debug, Default)]
pub struct MockPaymentGateway {
    reject_orders: bool,
    calls: Arc<Mutex<Vec<GatewayCall>>>,
}

impl MockPaymentGateway {
    /// Creates a new mock payment gateway
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A gateway that rejects every order
    #[must_use]
    pub fn failing() -> Self {
        Self {
            reject_orders: true,
            ..Self::default()
        }
    }

    /// Creates an Arc-wrapped instance for sharing
    #[must_use]
    pub fn shared() -> Arc<dyn PaymentGateway> {
        Arc::new(Self::new())
    }

    /// Every call made so far, in order
    #[must_use]
    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, call: GatewayCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }
}

impl PaymentGateway for MockPaymentGateway {
    fn create_order(&self, request: OrderRequest) -> GatewayFuture<GatewayOrder> {
        self.record(GatewayCall::CreateOrder(request.clone()));
        let reject = self.reject_orders;

        Box::pin(async move {
            if reject {
                tracing::warn!(receipt = %request.receipt, "Mock gateway rejected order");
                return Err(GatewayError::Rejected {
                    reason: "mock gateway configured to fail".to_string(),
                });
            }

            let order = GatewayOrder {
                id: format!("order_{}", uuid::Uuid::new_v4().simple()),
                amount: request.amount,
                currency: request.currency,
                receipt: request.receipt,
            };

            tracing::info!(
                order_id = %order.id,
                amount = order.amount.minor(),
                "Mock order created"
            );

            Ok(order)
        })
    }

    fn cancel_order(&self, order_id: &str) -> GatewayFuture<()> {
        self.record(GatewayCall::CancelOrder(order_id.to_string()));
        let order_id = order_id.to_string();

        Box::pin(async move {
            tracing::info!(order_id = %order_id, "Mock order cancelled");
            Ok(())
        })
    }

    fn refund_payment(&self, gateway_payment_id: &str, amount: Money) -> GatewayFuture<String> {
        self.record(GatewayCall::Refund {
            gateway_payment_id: gateway_payment_id.to_string(),
            amount,
        });
        let gateway_payment_id = gateway_payment_id.to_string();

        Box::pin(async move {
            let refund_id = format!("rfnd_{}", uuid::Uuid::new_v4().simple());

            tracing::info!(
                gateway_payment_id = %gateway_payment_id,
                amount = amount.minor(),
                refund_id = %refund_id,
                "Mock refund processed"
            );

            Ok(refund_id)
        })
    }
}
