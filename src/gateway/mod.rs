//! Payment gateway abstraction.
//!
//! Reconciliation only needs two calls from a gateway: start a hosted checkout
//! and ask for the authoritative state of an order. Everything else (tokens,
//! envelopes, endpoints) stays inside the concrete client.

pub mod phonepe;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

pub use phonepe::PhonePeClient;

/// Gateway-reported state of a payment order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayState {
    Pending,
    Success,
    Failed,
    Cancelled,
}

impl GatewayState {
    /// Maps the gateway's wire vocabulary onto the four states we act on.
    /// Unknown values are treated as still pending.
    pub fn from_wire(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "COMPLETED" | "SUCCESS" | "PAYMENT_SUCCESS" => Self::Success,
            "FAILED" | "PAYMENT_ERROR" | "PAYMENT_DECLINED" => Self::Failed,
            "CANCELLED" | "EXPIRED" => Self::Cancelled,
            _ => Self::Pending,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Result of a status inquiry
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayStatus {
    pub state: GatewayState,
    pub gateway_order_id: Option<String>,
    pub gateway_transaction_id: Option<String>,
    /// Amount in minor units as reported by the gateway
    pub amount: Option<i64>,
    pub error_code: Option<String>,
    pub raw_response: serde_json::Value,
}

/// Parameters for a hosted checkout session
#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub merchant_order_id: String,
    pub amount: i64,
    pub expire_after: Duration,
    pub redirect_url: String,
}

/// Hosted checkout created by the gateway
#[derive(Debug, Clone)]
pub struct CheckoutSession {
    pub gateway_order_id: Option<String>,
    pub redirect_url: String,
    pub raw_response: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway call timed out after {0}s")]
    Timeout(u64),

    #[error("gateway transport failure: {0}")]
    Transport(String),

    #[error("gateway returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("unexpected gateway response: {0}")]
    Decode(String),

    #[error("gateway authentication failed: {0}")]
    Auth(String),
}

impl GatewayError {
    /// Timeouts, transport failures and 5xx/429 responses may succeed on retry
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Transport(_) => true,
            Self::Http { status, .. } => *status >= 500 || *status == 429,
            Self::Decode(_) | Self::Auth(_) => false,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout(0)
        } else if err.is_decode() {
            GatewayError::Decode(err.to_string())
        } else {
            GatewayError::Transport(err.to_string())
        }
    }
}

#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Authoritative state of `merchant_order_id`
    async fn check_status(&self, merchant_order_id: &str) -> Result<GatewayStatus, GatewayError>;

    /// Starts a hosted checkout and returns where to send the customer
    async fn create_checkout(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, GatewayError>;
}

/// Bounds any gateway call by `limit`, independent of client-level timeouts
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, GatewayError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout(limit.as_secs())),
    }
}
