use super::{
    CheckoutRequest, CheckoutSession, GatewayClient, GatewayError, GatewayState, GatewayStatus,
};
use crate::config::GatewayConfig;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

/// Tokens are refreshed this many seconds before the gateway says they expire
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_at: Option<i64>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderStatusResponse {
    #[serde(default)]
    order_id: Option<String>,
    state: String,
    #[serde(default)]
    amount: Option<i64>,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    payment_details: Vec<PaymentDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentDetail {
    #[serde(default)]
    transaction_id: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckoutResponse {
    #[serde(default)]
    order_id: Option<String>,
    redirect_url: String,
}

/// PhonePe Standard Checkout (v2) client
pub struct PhonePeClient {
    http: reqwest::Client,
    pg_base_url: String,
    oauth_base_url: String,
    client_id: String,
    client_secret: String,
    client_version: String,
    token: RwLock<Option<CachedToken>>,
}

impl PhonePeClient {
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        info!(
            environment = %config.environment,
            pg_base_url = %config.pg_base_url(),
            "PhonePe client configured"
        );

        Ok(Self {
            http,
            pg_base_url: config.pg_base_url(),
            oauth_base_url: config.oauth_base_url(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            client_version: config.client_version.clone(),
            token: RwLock::new(None),
        })
    }

    async fn access_token(&self) -> Result<String, GatewayError> {
        let now = chrono::Utc::now().timestamp();
        if let Some(cached) = self.token.read().await.as_ref() {
            if now < cached.expires_at {
                return Ok(cached.access_token.clone());
            }
        }

        let mut slot = self.token.write().await;
        // Another task may have refreshed while we waited for the write lock
        if let Some(cached) = slot.as_ref() {
            if now < cached.expires_at {
                return Ok(cached.access_token.clone());
            }
        }

        debug!("Requesting PhonePe OAuth token");
        let response = self
            .http
            .post(format!("{}/v1/oauth/token", self.oauth_base_url))
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_version", self.client_version.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "PhonePe OAuth token request rejected");
            return Err(GatewayError::Auth(format!("HTTP {}: {}", status.as_u16(), body)));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))?;

        let expires_at = token
            .expires_at
            .or_else(|| token.expires_in.map(|secs| now + secs))
            .unwrap_or(now + 3600)
            - TOKEN_REFRESH_MARGIN_SECS;

        *slot = Some(CachedToken {
            access_token: token.access_token.clone(),
            expires_at,
        });
        Ok(token.access_token)
    }

    async fn invalidate_token(&self) {
        *self.token.write().await = None;
    }

    async fn read_json(&self, response: reqwest::Response) -> Result<Value, GatewayError> {
        let status = response.status();
        let body = response.text().await?;
        if status == reqwest::StatusCode::UNAUTHORIZED {
            self.invalidate_token().await;
            return Err(GatewayError::Auth(body));
        }
        if !status.is_success() {
            return Err(GatewayError::Http {
                status: status.as_u16(),
                body,
            });
        }
        serde_json::from_str(&body).map_err(|e| GatewayError::Decode(e.to_string()))
    }
}

#[async_trait]
impl GatewayClient for PhonePeClient {
    #[instrument(skip(self))]
    async fn check_status(&self, merchant_order_id: &str) -> Result<GatewayStatus, GatewayError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(format!(
                "{}/checkout/v2/order/{}/status",
                self.pg_base_url, merchant_order_id
            ))
            .header("Authorization", format!("O-Bearer {}", token))
            .header("Accept", "application/json")
            .send()
            .await?;

        let raw = self.read_json(response).await?;
        let parsed: OrderStatusResponse = serde_json::from_value(raw.clone())
            .map_err(|e| GatewayError::Decode(e.to_string()))?;

        let state = GatewayState::from_wire(&parsed.state);
        // Latest attempt carries the transaction id; prefer a completed one
        let transaction_id = parsed
            .payment_details
            .iter()
            .rev()
            .find(|d| d.state.as_deref().map(GatewayState::from_wire) == Some(state))
            .or_else(|| parsed.payment_details.last())
            .and_then(|d| d.transaction_id.clone());

        debug!(?state, "PhonePe status resolved");

        Ok(GatewayStatus {
            state,
            gateway_order_id: parsed.order_id,
            gateway_transaction_id: transaction_id,
            amount: parsed.amount,
            error_code: parsed.error_code,
            raw_response: raw,
        })
    }

    #[instrument(skip(self, request), fields(merchant_order_id = %request.merchant_order_id))]
    async fn create_checkout(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, GatewayError> {
        let token = self.access_token().await?;
        let payload = json!({
            "merchantOrderId": request.merchant_order_id,
            "amount": request.amount,
            "expireAfter": request.expire_after.as_secs(),
            "paymentFlow": {
                "type": "PG_CHECKOUT",
                "message": format!("Payment for {}", request.merchant_order_id),
                "merchantUrls": { "redirectUrl": request.redirect_url }
            }
        });

        let response = self
            .http
            .post(format!("{}/checkout/v2/pay", self.pg_base_url))
            .header("Authorization", format!("O-Bearer {}", token))
            .json(&payload)
            .send()
            .await?;

        let raw = self.read_json(response).await?;
        let parsed: CheckoutResponse = serde_json::from_value(raw.clone())
            .map_err(|e| GatewayError::Decode(e.to_string()))?;

        info!(gateway_order_id = ?parsed.order_id, "PhonePe checkout created");

        Ok(CheckoutSession {
            gateway_order_id: parsed.order_id,
            redirect_url: parsed.redirect_url,
            raw_response: raw,
        })
    }
}
