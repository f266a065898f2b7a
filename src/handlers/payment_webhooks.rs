use crate::{
    config::WebhookConfig,
    entities::payment_webhook,
    errors::ServiceError,
    gateway::GatewayState,
    services::PaymentSignal,
    ApiResponse, AppState,
};
use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sea_orm::{ActiveModelTrait, Set};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_HEADER: &str = "x-webhook-signature";
const AUDITED_HEADERS: [&str; 4] = ["content-type", "user-agent", "x-request-id", "x-verify"];

/// A webhook body reduced to what reconciliation acts on
#[derive(Debug, Clone)]
pub struct WebhookNotification {
    pub event_type: String,
    pub merchant_order_id: String,
    pub signal: PaymentSignal,
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchant_order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_status: Option<String>,
}

// POST /api/v1/payments/webhook
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ApiResponse<WebhookAck>>, ServiceError> {
    if !authenticate(&headers, &body, &state.config.webhook) {
        warn!(
            target: "security",
            body_len = body.len(),
            has_authorization = headers.contains_key(axum::http::header::AUTHORIZATION),
            "Payment webhook failed authentication"
        );
        return Err(ServiceError::Unauthorized(
            "invalid webhook credentials".to_string(),
        ));
    }

    let raw: Value = serde_json::from_slice(&body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()));
    let parsed = parse_notification(&raw);

    let audit = payment_webhook::ActiveModel {
        id: Set(Uuid::new_v4()),
        event_type: Set(parsed
            .as_ref()
            .map(|n| n.event_type.clone())
            .unwrap_or_else(|_| "unparseable".to_string())),
        merchant_order_id: Set(parsed.as_ref().ok().map(|n| n.merchant_order_id.clone())),
        payload: Set(raw.clone()),
        headers: Set(audited_headers(&headers)),
        processed: Set(false),
        processing_error: Set(None),
        received_at: Set(Utc::now()),
        processed_at: Set(None),
    }
    .insert(&*state.db)
    .await?;

    let notification = match parsed {
        Ok(notification) => notification,
        Err(reason) => {
            warn!(webhook_id = %audit.id, reason = %reason, "Ignoring webhook payload");
            finish_audit(&state, audit, Some(reason)).await?;
            return Ok(Json(ApiResponse::success(WebhookAck {
                outcome: "ignored",
                merchant_order_id: None,
                order_status: None,
            })));
        }
    };

    let merchant_order_id = notification.merchant_order_id.clone();
    info!(
        webhook_id = %audit.id,
        merchant_order_id = %merchant_order_id,
        event_type = %notification.event_type,
        "Payment webhook received"
    );

    let result = state
        .services
        .reconciler
        .apply_signal(&merchant_order_id, notification.signal)
        .await;

    let ack = match result {
        Ok(outcome) => {
            finish_audit(&state, audit, None).await?;
            WebhookAck {
                outcome: if outcome.transitioned { "processed" } else { "already_applied" },
                merchant_order_id: Some(merchant_order_id),
                order_status: Some(format!("{:?}", outcome.status).to_uppercase()),
            }
        }
        Err(ServiceError::NotFound(_)) => {
            warn!(merchant_order_id = %merchant_order_id, "Webhook for unknown payment order");
            finish_audit(&state, audit, Some("unknown merchant order id".to_string())).await?;
            WebhookAck {
                outcome: "unknown_order",
                merchant_order_id: Some(merchant_order_id),
                order_status: None,
            }
        }
        Err(ServiceError::CartMissing(cart)) => {
            error!(merchant_order_id = %merchant_order_id, cart = %cart, "Paid order could not be booked");
            finish_audit(&state, audit, Some(format!("cart missing: {}", cart))).await?;
            WebhookAck {
                outcome: "cart_missing",
                merchant_order_id: Some(merchant_order_id),
                order_status: Some("SUCCESS".to_string()),
            }
        }
        Err(e) => {
            // Non-2xx so the gateway redelivers once we are healthy again
            error!(merchant_order_id = %merchant_order_id, error = %e, "Webhook processing failed");
            if let Err(audit_err) = finish_audit(&state, audit, Some(e.to_string())).await {
                error!(error = %audit_err, "Could not record webhook failure");
            }
            return Err(e);
        }
    };

    Ok(Json(ApiResponse::success(ack)))
}

async fn finish_audit(
    state: &AppState,
    audit: payment_webhook::Model,
    processing_error: Option<String>,
) -> Result<(), ServiceError> {
    let mut active: payment_webhook::ActiveModel = audit.into();
    active.processed = Set(processing_error.is_none());
    active.processing_error = Set(processing_error);
    active.processed_at = Set(Some(Utc::now()));
    active.update(&*state.db).await?;
    Ok(())
}

fn audited_headers(headers: &HeaderMap) -> Value {
    let mut selected = serde_json::Map::new();
    for name in AUDITED_HEADERS {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            selected.insert(name.to_string(), Value::String(value.to_string()));
        }
    }
    Value::Object(selected)
}

/// Either scheme configured on the gateway dashboard is accepted
pub fn authenticate(headers: &HeaderMap, body: &[u8], config: &WebhookConfig) -> bool {
    if let Some(secret) = config.hmac_secret.as_deref().filter(|s| !s.is_empty()) {
        if verify_hmac_signature(headers, body, secret) {
            return true;
        }
    }
    verify_credentials(headers, config)
}

/// `Authorization: SHA256(username:password)` as hex, with optional `SHA256` prefix
pub fn verify_credentials(headers: &HeaderMap, config: &WebhookConfig) -> bool {
    if !config.has_credentials() {
        return false;
    }
    let Some(provided) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };

    let provided = provided.trim();
    let provided = match provided.get(..6) {
        Some(prefix) if prefix.eq_ignore_ascii_case("sha256") => provided[6..].trim(),
        _ => provided,
    };

    let expected = hex::encode(Sha256::digest(
        format!("{}:{}", config.username, config.password).as_bytes(),
    ));
    constant_time_eq(&expected, &provided.to_ascii_lowercase())
}

/// `X-Webhook-Signature: hex(HMAC-SHA256(secret, body))`, optional `sha256=` prefix
pub fn verify_hmac_signature(headers: &HeaderMap, body: &[u8], secret: &str) -> bool {
    let Some(signature) = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let signature = signature.trim();
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature);
    let Ok(signature) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}

fn str_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| value.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn amount_field(value: &Value) -> Option<i64> {
    match value.get("amount")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Event names carry the outcome when no explicit state is sent
fn state_from_event(event: &str) -> Option<GatewayState> {
    let event = event.to_ascii_lowercase();
    if event.contains("success") || event.contains("completed") {
        Some(GatewayState::Success)
    } else if event.contains("fail") {
        Some(GatewayState::Failed)
    } else if event.contains("cancel") || event.contains("expire") {
        Some(GatewayState::Cancelled)
    } else if event.contains("pending") {
        Some(GatewayState::Pending)
    } else {
        None
    }
}

/// Accepts the flat shape and the PhonePe V2 `{event, payload}` envelope
pub fn parse_notification(raw: &Value) -> Result<WebhookNotification, String> {
    if !raw.is_object() {
        return Err("payload is not a JSON object".to_string());
    }

    let (event_type, body) = match (raw.get("event").and_then(Value::as_str), raw.get("payload")) {
        (Some(event), Some(payload)) if payload.is_object() => (event.to_string(), payload),
        _ => (
            str_field(raw, &["event_type", "eventType", "event", "type"])
                .unwrap_or_default()
                .to_string(),
            raw,
        ),
    };

    let merchant_order_id = str_field(
        body,
        &["merchant_order_id", "merchantOrderId", "merchantTransactionId"],
    )
    .ok_or_else(|| "missing merchant order id".to_string())?
    .to_string();

    let state = match str_field(body, &["state", "status"]) {
        Some(state) => GatewayState::from_wire(state),
        None => state_from_event(&event_type)
            .ok_or_else(|| format!("cannot determine payment state from event '{}'", event_type))?,
    };

    let details = body
        .get("payment_details")
        .or_else(|| body.get("paymentDetails"))
        .and_then(Value::as_array);
    let transaction_id = str_field(body, &["gateway_transaction_id", "transactionId"])
        .map(str::to_string)
        .or_else(|| {
            details.and_then(|d| {
                d.iter()
                    .rev()
                    .find_map(|p| str_field(p, &["transactionId", "transaction_id"]))
                    .map(str::to_string)
            })
        });

    let raw_payload = raw.clone();
    let signal = match state {
        GatewayState::Success => PaymentSignal::Success {
            gateway_transaction_id: transaction_id,
            amount: amount_field(body),
            raw: raw_payload,
        },
        GatewayState::Failed => PaymentSignal::Failed {
            reason: str_field(body, &["errorCode", "error_code", "detailedErrorCode"])
                .unwrap_or("gateway reported FAILED")
                .to_string(),
            raw: raw_payload,
        },
        GatewayState::Cancelled => PaymentSignal::Cancelled { raw: raw_payload },
        GatewayState::Pending => PaymentSignal::Pending { raw: raw_payload },
    };

    Ok(WebhookNotification {
        event_type: if event_type.is_empty() {
            format!("{:?}", state).to_lowercase()
        } else {
            event_type
        },
        merchant_order_id,
        signal,
    })
}

/// Hex credential header for `username:password`, as the gateway sends it
pub fn credential_header(username: &str, password: &str) -> String {
    hex::encode(Sha256::digest(format!("{}:{}", username, password).as_bytes()))
}
