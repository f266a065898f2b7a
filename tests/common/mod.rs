#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use booking_reconciler::{
    auth::Claims,
    config::AppConfig,
    db,
    entities::{cart, payment_order, PaymentOrder},
    gateway::{
        CheckoutRequest, CheckoutSession, GatewayClient, GatewayError, GatewayState,
        GatewayStatus,
    },
    handlers::{payment_webhooks::credential_header, AppServices},
    notifications::{NotificationDispatcher, NotificationError},
    services::{NewCart, NewPaymentOrder},
    AppState,
};
use chrono::{NaiveDate, Utc};
use sea_orm::{sea_query::Expr, ColumnTrait, EntityTrait, QueryFilter};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

pub const JWT_SECRET: &str = "test_secret_key_for_testing_purposes_only_32chars";
pub const WEBHOOK_USERNAME: &str = "okpuja_webhook";
pub const WEBHOOK_PASSWORD: &str = "Okpuja2025";
pub const FRONTEND_BASE: &str = "https://www.okpuja.com";

/// Scripted stand-in for the PhonePe API
#[derive(Default)]
pub struct FakeGateway {
    statuses: Mutex<HashMap<String, Result<GatewayState, String>>>,
    status_calls: AtomicUsize,
    delay: Mutex<Option<Duration>>,
    fail_checkout: AtomicBool,
}

impl FakeGateway {
    pub fn set_state(&self, merchant_order_id: &str, state: GatewayState) {
        self.statuses
            .lock()
            .unwrap()
            .insert(merchant_order_id.to_string(), Ok(state));
    }

    pub fn set_error(&self, merchant_order_id: &str, message: &str) {
        self.statuses
            .lock()
            .unwrap()
            .insert(merchant_order_id.to_string(), Err(message.to_string()));
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn fail_checkout(&self) {
        self.fail_checkout.store(true, Ordering::SeqCst);
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GatewayClient for FakeGateway {
    async fn check_status(&self, merchant_order_id: &str) -> Result<GatewayStatus, GatewayError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .statuses
            .lock()
            .unwrap()
            .get(merchant_order_id)
            .cloned()
            .unwrap_or(Ok(GatewayState::Pending));

        let state = scripted.map_err(GatewayError::Transport)?;
        Ok(GatewayStatus {
            state,
            gateway_order_id: Some(format!("OMO-{}", merchant_order_id)),
            gateway_transaction_id: (state == GatewayState::Success)
                .then(|| format!("T-{}", merchant_order_id)),
            amount: None,
            error_code: (state == GatewayState::Failed).then(|| "PAYMENT_DECLINED".to_string()),
            raw_response: json!({ "state": format!("{:?}", state).to_uppercase() }),
        })
    }

    async fn create_checkout(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, GatewayError> {
        if self.fail_checkout.load(Ordering::SeqCst) {
            return Err(GatewayError::Http {
                status: 500,
                body: "internal error".into(),
            });
        }
        Ok(CheckoutSession {
            gateway_order_id: Some(format!("OMO-{}", request.merchant_order_id)),
            redirect_url: format!(
                "https://mercury-uat.phonepe.com/transact/{}",
                request.merchant_order_id
            ),
            raw_response: json!({ "state": "PENDING" }),
        })
    }
}

/// Captures enqueued booking ids instead of publishing them
#[derive(Default)]
pub struct RecordingDispatcher {
    enqueued: Mutex<Vec<String>>,
    delay: Mutex<Option<Duration>>,
}

impl RecordingDispatcher {
    pub fn enqueued(&self) -> Vec<String> {
        self.enqueued.lock().unwrap().clone()
    }

    /// Slows every enqueue down, like a congested queue
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl NotificationDispatcher for RecordingDispatcher {
    async fn enqueue(&self, booking_id: &str) -> Result<(), NotificationError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.enqueued.lock().unwrap().push(booking_id.to_string());
        Ok(())
    }
}

/// Application wired to a throwaway SQLite file, a fake gateway and a recording dispatcher.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub gateway: Arc<FakeGateway>,
    pub dispatcher: Arc<RecordingDispatcher>,
    _db_dir: TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(customize: impl FnOnce(&mut AppConfig)) -> Self {
        let db_dir = tempfile::tempdir().expect("create temp dir");
        let db_path = db_dir.path().join("reconciler_test.db");

        let mut cfg = AppConfig::new(
            format!("sqlite://{}?mode=rwc", db_path.display()),
            JWT_SECRET.to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.frontend_base_url = FRONTEND_BASE.to_string();
        cfg.redirect_path = "/confirmbooking".to_string();
        cfg.webhook.username = WEBHOOK_USERNAME.to_string();
        cfg.webhook.password = WEBHOOK_PASSWORD.to_string();
        cfg.gateway.timeout_secs = 2;
        cfg.redirect_timeout_secs = 5;
        customize(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        let db_arc = Arc::new(pool);

        let gateway = Arc::new(FakeGateway::default());
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let services = AppServices::new(db_arc.clone(), &cfg, gateway.clone(), dispatcher.clone());

        let state = AppState {
            db: db_arc,
            config: cfg,
            services,
        };

        Self {
            router: booking_reconciler::app_router(state.clone()),
            state,
            gateway,
            dispatcher,
            _db_dir: db_dir,
        }
    }

    pub fn services(&self) -> &AppServices {
        &self.state.services
    }

    /// Bearer token for `user_id` as the session service would mint it
    pub fn token_for(&self, user_id: &str, roles: &[&str]) -> String {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            name: None,
            email: Some(format!("{}@example.com", user_id)),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            iat: now,
            exp: now + 3600,
            iss: self.state.config.auth_issuer.clone(),
            aud: self.state.config.auth_audience.clone(),
        };
        jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(JWT_SECRET.as_bytes()),
        )
        .expect("encode access token")
    }

    /// Send a request against the router with an optional bearer token.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        self.send(builder.body(body).expect("failed to build request"))
            .await
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Delivers a webhook with the given raw `Authorization` header value
    pub async fn webhook_with_auth(&self, payload: &Value, authorization: Option<&str>) -> Response {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/payments/webhook")
            .header("content-type", "application/json");
        if let Some(auth) = authorization {
            builder = builder.header("authorization", auth);
        }
        self.send(
            builder
                .body(Body::from(serde_json::to_vec(payload).unwrap()))
                .unwrap(),
        )
        .await
    }

    /// Delivers a correctly authenticated webhook
    pub async fn webhook(&self, payload: &Value) -> Response {
        let auth = credential_header(WEBHOOK_USERNAME, WEBHOOK_PASSWORD);
        self.webhook_with_auth(payload, Some(&auth)).await
    }

    /// Follows the gateway redirect and returns the frontend `Location`
    pub async fn redirect(&self, query: &str, token: Option<&str>) -> String {
        let uri = if query.is_empty() {
            "/api/v1/payments/redirect".to_string()
        } else {
            format!("/api/v1/payments/redirect?{}", query)
        };
        let response = self.request(Method::GET, &uri, None, token).await;
        assert_eq!(response.status().as_u16(), 303, "redirect must be a 303");
        response
            .headers()
            .get("location")
            .expect("location header")
            .to_str()
            .unwrap()
            .to_string()
    }

    pub async fn seed_cart(&self, user_id: &str, cart_id: &str) -> cart::Model {
        self.services()
            .carts
            .create(
                user_id,
                NewCart {
                    cart_id: Some(cart_id.to_string()),
                    service_ref: "griha-pravesh-puja".to_string(),
                    package_ref: Some("standard".to_string()),
                    address_ref: None,
                    selected_date: NaiveDate::from_ymd_opt(2025, 9, 1).unwrap(),
                    selected_time: "10:00".to_string(),
                },
            )
            .await
            .expect("seed cart")
    }

    pub async fn seed_order(
        &self,
        merchant_order_id: &str,
        user_id: &str,
        cart_id: Option<&str>,
        amount: i64,
    ) -> payment_order::Model {
        self.services()
            .orders
            .create_with_id(
                merchant_order_id.to_string(),
                NewPaymentOrder {
                    user_id: user_id.to_string(),
                    cart_id: cart_id.map(str::to_string),
                    amount,
                    currency: "INR".to_string(),
                },
            )
            .await
            .expect("seed payment order")
    }

    /// Moves an order's creation time into the past
    pub async fn backdate_order(&self, merchant_order_id: &str, age: chrono::Duration) {
        PaymentOrder::update_many()
            .col_expr(
                payment_order::Column::CreatedAt,
                Expr::value(Utc::now() - age),
            )
            .filter(payment_order::Column::MerchantOrderId.eq(merchant_order_id))
            .exec(&*self.state.db)
            .await
            .expect("backdate order");
    }

    pub async fn order(&self, merchant_order_id: &str) -> payment_order::Model {
        self.services()
            .orders
            .get(merchant_order_id)
            .await
            .expect("load payment order")
    }
}

pub fn success_payload(merchant_order_id: &str, amount: i64) -> Value {
    json!({
        "event_type": "success",
        "merchant_order_id": merchant_order_id,
        "gateway_transaction_id": format!("T-{}", merchant_order_id),
        "amount": amount,
    })
}

pub async fn body_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read response body");
    serde_json::from_slice(&bytes).expect("response body is json")
}

/// Query pairs of a redirect target
pub fn query_pairs(location: &str) -> HashMap<String, String> {
    url::Url::parse(location)
        .expect("absolute redirect url")
        .query_pairs()
        .into_owned()
        .collect()
}
