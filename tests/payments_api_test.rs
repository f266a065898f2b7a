mod common;

use axum::http::{Method, StatusCode};
use booking_reconciler::{auth::ADMIN_ROLE, entities::PaymentOrderStatus, gateway::GatewayState};
use common::{body_json, success_payload, TestApp};
use serde_json::json;

async fn create_cart(app: &TestApp, token: &str, cart_id: &str) {
    let response = app
        .request(
            Method::POST,
            "/api/v1/carts",
            Some(json!({
                "cart_id": cart_id,
                "service_ref": "satyanarayan-puja",
                "selected_date": "2025-10-02",
                "selected_time": "09:30"
            })),
            Some(token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn initiating_payment_opens_checkout_for_active_cart() {
    let app = TestApp::new().await;
    let token = app.token_for("u-1", &[]);
    create_cart(&app, &token, "c-1").await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/payments",
            Some(json!({ "cart_id": "c-1", "amount": 50000 })),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    let merchant_order_id = body["data"]["merchant_order_id"].as_str().unwrap().to_string();
    assert!(merchant_order_id.starts_with("OKPUJA_"));
    assert_eq!(body["data"]["currency"], "INR");
    assert!(body["data"]["checkout_url"]
        .as_str()
        .unwrap()
        .ends_with(&merchant_order_id));

    let order = app.order(&merchant_order_id).await;
    assert_eq!(order.status, PaymentOrderStatus::Initiated);
    assert_eq!(order.cart_id.as_deref(), Some("c-1"));
    assert_eq!(
        order.gateway_order_id,
        Some(format!("OMO-{}", merchant_order_id))
    );
}

#[tokio::test]
async fn checkout_failure_closes_the_order() {
    let app = TestApp::new().await;
    let token = app.token_for("u-1", &[]);
    create_cart(&app, &token, "c-1").await;
    app.gateway.fail_checkout();

    let response = app
        .request(
            Method::POST,
            "/api/v1/payments",
            Some(json!({ "cart_id": "c-1", "amount": 50000 })),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let orders = app
        .services()
        .orders
        .latest_for_cart("c-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(orders.status, PaymentOrderStatus::Failed);
}

#[tokio::test]
async fn payments_require_owner_or_admin() {
    let app = TestApp::new().await;
    let owner = app.token_for("u-1", &[]);
    create_cart(&app, &owner, "c-1").await;
    app.seed_order("ord-1", "u-1", Some("c-1"), 50_000).await;

    let anonymous = app.request(Method::GET, "/api/v1/payments/ord-1", None, None).await;
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

    let stranger = app.token_for("u-2", &[]);
    let forbidden = app
        .request(Method::GET, "/api/v1/payments/ord-1", None, Some(&stranger))
        .await;
    assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

    let paying_for_someone_else = app
        .request(
            Method::POST,
            "/api/v1/payments",
            Some(json!({ "cart_id": "c-1", "amount": 100 })),
            Some(&stranger),
        )
        .await;
    assert_eq!(paying_for_someone_else.status(), StatusCode::FORBIDDEN);

    let admin = app.token_for("ops-1", &[ADMIN_ROLE]);
    let allowed = app
        .request(Method::GET, "/api/v1/payments/ord-1", None, Some(&admin))
        .await;
    assert_eq!(allowed.status(), StatusCode::OK);
}

#[tokio::test]
async fn payment_view_includes_booking_after_success() {
    let app = TestApp::new().await;
    let token = app.token_for("u-1", &[]);
    create_cart(&app, &token, "c-1").await;
    app.seed_order("ord-1", "u-1", Some("c-1"), 50_000).await;
    app.webhook(&success_payload("ord-1", 50_000)).await;

    let response = app
        .request(Method::GET, "/api/v1/payments/ord-1", None, Some(&token))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["status"], "SUCCESS");
    let booking_id = body["data"]["booking_id"].as_str().unwrap().to_string();
    assert!(booking_id.starts_with("BK-"));

    let booking = app
        .request(
            Method::GET,
            &format!("/api/v1/bookings/{}", booking_id),
            None,
            Some(&token),
        )
        .await;
    assert_eq!(booking.status(), StatusCode::OK);
    let booking = body_json(booking).await;
    assert_eq!(booking["data"]["cart_id"], "c-1");
    assert_eq!(booking["data"]["status"], "CONFIRMED");
    assert_eq!(booking["data"]["selected_time"], "09:30");
}

#[tokio::test]
async fn status_refresh_applies_gateway_answer() {
    let app = TestApp::new().await;
    let token = app.token_for("u-1", &[]);
    create_cart(&app, &token, "c-1").await;
    app.seed_order("ord-1", "u-1", Some("c-1"), 50_000).await;
    app.gateway.set_state("ord-1", GatewayState::Success);

    let response = app
        .request(Method::GET, "/api/v1/payments/ord-1/status", None, Some(&token))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["status"], "SUCCESS");
    assert_eq!(body["data"]["gateway_checked"], true);
    assert!(body["data"]["booking_id"].is_string());

    // Terminal orders are answered locally
    let again = body_json(
        app.request(Method::GET, "/api/v1/payments/ord-1/status", None, Some(&token))
            .await,
    )
    .await;
    assert_eq!(again["data"]["gateway_checked"], false);
    assert_eq!(app.gateway.status_calls(), 1);
}

#[tokio::test]
async fn review_queue_is_admin_only() {
    let app = TestApp::new().await;
    app.seed_order("ord-9", "u-1", Some("c-gone"), 50_000).await;
    app.webhook(&success_payload("ord-9", 50_000)).await;

    let customer = app.token_for("u-1", &[]);
    let denied = app
        .request(Method::GET, "/api/v1/payments/review", None, Some(&customer))
        .await;
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);

    let admin = app.token_for("ops-1", &[ADMIN_ROLE]);
    let response = app
        .request(Method::GET, "/api/v1/payments/review", None, Some(&admin))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let items = body["data"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["merchant_order_id"], "ord-9");
}

#[tokio::test]
async fn new_cart_retires_previous_active_cart() {
    let app = TestApp::new().await;
    let token = app.token_for("u-1", &[]);
    create_cart(&app, &token, "c-1").await;
    create_cart(&app, &token, "c-2").await;

    let first = body_json(
        app.request(Method::GET, "/api/v1/carts/c-1", None, Some(&token))
            .await,
    )
    .await;
    assert_eq!(first["data"]["status"], "INACTIVE");

    let response = app
        .request(
            Method::POST,
            "/api/v1/payments",
            Some(json!({ "cart_id": "c-1", "amount": 50000 })),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn health_reports_database() {
    let app = TestApp::new().await;
    let response = app.request(Method::GET, "/api/v1/health", None, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let body = body_json(response).await;
    assert_eq!(body["data"]["checks"]["database"], "healthy");
}
