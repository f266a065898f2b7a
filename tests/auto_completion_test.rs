mod common;

use booking_reconciler::{
    entities::{booking, Booking, PaymentOrderStatus},
    gateway::GatewayState,
};
use chrono::Duration;
use common::TestApp;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};

#[tokio::test]
async fn stale_order_is_completed_by_poller() {
    let app = TestApp::new().await;
    app.seed_cart("u-1", "c-2").await;
    app.seed_order("ord-2", "u-1", Some("c-2"), 50_000).await;
    app.backdate_order("ord-2", Duration::minutes(6)).await;
    app.gateway.set_state("ord-2", GatewayState::Success);

    let report = app.services().poller.run_once().await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.resolved, 1);

    let order = app.order("ord-2").await;
    assert_eq!(order.status, PaymentOrderStatus::Success);
    assert_eq!(order.gateway_transaction_id.as_deref(), Some("T-ord-2"));
    assert!(order.poll_lease_until.is_none());

    let booking = Booking::find()
        .filter(booking::Column::CartId.eq("c-2"))
        .one(&*app.state.db)
        .await
        .unwrap();
    assert!(booking.is_some());
}

#[tokio::test]
async fn fresh_orders_are_left_to_the_webhook() {
    let app = TestApp::new().await;
    app.seed_cart("u-1", "c-1").await;
    app.seed_order("ord-1", "u-1", Some("c-1"), 50_000).await;
    app.gateway.set_state("ord-1", GatewayState::Success);

    let report = app.services().poller.run_once().await.unwrap();
    assert_eq!(report.examined, 0);
    assert_eq!(app.gateway.status_calls(), 0);
    assert_eq!(app.order("ord-1").await.status, PaymentOrderStatus::Initiated);
}

#[tokio::test]
async fn unresolved_orders_go_to_review_after_bounded_attempts() {
    let app = TestApp::with_config(|cfg| cfg.poller.max_attempts = 3).await;
    app.seed_cart("u-1", "c-1").await;
    app.seed_order("ord-1", "u-1", Some("c-1"), 50_000).await;
    app.backdate_order("ord-1", Duration::minutes(10)).await;
    app.gateway.set_error("ord-1", "connection reset");

    for _ in 0..3 {
        app.services().poller.run_once().await.unwrap();
    }

    let order = app.order("ord-1").await;
    assert_eq!(order.check_attempts, 3);
    assert!(order.needs_review);
    assert_eq!(order.status, PaymentOrderStatus::Initiated);
    assert!(order
        .last_check_error
        .as_deref()
        .unwrap_or_default()
        .contains("connection reset"));

    // Flagged orders leave the poll set
    let report = app.services().poller.run_once().await.unwrap();
    assert_eq!(report.examined, 0);
    assert_eq!(app.gateway.status_calls(), 3);
}

#[tokio::test]
async fn pending_answers_count_as_attempts() {
    let app = TestApp::new().await;
    app.seed_cart("u-1", "c-1").await;
    app.seed_order("ord-1", "u-1", Some("c-1"), 50_000).await;
    app.backdate_order("ord-1", Duration::minutes(10)).await;

    let report = app.services().poller.run_once().await.unwrap();
    assert_eq!(report.still_pending, 1);

    let order = app.order("ord-1").await;
    assert_eq!(order.status, PaymentOrderStatus::Pending);
    assert_eq!(order.check_attempts, 1);
    assert!(order.last_check_error.is_none());
}

#[tokio::test]
async fn gateway_timeout_leaves_order_open() {
    let app = TestApp::with_config(|cfg| cfg.gateway.timeout_secs = 1).await;
    app.seed_cart("u-1", "c-1").await;
    app.seed_order("ord-1", "u-1", Some("c-1"), 50_000).await;
    app.backdate_order("ord-1", Duration::minutes(10)).await;
    app.gateway.set_state("ord-1", GatewayState::Success);
    app.gateway.set_delay(std::time::Duration::from_secs(3));

    let report = app.services().poller.run_once().await.unwrap();
    assert_eq!(report.gateway_errors, 1);

    let order = app.order("ord-1").await;
    assert_eq!(order.status, PaymentOrderStatus::Initiated);
    assert!(order
        .last_check_error
        .as_deref()
        .unwrap_or_default()
        .contains("timed out"));
    assert!(Booking::find().all(&*app.state.db).await.unwrap().is_empty());
}
