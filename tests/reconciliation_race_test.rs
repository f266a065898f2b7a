mod common;

use std::sync::Arc;
use std::time::Duration;

use booking_reconciler::{
    entities::{booking, Booking, Cart, PaymentOrderStatus},
    gateway::GatewayState,
    services::CartRetentionPolicy,
};
use common::{success_payload, TestApp};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};

async fn pooled_app() -> TestApp {
    TestApp::with_config(|cfg| {
        cfg.db_max_connections = 4;
        cfg.cart_retention_keep = 10;
    })
    .await
}

#[tokio::test]
async fn different_paid_orders_on_one_cart_book_it_once() {
    let app = pooled_app().await;
    app.seed_cart("u-1", "c-1").await;
    let ids: Vec<String> = (1..=4).map(|i| format!("ord-{}", i)).collect();
    for id in &ids {
        app.seed_order(id, "u-1", Some("c-1"), 50_000).await;
        app.services()
            .orders
            .mark_success(id, Some(format!("T-{}", id)), None)
            .await
            .unwrap();
    }

    let factory = app.services().bookings.clone();
    let mut attempts = Vec::new();
    for id in &ids {
        let order = app.order(id).await;
        let factory = Arc::clone(&factory);
        attempts.push(tokio::spawn(async move { factory.create_from_cart(&order).await }));
    }
    let outcomes: Vec<_> = futures::future::join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.expect("task panicked").expect("booking creation failed"))
        .collect();

    assert_eq!(outcomes.iter().filter(|o| o.created).count(), 1);
    let stored = Booking::find().all(&*app.state.db).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(app.dispatcher.enqueued(), vec![stored[0].id.clone()]);

    let mut flagged = 0;
    for id in &ids {
        let order = app.order(id).await;
        if order.merchant_order_id == stored[0].payment_order_id {
            assert!(!order.needs_review);
            continue;
        }
        assert!(order.needs_review);
        assert!(order
            .review_reason
            .as_deref()
            .unwrap_or_default()
            .starts_with("duplicate capture"));
        flagged += 1;
    }
    assert_eq!(flagged, 3);
}

#[tokio::test]
async fn webhook_and_poller_racing_on_one_order_book_once() {
    let app = pooled_app().await;
    app.seed_cart("u-1", "c-1").await;
    app.seed_order("ord-1", "u-1", Some("c-1"), 50_000).await;
    app.backdate_order("ord-1", chrono::Duration::minutes(6)).await;
    app.gateway.set_state("ord-1", GatewayState::Success);

    let payload = success_payload("ord-1", 50_000);
    let poller = app.services().poller.clone();
    let (response, report) = tokio::join!(app.webhook(&payload), poller.run_once());

    assert_eq!(response.status().as_u16(), 200);
    report.unwrap();

    let order = app.order("ord-1").await;
    assert_eq!(order.status, PaymentOrderStatus::Success);
    assert!(!order.needs_review);

    let stored = Booking::find()
        .filter(booking::Column::CartId.eq("c-1"))
        .all(&*app.state.db)
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(app.dispatcher.enqueued().len(), 1);
}

#[tokio::test]
async fn overlapping_poller_pass_is_skipped() {
    let app = pooled_app().await;
    app.seed_cart("u-1", "c-1").await;
    app.seed_order("ord-1", "u-1", Some("c-1"), 50_000).await;
    app.backdate_order("ord-1", chrono::Duration::minutes(6)).await;
    app.gateway.set_delay(Duration::from_millis(500));

    let poller = app.services().poller.clone();
    let first = tokio::spawn({
        let poller = poller.clone();
        async move { poller.run_once().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = poller.run_once().await.unwrap();
    assert!(second.skipped);
    assert_eq!(second.examined, 0);

    let first = first.await.unwrap().unwrap();
    assert!(!first.skipped);
    assert_eq!(first.examined, 1);
    assert_eq!(app.gateway.status_calls(), 1);
}

#[tokio::test]
async fn second_retention_pass_is_a_no_op() {
    let app = pooled_app().await;
    for i in 1..=4 {
        let cart_id = format!("c-{}", i);
        let order_id = format!("ord-{}", i);
        app.seed_cart("u-1", &cart_id).await;
        app.seed_order(&order_id, "u-1", Some(&cart_id), 1_000 * i).await;
        app.webhook(&success_payload(&order_id, 1_000 * i)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let retention = CartRetentionPolicy::new(app.state.db.clone(), 2);
    let first = retention.enforce("u-1").await.unwrap();
    assert_eq!(first.deleted_cart_ids.len(), 2);
    assert_eq!(first.detached_bookings, 2);

    let second = retention.enforce("u-1").await.unwrap();
    assert!(second.deleted_cart_ids.is_empty());
    assert_eq!(second.detached_bookings, 0);
    assert_eq!(second.kept, 2);

    assert_eq!(Cart::find().all(&*app.state.db).await.unwrap().len(), 2);
    assert_eq!(Booking::find().all(&*app.state.db).await.unwrap().len(), 4);
}
