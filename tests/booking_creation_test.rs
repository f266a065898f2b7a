mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use booking_reconciler::{
    entities::{booking, Booking, Cart, CartStatus, PaymentOrderStatus},
    errors::ServiceError,
};
use common::{success_payload, TestApp};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};

#[tokio::test]
async fn concurrent_creation_yields_a_single_booking() {
    let app = TestApp::with_config(|cfg| cfg.db_max_connections = 4).await;
    app.seed_cart("u-1", "c-1").await;
    app.seed_order("ord-1", "u-1", Some("c-1"), 50_000).await;
    app.services()
        .orders
        .mark_success("ord-1", Some("T1".into()), None)
        .await
        .unwrap();
    let order = app.order("ord-1").await;

    let factory = app.services().bookings.clone();
    let attempts = (0..6).map(|_| {
        let factory = Arc::clone(&factory);
        let order = order.clone();
        tokio::spawn(async move { factory.create_from_cart(&order).await })
    });
    let outcomes: Vec<_> = futures::future::join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.expect("task panicked").expect("booking creation failed"))
        .collect();

    let created = outcomes.iter().filter(|o| o.created).count();
    assert_eq!(created, 1);
    let first_id = &outcomes[0].booking.id;
    assert!(outcomes.iter().all(|o| &o.booking.id == first_id));

    let stored = Booking::find().all(&*app.state.db).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(app.dispatcher.enqueued().len(), 1);

    let cart = Cart::find_by_id("c-1".to_string())
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cart.status, CartStatus::Converted);
}

#[tokio::test]
async fn abandoned_caller_still_gets_booking_notified() {
    let app = TestApp::new().await;
    app.seed_cart("u-1", "c-1").await;
    app.seed_order("ord-1", "u-1", Some("c-1"), 50_000).await;
    app.services()
        .orders
        .mark_success("ord-1", Some("T1".into()), None)
        .await
        .unwrap();
    let order = app.order("ord-1").await;
    app.dispatcher.set_delay(std::time::Duration::from_millis(500));

    let factory = app.services().bookings.clone();
    let gave_up = tokio::time::timeout(
        std::time::Duration::from_millis(100),
        factory.create_from_cart(&order),
    )
    .await;
    assert!(gave_up.is_err());

    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    let stored = Booking::find().all(&*app.state.db).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(app.dispatcher.enqueued(), vec![stored[0].id.clone()]);

    // a retry is served from the store
    let again = factory.create_from_cart(&order).await.unwrap();
    assert!(!again.created);
    assert_eq!(again.booking.id, stored[0].id);
}

#[tokio::test]
async fn booking_requires_a_successful_payment() {
    let app = TestApp::new().await;
    app.seed_cart("u-1", "c-1").await;
    let order = app.seed_order("ord-1", "u-1", Some("c-1"), 50_000).await;

    let err = app
        .services()
        .bookings
        .create_from_cart(&order)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidState(_));
    assert!(Booking::find().all(&*app.state.db).await.unwrap().is_empty());
}

#[tokio::test]
async fn second_payment_for_booked_cart_is_flagged() {
    let app = TestApp::new().await;
    app.seed_cart("u-1", "c-1").await;
    app.seed_order("ord-1", "u-1", Some("c-1"), 50_000).await;
    app.seed_order("ord-2", "u-1", Some("c-1"), 50_000).await;

    app.webhook(&success_payload("ord-1", 50_000)).await;
    app.webhook(&success_payload("ord-2", 50_000)).await;

    let bookings = Booking::find().all(&*app.state.db).await.unwrap();
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0].payment_order_id, "ord-1");

    let duplicate = app.order("ord-2").await;
    assert_eq!(duplicate.status, PaymentOrderStatus::Success);
    assert!(duplicate.needs_review);
    assert!(duplicate
        .review_reason
        .as_deref()
        .unwrap_or_default()
        .starts_with("duplicate capture"));
}

#[tokio::test]
async fn retention_keeps_newest_converted_carts_and_all_bookings() {
    let app = TestApp::with_config(|cfg| cfg.cart_retention_keep = 3).await;

    for i in 1..=4 {
        let cart_id = format!("c-{}", i);
        let order_id = format!("ord-{}", i);
        app.seed_cart("u-1", &cart_id).await;
        app.seed_order(&order_id, "u-1", Some(&cart_id), 10_000 * i).await;
        app.webhook(&success_payload(&order_id, 10_000 * i)).await;
        // distinct created_at ordering on coarse clocks
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let carts = Cart::find().all(&*app.state.db).await.unwrap();
    let mut cart_ids: Vec<_> = carts.iter().map(|c| c.id.clone()).collect();
    cart_ids.sort();
    assert_eq!(cart_ids, vec!["c-2", "c-3", "c-4"]);

    let bookings = Booking::find().all(&*app.state.db).await.unwrap();
    assert_eq!(bookings.len(), 4);

    let orphaned = Booking::find()
        .filter(booking::Column::PaymentOrderId.eq("ord-1"))
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert!(orphaned.cart_id.is_none());
    assert_eq!(orphaned.service_ref, "griha-pravesh-puja");
    assert_eq!(orphaned.amount, 10_000);
}

#[tokio::test]
async fn retention_preview_changes_nothing() {
    let app = TestApp::new().await;
    let retention = app.services().retention.clone();

    for i in 1..=2 {
        let cart_id = format!("c-{}", i);
        app.seed_cart("u-1", &cart_id).await;
        app.seed_order(&format!("ord-{}", i), "u-1", Some(&cart_id), 500).await;
        app.webhook(&success_payload(&format!("ord-{}", i), 500)).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let report = retention.preview("u-1").await.unwrap();
    assert!(report.dry_run);
    assert!(report.deleted_cart_ids.is_empty());
    assert_eq!(report.kept, 2);
    assert_eq!(Cart::find().all(&*app.state.db).await.unwrap().len(), 2);
}
