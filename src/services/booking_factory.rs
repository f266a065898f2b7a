use crate::{
    db,
    entities::{
        booking::{self, BookingStatus, Entity as Booking},
        cart::{self, CartStatus, Entity as Cart},
        payment_order::{self, PaymentOrderStatus},
    },
    errors::ServiceError,
    notifications::NotificationDispatcher,
    services::{cart_retention::CartRetentionPolicy, payment_orders::PaymentOrderStore},
};
use chrono::Utc;
use dashmap::DashMap;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QuerySelect, Set, TransactionTrait,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct BookingOutcome {
    pub booking: booking::Model,
    /// False when an existing booking was returned
    pub created: bool,
}

/// Turns a SUCCESS payment order and its cart into exactly one booking.
///
/// The cart row is the serialization point: every caller takes the
/// per-cart mutex, then the row lock (where the backend has one), and only
/// then checks whether a booking already exists. The unique index on
/// `bookings.cart_id` catches anything that slips past both.
pub struct BookingFactory {
    db: Arc<DatabaseConnection>,
    orders: PaymentOrderStore,
    retention: CartRetentionPolicy,
    dispatcher: Arc<dyn NotificationDispatcher>,
    cart_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl BookingFactory {
    pub fn new(
        db: Arc<DatabaseConnection>,
        orders: PaymentOrderStore,
        retention: CartRetentionPolicy,
        dispatcher: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        Self {
            db,
            orders,
            retention,
            dispatcher,
            cart_locks: DashMap::new(),
        }
    }

    pub fn generate_booking_id() -> String {
        format!("BK-{:08X}", rand::random::<u32>())
    }

    /// Existing or new booking for a SUCCESS order.
    ///
    /// The locked section, commit and notification enqueue run on a spawned
    /// task, so a caller that stops waiting (request deadline, client gone)
    /// cannot leave a committed booking without its notification.
    #[instrument(skip(self, order), fields(merchant_order_id = %order.merchant_order_id))]
    pub async fn create_from_cart(
        self: &Arc<Self>,
        order: &payment_order::Model,
    ) -> Result<BookingOutcome, ServiceError> {
        if order.status != PaymentOrderStatus::Success {
            error!(status = ?order.status, "Booking requested for a payment that is not SUCCESS");
            return Err(ServiceError::InvalidState(format!(
                "payment order {} is {:?}, expected SUCCESS",
                order.merchant_order_id, order.status
            )));
        }

        if let Some(existing) = self.for_payment_order(&order.merchant_order_id).await? {
            return Ok(BookingOutcome {
                booking: existing,
                created: false,
            });
        }

        let cart_id = match order.cart_id.as_deref() {
            Some(id) => id.to_string(),
            None => {
                warn!("SUCCESS payment has no cart reference");
                self.orders
                    .flag_for_review(&order.merchant_order_id, "successful payment without cart")
                    .await?;
                return Err(ServiceError::CartMissing(format!(
                    "payment order {} has no cart",
                    order.merchant_order_id
                )));
            }
        };

        let factory = Arc::clone(self);
        let order = order.clone();
        tokio::spawn(async move { factory.create_and_notify(&order, &cart_id).await })
            .await
            .map_err(|e| ServiceError::InternalError(format!("booking task failed: {}", e)))?
    }

    async fn create_and_notify(
        &self,
        order: &payment_order::Model,
        cart_id: &str,
    ) -> Result<BookingOutcome, ServiceError> {
        let lock = self
            .cart_locks
            .entry(cart_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock().await;
        let result = self.create_locked(order, cart_id).await;
        drop(guard);
        drop(lock);
        self.cart_locks
            .remove_if(cart_id, |_, l| Arc::strong_count(l) == 1);

        let outcome = result?;
        if outcome.created {
            if let Err(e) = self.dispatcher.enqueue(&outcome.booking.id).await {
                warn!(booking_id = %outcome.booking.id, error = %e, "Booking notification could not be enqueued");
            }
        }
        Ok(outcome)
    }

    async fn create_locked(
        &self,
        order: &payment_order::Model,
        cart_id: &str,
    ) -> Result<BookingOutcome, ServiceError> {
        let txn = self.db.begin().await?;

        let mut cart_query = Cart::find_by_id(cart_id.to_string());
        if db::supports_row_locks(&txn) {
            cart_query = cart_query.lock_exclusive();
        } else {
            // SQLite: take the write lock before the first read so a
            // concurrent writer makes us wait instead of failing the upgrade.
            Cart::update_many()
                .col_expr(cart::Column::Status, Expr::col(cart::Column::Status).into())
                .filter(cart::Column::Id.eq(cart_id))
                .exec(&txn)
                .await?;
        }

        let Some(cart) = cart_query.one(&txn).await? else {
            txn.rollback().await?;
            error!(cart_id, "Payment references a cart that no longer exists");
            self.orders
                .flag_for_review(
                    &order.merchant_order_id,
                    &format!("cart {} missing at booking time", cart_id),
                )
                .await?;
            return Err(ServiceError::CartMissing(cart_id.to_string()));
        };

        let existing = Booking::find()
            .filter(booking::Column::CartId.eq(cart_id))
            .one(&txn)
            .await?;
        if let Some(existing) = existing {
            txn.commit().await?;
            self.note_duplicate_capture(order, &existing).await?;
            return Ok(BookingOutcome {
                booking: existing,
                created: false,
            });
        }

        let now = Utc::now();
        let inserted = booking::ActiveModel {
            id: Set(Self::generate_booking_id()),
            user_id: Set(cart.user_id.clone()),
            cart_id: Set(Some(cart.id.clone())),
            payment_order_id: Set(order.merchant_order_id.clone()),
            service_ref: Set(cart.service_ref.clone()),
            package_ref: Set(cart.package_ref.clone()),
            address_ref: Set(cart.address_ref.clone()),
            selected_date: Set(cart.selected_date),
            selected_time: Set(cart.selected_time.clone()),
            amount: Set(order.amount),
            currency: Set(order.currency.clone()),
            status: Set(BookingStatus::Confirmed),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await;

        let booking = match inserted {
            Ok(booking) => booking,
            Err(e) if db::is_unique_violation(&e) => {
                txn.rollback().await?;
                warn!(cart_id, "Concurrent booking creation detected; returning winner");
                let winner = self.for_cart(cart_id).await?.ok_or(ServiceError::DatabaseError(e))?;
                self.note_duplicate_capture(order, &winner).await?;
                return Ok(BookingOutcome {
                    booking: winner,
                    created: false,
                });
            }
            Err(e) => return Err(e.into()),
        };

        Cart::update_many()
            .col_expr(cart::Column::Status, Expr::value(CartStatus::Converted))
            .col_expr(cart::Column::UpdatedAt, Expr::value(now))
            .filter(cart::Column::Id.eq(cart_id))
            .exec(&txn)
            .await?;

        self.retention.enforce_with(&txn, &cart.user_id).await?;

        txn.commit().await?;

        info!(
            booking_id = %booking.id,
            cart_id,
            user_id = %booking.user_id,
            "Booking created from cart"
        );
        Ok(BookingOutcome {
            booking,
            created: true,
        })
    }

    /// A second successful payment landing on an already-booked cart
    async fn note_duplicate_capture(
        &self,
        order: &payment_order::Model,
        existing: &booking::Model,
    ) -> Result<(), ServiceError> {
        if existing.payment_order_id != order.merchant_order_id {
            self.orders
                .flag_for_review(
                    &order.merchant_order_id,
                    &format!(
                        "duplicate capture: cart already booked as {} by {}",
                        existing.id, existing.payment_order_id
                    ),
                )
                .await?;
        }
        Ok(())
    }

    pub async fn find(&self, booking_id: &str) -> Result<Option<booking::Model>, ServiceError> {
        Ok(Booking::find_by_id(booking_id.to_string())
            .one(&*self.db)
            .await?)
    }

    pub async fn get(&self, booking_id: &str) -> Result<booking::Model, ServiceError> {
        self.find(booking_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Booking {} not found", booking_id)))
    }

    pub async fn for_payment_order(
        &self,
        merchant_order_id: &str,
    ) -> Result<Option<booking::Model>, ServiceError> {
        Ok(Booking::find()
            .filter(booking::Column::PaymentOrderId.eq(merchant_order_id))
            .one(&*self.db)
            .await?)
    }

    pub async fn for_cart(&self, cart_id: &str) -> Result<Option<booking::Model>, ServiceError> {
        Ok(Booking::find()
            .filter(booking::Column::CartId.eq(cart_id))
            .one(&*self.db)
            .await?)
    }
}
