pub mod bookings;
pub mod carts;
pub mod payment_redirect;
pub mod payment_webhooks;
pub mod payments;

use crate::{
    config::AppConfig,
    db::DbPool,
    gateway::GatewayClient,
    notifications::NotificationDispatcher,
    services::{
        BookingFactory, CartRetentionPolicy, CartStore, PaymentOrderStore, PaymentReconciler,
        RedirectResolver,
    },
    workers::AutoCompletionPoller,
};
use std::sync::Arc;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer shared by HTTP handlers, workers and the CLI.
///
/// Gateway and dispatcher are injected so tests can swap in fakes.
#[derive(Clone)]
pub struct AppServices {
    pub orders: PaymentOrderStore,
    pub carts: CartStore,
    pub retention: Arc<CartRetentionPolicy>,
    pub bookings: Arc<BookingFactory>,
    pub reconciler: Arc<PaymentReconciler>,
    pub resolver: Arc<RedirectResolver>,
    pub poller: Arc<AutoCompletionPoller>,
    pub gateway: Arc<dyn GatewayClient>,
    pub dispatcher: Arc<dyn NotificationDispatcher>,
}

impl AppServices {
    pub fn new(
        db_pool: Arc<DbPool>,
        config: &AppConfig,
        gateway: Arc<dyn GatewayClient>,
        dispatcher: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        let orders = PaymentOrderStore::from_config(db_pool.clone(), config);
        let carts = CartStore::new(db_pool.clone());
        let retention = CartRetentionPolicy::new(db_pool.clone(), config.cart_retention_keep);

        let bookings = Arc::new(BookingFactory::new(
            db_pool,
            orders.clone(),
            retention.clone(),
            dispatcher.clone(),
        ));

        let reconciler = Arc::new(PaymentReconciler::new(
            orders.clone(),
            bookings.clone(),
            gateway.clone(),
            config.gateway.timeout(),
        ));

        let window_secs = config
            .redirect_global_fallback_window_secs
            .min(365 * 24 * 3600) as i64;
        let resolver = Arc::new(RedirectResolver::with_default_chain(
            orders.clone(),
            carts.clone(),
            reconciler.clone(),
            chrono::Duration::seconds(window_secs),
            config.redirect_gateway_timeout(),
        ));

        let poller = Arc::new(AutoCompletionPoller::new(
            orders.clone(),
            reconciler.clone(),
            config.poller.clone(),
        ));

        Self {
            orders,
            carts,
            retention: Arc::new(retention),
            bookings,
            reconciler,
            resolver,
            poller,
            gateway,
            dispatcher,
        }
    }
}
