use crate::{
    entities::payment_order::{self, PaymentOrderStatus},
    errors::ServiceError,
    services::{
        carts::CartStore,
        payment_orders::PaymentOrderStore,
        reconciliation::{GatewayCheck, PaymentReconciler},
    },
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Query/form keys the gateway (or older integrations) have used for our order id
pub const CORRELATION_KEYS: [&str; 7] = [
    "merchantOrderId",
    "merchant_order_id",
    "merchantTransactionId",
    "transactionId",
    "orderId",
    "order_id",
    "id",
];

/// What the browser brought back from the gateway
#[derive(Debug, Clone, Default)]
pub struct RedirectRequest {
    /// Query string and form fields, in arrival order
    pub params: Vec<(String, String)>,
    /// Session user, if the browser still carried a valid token
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedPayment {
    pub cart_id: Option<String>,
    pub merchant_order_id: String,
    pub status: PaymentOrderStatus,
    pub booking_id: Option<String>,
    pub strategy: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Resolution {
    Resolved(ResolvedPayment),
    Unresolved,
}

/// One step of the fallback chain
#[async_trait]
pub trait ResolutionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn resolve(
        &self,
        request: &RedirectRequest,
    ) -> Result<Option<payment_order::Model>, ServiceError>;
}

/// Candidate ids from known keys first, then any value shaped like one of our ids
pub fn correlation_candidates(
    params: &[(String, String)],
    looks_like_order_id: impl Fn(&str) -> bool,
) -> Vec<String> {
    let mut candidates: Vec<String> = Vec::new();
    let mut push = |value: &str| {
        let value = value.trim();
        if !value.is_empty() && !candidates.iter().any(|c| c == value) {
            candidates.push(value.to_string());
        }
    };

    for key in CORRELATION_KEYS {
        for (k, v) in params {
            if k == key {
                push(v);
            }
        }
    }
    for (_, v) in params {
        if looks_like_order_id(v.trim()) {
            push(v);
        }
    }
    candidates
}

/// Step 1: an order id carried in the redirect itself
pub struct ExplicitCorrelation {
    orders: PaymentOrderStore,
}

impl ExplicitCorrelation {
    pub fn new(orders: PaymentOrderStore) -> Self {
        Self { orders }
    }
}

#[async_trait]
impl ResolutionStrategy for ExplicitCorrelation {
    fn name(&self) -> &'static str {
        "explicit_correlation"
    }

    async fn resolve(
        &self,
        request: &RedirectRequest,
    ) -> Result<Option<payment_order::Model>, ServiceError> {
        let candidates = correlation_candidates(&request.params, |v| {
            self.orders.looks_like_merchant_order_id(v)
        });

        for candidate in candidates {
            let found = match self.orders.find(&candidate).await? {
                Some(order) => Some(order),
                None => self.orders.find_by_gateway_order_id(&candidate).await?,
            };
            let Some(order) = found else { continue };

            if let Some(user_id) = request.user_id.as_deref() {
                if order.user_id != user_id {
                    warn!(
                        merchant_order_id = %order.merchant_order_id,
                        "Redirect carried an order id owned by another user; ignoring it"
                    );
                    continue;
                }
            }
            return Ok(Some(order));
        }
        Ok(None)
    }
}

/// Step 2: the session user's newest cart and its newest payment
pub struct AuthenticatedUserLatestCart {
    carts: CartStore,
    orders: PaymentOrderStore,
}

impl AuthenticatedUserLatestCart {
    pub fn new(carts: CartStore, orders: PaymentOrderStore) -> Self {
        Self { carts, orders }
    }
}

#[async_trait]
impl ResolutionStrategy for AuthenticatedUserLatestCart {
    fn name(&self) -> &'static str {
        "authenticated_user_latest_cart"
    }

    async fn resolve(
        &self,
        request: &RedirectRequest,
    ) -> Result<Option<payment_order::Model>, ServiceError> {
        let Some(user_id) = request.user_id.as_deref() else {
            return Ok(None);
        };
        let Some(cart) = self.carts.latest_for_user(user_id).await? else {
            return Ok(None);
        };
        self.orders.latest_for_cart(&cart.id).await
    }
}

/// Step 3: newest successful payment system-wide, within a recency window
pub struct GlobalLatestSuccess {
    orders: PaymentOrderStore,
    window: Duration,
}

impl GlobalLatestSuccess {
    pub fn new(orders: PaymentOrderStore, window: Duration) -> Self {
        Self { orders, window }
    }
}

#[async_trait]
impl ResolutionStrategy for GlobalLatestSuccess {
    fn name(&self) -> &'static str {
        "global_latest_success"
    }

    async fn resolve(
        &self,
        request: &RedirectRequest,
    ) -> Result<Option<payment_order::Model>, ServiceError> {
        let since = Utc::now() - self.window;
        let Some(order) = self.orders.latest_success_with_cart(since).await? else {
            return Ok(None);
        };

        match request.user_id.as_deref() {
            Some(user_id) if order.user_id != user_id => Ok(None),
            _ => Ok(Some(order)),
        }
    }
}

/// Works out which payment a returning browser belongs to
pub struct RedirectResolver {
    strategies: Vec<Box<dyn ResolutionStrategy>>,
    reconciler: Arc<PaymentReconciler>,
    /// Bound on the gateway check for an open order; kept below the redirect deadline
    gateway_timeout: std::time::Duration,
}

impl RedirectResolver {
    pub fn new(
        strategies: Vec<Box<dyn ResolutionStrategy>>,
        reconciler: Arc<PaymentReconciler>,
        gateway_timeout: std::time::Duration,
    ) -> Self {
        Self {
            strategies,
            reconciler,
            gateway_timeout,
        }
    }

    /// Explicit id, then session user's latest cart, then recent global success
    pub fn with_default_chain(
        orders: PaymentOrderStore,
        carts: CartStore,
        reconciler: Arc<PaymentReconciler>,
        global_window: Duration,
        gateway_timeout: std::time::Duration,
    ) -> Self {
        Self::new(
            vec![
                Box::new(ExplicitCorrelation::new(orders.clone())),
                Box::new(AuthenticatedUserLatestCart::new(carts, orders.clone())),
                Box::new(GlobalLatestSuccess::new(orders, global_window)),
            ],
            reconciler,
            gateway_timeout,
        )
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    #[instrument(skip(self, request), fields(authenticated = request.user_id.is_some()))]
    pub async fn resolve(&self, request: &RedirectRequest) -> Result<Resolution, ServiceError> {
        for strategy in &self.strategies {
            if let Some(order) = strategy.resolve(request).await? {
                debug!(
                    strategy = strategy.name(),
                    merchant_order_id = %order.merchant_order_id,
                    "Redirect correlated to payment order"
                );
                let resolved = self.settle(order, strategy.name()).await?;
                return Ok(Resolution::Resolved(resolved));
            }
        }

        info!("Redirect could not be correlated to any payment");
        Ok(Resolution::Unresolved)
    }

    /// Brings the resolved order up to date and makes sure a SUCCESS has its booking
    async fn settle(
        &self,
        order: payment_order::Model,
        strategy: &'static str,
    ) -> Result<ResolvedPayment, ServiceError> {
        let merchant_order_id = order.merchant_order_id.clone();
        let orders = self.reconciler.orders();

        let order = if order.is_terminal() {
            order
        } else {
            match self
                .reconciler
                .refresh_from_gateway_within(&order, self.gateway_timeout)
                .await
            {
                Ok(GatewayCheck::Unavailable(_)) | Ok(GatewayCheck::AlreadyTerminal(_)) => order,
                Ok(_) => orders.get(&merchant_order_id).await?,
                Err(ServiceError::CartMissing(cart)) => {
                    warn!(merchant_order_id = %merchant_order_id, cart = %cart, "Paid order has no cart to book");
                    orders.get(&merchant_order_id).await?
                }
                Err(e) => return Err(e),
            }
        };

        let booking_id = match self.reconciler.ensure_booking(&order).await {
            Ok(booking) => booking.map(|b| b.id),
            Err(ServiceError::CartMissing(cart)) => {
                warn!(merchant_order_id = %merchant_order_id, cart = %cart, "Paid order has no cart to book");
                None
            }
            Err(e) => return Err(e),
        };

        info!(
            merchant_order_id = %merchant_order_id,
            strategy,
            status = ?order.status,
            booking_id = ?booking_id,
            "Redirect resolved"
        );

        Ok(ResolvedPayment {
            cart_id: order.cart_id,
            merchant_order_id,
            status: order.status,
            booking_id,
            strategy,
        })
    }
}
