use super::{payment_redirect::payment_redirect, payment_webhooks::payment_webhook};
use crate::{
    auth::AuthUser,
    entities::{payment_order, CartStatus, PaymentOrderStatus},
    errors::ServiceError,
    gateway::{self, CheckoutRequest},
    handlers::AppState,
    services::{GatewayCheck, NewPaymentOrder},
    ApiResponse,
};
use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct InitiatePaymentRequest {
    #[validate(length(min = 1, max = 100))]
    pub cart_id: String,
    /// Minor units (paise); priced by the caller
    #[validate(range(min = 1))]
    pub amount: i64,
    #[validate(length(equal = 3))]
    pub currency: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InitiatePaymentResponse {
    pub merchant_order_id: String,
    pub checkout_url: String,
    pub amount: i64,
    pub currency: String,
    pub expires_at: DateTime<Utc>,
}

/// Customer-facing view of a payment order
#[derive(Debug, Serialize)]
pub struct PaymentOrderView {
    pub merchant_order_id: String,
    pub cart_id: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub status: PaymentOrderStatus,
    pub gateway_transaction_id: Option<String>,
    pub failure_reason: Option<String>,
    pub needs_review: bool,
    pub booking_id: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl PaymentOrderView {
    fn new(order: payment_order::Model, booking_id: Option<String>) -> Self {
        Self {
            merchant_order_id: order.merchant_order_id,
            cart_id: order.cart_id,
            amount: order.amount,
            currency: order.currency,
            status: order.status,
            gateway_transaction_id: order.gateway_transaction_id,
            failure_reason: order.failure_reason,
            needs_review: order.needs_review,
            booking_id,
            expires_at: order.expires_at,
            completed_at: order.completed_at,
            created_at: order.created_at,
        }
    }
}

/// Result of an on-demand status refresh
#[derive(Debug, Serialize)]
pub struct PaymentStatusView {
    pub merchant_order_id: String,
    pub status: PaymentOrderStatus,
    pub booking_id: Option<String>,
    /// False when the order was already terminal and the gateway was not asked
    pub gateway_checked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_error: Option<String>,
}

/// Review queue entry for operators
#[derive(Debug, Serialize)]
pub struct ReviewItem {
    pub merchant_order_id: String,
    pub user_id: String,
    pub cart_id: Option<String>,
    pub amount: i64,
    pub status: PaymentOrderStatus,
    pub review_reason: Option<String>,
    pub check_attempts: i32,
    pub last_check_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<payment_order::Model> for ReviewItem {
    fn from(order: payment_order::Model) -> Self {
        Self {
            merchant_order_id: order.merchant_order_id,
            user_id: order.user_id,
            cart_id: order.cart_id,
            amount: order.amount,
            status: order.status,
            review_reason: order.review_reason,
            check_attempts: order.check_attempts,
            last_check_error: order.last_check_error,
            updated_at: order.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ReviewQuery {
    pub limit: Option<u64>,
}

/// Creates a payment order for the caller's active cart and opens a hosted checkout
async fn initiate_payment(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<InitiatePaymentRequest>,
) -> Result<(StatusCode, Json<ApiResponse<InitiatePaymentResponse>>), ServiceError> {
    request.validate()?;

    let cart = state.services.carts.get(&request.cart_id).await?;
    user.ensure_can_access(&cart.user_id)?;
    if cart.status != CartStatus::Active {
        return Err(ServiceError::Conflict(format!(
            "Cart {} is {:?}, not ACTIVE",
            cart.id, cart.status
        )));
    }

    let orders = &state.services.orders;
    let order = orders
        .create(NewPaymentOrder {
            user_id: cart.user_id.clone(),
            cart_id: Some(cart.id.clone()),
            amount: request.amount,
            currency: request
                .currency
                .map(|c| c.to_uppercase())
                .unwrap_or_else(|| state.config.default_currency.clone()),
        })
        .await?;

    let expire_after = (order.expires_at - order.created_at)
        .to_std()
        .unwrap_or_else(|_| std::time::Duration::from_secs(60));
    let checkout = CheckoutRequest {
        merchant_order_id: order.merchant_order_id.clone(),
        amount: order.amount,
        expire_after,
        redirect_url: state.config.redirect_callback_url(),
    };

    let session = match gateway::with_timeout(
        state.config.gateway.timeout(),
        state.services.gateway.create_checkout(&checkout),
    )
    .await
    {
        Ok(session) => session,
        Err(e) => {
            error!(merchant_order_id = %order.merchant_order_id, error = %e, "Checkout creation failed");
            if let Err(mark_err) = orders
                .mark_failed(
                    &order.merchant_order_id,
                    &format!("checkout creation failed: {}", e),
                    None,
                )
                .await
            {
                warn!(error = %mark_err, "Could not close order after checkout failure");
            }
            return Err(e.into());
        }
    };

    orders
        .attach_checkout(
            &order.merchant_order_id,
            session.gateway_order_id.clone(),
            &session.redirect_url,
        )
        .await?;

    info!(
        merchant_order_id = %order.merchant_order_id,
        cart_id = %cart.id,
        gateway_order_id = ?session.gateway_order_id,
        "Checkout session opened"
    );

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(InitiatePaymentResponse {
            merchant_order_id: order.merchant_order_id,
            checkout_url: session.redirect_url,
            amount: order.amount,
            currency: order.currency,
            expires_at: order.expires_at,
        })),
    ))
}

async fn get_payment(
    State(state): State<AppState>,
    Path(merchant_order_id): Path<String>,
    user: AuthUser,
) -> Result<Json<ApiResponse<PaymentOrderView>>, ServiceError> {
    let order = state.services.orders.get(&merchant_order_id).await?;
    user.ensure_can_access(&order.user_id)?;

    let booking_id = state
        .services
        .bookings
        .for_payment_order(&merchant_order_id)
        .await?
        .map(|b| b.id);

    Ok(Json(ApiResponse::success(PaymentOrderView::new(
        order, booking_id,
    ))))
}

/// Asks the gateway about an open order and applies the answer
async fn refresh_payment_status(
    State(state): State<AppState>,
    Path(merchant_order_id): Path<String>,
    user: AuthUser,
) -> Result<Json<ApiResponse<PaymentStatusView>>, ServiceError> {
    let orders = &state.services.orders;
    let order = orders.get(&merchant_order_id).await?;
    user.ensure_can_access(&order.user_id)?;

    let (gateway_checked, gateway_error) =
        match state.services.reconciler.refresh_from_gateway(&order).await {
            Ok(GatewayCheck::AlreadyTerminal(_)) => (false, None),
            Ok(GatewayCheck::Resolved(_)) | Ok(GatewayCheck::StillPending(_)) => (true, None),
            Ok(GatewayCheck::Unavailable(e)) => (true, Some(e.to_string())),
            Err(ServiceError::CartMissing(cart)) => {
                warn!(merchant_order_id = %merchant_order_id, cart = %cart, "Paid order has no cart to book");
                (true, None)
            }
            Err(e) => return Err(e),
        };

    let order = orders.get(&merchant_order_id).await?;
    let booking_id = match state.services.reconciler.ensure_booking(&order).await {
        Ok(booking) => booking.map(|b| b.id),
        Err(ServiceError::CartMissing(_)) => None,
        Err(e) => return Err(e),
    };

    Ok(Json(ApiResponse::success(PaymentStatusView {
        merchant_order_id: order.merchant_order_id,
        status: order.status,
        booking_id,
        gateway_checked,
        gateway_error,
    })))
}

/// Orders flagged for manual review, newest first
async fn list_review_queue(
    State(state): State<AppState>,
    Query(query): Query<ReviewQuery>,
    user: AuthUser,
) -> Result<Json<ApiResponse<Vec<ReviewItem>>>, ServiceError> {
    user.ensure_admin()?;

    let limit = query.limit.unwrap_or(100).clamp(1, 500);
    let items = state
        .services
        .orders
        .list_needing_review(limit)
        .await?
        .into_iter()
        .map(ReviewItem::from)
        .collect();
    Ok(Json(ApiResponse::success(items)))
}

pub fn payment_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(initiate_payment))
        .route("/webhook", post(payment_webhook))
        .route("/redirect", get(payment_redirect).post(payment_redirect))
        .route("/review", get(list_review_queue))
        .route("/:merchant_order_id", get(get_payment))
        .route("/:merchant_order_id/status", get(refresh_payment_status))
}
