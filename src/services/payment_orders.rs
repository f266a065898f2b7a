use crate::{
    config::AppConfig,
    entities::payment_order::{self, Column, Entity as PaymentOrder, PaymentOrderStatus},
    errors::ServiceError,
};
use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    sea_query::{Expr, SimpleExpr},
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Result of a conditional state transition.
///
/// `applied` is false when the order was already past the states the
/// transition is allowed from; `order` is then the current, untouched row.
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub order: payment_order::Model,
    pub applied: bool,
}

/// Input for a new payment attempt
#[derive(Debug, Clone)]
pub struct NewPaymentOrder {
    pub user_id: String,
    pub cart_id: Option<String>,
    pub amount: i64,
    pub currency: String,
}

/// Persistent payment attempt state machine.
///
/// Every status change is a single `UPDATE ... WHERE status IN (allowed)`;
/// nothing reads the status and writes it back.
#[derive(Clone)]
pub struct PaymentOrderStore {
    db: Arc<DatabaseConnection>,
    prefix: String,
    expiry: Duration,
}

impl PaymentOrderStore {
    pub fn new(db: Arc<DatabaseConnection>, prefix: impl Into<String>, expiry_minutes: i64) -> Self {
        Self {
            db,
            prefix: prefix.into(),
            expiry: Duration::minutes(expiry_minutes),
        }
    }

    pub fn from_config(db: Arc<DatabaseConnection>, config: &AppConfig) -> Self {
        Self::new(
            db,
            config.merchant_order_prefix.clone(),
            config.payment_expiry_minutes,
        )
    }

    /// `{prefix}_` followed by 12 uppercase hex characters
    pub fn generate_merchant_order_id(&self) -> String {
        format!(
            "{}_{:012X}",
            self.prefix,
            rand::random::<u64>() & 0xFFFF_FFFF_FFFF
        )
    }

    /// True if `value` has the shape of an id this store generates
    pub fn looks_like_merchant_order_id(&self, value: &str) -> bool {
        value
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('_'))
            .map_or(false, |suffix| {
                !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_alphanumeric())
            })
    }

    #[instrument(skip(self, input), fields(user_id = %input.user_id))]
    pub async fn create(&self, input: NewPaymentOrder) -> Result<payment_order::Model, ServiceError> {
        let merchant_order_id = self.generate_merchant_order_id();
        self.create_with_id(merchant_order_id, input).await
    }

    /// Creates an INITIATED order under a caller-chosen merchant order id
    pub async fn create_with_id(
        &self,
        merchant_order_id: String,
        input: NewPaymentOrder,
    ) -> Result<payment_order::Model, ServiceError> {
        if input.amount <= 0 {
            return Err(ServiceError::ValidationError(
                "amount must be a positive number of minor units".to_string(),
            ));
        }

        let now = Utc::now();
        let model = payment_order::ActiveModel {
            merchant_order_id: Set(merchant_order_id.clone()),
            user_id: Set(input.user_id),
            cart_id: Set(input.cart_id),
            amount: Set(input.amount),
            currency: Set(input.currency),
            status: Set(PaymentOrderStatus::Initiated),
            gateway_order_id: Set(None),
            gateway_transaction_id: Set(None),
            gateway_response: Set(None),
            failure_reason: Set(None),
            redirect_url: Set(None),
            check_attempts: Set(0),
            last_check_error: Set(None),
            last_checked_at: Set(None),
            needs_review: Set(false),
            review_reason: Set(None),
            poll_lease_until: Set(None),
            expires_at: Set(now + self.expiry),
            completed_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let order = model.insert(&*self.db).await?;
        info!(merchant_order_id = %merchant_order_id, amount = order.amount, "Payment order created");
        Ok(order)
    }

    pub async fn find(
        &self,
        merchant_order_id: &str,
    ) -> Result<Option<payment_order::Model>, ServiceError> {
        Ok(PaymentOrder::find_by_id(merchant_order_id.to_string())
            .one(&*self.db)
            .await?)
    }

    pub async fn get(&self, merchant_order_id: &str) -> Result<payment_order::Model, ServiceError> {
        self.find(merchant_order_id).await?.ok_or_else(|| {
            ServiceError::NotFound(format!("Payment order {} not found", merchant_order_id))
        })
    }

    /// Runs one conditional update and reports whether it matched
    async fn transition(
        &self,
        merchant_order_id: &str,
        allowed_from: &[PaymentOrderStatus],
        changes: Vec<(Column, SimpleExpr)>,
    ) -> Result<TransitionOutcome, ServiceError> {
        let mut update =
            PaymentOrder::update_many().col_expr(Column::UpdatedAt, Expr::value(Utc::now()));
        for (column, expr) in changes {
            update = update.col_expr(column, expr);
        }

        let result = update
            .filter(Column::MerchantOrderId.eq(merchant_order_id))
            .filter(Column::Status.is_in(allowed_from.iter().copied()))
            .exec(&*self.db)
            .await?;

        let order = self.get(merchant_order_id).await?;
        let applied = result.rows_affected > 0;
        if !applied {
            debug!(
                merchant_order_id = %merchant_order_id,
                status = ?order.status,
                "Transition not applied; order already past allowed states"
            );
        }
        Ok(TransitionOutcome { order, applied })
    }

    fn terminal_changes(status: PaymentOrderStatus, raw: Option<Value>) -> Vec<(Column, SimpleExpr)> {
        let now = Utc::now();
        let mut changes = vec![
            (Column::Status, Expr::value(status)),
            (Column::CompletedAt, Expr::value(Some(now))),
            (Column::PollLeaseUntil, Expr::value(Option::<DateTime<Utc>>::None)),
        ];
        if let Some(raw) = raw {
            changes.push((Column::GatewayResponse, Expr::value(raw)));
        }
        changes
    }

    /// No-op on terminal orders; otherwise SUCCESS with transaction id and raw response
    #[instrument(skip(self, raw_response))]
    pub async fn mark_success(
        &self,
        merchant_order_id: &str,
        gateway_transaction_id: Option<String>,
        raw_response: Option<Value>,
    ) -> Result<TransitionOutcome, ServiceError> {
        let mut changes = Self::terminal_changes(PaymentOrderStatus::Success, raw_response);
        if let Some(txn_id) = gateway_transaction_id {
            changes.push((Column::GatewayTransactionId, Expr::value(txn_id)));
        }

        let outcome = self
            .transition(merchant_order_id, &PaymentOrderStatus::OPEN, changes)
            .await?;
        if outcome.applied {
            info!(merchant_order_id = %merchant_order_id, "Payment order marked SUCCESS");
        }
        Ok(outcome)
    }

    #[instrument(skip(self, raw_response))]
    pub async fn mark_failed(
        &self,
        merchant_order_id: &str,
        reason: &str,
        raw_response: Option<Value>,
    ) -> Result<TransitionOutcome, ServiceError> {
        let mut changes = Self::terminal_changes(PaymentOrderStatus::Failed, raw_response);
        changes.push((Column::FailureReason, Expr::value(reason.to_string())));

        let outcome = self
            .transition(merchant_order_id, &PaymentOrderStatus::OPEN, changes)
            .await?;
        if outcome.applied {
            info!(merchant_order_id = %merchant_order_id, reason, "Payment order marked FAILED");
        }
        Ok(outcome)
    }

    #[instrument(skip(self, raw_response))]
    pub async fn mark_cancelled(
        &self,
        merchant_order_id: &str,
        raw_response: Option<Value>,
    ) -> Result<TransitionOutcome, ServiceError> {
        let changes = Self::terminal_changes(PaymentOrderStatus::Cancelled, raw_response);
        let outcome = self
            .transition(merchant_order_id, &PaymentOrderStatus::OPEN, changes)
            .await?;
        if outcome.applied {
            info!(merchant_order_id = %merchant_order_id, "Payment order marked CANCELLED");
        }
        Ok(outcome)
    }

    /// INITIATED -> PENDING; anything else is left alone
    pub async fn mark_pending(
        &self,
        merchant_order_id: &str,
        raw_response: Option<Value>,
    ) -> Result<TransitionOutcome, ServiceError> {
        let mut changes = vec![(Column::Status, Expr::value(PaymentOrderStatus::Pending))];
        if let Some(raw) = raw_response {
            changes.push((Column::GatewayResponse, Expr::value(raw)));
        }
        self.transition(merchant_order_id, &[PaymentOrderStatus::Initiated], changes)
            .await
    }

    /// Stores the gateway's checkout handle on a still-open order
    pub async fn attach_checkout(
        &self,
        merchant_order_id: &str,
        gateway_order_id: Option<String>,
        redirect_url: &str,
    ) -> Result<TransitionOutcome, ServiceError> {
        let changes = vec![
            (Column::GatewayOrderId, Expr::value(gateway_order_id)),
            (Column::RedirectUrl, Expr::value(redirect_url.to_string())),
        ];
        self.transition(merchant_order_id, &PaymentOrderStatus::OPEN, changes)
            .await
    }

    /// Counts one unresolved gateway check and releases the poll lease;
    /// flags the order once `max_attempts` is reached
    #[instrument(skip(self))]
    pub async fn record_check_attempt(
        &self,
        merchant_order_id: &str,
        error: Option<String>,
        max_attempts: i32,
    ) -> Result<payment_order::Model, ServiceError> {
        PaymentOrder::update_many()
            .col_expr(
                Column::CheckAttempts,
                Expr::col(Column::CheckAttempts).add(1),
            )
            .col_expr(Column::LastCheckError, Expr::value(error))
            .col_expr(Column::LastCheckedAt, Expr::value(Some(Utc::now())))
            .col_expr(Column::PollLeaseUntil, Expr::value(Option::<DateTime<Utc>>::None))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(Column::MerchantOrderId.eq(merchant_order_id))
            .filter(Column::Status.is_in(PaymentOrderStatus::OPEN))
            .exec(&*self.db)
            .await?;

        let order = self.get(merchant_order_id).await?;
        if !order.is_terminal() && !order.needs_review && order.check_attempts >= max_attempts {
            warn!(
                merchant_order_id = %merchant_order_id,
                attempts = order.check_attempts,
                "Gateway status still unresolved; handing order to manual review"
            );
            self.flag_for_review(
                merchant_order_id,
                &format!(
                    "gateway status unresolved after {} checks",
                    order.check_attempts
                ),
            )
            .await?;
            return self.get(merchant_order_id).await;
        }
        Ok(order)
    }

    /// Sets the manual-review flag; the first reason recorded is kept. Status is never touched.
    pub async fn flag_for_review(
        &self,
        merchant_order_id: &str,
        reason: &str,
    ) -> Result<bool, ServiceError> {
        let result = PaymentOrder::update_many()
            .col_expr(Column::NeedsReview, Expr::value(true))
            .col_expr(Column::ReviewReason, Expr::value(reason.to_string()))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(Column::MerchantOrderId.eq(merchant_order_id))
            .filter(Column::NeedsReview.eq(false))
            .exec(&*self.db)
            .await?;

        let flagged = result.rows_affected > 0;
        if flagged {
            warn!(merchant_order_id = %merchant_order_id, reason, "Payment order flagged for review");
        }
        Ok(flagged)
    }

    /// Open, unflagged orders older than `grace` whose poll lease is free, newest first
    pub async fn stale_non_terminal(
        &self,
        grace: Duration,
        limit: u64,
    ) -> Result<Vec<payment_order::Model>, ServiceError> {
        let now = Utc::now();
        Ok(PaymentOrder::find()
            .filter(Column::Status.is_in(PaymentOrderStatus::OPEN))
            .filter(Column::CreatedAt.lt(now - grace))
            .filter(Column::NeedsReview.eq(false))
            .filter(
                Condition::any()
                    .add(Column::PollLeaseUntil.is_null())
                    .add(Column::PollLeaseUntil.lt(now)),
            )
            .order_by_desc(Column::CreatedAt)
            .limit(limit)
            .all(&*self.db)
            .await?)
    }

    /// Compare-and-set on the poll lease; true if this caller now owns the order for `lease`
    pub async fn claim_for_poll(
        &self,
        merchant_order_id: &str,
        lease: Duration,
    ) -> Result<bool, ServiceError> {
        let now = Utc::now();
        let result = PaymentOrder::update_many()
            .col_expr(Column::PollLeaseUntil, Expr::value(Some(now + lease)))
            .filter(Column::MerchantOrderId.eq(merchant_order_id))
            .filter(Column::Status.is_in(PaymentOrderStatus::OPEN))
            .filter(
                Condition::any()
                    .add(Column::PollLeaseUntil.is_null())
                    .add(Column::PollLeaseUntil.lt(now)),
            )
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    pub async fn latest_for_cart(
        &self,
        cart_id: &str,
    ) -> Result<Option<payment_order::Model>, ServiceError> {
        Ok(PaymentOrder::find()
            .filter(Column::CartId.eq(cart_id))
            .order_by_desc(Column::CreatedAt)
            .order_by_desc(Column::MerchantOrderId)
            .one(&*self.db)
            .await?)
    }

    /// Most recent SUCCESS order with a cart reference created at or after `since`
    pub async fn latest_success_with_cart(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Option<payment_order::Model>, ServiceError> {
        Ok(PaymentOrder::find()
            .filter(Column::Status.eq(PaymentOrderStatus::Success))
            .filter(Column::CartId.is_not_null())
            .filter(Column::CreatedAt.gte(since))
            .order_by_desc(Column::CreatedAt)
            .one(&*self.db)
            .await?)
    }

    pub async fn find_by_gateway_order_id(
        &self,
        gateway_order_id: &str,
    ) -> Result<Option<payment_order::Model>, ServiceError> {
        Ok(PaymentOrder::find()
            .filter(Column::GatewayOrderId.eq(gateway_order_id))
            .one(&*self.db)
            .await?)
    }

    pub async fn list_needing_review(
        &self,
        limit: u64,
    ) -> Result<Vec<payment_order::Model>, ServiceError> {
        Ok(PaymentOrder::find()
            .filter(Column::NeedsReview.eq(true))
            .order_by_desc(Column::UpdatedAt)
            .limit(limit)
            .all(&*self.db)
            .await?)
    }
}
