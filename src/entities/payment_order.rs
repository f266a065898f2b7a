use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One payment attempt against the gateway, keyed by the merchant order id we generate.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payment_orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub merchant_order_id: String,
    pub user_id: String,
    /// Weak reference; may no longer resolve to a cart
    #[sea_orm(nullable)]
    pub cart_id: Option<String>,
    /// Minor units (paise)
    pub amount: i64,
    pub currency: String,
    pub status: PaymentOrderStatus,
    #[sea_orm(nullable)]
    pub gateway_order_id: Option<String>,
    #[sea_orm(nullable)]
    pub gateway_transaction_id: Option<String>,
    #[sea_orm(column_type = "Json", nullable)]
    pub gateway_response: Option<Json>,
    #[sea_orm(nullable)]
    pub failure_reason: Option<String>,
    #[sea_orm(nullable)]
    pub redirect_url: Option<String>,
    pub check_attempts: i32,
    #[sea_orm(nullable)]
    pub last_check_error: Option<String>,
    #[sea_orm(nullable)]
    pub last_checked_at: Option<DateTime<Utc>>,
    pub needs_review: bool,
    #[sea_orm(nullable)]
    pub review_reason: Option<String>,
    #[sea_orm(nullable)]
    pub poll_lease_until: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    #[sea_orm(nullable)]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// Payment state machine: INITIATED -> PENDING -> {SUCCESS | FAILED | CANCELLED}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentOrderStatus {
    #[sea_orm(string_value = "INITIATED")]
    Initiated,
    #[sea_orm(string_value = "PENDING")]
    Pending,
    #[sea_orm(string_value = "SUCCESS")]
    Success,
    #[sea_orm(string_value = "FAILED")]
    Failed,
    #[sea_orm(string_value = "CANCELLED")]
    Cancelled,
}

impl PaymentOrderStatus {
    pub const TERMINAL: [PaymentOrderStatus; 3] = [
        PaymentOrderStatus::Success,
        PaymentOrderStatus::Failed,
        PaymentOrderStatus::Cancelled,
    ];

    pub const OPEN: [PaymentOrderStatus; 2] =
        [PaymentOrderStatus::Initiated, PaymentOrderStatus::Pending];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }
}

impl Model {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
