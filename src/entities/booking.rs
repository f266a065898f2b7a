use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Confirmed commitment to deliver a service.
///
/// Schedule, user and amount are snapshotted from the cart and payment order at creation,
/// so a booking stays meaningful after its cart is removed by retention.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "bookings")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub user_id: String,
    #[sea_orm(nullable, unique)]
    pub cart_id: Option<String>,
    pub payment_order_id: String,
    pub service_ref: String,
    #[sea_orm(nullable)]
    pub package_ref: Option<String>,
    #[sea_orm(nullable)]
    pub address_ref: Option<String>,
    pub selected_date: NaiveDate,
    pub selected_time: String,
    pub amount: i64,
    pub currency: String,
    pub status: BookingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    #[sea_orm(string_value = "PENDING")]
    Pending,
    #[sea_orm(string_value = "CONFIRMED")]
    Confirmed,
    #[sea_orm(string_value = "CANCELLED")]
    Cancelled,
    #[sea_orm(string_value = "REJECTED")]
    Rejected,
    #[sea_orm(string_value = "FAILED")]
    Failed,
    #[sea_orm(string_value = "COMPLETED")]
    Completed,
}
