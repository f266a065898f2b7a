use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Audit record of an authenticated gateway webhook delivery
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payment_webhooks")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub event_type: String,
    #[sea_orm(nullable)]
    pub merchant_order_id: Option<String>,
    #[sea_orm(column_type = "Json")]
    pub payload: Json,
    #[sea_orm(column_type = "Json")]
    pub headers: Json,
    pub processed: bool,
    #[sea_orm(nullable)]
    pub processing_error: Option<String>,
    pub received_at: DateTime<Utc>,
    #[sea_orm(nullable)]
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
