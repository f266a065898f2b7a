use crate::{
    entities::cart::{self, CartStatus, Column, Entity as Cart},
    errors::ServiceError,
};
use chrono::{NaiveDate, Utc};
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

/// Selection made at checkout
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewCart {
    /// Caller-supplied id; generated when absent
    #[serde(default)]
    #[validate(length(min = 1, max = 100))]
    pub cart_id: Option<String>,
    #[validate(length(min = 1, max = 255))]
    pub service_ref: String,
    pub package_ref: Option<String>,
    pub address_ref: Option<String>,
    pub selected_date: NaiveDate,
    #[validate(length(min = 1, max = 100))]
    pub selected_time: String,
}

/// Cart persistence; one ACTIVE cart per user
#[derive(Clone)]
pub struct CartStore {
    db: Arc<DatabaseConnection>,
}

impl CartStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Creates an ACTIVE cart and retires the user's previous ACTIVE carts
    #[instrument(skip(self, input))]
    pub async fn create(&self, user_id: &str, input: NewCart) -> Result<cart::Model, ServiceError> {
        input.validate()?;

        let now = Utc::now();
        let cart_id = input
            .cart_id
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

        let txn = self.db.begin().await?;

        Cart::update_many()
            .col_expr(Column::Status, Expr::value(CartStatus::Inactive))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::UserId.eq(user_id))
            .filter(Column::Status.eq(CartStatus::Active))
            .exec(&txn)
            .await?;

        let cart = cart::ActiveModel {
            id: Set(cart_id),
            user_id: Set(user_id.to_string()),
            service_ref: Set(input.service_ref),
            package_ref: Set(input.package_ref),
            address_ref: Set(input.address_ref),
            selected_date: Set(input.selected_date),
            selected_time: Set(input.selected_time),
            status: Set(CartStatus::Active),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await
        .map_err(|e| {
            if crate::db::is_unique_violation(&e) {
                ServiceError::Conflict("Cart id already exists".to_string())
            } else {
                ServiceError::from(e)
            }
        })?;

        txn.commit().await?;

        info!(cart_id = %cart.id, user_id, "Cart created");
        Ok(cart)
    }

    pub async fn find(&self, cart_id: &str) -> Result<Option<cart::Model>, ServiceError> {
        Ok(Cart::find_by_id(cart_id.to_string()).one(&*self.db).await?)
    }

    pub async fn get(&self, cart_id: &str) -> Result<cart::Model, ServiceError> {
        self.find(cart_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))
    }

    /// Most recently created cart of any status
    pub async fn latest_for_user(&self, user_id: &str) -> Result<Option<cart::Model>, ServiceError> {
        Ok(Cart::find()
            .filter(Column::UserId.eq(user_id))
            .order_by_desc(Column::CreatedAt)
            .order_by_desc(Column::Id)
            .one(&*self.db)
            .await?)
    }
}
