use crate::{
    entities::{
        booking::{self, Entity as Booking},
        cart::{self, CartStatus, Entity as Cart},
    },
    errors::ServiceError,
};
use sea_orm::{
    sea_query::Expr, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, TransactionTrait,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// What one retention pass did (or would do, for a dry run)
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetentionReport {
    pub user_id: String,
    pub kept: usize,
    pub deleted_cart_ids: Vec<String>,
    pub detached_bookings: u64,
    pub dry_run: bool,
}

/// Keeps the N newest CONVERTED carts per user; older ones are deleted after
/// their bookings are detached, never cascaded.
#[derive(Clone)]
pub struct CartRetentionPolicy {
    db: Arc<DatabaseConnection>,
    keep: usize,
}

impl CartRetentionPolicy {
    pub fn new(db: Arc<DatabaseConnection>, keep: usize) -> Self {
        Self { db, keep: keep.max(1) }
    }

    pub fn keep(&self) -> usize {
        self.keep
    }

    /// Enforces the bound for `user_id` in its own transaction
    #[instrument(skip(self))]
    pub async fn enforce(&self, user_id: &str) -> Result<RetentionReport, ServiceError> {
        let txn = self.db.begin().await?;
        let report = self.enforce_with(&txn, user_id).await?;
        txn.commit().await?;
        Ok(report)
    }

    /// Enforces the bound using the caller's connection or transaction
    pub async fn enforce_with<C: ConnectionTrait>(
        &self,
        conn: &C,
        user_id: &str,
    ) -> Result<RetentionReport, ServiceError> {
        self.run(conn, user_id, false).await
    }

    async fn run<C: ConnectionTrait>(
        &self,
        conn: &C,
        user_id: &str,
        dry_run: bool,
    ) -> Result<RetentionReport, ServiceError> {
        let converted = Cart::find()
            .filter(cart::Column::UserId.eq(user_id))
            .filter(cart::Column::Status.eq(CartStatus::Converted))
            .order_by_desc(cart::Column::CreatedAt)
            .order_by_desc(cart::Column::Id)
            .all(conn)
            .await?;

        let mut report = RetentionReport {
            user_id: user_id.to_string(),
            kept: converted.len().min(self.keep),
            dry_run,
            ..RetentionReport::default()
        };

        for stale in converted.into_iter().skip(self.keep) {
            if dry_run {
                report.detached_bookings += Booking::find()
                    .filter(booking::Column::CartId.eq(stale.id.as_str()))
                    .count(conn)
                    .await?;
                report.deleted_cart_ids.push(stale.id);
                continue;
            }

            let detached = Booking::update_many()
                .col_expr(
                    booking::Column::CartId,
                    Expr::value(Option::<String>::None),
                )
                .filter(booking::Column::CartId.eq(stale.id.as_str()))
                .exec(conn)
                .await?;

            Cart::delete_by_id(stale.id.clone()).exec(conn).await?;

            debug!(
                cart_id = %stale.id,
                detached = detached.rows_affected,
                "Deleted superseded converted cart"
            );
            report.detached_bookings += detached.rows_affected;
            report.deleted_cart_ids.push(stale.id);
        }

        if !report.deleted_cart_ids.is_empty() {
            info!(
                user_id,
                deleted = report.deleted_cart_ids.len(),
                kept = report.kept,
                dry_run,
                "Cart retention applied"
            );
        }
        Ok(report)
    }

    /// Reports what `enforce` would delete without changing anything
    pub async fn preview(&self, user_id: &str) -> Result<RetentionReport, ServiceError> {
        self.run(&*self.db, user_id, true).await
    }

    /// Applies (or previews) the bound for every user over it
    #[instrument(skip(self))]
    pub async fn sweep_all(&self, dry_run: bool) -> Result<Vec<RetentionReport>, ServiceError> {
        let owners: Vec<String> = Cart::find()
            .select_only()
            .column(cart::Column::UserId)
            .filter(cart::Column::Status.eq(CartStatus::Converted))
            .into_tuple()
            .all(&*self.db)
            .await?;

        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for owner in owners {
            *counts.entry(owner).or_default() += 1;
        }

        let mut reports = Vec::new();
        for (user_id, count) in counts {
            if count <= self.keep {
                continue;
            }
            let report = if dry_run {
                self.preview(&user_id).await?
            } else {
                self.enforce(&user_id).await?
            };
            reports.push(report);
        }
        Ok(reports)
    }
}
