use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, SqlErr, TransactionTrait,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::entities::{
    promo_code, purchase, revenue, sop, PromoCode, Purchase, PurchaseStatus, Revenue,
    RevenueStatus, Sop,
};
use crate::errors::ServiceError;
use crate::repositories::Repository;

use super::BaseRepository;

/// A purchase row about to be written for a new checkout session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPurchase {
    pub buyer_id: String,
    pub sop_id: Uuid,
    pub amount: i64,
    pub platform_fee: i64,
    pub seller_revenue: i64,
    pub promo_code_id: Option<Uuid>,
}

/// Outcome of a guarded revenue insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevenueInsert {
    Created(revenue::Model),
    /// The unique index on `purchase_id` rejected the row; another caller credited it first.
    AlreadyExists,
}

/// Data access used by checkout and reconciliation.
///
/// Status changes are conditional on the row still being `pending`, so concurrent callers
/// can race freely and exactly one of them observes `true`.
#[async_trait]
pub trait PurchaseStore: Send + Sync {
    async fn find_purchase(
        &self,
        id: Uuid,
    ) -> Result<Option<(purchase::Model, Option<sop::Model>)>, ServiceError>;

    async fn find_purchases(&self, ids: &[Uuid]) -> Result<Vec<purchase::Model>, ServiceError>;

    /// Most recent pending purchases of a buyer that already have a checkout session.
    async fn find_pending_for_buyer(
        &self,
        buyer_id: &str,
        limit: u64,
    ) -> Result<Vec<purchase::Model>, ServiceError>;

    /// Moves a `pending` purchase to `to`. Returns false when the row was not pending.
    async fn transition_status(
        &self,
        id: Uuid,
        to: PurchaseStatus,
        payment_intent_id: Option<&str>,
    ) -> Result<bool, ServiceError>;

    async fn find_revenue_by_purchase(
        &self,
        purchase_id: Uuid,
    ) -> Result<Option<revenue::Model>, ServiceError>;

    async fn insert_revenue(
        &self,
        purchase: &purchase::Model,
        seller_id: &str,
    ) -> Result<RevenueInsert, ServiceError>;

    async fn increment_promo_usage(&self, promo_code_id: Uuid) -> Result<bool, ServiceError>;

    async fn find_sops(&self, ids: &[Uuid]) -> Result<Vec<sop::Model>, ServiceError>;

    /// SOP ids among `sop_ids` the buyer already owns.
    async fn owned_sop_ids(
        &self,
        buyer_id: &str,
        sop_ids: &[Uuid],
    ) -> Result<HashSet<Uuid>, ServiceError>;

    async fn create_pending_purchases(
        &self,
        purchases: Vec<NewPurchase>,
    ) -> Result<Vec<purchase::Model>, ServiceError>;

    async fn attach_session(&self, ids: &[Uuid], session_id: &str) -> Result<u64, ServiceError>;
}

/// sea-orm backed store
#[derive(Debug, Clone)]
pub struct SeaOrmPurchaseStore {
    base: BaseRepository,
}

impl SeaOrmPurchaseStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            base: BaseRepository::new(db),
        }
    }
}

impl Repository for SeaOrmPurchaseStore {
    fn get_db(&self) -> &DatabaseConnection {
        self.base.get_db()
    }
}

#[async_trait]
impl PurchaseStore for SeaOrmPurchaseStore {
    async fn find_purchase(
        &self,
        id: Uuid,
    ) -> Result<Option<(purchase::Model, Option<sop::Model>)>, ServiceError> {
        Purchase::find_by_id(id)
            .find_also_related(Sop)
            .one(self.get_db())
            .await
            .map_err(ServiceError::db_error)
    }

    async fn find_purchases(&self, ids: &[Uuid]) -> Result<Vec<purchase::Model>, ServiceError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        Purchase::find()
            .filter(purchase::Column::Id.is_in(ids.iter().copied()))
            .all(self.get_db())
            .await
            .map_err(ServiceError::db_error)
    }

    async fn find_pending_for_buyer(
        &self,
        buyer_id: &str,
        limit: u64,
    ) -> Result<Vec<purchase::Model>, ServiceError> {
        Purchase::find()
            .filter(purchase::Column::BuyerId.eq(buyer_id))
            .filter(purchase::Column::Status.eq(PurchaseStatus::Pending))
            .filter(purchase::Column::StripeSessionId.is_not_null())
            .order_by_desc(purchase::Column::CreatedAt)
            .limit(limit)
            .all(self.get_db())
            .await
            .map_err(ServiceError::db_error)
    }

    async fn transition_status(
        &self,
        id: Uuid,
        to: PurchaseStatus,
        payment_intent_id: Option<&str>,
    ) -> Result<bool, ServiceError> {
        let mut update = Purchase::update_many()
            .col_expr(purchase::Column::Status, Expr::value(to))
            .col_expr(purchase::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(purchase::Column::Id.eq(id))
            .filter(purchase::Column::Status.eq(PurchaseStatus::Pending));

        if let Some(payment_intent_id) = payment_intent_id {
            update = update.col_expr(
                purchase::Column::StripePaymentId,
                Expr::value(payment_intent_id.to_string()),
            );
        }

        let result = update
            .exec(self.get_db())
            .await
            .map_err(ServiceError::db_error)?;

        debug!(purchase_id = %id, status = %to, rows = result.rows_affected, "conditional status update");
        Ok(result.rows_affected > 0)
    }

    async fn find_revenue_by_purchase(
        &self,
        purchase_id: Uuid,
    ) -> Result<Option<revenue::Model>, ServiceError> {
        Revenue::find()
            .filter(revenue::Column::PurchaseId.eq(purchase_id))
            .one(self.get_db())
            .await
            .map_err(ServiceError::db_error)
    }

    async fn insert_revenue(
        &self,
        purchase: &purchase::Model,
        seller_id: &str,
    ) -> Result<RevenueInsert, ServiceError> {
        let row = revenue::ActiveModel {
            id: Set(Uuid::new_v4()),
            purchase_id: Set(purchase.id),
            seller_id: Set(seller_id.to_string()),
            sop_id: Set(purchase.sop_id),
            amount: Set(purchase.seller_revenue),
            platform_fee: Set(purchase.platform_fee),
            status: Set(RevenueStatus::Pending),
            created_at: Set(Utc::now()),
        };

        match row.insert(self.get_db()).await {
            Ok(model) => Ok(RevenueInsert::Created(model)),
            Err(err) if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                debug!(purchase_id = %purchase.id, "revenue row already present");
                Ok(RevenueInsert::AlreadyExists)
            }
            Err(err) => Err(ServiceError::db_error(err)),
        }
    }

    async fn increment_promo_usage(&self, promo_code_id: Uuid) -> Result<bool, ServiceError> {
        let result = PromoCode::update_many()
            .col_expr(
                promo_code::Column::UsedCount,
                Expr::col(promo_code::Column::UsedCount).add(1),
            )
            .col_expr(promo_code::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(promo_code::Column::Id.eq(promo_code_id))
            .exec(self.get_db())
            .await
            .map_err(ServiceError::db_error)?;

        Ok(result.rows_affected > 0)
    }

    async fn find_sops(&self, ids: &[Uuid]) -> Result<Vec<sop::Model>, ServiceError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        Sop::find()
            .filter(sop::Column::Id.is_in(ids.iter().copied()))
            .all(self.get_db())
            .await
            .map_err(ServiceError::db_error)
    }

    async fn owned_sop_ids(
        &self,
        buyer_id: &str,
        sop_ids: &[Uuid],
    ) -> Result<HashSet<Uuid>, ServiceError> {
        if sop_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let owned: Vec<Uuid> = Purchase::find()
            .select_only()
            .column(purchase::Column::SopId)
            .filter(purchase::Column::BuyerId.eq(buyer_id))
            .filter(purchase::Column::Status.eq(PurchaseStatus::Completed))
            .filter(purchase::Column::SopId.is_in(sop_ids.iter().copied()))
            .into_tuple()
            .all(self.get_db())
            .await
            .map_err(ServiceError::db_error)?;

        Ok(owned.into_iter().collect())
    }

    async fn create_pending_purchases(
        &self,
        purchases: Vec<NewPurchase>,
    ) -> Result<Vec<purchase::Model>, ServiceError> {
        let txn = self
            .get_db()
            .begin()
            .await
            .map_err(ServiceError::db_error)?;

        let now = Utc::now();
        let mut created = Vec::with_capacity(purchases.len());
        for new in purchases {
            let row = purchase::ActiveModel {
                id: Set(Uuid::new_v4()),
                buyer_id: Set(new.buyer_id),
                sop_id: Set(new.sop_id),
                amount: Set(new.amount),
                platform_fee: Set(new.platform_fee),
                seller_revenue: Set(new.seller_revenue),
                promo_code_id: Set(new.promo_code_id),
                status: Set(PurchaseStatus::Pending),
                stripe_session_id: Set(None),
                stripe_payment_id: Set(None),
                created_at: Set(now),
                updated_at: Set(now),
            };
            created.push(row.insert(&txn).await.map_err(ServiceError::db_error)?);
        }

        txn.commit().await.map_err(ServiceError::db_error)?;
        Ok(created)
    }

    async fn attach_session(&self, ids: &[Uuid], session_id: &str) -> Result<u64, ServiceError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = Purchase::update_many()
            .col_expr(
                purchase::Column::StripeSessionId,
                Expr::value(session_id.to_string()),
            )
            .col_expr(purchase::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(purchase::Column::Id.is_in(ids.iter().copied()))
            .exec(self.get_db())
            .await
            .map_err(ServiceError::db_error)?;

        Ok(result.rows_affected)
    }
}
