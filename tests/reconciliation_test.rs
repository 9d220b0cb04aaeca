mod common;

use assert_matches::assert_matches;
use async_trait::async_trait;
use common::{metadata_for, TestApp};
use sea_orm::DbErr;
use sop_marketplace::entities::{
    purchase,
    revenue::{self, RevenueStatus},
    sop, DiscountType, PurchaseStatus,
};
use sop_marketplace::errors::ServiceError;
use sop_marketplace::repositories::{
    NewPurchase, PurchaseStore, RevenueInsert, SeaOrmPurchaseStore,
};
use sop_marketplace::services::reconciliation::CompletionReconciler;
use sop_marketplace::services::session_metadata::{LineItemRef, SessionMetadata};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

#[tokio::test]
async fn completes_fresh_session_and_credits_each_seller() {
    let app = TestApp::new().await;
    let sop_a = app.seed_sop("author-a", 1_000).await;
    let sop_b = app.seed_sop("author-b", 2_500).await;
    let p1 = app.seed_purchase("u1", &sop_a, Some("cs_a"), None).await;
    let p2 = app.seed_purchase("u1", &sop_b, Some("cs_a"), None).await;

    let report = app
        .reconciler()
        .complete_session(
            &metadata_for("u1", &[p1.clone(), p2.clone()]),
            Some("pi_a"),
            None,
        )
        .await
        .expect("completion succeeds");

    assert_eq!(report.completed, 2);
    assert_eq!(report.already_completed, 0);
    assert!(report.errors.is_empty());

    for (purchase, author) in [(&p1, "author-a"), (&p2, "author-b")] {
        let stored = app.purchase(purchase.id).await;
        assert_eq!(stored.status, PurchaseStatus::Completed);
        assert_eq!(stored.stripe_payment_id.as_deref(), Some("pi_a"));

        let revenues = app.revenues_for(purchase.id).await;
        assert_eq!(revenues.len(), 1);
        assert_eq!(revenues[0].seller_id, author);
        assert_eq!(revenues[0].amount, purchase.seller_revenue);
        assert_eq!(revenues[0].platform_fee, purchase.platform_fee);
        assert_eq!(revenues[0].sop_id, purchase.sop_id);
        assert_eq!(revenues[0].status, RevenueStatus::Pending);
    }
    assert_eq!(app.revenue_count().await, 2);
}

#[tokio::test]
async fn repeated_completion_is_a_no_op() {
    let app = TestApp::new().await;
    let sop_a = app.seed_sop("author-a", 1_000).await;
    let sop_b = app.seed_sop("author-b", 2_000).await;
    let p1 = app.seed_purchase("u1", &sop_a, Some("cs_b"), None).await;
    let p2 = app.seed_purchase("u1", &sop_b, Some("cs_b"), None).await;
    let metadata = metadata_for("u1", &[p1, p2]);
    let reconciler = app.reconciler();

    reconciler
        .complete_session(&metadata, Some("pi_b"), None)
        .await
        .unwrap();
    let again = reconciler
        .complete_session(&metadata, Some("pi_b"), None)
        .await
        .unwrap();

    assert_eq!(again.completed, 0);
    assert_eq!(again.already_completed, 2);
    assert!(again.errors.is_empty());
    assert_eq!(app.revenue_count().await, 2);
}

#[tokio::test]
async fn unknown_purchase_does_not_block_siblings() {
    let app = TestApp::new().await;
    let sop = app.seed_sop("author-a", 1_500).await;
    let real = app.seed_purchase("u1", &sop, Some("cs_c"), None).await;
    let ghost = Uuid::new_v4();

    let metadata = SessionMetadata::new(
        "u1",
        vec![
            LineItemRef {
                purchase_id: ghost,
                sop_id: sop.id,
            },
            LineItemRef {
                purchase_id: real.id,
                sop_id: sop.id,
            },
        ],
    );

    let report = app
        .reconciler()
        .complete_session(&metadata, None, None)
        .await
        .expect("per-item problems are reported, not raised");

    assert_eq!(report.completed, 1);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains(&ghost.to_string()));
    assert_eq!(app.purchase(real.id).await.status, PurchaseStatus::Completed);
    assert_eq!(app.revenue_count().await, 1);
}

#[tokio::test]
async fn concurrent_completions_credit_revenue_once() {
    let app = TestApp::new().await;
    let sop = app.seed_sop("author-a", 4_200).await;
    let purchase = app.seed_purchase("u1", &sop, Some("cs_race"), None).await;
    let metadata = metadata_for("u1", &[purchase.clone()]);
    let first = app.reconciler();
    let second = app.reconciler();

    let (a, b) = tokio::join!(
        first.complete_session(&metadata, Some("pi_race"), None),
        second.complete_session(&metadata, Some("pi_race"), Some("u1")),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.completed + b.completed, 1);
    assert_eq!(a.already_completed + b.already_completed, 1);
    assert!(a.errors.is_empty() && b.errors.is_empty());
    assert_eq!(app.revenues_for(purchase.id).await.len(), 1);
}

#[tokio::test]
async fn caller_must_own_the_session() {
    let app = TestApp::new().await;
    let sop = app.seed_sop("author-a", 1_000).await;
    let purchase = app.seed_purchase("u1", &sop, Some("cs_d"), None).await;

    let result = app
        .reconciler()
        .complete_session(&metadata_for("u1", &[purchase.clone()]), None, Some("intruder"))
        .await;

    assert_matches!(result, Err(ServiceError::Forbidden(_)));
    assert_eq!(app.purchase(purchase.id).await.status, PurchaseStatus::Pending);
    assert_eq!(app.revenue_count().await, 0);
}

#[tokio::test]
async fn mismatched_line_item_is_reported_without_mutation() {
    let app = TestApp::new().await;
    let sop = app.seed_sop("author-a", 1_000).await;
    let other_sop = app.seed_sop("author-b", 1_000).await;
    let purchase = app.seed_purchase("u1", &sop, Some("cs_e"), None).await;

    let metadata = SessionMetadata::new(
        "u1",
        vec![LineItemRef {
            purchase_id: purchase.id,
            sop_id: other_sop.id,
        }],
    );
    let report = app
        .reconciler()
        .complete_session(&metadata, None, None)
        .await
        .unwrap();

    assert_eq!(report.completed, 0);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(app.purchase(purchase.id).await.status, PurchaseStatus::Pending);
}

#[tokio::test]
async fn missing_revenue_is_backfilled_for_completed_purchase() {
    let app = TestApp::new().await;
    let sop = app.seed_sop("author-a", 3_000).await;
    let purchase = app.seed_purchase("u1", &sop, Some("cs_f"), None).await;
    app.set_purchase_status(purchase.id, PurchaseStatus::Completed)
        .await;

    let report = app
        .reconciler()
        .complete_session(&metadata_for("u1", &[purchase.clone()]), None, None)
        .await
        .unwrap();

    assert_eq!(report.completed, 0);
    assert_eq!(report.already_completed, 1);
    let revenues = app.revenues_for(purchase.id).await;
    assert_eq!(revenues.len(), 1);
    assert_eq!(revenues[0].amount, 2_100);
}

#[tokio::test]
async fn failed_purchase_is_not_resurrected() {
    let app = TestApp::new().await;
    let sop = app.seed_sop("author-a", 1_000).await;
    let purchase = app.seed_purchase("u1", &sop, Some("cs_g"), None).await;
    app.set_purchase_status(purchase.id, PurchaseStatus::Failed)
        .await;

    let report = app
        .reconciler()
        .complete_session(&metadata_for("u1", &[purchase.clone()]), None, None)
        .await
        .unwrap();

    assert_eq!(report.completed, 0);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(app.purchase(purchase.id).await.status, PurchaseStatus::Failed);
    assert_eq!(app.revenue_count().await, 0);
}

#[tokio::test]
async fn late_failure_never_downgrades_completion() {
    let app = TestApp::new().await;
    let sop = app.seed_sop("author-a", 1_000).await;
    let done = app.seed_purchase("u1", &sop, Some("cs_h"), None).await;
    let open = app.seed_purchase("u2", &sop, Some("cs_i"), None).await;
    let reconciler = app.reconciler();

    reconciler
        .complete_session(&metadata_for("u1", &[done.clone()]), None, None)
        .await
        .unwrap();

    let report = reconciler
        .fail_session(&[done.id, open.id, Uuid::new_v4()])
        .await
        .unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(app.purchase(done.id).await.status, PurchaseStatus::Completed);
    assert_eq!(app.purchase(open.id).await.status, PurchaseStatus::Failed);
    assert_eq!(app.revenues_for(done.id).await.len(), 1);
}

#[tokio::test]
async fn promo_usage_counts_once_per_session() {
    let app = TestApp::new().await;
    let promo = app
        .seed_promo("LAUNCH20", DiscountType::Percentage, 20, Some(10), 0)
        .await;
    let sop_a = app.seed_sop("author-a", 1_000).await;
    let sop_b = app.seed_sop("author-b", 1_000).await;
    let p1 = app
        .seed_purchase("u1", &sop_a, Some("cs_j"), Some(promo.id))
        .await;
    let p2 = app
        .seed_purchase("u1", &sop_b, Some("cs_j"), Some(promo.id))
        .await;
    let metadata = metadata_for("u1", &[p1, p2]);
    let reconciler = app.reconciler();

    reconciler
        .complete_session(&metadata, None, None)
        .await
        .unwrap();
    reconciler
        .complete_session(&metadata, None, None)
        .await
        .unwrap();

    assert_eq!(app.promo(promo.id).await.used_count, 1);
}

#[tokio::test]
async fn duplicate_revenue_insert_is_reported_as_existing() {
    let app = TestApp::new().await;
    let sop = app.seed_sop("author-a", 1_500).await;
    let purchase = app.seed_purchase("u1", &sop, Some("cs_dup"), None).await;
    let store = SeaOrmPurchaseStore::new(app.state.db.clone());

    let first = store.insert_revenue(&purchase, "author-a").await.unwrap();
    assert_matches!(first, RevenueInsert::Created(ref row) if row.purchase_id == purchase.id);

    let second = store.insert_revenue(&purchase, "author-a").await.unwrap();
    assert_eq!(second, RevenueInsert::AlreadyExists);
    assert_eq!(app.revenues_for(purchase.id).await.len(), 1);
}

/// Store whose promo counter is unreachable; everything else hits the database.
struct PromoCounterDown(SeaOrmPurchaseStore);

#[async_trait]
impl PurchaseStore for PromoCounterDown {
    async fn find_purchase(
        &self,
        id: Uuid,
    ) -> Result<Option<(purchase::Model, Option<sop::Model>)>, ServiceError> {
        self.0.find_purchase(id).await
    }

    async fn find_purchases(&self, ids: &[Uuid]) -> Result<Vec<purchase::Model>, ServiceError> {
        self.0.find_purchases(ids).await
    }

    async fn find_pending_for_buyer(
        &self,
        buyer_id: &str,
        limit: u64,
    ) -> Result<Vec<purchase::Model>, ServiceError> {
        self.0.find_pending_for_buyer(buyer_id, limit).await
    }

    async fn transition_status(
        &self,
        id: Uuid,
        to: PurchaseStatus,
        payment_intent_id: Option<&str>,
    ) -> Result<bool, ServiceError> {
        self.0.transition_status(id, to, payment_intent_id).await
    }

    async fn find_revenue_by_purchase(
        &self,
        purchase_id: Uuid,
    ) -> Result<Option<revenue::Model>, ServiceError> {
        self.0.find_revenue_by_purchase(purchase_id).await
    }

    async fn insert_revenue(
        &self,
        purchase: &purchase::Model,
        seller_id: &str,
    ) -> Result<RevenueInsert, ServiceError> {
        self.0.insert_revenue(purchase, seller_id).await
    }

    async fn increment_promo_usage(&self, _promo_code_id: Uuid) -> Result<bool, ServiceError> {
        Err(ServiceError::DatabaseError(DbErr::Custom(
            "promo counter unavailable".to_string(),
        )))
    }

    async fn find_sops(&self, ids: &[Uuid]) -> Result<Vec<sop::Model>, ServiceError> {
        self.0.find_sops(ids).await
    }

    async fn owned_sop_ids(
        &self,
        buyer_id: &str,
        sop_ids: &[Uuid],
    ) -> Result<HashSet<Uuid>, ServiceError> {
        self.0.owned_sop_ids(buyer_id, sop_ids).await
    }

    async fn create_pending_purchases(
        &self,
        purchases: Vec<NewPurchase>,
    ) -> Result<Vec<purchase::Model>, ServiceError> {
        self.0.create_pending_purchases(purchases).await
    }

    async fn attach_session(&self, ids: &[Uuid], session_id: &str) -> Result<u64, ServiceError> {
        self.0.attach_session(ids, session_id).await
    }
}

#[tokio::test]
async fn lost_promo_usage_is_reported_with_the_completion() {
    let app = TestApp::new().await;
    let promo = app
        .seed_promo("SPRING10", DiscountType::Percentage, 10, None, 0)
        .await;
    let sop = app.seed_sop("author-a", 2_000).await;
    let purchase = app
        .seed_purchase("u1", &sop, Some("cs_promo_down"), Some(promo.id))
        .await;
    let metadata = metadata_for("u1", &[purchase.clone()]);
    let reconciler = CompletionReconciler::new(Arc::new(PromoCounterDown(
        SeaOrmPurchaseStore::new(app.state.db.clone()),
    )));

    let report = reconciler
        .complete_session(&metadata, Some("pi_promo_down"), None)
        .await
        .unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(report.failed_items(), 0);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains("promo usage not recorded"));
    assert!(report.errors[0].contains(&purchase.id.to_string()));

    assert_eq!(app.purchase(purchase.id).await.status, PurchaseStatus::Completed);
    assert_eq!(app.revenues_for(purchase.id).await.len(), 1);
    assert_eq!(app.promo(promo.id).await.used_count, 0);

    let retry = reconciler
        .complete_session(&metadata, Some("pi_promo_down"), None)
        .await
        .unwrap();
    assert_eq!(retry.already_completed, 1);
    assert!(retry.errors.is_empty());
}
