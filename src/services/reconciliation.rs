//! Completion reconciler: the only code that moves purchases out of `pending` and credits
//! seller revenue.
//!
//! Every entry point (webhook, verify-and-complete, pending sweep) funnels through
//! [`CompletionReconciler`]. Repeated or concurrent calls for the same session converge:
//! the status change is conditional on the row still being pending, and revenue rows are
//! keyed uniquely by purchase id.

use metrics::counter;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::entities::{purchase, sop, PurchaseStatus};
use crate::errors::ServiceError;
use crate::repositories::{PurchaseStore, RevenueInsert};
use crate::services::session_metadata::{LineItemRef, SessionMetadata};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CompletionReport {
    pub completed: usize,
    pub already_completed: usize,
    pub errors: Vec<String>,
    /// Entries in `errors` for completed purchases whose promo use was not recorded
    #[serde(skip)]
    pub promo_errors: usize,
}

impl CompletionReport {
    pub fn merge(&mut self, other: CompletionReport) {
        self.completed += other.completed;
        self.already_completed += other.already_completed;
        self.errors.extend(other.errors);
        self.promo_errors += other.promo_errors;
    }

    /// Line items that did not end up completed.
    pub fn failed_items(&self) -> usize {
        self.errors.len() - self.promo_errors
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FailureReport {
    pub failed: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ItemOutcome {
    /// `promo_error` is set when the purchase completed but its promo use was not recorded.
    Completed { promo_error: Option<String> },
    AlreadyCompleted,
}

#[derive(Clone)]
pub struct CompletionReconciler {
    store: Arc<dyn PurchaseStore>,
}

impl CompletionReconciler {
    pub fn new(store: Arc<dyn PurchaseStore>) -> Self {
        Self { store }
    }

    /// Completes every line item of a paid session.
    ///
    /// `authorized_buyer` is the caller identity on client-triggered paths; a mismatch with the
    /// metadata buyer rejects the whole call before anything is touched. Per-item problems are
    /// collected in the report and never abort sibling items.
    #[instrument(skip(self, metadata), fields(buyer_id = %metadata.buyer_id, items = metadata.line_items.len()))]
    pub async fn complete_session(
        &self,
        metadata: &SessionMetadata,
        payment_intent_id: Option<&str>,
        authorized_buyer: Option<&str>,
    ) -> Result<CompletionReport, ServiceError> {
        if let Some(caller) = authorized_buyer {
            if caller != metadata.buyer_id {
                warn!(caller, "caller does not own checkout session");
                return Err(ServiceError::Forbidden(
                    "checkout session does not belong to the caller".to_string(),
                ));
            }
        }

        let mut report = CompletionReport::default();
        for (index, item) in metadata.line_items.iter().enumerate() {
            match self
                .complete_item(index, item, &metadata.buyer_id, payment_intent_id)
                .await
            {
                Ok(ItemOutcome::Completed { promo_error }) => {
                    report.completed += 1;
                    if let Some(err) = promo_error {
                        report.promo_errors += 1;
                        report.errors.push(format!(
                            "purchase {}: promo usage not recorded: {}",
                            item.purchase_id, err
                        ));
                    }
                }
                Ok(ItemOutcome::AlreadyCompleted) => report.already_completed += 1,
                Err(err) => {
                    warn!(purchase_id = %item.purchase_id, error = %err, "line item not completed");
                    report
                        .errors
                        .push(format!("purchase {}: {}", item.purchase_id, err));
                }
            }
        }

        counter!("reconciliation.purchases.completed", report.completed as u64);
        counter!(
            "reconciliation.purchases.already_completed",
            report.already_completed as u64
        );
        counter!("reconciliation.purchases.errors", report.errors.len() as u64);
        info!(
            completed = report.completed,
            already_completed = report.already_completed,
            errors = report.errors.len(),
            "checkout session reconciled"
        );

        Ok(report)
    }

    async fn complete_item(
        &self,
        index: usize,
        item: &LineItemRef,
        buyer_id: &str,
        payment_intent_id: Option<&str>,
    ) -> Result<ItemOutcome, ServiceError> {
        let (purchase, sop) = self
            .store
            .find_purchase(item.purchase_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound("purchase does not exist".to_string()))?;

        if purchase.sop_id != item.sop_id {
            return Err(ServiceError::Conflict(format!(
                "purchase is for SOP {} but metadata lists {}",
                purchase.sop_id, item.sop_id
            )));
        }
        if purchase.buyer_id != buyer_id {
            return Err(ServiceError::Conflict(
                "purchase belongs to a different buyer".to_string(),
            ));
        }
        let sop = sop.ok_or_else(|| ServiceError::NotFound("SOP no longer exists".to_string()))?;

        match purchase.status {
            PurchaseStatus::Completed => {
                self.ensure_revenue(&purchase, &sop).await?;
                return Ok(ItemOutcome::AlreadyCompleted);
            }
            PurchaseStatus::Failed => {
                return Err(ServiceError::Conflict(
                    "purchase was already marked failed".to_string(),
                ));
            }
            PurchaseStatus::Pending => {}
        }

        let transitioned = self
            .store
            .transition_status(purchase.id, PurchaseStatus::Completed, payment_intent_id)
            .await?;

        if !transitioned {
            // Lost the race; whoever won decides the outcome.
            let current = self
                .store
                .find_purchase(purchase.id)
                .await?
                .map(|(p, _)| p.status);
            return match current {
                Some(PurchaseStatus::Completed) => {
                    self.ensure_revenue(&purchase, &sop).await?;
                    Ok(ItemOutcome::AlreadyCompleted)
                }
                _ => Err(ServiceError::Conflict(
                    "purchase left pending state concurrently".to_string(),
                )),
            };
        }

        debug!(purchase_id = %purchase.id, "purchase completed");

        let mut promo_error = None;
        if index == 0 {
            if let Some(promo_code_id) = purchase.promo_code_id {
                match self.store.increment_promo_usage(promo_code_id).await {
                    Ok(true) => debug!(%promo_code_id, "promo usage incremented"),
                    Ok(false) => warn!(%promo_code_id, "promo code vanished before usage increment"),
                    Err(err) => {
                        // retries see a completed purchase and never get here again
                        counter!("reconciliation.promo_usage.errors", 1);
                        warn!(%promo_code_id, error = %err, "promo usage increment failed");
                        promo_error = Some(err.to_string());
                    }
                }
            }
        }

        self.ensure_revenue(&purchase, &sop).await?;
        Ok(ItemOutcome::Completed { promo_error })
    }

    /// Creates the revenue row unless one exists. Returns whether a row was written.
    async fn ensure_revenue(
        &self,
        purchase: &purchase::Model,
        sop: &sop::Model,
    ) -> Result<bool, ServiceError> {
        if self
            .store
            .find_revenue_by_purchase(purchase.id)
            .await?
            .is_some()
        {
            return Ok(false);
        }

        match self.store.insert_revenue(purchase, &sop.author_id).await? {
            RevenueInsert::Created(revenue) => {
                info!(
                    purchase_id = %purchase.id,
                    revenue_id = %revenue.id,
                    seller_id = %revenue.seller_id,
                    amount = revenue.amount,
                    "seller revenue credited"
                );
                Ok(true)
            }
            RevenueInsert::AlreadyExists => Ok(false),
        }
    }

    /// Marks still-pending purchases failed. Terminal purchases are left alone, so a late
    /// failure never undoes a completion.
    #[instrument(skip(self))]
    pub async fn fail_session(&self, purchase_ids: &[Uuid]) -> Result<FailureReport, ServiceError> {
        let mut report = FailureReport::default();

        for &purchase_id in purchase_ids {
            let current = match self.store.find_purchase(purchase_id).await {
                Ok(Some((purchase, _))) => purchase,
                Ok(None) => {
                    report
                        .errors
                        .push(format!("purchase {purchase_id}: does not exist"));
                    continue;
                }
                Err(err) => {
                    report.errors.push(format!("purchase {purchase_id}: {err}"));
                    continue;
                }
            };

            if current.status.is_terminal() {
                info!(%purchase_id, status = %current.status, "ignoring failure for terminal purchase");
                report.skipped += 1;
                continue;
            }

            match self
                .store
                .transition_status(purchase_id, PurchaseStatus::Failed, None)
                .await
            {
                Ok(true) => report.failed += 1,
                Ok(false) => report.skipped += 1,
                Err(err) => report.errors.push(format!("purchase {purchase_id}: {err}")),
            }
        }

        counter!("reconciliation.purchases.failed", report.failed as u64);
        info!(
            failed = report.failed,
            skipped = report.skipped,
            errors = report.errors.len(),
            "payment failure reconciled"
        );
        Ok(report)
    }
}
