use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::entities::PurchaseStatus;
use crate::errors::ServiceError;
use crate::repositories::PurchaseStore;
use crate::services::reconciliation::{CompletionReconciler, CompletionReport};
use crate::services::session_metadata::{parse_purchase_ids, SessionMetadata};
use crate::stripe::{PaymentProvider, PaymentStatus};

/// What the buyer-facing page should show after verify-and-complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum VerifyOutcome {
    /// Payment has not gone through yet; try again later
    NotPaid,
    /// Paid and every purchase is recorded
    Recorded,
    /// Paid but at least one purchase could not be recorded; needs manual reconciliation
    RecordingFailed,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResult {
    pub success: bool,
    pub outcome: VerifyOutcome,
    pub payment_status: PaymentStatus,
    pub completed: usize,
    pub already_completed: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutStatus {
    pub session_id: String,
    pub payment_status: PaymentStatus,
    pub status: Option<String>,
    pub amount_total: Option<i64>,
    pub currency: Option<String>,
    pub metadata: HashMap<String, String>,
    /// Every purchase referenced by the session is completed locally
    pub recorded: bool,
}

#[derive(Debug, Clone, Default, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub checked: usize,
    pub completed: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    pub message: String,
}

/// Client-driven completion paths: verify-and-complete, status polling and the pending sweep.
#[derive(Clone)]
pub struct PaymentsService {
    provider: Arc<dyn PaymentProvider>,
    store: Arc<dyn PurchaseStore>,
    reconciler: CompletionReconciler,
    sweep_limit: u64,
}

impl PaymentsService {
    pub fn new(
        provider: Arc<dyn PaymentProvider>,
        store: Arc<dyn PurchaseStore>,
        reconciler: CompletionReconciler,
        sweep_limit: u64,
    ) -> Self {
        Self {
            provider,
            store,
            reconciler,
            sweep_limit,
        }
    }

    /// Re-reads the session from the provider and completes it on the caller's behalf.
    #[instrument(skip(self))]
    pub async fn verify_and_complete(
        &self,
        session_id: &str,
        caller: &str,
    ) -> Result<VerifyResult, ServiceError> {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(ServiceError::BadRequest("sessionId is required".to_string()));
        }

        let session = self.provider.retrieve_checkout_session(session_id).await?;

        if !session.payment_status.is_paid() {
            info!(payment_status = ?session.payment_status, "payment not completed yet");
            return Ok(VerifyResult {
                success: false,
                outcome: VerifyOutcome::NotPaid,
                payment_status: session.payment_status,
                completed: 0,
                already_completed: 0,
                errors: Vec::new(),
                message: "Payment not completed".to_string(),
            });
        }

        let metadata = SessionMetadata::parse(&session.metadata)?;
        let report = self
            .reconciler
            .complete_session(&metadata, session.payment_intent.as_deref(), Some(caller))
            .await?;

        Ok(verify_result(session.payment_status, report))
    }

    /// Read-only view of a session for polling clients.
    #[instrument(skip(self))]
    pub async fn checkout_status(&self, session_id: &str) -> Result<CheckoutStatus, ServiceError> {
        let session = self.provider.retrieve_checkout_session(session_id).await?;

        let recorded = match parse_purchase_ids(&session.metadata) {
            Ok(ids) => {
                let purchases = self.store.find_purchases(&ids).await?;
                purchases.len() == ids.len()
                    && purchases
                        .iter()
                        .all(|p| p.status == PurchaseStatus::Completed)
            }
            Err(_) => false,
        };

        Ok(CheckoutStatus {
            session_id: session.id,
            payment_status: session.payment_status,
            status: session.status,
            amount_total: session.amount_total,
            currency: session.currency,
            metadata: session.metadata,
            recorded,
        })
    }

    pub async fn has_purchased(&self, buyer_id: &str, sop_id: Uuid) -> Result<bool, ServiceError> {
        let owned = self.store.owned_sop_ids(buyer_id, &[sop_id]).await?;
        Ok(owned.contains(&sop_id))
    }

    /// Re-verifies the caller's most recent pending purchases against the provider.
    ///
    /// Purchases are grouped by checkout session so each session is fetched once and completed
    /// as a whole. A provider failure only affects the purchases of that session.
    #[instrument(skip(self))]
    pub async fn check_pending(&self, caller: &str) -> Result<SweepReport, ServiceError> {
        let pending = self
            .store
            .find_pending_for_buyer(caller, self.sweep_limit)
            .await?;

        let mut by_session: BTreeMap<String, usize> = BTreeMap::new();
        for purchase in &pending {
            if let Some(session_id) = &purchase.stripe_session_id {
                *by_session.entry(session_id.clone()).or_default() += 1;
            }
        }

        let mut sweep = SweepReport {
            checked: pending.len(),
            ..Default::default()
        };
        let mut completion = CompletionReport::default();

        for (session_id, purchases) in by_session {
            let session = match self.provider.retrieve_checkout_session(&session_id).await {
                Ok(session) => session,
                Err(err) => {
                    warn!(%session_id, error = %err, "could not re-verify checkout session");
                    sweep.failed += purchases;
                    sweep.errors.push(format!("session {session_id}: {err}"));
                    continue;
                }
            };

            if !session.payment_status.is_paid() {
                continue;
            }

            let outcome = match SessionMetadata::parse(&session.metadata) {
                Ok(metadata) => {
                    self.reconciler
                        .complete_session(&metadata, session.payment_intent.as_deref(), Some(caller))
                        .await
                }
                Err(err) => Err(err.into()),
            };

            match outcome {
                Ok(report) => {
                    sweep.failed += report.failed_items();
                    completion.merge(report);
                }
                Err(err) => {
                    sweep.failed += purchases;
                    sweep.errors.push(format!("session {session_id}: {err}"));
                }
            }
        }

        sweep.completed = completion.completed;
        sweep.errors.extend(completion.errors);
        sweep.message = if sweep.completed > 0 {
            format!("Completed {} purchase(s)", sweep.completed)
        } else {
            "No purchases needed completion".to_string()
        };

        info!(
            checked = sweep.checked,
            completed = sweep.completed,
            failed = sweep.failed,
            "pending purchases swept"
        );
        Ok(sweep)
    }
}

fn verify_result(payment_status: PaymentStatus, report: CompletionReport) -> VerifyResult {
    let recorded = report.errors.is_empty();
    VerifyResult {
        success: recorded,
        outcome: if recorded {
            VerifyOutcome::Recorded
        } else {
            VerifyOutcome::RecordingFailed
        },
        payment_status,
        completed: report.completed,
        already_completed: report.already_completed,
        message: if recorded {
            "Purchase recorded".to_string()
        } else {
            "Payment received but some purchases could not be recorded; contact support"
                .to_string()
        },
        errors: report.errors,
    }
}
