use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::entities::sop;
use crate::errors::ServiceError;
use crate::repositories::{NewPurchase, PurchaseStore};
use crate::services::promotions::{PromoEvaluation, PromotionService};
use crate::services::revenue_split::split;
use crate::services::session_metadata::{LineItemRef, SessionMetadata, PURCHASE_IDS_KEY};
use crate::stripe::{CheckoutLineItem, CreateCheckoutSession, PaymentProvider};

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSessionCreated {
    pub session_id: String,
    pub url: Option<String>,
}

/// Where the hosted checkout sends the buyer back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnTarget {
    Cart,
    Sop(Uuid),
}

#[derive(Clone)]
pub struct CheckoutService {
    store: Arc<dyn PurchaseStore>,
    provider: Arc<dyn PaymentProvider>,
    promotions: PromotionService,
    currency: String,
    public_base_url: String,
}

impl CheckoutService {
    pub fn new(
        store: Arc<dyn PurchaseStore>,
        provider: Arc<dyn PaymentProvider>,
        promotions: PromotionService,
        currency: impl Into<String>,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            provider,
            promotions,
            currency: currency.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Writes pending purchases for the payable SOPs and opens a hosted checkout session.
    #[instrument(skip(self, sop_ids, promo_code), fields(items = sop_ids.len()))]
    pub async fn create_session(
        &self,
        buyer_id: &str,
        sop_ids: &[Uuid],
        promo_code: Option<&str>,
        return_to: ReturnTarget,
    ) -> Result<CheckoutSessionCreated, ServiceError> {
        let mut seen = HashSet::new();
        let requested: Vec<Uuid> = sop_ids.iter().copied().filter(|id| seen.insert(*id)).collect();
        if requested.is_empty() {
            return Err(ServiceError::BadRequest(
                "No SOPs selected for checkout".to_string(),
            ));
        }

        let mut sops = self.store.find_sops(&requested).await?;
        if sops.is_empty() {
            return Err(ServiceError::NotFound("No SOPs found".to_string()));
        }
        sops.sort_by_key(|s| requested.iter().position(|id| *id == s.id));

        let paid: Vec<sop::Model> = sops.into_iter().filter(|s| s.price > 0).collect();
        if paid.is_empty() {
            return Err(ServiceError::BadRequest(
                "All selected SOPs are free".to_string(),
            ));
        }

        let paid_ids: Vec<Uuid> = paid.iter().map(|s| s.id).collect();
        let owned = self.store.owned_sop_ids(buyer_id, &paid_ids).await?;
        let items: Vec<sop::Model> = paid.into_iter().filter(|s| !owned.contains(&s.id)).collect();
        if items.is_empty() {
            return Err(ServiceError::BadRequest(
                "You already own all selected SOPs".to_string(),
            ));
        }

        let original_total: i64 = items.iter().map(|s| s.price).sum();
        let (final_total, promo_code_id) = match promo_code.map(str::trim).filter(|c| !c.is_empty())
        {
            Some(code) => match self.promotions.evaluate_code(code, original_total).await? {
                PromoEvaluation::Valid(applied) => {
                    (applied.final_amount, Some(applied.promo_code_id))
                }
                PromoEvaluation::Invalid(reason) => {
                    return Err(ServiceError::BadRequest(reason.message().to_string()));
                }
            },
            None => (original_total, None),
        };

        if final_total <= 0 {
            return Err(ServiceError::BadRequest(
                "Checkout total must be greater than zero".to_string(),
            ));
        }

        let prices: Vec<i64> = items.iter().map(|s| s.price).collect();
        let allocation = allocate(final_total, &prices);

        let new_purchases = items
            .iter()
            .zip(&allocation)
            .map(|(sop, &amount)| {
                let split = split(amount);
                NewPurchase {
                    buyer_id: buyer_id.to_string(),
                    sop_id: sop.id,
                    amount,
                    platform_fee: split.platform_fee,
                    seller_revenue: split.seller_revenue,
                    promo_code_id,
                }
            })
            .collect();
        let purchases = self.store.create_pending_purchases(new_purchases).await?;

        let metadata = SessionMetadata::new(
            buyer_id,
            purchases
                .iter()
                .map(|p| LineItemRef {
                    purchase_id: p.id,
                    sop_id: p.sop_id,
                })
                .collect(),
        );
        let wire = metadata.to_metadata();
        let (success_url, cancel_url) = self.return_urls(return_to);

        let request = CreateCheckoutSession {
            currency: self.currency.clone(),
            line_items: items
                .iter()
                .zip(&allocation)
                .map(|(sop, &amount)| CheckoutLineItem {
                    name: sop.title.clone(),
                    unit_amount: amount,
                    quantity: 1,
                })
                .collect(),
            success_url,
            cancel_url,
            client_reference_id: Some(buyer_id.to_string()),
            payment_intent_metadata: wire
                .get(PURCHASE_IDS_KEY)
                .map(|ids| [(PURCHASE_IDS_KEY.to_string(), ids.clone())].into())
                .unwrap_or_default(),
            metadata: wire,
        };

        let session = match self.provider.create_checkout_session(&request).await {
            Ok(session) => session,
            Err(err) => {
                warn!(error = %err, purchases = purchases.len(), "checkout session creation failed; purchases left pending");
                return Err(err.into());
            }
        };

        let purchase_ids = metadata.purchase_ids();
        self.store.attach_session(&purchase_ids, &session.id).await?;

        info!(
            session_id = %session.id,
            purchases = purchase_ids.len(),
            original_total,
            final_total,
            "checkout session created"
        );

        Ok(CheckoutSessionCreated {
            session_id: session.id,
            url: session.url,
        })
    }

    fn return_urls(&self, target: ReturnTarget) -> (String, String) {
        let base = match target {
            ReturnTarget::Cart => format!("{}/cart", self.public_base_url),
            ReturnTarget::Sop(id) => format!("{}/sops/{id}", self.public_base_url),
        };
        (
            format!("{base}?payment=success&session_id={{CHECKOUT_SESSION_ID}}"),
            format!("{base}?payment=cancelled"),
        )
    }
}

/// Splits `total` across items in proportion to `prices`, rounding down; the last item takes
/// the remainder so the parts always sum to `total`.
pub fn allocate(total: i64, prices: &[i64]) -> Vec<i64> {
    let Some((_, head)) = prices.split_last() else {
        return Vec::new();
    };
    let sum: i128 = prices.iter().map(|&p| i128::from(p.max(0))).sum();
    if sum == 0 {
        let mut parts = vec![0; prices.len()];
        if let Some(last) = parts.last_mut() {
            *last = total;
        }
        return parts;
    }

    let mut parts: Vec<i64> = head
        .iter()
        .map(|&p| (i128::from(total) * i128::from(p.max(0)) / sum) as i64)
        .collect();
    let assigned: i64 = parts.iter().sum();
    parts.push(total - assigned);
    parts
}
