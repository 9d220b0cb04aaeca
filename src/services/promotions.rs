use crate::{
    entities::promo_code::{self, DiscountType, Entity as PromoCode},
    errors::ServiceError,
};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

/// Why a code was not applied. Checks run in declaration order and the first failure wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PromoRejection {
    NotFound,
    Inactive,
    Expired,
    NotYetActive,
    UsageLimitReached,
    BelowMinimum,
}

impl PromoRejection {
    pub fn message(self) -> &'static str {
        match self {
            Self::NotFound => "Invalid promo code",
            Self::Inactive => "This promo code is no longer active",
            Self::Expired => "This promo code has expired",
            Self::NotYetActive => "This promo code is not yet active",
            Self::UsageLimitReached => "This promo code has reached its usage limit",
            Self::BelowMinimum => "Cart total is below the minimum purchase for this promo code",
        }
    }
}

/// A discount that passed every check, in minor units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedDiscount {
    pub promo_code_id: Uuid,
    pub code: String,
    pub discount_type: DiscountType,
    pub discount_value: i64,
    pub discount_amount: i64,
    pub final_amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromoEvaluation {
    Valid(AppliedDiscount),
    Invalid(PromoRejection),
}

impl PromoEvaluation {
    pub fn is_valid(&self) -> bool {
        matches!(self, PromoEvaluation::Valid(_))
    }
}

/// Canonical form used for storage and lookup.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Evaluates a looked-up promo code against a cart total (minor units) at `now`.
pub fn evaluate(
    promo: Option<&promo_code::Model>,
    cart_total: i64,
    now: DateTime<Utc>,
) -> PromoEvaluation {
    let Some(promo) = promo else {
        return PromoEvaluation::Invalid(PromoRejection::NotFound);
    };

    if !promo.active {
        return PromoEvaluation::Invalid(PromoRejection::Inactive);
    }
    if promo.expires_at.is_some_and(|end| now > end) {
        return PromoEvaluation::Invalid(PromoRejection::Expired);
    }
    if promo.starts_at.is_some_and(|start| now < start) {
        return PromoEvaluation::Invalid(PromoRejection::NotYetActive);
    }
    if promo.max_uses.is_some_and(|max| promo.used_count >= max) {
        return PromoEvaluation::Invalid(PromoRejection::UsageLimitReached);
    }
    if promo.min_purchase.is_some_and(|min| cart_total < min) {
        return PromoEvaluation::Invalid(PromoRejection::BelowMinimum);
    }

    let discount_amount = discount_for(promo, cart_total);
    PromoEvaluation::Valid(AppliedDiscount {
        promo_code_id: promo.id,
        code: promo.code.clone(),
        discount_type: promo.discount_type,
        discount_value: promo.discount_value,
        discount_amount,
        final_amount: cart_total - discount_amount,
    })
}

/// Discount in minor units, always within `0..=cart_total`.
fn discount_for(promo: &promo_code::Model, cart_total: i64) -> i64 {
    let cart_total = cart_total.max(0);
    let raw = match promo.discount_type {
        DiscountType::Percentage => {
            // products beyond Decimal or i64 range only arise from rates far above 100%
            let saturated = if promo.discount_value < 0 { 0 } else { cart_total };
            let pct = Decimal::from(cart_total)
                .checked_mul(Decimal::from(promo.discount_value))
                .and_then(|product| product.checked_div(Decimal::ONE_HUNDRED))
                .and_then(|amount| {
                    amount
                        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
                        .to_i64()
                })
                .unwrap_or(saturated);
            match promo.max_discount {
                Some(cap) => pct.min(cap),
                None => pct,
            }
        }
        DiscountType::Fixed => promo.discount_value,
    };

    raw.clamp(0, cart_total)
}

#[derive(Clone)]
pub struct PromotionService {
    db: Arc<DatabaseConnection>,
}

impl PromotionService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Case-insensitive lookup
    pub async fn find_by_code(
        &self,
        code: &str,
    ) -> Result<Option<promo_code::Model>, ServiceError> {
        PromoCode::find()
            .filter(promo_code::Column::Code.eq(normalize_code(code)))
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)
    }

    #[instrument(skip(self))]
    pub async fn evaluate_code(
        &self,
        code: &str,
        cart_total: i64,
    ) -> Result<PromoEvaluation, ServiceError> {
        let promo = self.find_by_code(code).await?;
        let evaluation = evaluate(promo.as_ref(), cart_total, Utc::now());
        debug!(valid = evaluation.is_valid(), "promo code evaluated");
        Ok(evaluation)
    }
}
