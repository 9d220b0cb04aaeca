//! Fixed-percentage division of a sale between the platform and the seller.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::Serialize;

pub const PLATFORM_FEE_PERCENT: u32 = 30;
pub const SELLER_REVENUE_PERCENT: u32 = 70;

const _: () = assert!(PLATFORM_FEE_PERCENT + SELLER_REVENUE_PERCENT == 100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevenueSplit {
    pub platform_fee: i64,
    pub seller_revenue: i64,
}

/// Splits a gross amount given in minor units.
///
/// Each side is rounded to the nearest minor unit on its own, so the two parts may differ
/// from `gross` by one unit. That drift is accepted and must not be corrected here.
pub fn split(gross: i64) -> RevenueSplit {
    let gross = Decimal::from(gross);
    RevenueSplit {
        platform_fee: percent_of(gross, PLATFORM_FEE_PERCENT),
        seller_revenue: percent_of(gross, SELLER_REVENUE_PERCENT),
    }
}

fn percent_of(amount: Decimal, percent: u32) -> i64 {
    (amount * Decimal::from(percent) / dec!(100))
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .unwrap_or(0)
}
