pub mod promo_code;
pub mod purchase;
pub mod revenue;
pub mod sop;

pub use promo_code::{DiscountType, Entity as PromoCode};
pub use purchase::{Entity as Purchase, PurchaseStatus};
pub use revenue::{Entity as Revenue, RevenueStatus};
pub use sop::Entity as Sop;
