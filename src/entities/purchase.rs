use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Purchase lifecycle. `Completed` and `Failed` are terminal.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    ToSchema,
    strum::Display,
    strum::AsRefStr,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PurchaseStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "failed")]
    Failed,
}

impl PurchaseStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, PurchaseStatus::Pending)
    }
}

/// One attempted acquisition of one SOP by one buyer within one checkout session.
///
/// `platform_fee + seller_revenue` is fixed at creation and never recomputed.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "purchases")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub buyer_id: String,
    pub sop_id: Uuid,
    /// Gross charged, minor units
    pub amount: i64,
    pub platform_fee: i64,
    pub seller_revenue: i64,
    pub promo_code_id: Option<Uuid>,
    pub status: PurchaseStatus,
    pub stripe_session_id: Option<String>,
    pub stripe_payment_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::sop::Entity",
        from = "Column::SopId",
        to = "super::sop::Column::Id"
    )]
    Sop,
    #[sea_orm(
        belongs_to = "super::promo_code::Entity",
        from = "Column::PromoCodeId",
        to = "super::promo_code::Column::Id"
    )]
    PromoCode,
    #[sea_orm(has_one = "super::revenue::Entity")]
    Revenue,
}

impl Related<super::sop::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Sop.def()
    }
}

impl Related<super::promo_code::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PromoCode.def()
    }
}

impl Related<super::revenue::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Revenue.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
