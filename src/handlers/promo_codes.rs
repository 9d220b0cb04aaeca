use axum::{
    extract::{Json, State},
    routing::post,
    Router,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use crate::entities::DiscountType;
use crate::errors::ServiceError;
use crate::handlers::AppState;
use crate::services::promotions::{PromoEvaluation, PromoRejection};

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
#[schema(example = json!({ "code": "LAUNCH20", "totalAmount": 4999 }))]
pub struct ValidatePromoRequest {
    #[serde(default)]
    #[validate(length(min = 1, max = 64, message = "code is required"))]
    pub code: String,
    /// Cart total in minor units
    #[validate(range(min = 1, message = "totalAmount must be positive"))]
    pub total_amount: i64,
}

#[derive(Debug, Default, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PromoValidationResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discount_type: Option<DiscountType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discount_value: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discount_amount: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_amount: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<PromoRejection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<PromoEvaluation> for PromoValidationResponse {
    fn from(evaluation: PromoEvaluation) -> Self {
        match evaluation {
            PromoEvaluation::Valid(applied) => Self {
                valid: true,
                code: Some(applied.code),
                discount_type: Some(applied.discount_type),
                discount_value: Some(applied.discount_value),
                discount_amount: Some(applied.discount_amount),
                final_amount: Some(applied.final_amount),
                ..Default::default()
            },
            PromoEvaluation::Invalid(reason) => Self {
                valid: false,
                reason: Some(reason),
                message: Some(reason.message().to_string()),
                ..Default::default()
            },
        }
    }
}

/// Check a promo code against a cart total
#[utoipa::path(
    post,
    path = "/api/v1/promo-codes/validate",
    request_body = ValidatePromoRequest,
    responses(
        (status = 200, description = "Evaluation result, valid or not", body = PromoValidationResponse),
        (status = 400, description = "Missing code or non-positive total", body = crate::errors::ErrorResponse)
    ),
    tag = "Promo Codes"
)]
pub async fn validate_promo_code(
    State(state): State<AppState>,
    Json(request): Json<ValidatePromoRequest>,
) -> Result<Json<PromoValidationResponse>, ServiceError> {
    request.validate()?;
    if request.code.trim().is_empty() {
        return Err(ServiceError::ValidationError("code is required".to_string()));
    }

    let evaluation = state
        .services
        .promotions
        .evaluate_code(&request.code, request.total_amount)
        .await?;
    Ok(Json(evaluation.into()))
}

pub fn promo_code_routes() -> Router<AppState> {
    Router::new().route("/validate", post(validate_promo_code))
}
