use axum::{
    extract::{Json, State},
    routing::post,
    Router,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::auth::AuthenticatedUser;
use crate::errors::ServiceError;
use crate::handlers::AppState;
use crate::services::checkout::{CheckoutSessionCreated, ReturnTarget};

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
#[schema(example = json!({
    "sopIds": ["550e8400-e29b-41d4-a716-446655440000"],
    "promoCode": "LAUNCH20"
}))]
pub struct CreateSessionRequest {
    /// SOPs in the cart
    #[validate(length(max = 50))]
    pub sop_ids: Option<Vec<Uuid>>,
    /// Single-item checkout from a SOP page
    pub sop_id: Option<Uuid>,
    #[validate(length(max = 64))]
    pub promo_code: Option<String>,
}

/// Create pending purchases and a hosted checkout session
#[utoipa::path(
    post,
    path = "/api/v1/checkout/create-session",
    request_body = CreateSessionRequest,
    responses(
        (status = 200, description = "Checkout session created", body = CheckoutSessionCreated),
        (status = 400, description = "Nothing payable, already owned or invalid promo code", body = crate::errors::ErrorResponse),
        (status = 401, description = "Not authenticated", body = crate::errors::ErrorResponse),
        (status = 404, description = "No SOPs found", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment provider unavailable", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Checkout"
)]
pub async fn create_session(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<CheckoutSessionCreated>, ServiceError> {
    request.validate()?;

    let (sop_ids, return_to) = match (request.sop_ids, request.sop_id) {
        (Some(ids), _) => (ids, ReturnTarget::Cart),
        (None, Some(id)) => (vec![id], ReturnTarget::Sop(id)),
        (None, None) => {
            return Err(ServiceError::BadRequest(
                "sopId or sopIds is required".to_string(),
            ))
        }
    };

    let created = state
        .services
        .checkout
        .create_session(
            user.user_id(),
            &sop_ids,
            request.promo_code.as_deref(),
            return_to,
        )
        .await?;
    Ok(Json(created))
}

pub fn checkout_routes() -> Router<AppState> {
    Router::new().route("/create-session", post(create_session))
}
