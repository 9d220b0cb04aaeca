use axum::{
    extract::{Json, Path, State},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::errors::ServiceError;
use crate::handlers::AppState;
use crate::services::payments::SweepReport;

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseStatusResponse {
    pub has_purchased: bool,
}

/// Re-verify the caller's pending purchases with the payment provider
#[utoipa::path(
    post,
    path = "/api/v1/purchases/check-pending",
    responses(
        (status = 200, description = "Sweep result", body = SweepReport),
        (status = 401, description = "Not authenticated", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Purchases"
)]
pub async fn check_pending(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<SweepReport>, ServiceError> {
    let report = state.services.payments.check_pending(user.user_id()).await?;
    Ok(Json(report))
}

/// Whether the caller owns a SOP; anonymous callers never do
#[utoipa::path(
    get,
    path = "/api/v1/sops/{id}/purchase-status",
    params(("id" = Uuid, Path, description = "SOP id")),
    responses(
        (status = 200, description = "Ownership", body = PurchaseStatusResponse)
    ),
    tag = "Purchases"
)]
pub async fn purchase_status(
    State(state): State<AppState>,
    user: Option<AuthenticatedUser>,
    Path(sop_id): Path<Uuid>,
) -> Result<Json<PurchaseStatusResponse>, ServiceError> {
    let has_purchased = match user {
        Some(user) => {
            state
                .services
                .payments
                .has_purchased(user.user_id(), sop_id)
                .await?
        }
        None => false,
    };
    Ok(Json(PurchaseStatusResponse { has_purchased }))
}

pub fn purchase_routes() -> Router<AppState> {
    Router::new().route("/check-pending", post(check_pending))
}

pub fn sop_routes() -> Router<AppState> {
    Router::new().route("/:id/purchase-status", get(purchase_status))
}
