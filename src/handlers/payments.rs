use axum::{
    body::Bytes,
    extract::{Json, Path, State},
    http::HeaderMap,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use crate::auth::AuthenticatedUser;
use crate::errors::ServiceError;
use crate::handlers::AppState;
use crate::services::payments::{CheckoutStatus, VerifyResult};
use crate::services::webhooks::WebhookAck;
use crate::stripe::{webhook::SIGNATURE_HEADER, WebhookError};

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
#[schema(example = json!({ "sessionId": "cs_test_a1b2c3" }))]
pub struct VerifyAndCompleteRequest {
    /// Checkout session id from the success redirect
    #[serde(default)]
    #[validate(length(min = 1, max = 255, message = "sessionId is required"))]
    pub session_id: String,
}

/// Complete the caller's checkout session if the provider reports it paid
#[utoipa::path(
    post,
    path = "/api/v1/payments/verify-and-complete",
    request_body = VerifyAndCompleteRequest,
    responses(
        (status = 200, description = "Verification result", body = VerifyResult),
        (status = 400, description = "Missing session id or malformed session metadata", body = crate::errors::ErrorResponse),
        (status = 401, description = "Not authenticated", body = crate::errors::ErrorResponse),
        (status = 403, description = "Session belongs to another buyer", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment provider unavailable", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Payments"
)]
pub async fn verify_and_complete(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(request): Json<VerifyAndCompleteRequest>,
) -> Result<Json<VerifyResult>, ServiceError> {
    request.validate()?;

    let result = state
        .services
        .payments
        .verify_and_complete(&request.session_id, user.user_id())
        .await?;
    Ok(Json(result))
}

/// Stripe webhook receiver
#[utoipa::path(
    post,
    path = "/api/v1/payments/webhook",
    request_body(content = String, description = "Raw Stripe event JSON", content_type = "application/json"),
    params(("Stripe-Signature" = String, Header, description = "Stripe webhook signature")),
    responses(
        (status = 200, description = "Event accepted", body = WebhookAck),
        (status = 400, description = "Signature or payload rejected", body = crate::errors::ErrorResponse),
        (status = 500, description = "Webhook secret not configured", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, WebhookError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let ack = state
        .services
        .webhooks
        .handle(&body, signature, Utc::now().timestamp())
        .await?;
    Ok(Json(ack))
}

/// Provider view of a checkout session, without side effects
#[utoipa::path(
    get,
    path = "/api/v1/payments/checkout-status/{session_id}",
    params(("session_id" = String, Path, description = "Checkout session id")),
    responses(
        (status = 200, description = "Session status", body = CheckoutStatus),
        (status = 502, description = "Payment provider unavailable", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn checkout_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<CheckoutStatus>, ServiceError> {
    let session_id = session_id.trim();
    if session_id.is_empty() {
        return Err(ServiceError::BadRequest("session id is required".to_string()));
    }
    let status = state.services.payments.checkout_status(session_id).await?;
    Ok(Json(status))
}

pub fn payment_routes() -> Router<AppState> {
    Router::new()
        .route("/verify-and-complete", post(verify_and_complete))
        .route("/webhook", post(stripe_webhook))
        .route("/checkout-status/:session_id", get(checkout_status))
}
