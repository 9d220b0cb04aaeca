use axum::{response::Json, routing::get, Router};
use utoipa::{
    openapi::security::{Http, HttpAuthScheme, SecurityScheme},
    Modify, OpenApi,
};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "SOP Marketplace API",
        version = "1.0.0",
        description = r#"
# SOP Marketplace Purchases API

Checkout, payment verification and revenue reconciliation for paid SOPs.

## Flow

1. `POST /api/v1/checkout/create-session` creates pending purchases and a hosted checkout session
2. The buyer pays on the provider's page
3. The purchase is completed by whichever arrives first:
   - the success redirect calling `POST /api/v1/payments/verify-and-complete`
   - the provider's `checkout.session.completed` webhook
   - a `POST /api/v1/purchases/check-pending` sweep

Completion is idempotent: each purchase is completed once and produces exactly one revenue record.

## Authentication

Bearer JWT in the `Authorization` header or the `session_token` cookie.
The webhook is authenticated by its `Stripe-Signature` header instead.

## Money

All amounts are integer minor units (cents).
        "#,
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "Checkout", description = "Checkout session creation"),
        (name = "Payments", description = "Payment verification and provider webhooks"),
        (name = "Purchases", description = "Purchase ownership and pending sweeps"),
        (name = "Promo Codes", description = "Promo code evaluation")
    ),
    paths(
        crate::handlers::checkout::create_session,

        crate::handlers::payments::verify_and_complete,
        crate::handlers::payments::stripe_webhook,
        crate::handlers::payments::checkout_status,

        crate::handlers::purchases::check_pending,
        crate::handlers::purchases::purchase_status,

        crate::handlers::promo_codes::validate_promo_code,
    ),
    components(
        schemas(
            // Requests
            crate::handlers::checkout::CreateSessionRequest,
            crate::handlers::payments::VerifyAndCompleteRequest,
            crate::handlers::promo_codes::ValidatePromoRequest,

            // Responses
            crate::services::checkout::CheckoutSessionCreated,
            crate::services::payments::VerifyResult,
            crate::services::payments::VerifyOutcome,
            crate::services::payments::CheckoutStatus,
            crate::services::payments::SweepReport,
            crate::services::webhooks::WebhookAck,
            crate::handlers::purchases::PurchaseStatusResponse,
            crate::handlers::promo_codes::PromoValidationResponse,
            crate::services::promotions::PromoRejection,
            crate::entities::DiscountType,
            crate::stripe::types::PaymentStatus,

            // Error types
            crate::errors::ErrorResponse
        )
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDocV1;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
            )
        }
    }
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDocV1::openapi())
}

/// Serves the generated document at `/api-docs/openapi.json`
pub fn openapi_routes<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().route("/api-docs/openapi.json", get(openapi_json))
}
