use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use thiserror::Error;

use crate::errors::ErrorResponse;

/// Stripe's `error.type` values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StripeErrorType {
    ApiConnectionError,
    ApiError,
    AuthenticationError,
    CardError,
    IdempotencyError,
    InvalidRequestError,
    RateLimitError,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub struct StripeErrorEnvelope {
    pub error: StripeErrorBody,
}

#[derive(Debug, Deserialize)]
pub struct StripeErrorBody {
    #[serde(rename = "type")]
    pub kind: StripeErrorType,
    pub message: Option<String>,
    pub code: Option<String>,
}

impl StripeErrorEnvelope {
    pub fn into_provider_error(self, status: u16) -> ProviderError {
        ProviderError::Stripe {
            kind: self.error.kind,
            message: self.error.message,
            code: self.error.code,
            status,
        }
    }
}

/// Failures talking to the payment provider. Never retried here; callers decide.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("http error: {0}")]
    Http(String),
    #[error("request timed out")]
    Timeout,
    #[error("could not decode provider response: {0}")]
    Decode(String),
    #[error("stripe {kind:?} (status {status}): {}", .message.as_deref().unwrap_or("no message"))]
    Stripe {
        kind: StripeErrorType,
        message: Option<String>,
        code: Option<String>,
        status: u16,
    },
    #[error("payment provider misconfigured: {0}")]
    Config(String),
}

impl ProviderError {
    /// Network trouble, rate limiting or a 5xx; worth another attempt later.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Http(_) | ProviderError::Timeout => true,
            ProviderError::Stripe { kind, status, .. } => {
                (500..600).contains(status)
                    || matches!(
                        kind,
                        StripeErrorType::ApiConnectionError
                            | StripeErrorType::ApiError
                            | StripeErrorType::RateLimitError
                    )
            }
            ProviderError::Decode(_) | ProviderError::Config(_) => false,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if err.is_decode() {
            ProviderError::Decode(err.to_string())
        } else {
            ProviderError::Http(err.to_string())
        }
    }
}

/// Webhook rejection reasons. Anything but a missing server secret is the sender's fault.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WebhookError {
    #[error("webhook secret is not configured")]
    MissingSecret,
    #[error("missing Stripe-Signature header")]
    MissingSignature,
    #[error("malformed Stripe-Signature header: {0}")]
    MalformedHeader(String),
    #[error("signature timestamp outside tolerance")]
    TimestampOutOfTolerance,
    #[error("no signature matches the payload")]
    SignatureMismatch,
    #[error("malformed event payload: {0}")]
    MalformedPayload(String),
}

impl WebhookError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            WebhookError::MissingSecret => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            WebhookError::MissingSecret => "WEBHOOK_SECRET_MISSING",
            WebhookError::MissingSignature => "SIGNATURE_MISSING",
            WebhookError::MalformedHeader(_) => "SIGNATURE_MALFORMED",
            WebhookError::TimestampOutOfTolerance => "SIGNATURE_EXPIRED",
            WebhookError::SignatureMismatch => "SIGNATURE_INVALID",
            WebhookError::MalformedPayload(_) => "PAYLOAD_INVALID",
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "webhook rejected");
        } else {
            tracing::warn!(error = %self, "webhook rejected");
        }

        let body = ErrorResponse::new(status, self.to_string(), Some(self.code().to_string()));
        (status, Json(body)).into_response()
    }
}
