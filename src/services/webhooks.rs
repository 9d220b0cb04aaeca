use metrics::counter;
use serde::Serialize;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;

use crate::services::reconciliation::{CompletionReconciler, CompletionReport, FailureReport};
use crate::services::session_metadata::{parse_purchase_ids, SessionMetadata};
use crate::stripe::types::{
    CHECKOUT_SESSION_ASYNC_PAYMENT_FAILED, CHECKOUT_SESSION_ASYNC_PAYMENT_SUCCEEDED,
    CHECKOUT_SESSION_COMPLETED, CHECKOUT_SESSION_EXPIRED, PAYMENT_INTENT_PAYMENT_FAILED,
};
use crate::stripe::{webhook, CheckoutSession, PaymentIntent, StripeEvent, WebhookError};

/// Body returned to Stripe once the signature checks out.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAck {
    pub received: bool,
    pub event_id: String,
    pub event_type: String,
}

/// What processing an event amounted to. Only used for logging; Stripe always gets a 200.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Completed(CompletionReport),
    Failed(FailureReport),
    /// Known event that needs no action, such as an unpaid `checkout.session.completed`
    NoAction,
    Unhandled,
    Error(String),
}

#[derive(Clone)]
pub struct WebhookProcessor {
    reconciler: CompletionReconciler,
    secret: Option<String>,
    tolerance_secs: u64,
}

impl WebhookProcessor {
    pub fn new(
        reconciler: CompletionReconciler,
        secret: Option<String>,
        tolerance_secs: u64,
    ) -> Self {
        Self {
            reconciler,
            secret: secret.filter(|s| !s.trim().is_empty()),
            tolerance_secs,
        }
    }

    /// Verifies and processes one delivery.
    ///
    /// Only signature and payload problems are returned as errors. Anything that goes wrong
    /// afterwards is logged and acknowledged so Stripe does not redeliver an event that will
    /// fail the same way again.
    #[instrument(skip_all)]
    pub async fn handle(
        &self,
        payload: &[u8],
        signature: Option<&str>,
        now: i64,
    ) -> Result<WebhookAck, WebhookError> {
        let event = self.verify(payload, signature, now).map_err(|err| {
            counter!("webhooks.stripe.rejected", 1);
            err
        })?;

        counter!("webhooks.stripe.received", 1, "event_type" => event.event_type.clone());
        info!(event_id = %event.id, event_type = %event.event_type, livemode = event.livemode, "stripe event received");

        match self.dispatch(&event).await {
            Disposition::Error(reason) => {
                error!(event_id = %event.id, event_type = %event.event_type, %reason, "stripe event processing failed; acknowledging anyway");
            }
            Disposition::Unhandled => {
                info!(event_type = %event.event_type, "unhandled stripe event type");
            }
            other => {
                info!(event_id = %event.id, outcome = ?other, "stripe event processed");
            }
        }

        Ok(WebhookAck {
            received: true,
            event_id: event.id,
            event_type: event.event_type,
        })
    }

    fn verify(
        &self,
        payload: &[u8],
        signature: Option<&str>,
        now: i64,
    ) -> Result<StripeEvent, WebhookError> {
        let secret = self.secret.as_deref().ok_or(WebhookError::MissingSecret)?;
        let signature = signature.ok_or(WebhookError::MissingSignature)?;
        webhook::construct_event(payload, signature, secret, self.tolerance_secs, now)
    }

    pub async fn dispatch(&self, event: &StripeEvent) -> Disposition {
        match event.event_type.as_str() {
            CHECKOUT_SESSION_COMPLETED => match decode::<CheckoutSession>(event) {
                Ok(session) if session.payment_status.is_paid() => self.complete(&session).await,
                Ok(session) => {
                    info!(session_id = %session.id, payment_status = ?session.payment_status, "checkout completed without payment yet");
                    Disposition::NoAction
                }
                Err(reason) => Disposition::Error(reason),
            },
            CHECKOUT_SESSION_ASYNC_PAYMENT_SUCCEEDED => match decode::<CheckoutSession>(event) {
                Ok(session) => self.complete(&session).await,
                Err(reason) => Disposition::Error(reason),
            },
            CHECKOUT_SESSION_ASYNC_PAYMENT_FAILED | CHECKOUT_SESSION_EXPIRED => {
                match decode::<CheckoutSession>(event) {
                    Ok(session) => self.fail(&session.metadata).await,
                    Err(reason) => Disposition::Error(reason),
                }
            }
            PAYMENT_INTENT_PAYMENT_FAILED => match decode::<PaymentIntent>(event) {
                Ok(intent) => self.fail(&intent.metadata).await,
                Err(reason) => Disposition::Error(reason),
            },
            _ => Disposition::Unhandled,
        }
    }

    async fn complete(&self, session: &CheckoutSession) -> Disposition {
        let metadata = match SessionMetadata::parse(&session.metadata) {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(session_id = %session.id, error = %err, "checkout session metadata unusable");
                return Disposition::Error(err.to_string());
            }
        };

        // Signed provider metadata is trusted as-is; no caller identity to check.
        match self
            .reconciler
            .complete_session(&metadata, session.payment_intent.as_deref(), None)
            .await
        {
            Ok(report) => Disposition::Completed(report),
            Err(err) => Disposition::Error(err.to_string()),
        }
    }

    async fn fail(&self, metadata: &std::collections::HashMap<String, String>) -> Disposition {
        let purchase_ids = match parse_purchase_ids(metadata) {
            Ok(ids) => ids,
            Err(err) => return Disposition::Error(err.to_string()),
        };
        match self.reconciler.fail_session(&purchase_ids).await {
            Ok(report) => Disposition::Failed(report),
            Err(err) => Disposition::Error(err.to_string()),
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(event: &StripeEvent) -> Result<T, String> {
    serde_json::from_value(event.data.object.clone())
        .map_err(|e| format!("unexpected {} payload: {e}", event.event_type))
}
