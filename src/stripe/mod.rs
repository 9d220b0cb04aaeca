//! Payment provider boundary: the [`PaymentProvider`] seam, the Stripe REST client behind it
//! and webhook signature verification.

use async_trait::async_trait;

pub mod client;
pub mod errors;
pub mod types;
pub mod webhook;

pub use client::StripeClient;
pub use errors::{ProviderError, StripeErrorType, WebhookError};
pub use types::{
    CheckoutLineItem, CheckoutSession, CreateCheckoutSession, PaymentIntent, PaymentStatus,
    StripeEvent,
};

/// Checkout operations the service needs from a payment provider.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<CheckoutSession, ProviderError>;

    async fn create_checkout_session(
        &self,
        request: &CreateCheckoutSession,
    ) -> Result<CheckoutSession, ProviderError>;
}
