use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use url::Url;

use super::errors::{ProviderError, StripeErrorEnvelope, StripeErrorType};
use super::types::{CheckoutSession, CreateCheckoutSession};
use super::PaymentProvider;
use crate::config::AppConfig;

/// Minimal Stripe REST client. One attempt per call with a fixed timeout.
#[derive(Clone)]
pub struct StripeClient {
    http: Client,
    base_url: Url,
    secret_key: String,
    api_version: Option<String>,
}

impl std::fmt::Debug for StripeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeClient")
            .field("base_url", &self.base_url.as_str())
            .field("api_version", &self.api_version)
            .finish_non_exhaustive()
    }
}

impl StripeClient {
    pub fn new(
        secret_key: impl Into<String>,
        base_url: &str,
        timeout: Duration,
        api_version: Option<String>,
    ) -> Result<Self, ProviderError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ProviderError::Config(format!("invalid stripe_api_base: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ProviderError::Config(format!(
                "stripe_api_base `{base_url}` cannot be a base URL"
            )));
        }

        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("sop-marketplace/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProviderError::Config(e.to_string()))?;

        Ok(Self {
            http,
            base_url,
            secret_key: secret_key.into(),
            api_version: api_version.filter(|v| !v.trim().is_empty()),
        })
    }

    pub fn from_config(cfg: &AppConfig) -> Result<Self, ProviderError> {
        Self::new(
            cfg.stripe_secret_key.clone(),
            &cfg.stripe_api_base,
            cfg.stripe_timeout(),
            cfg.stripe_api_version.clone(),
        )
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        let req = req.bearer_auth(&self.secret_key);
        match &self.api_version {
            Some(version) => req.header("Stripe-Version", version),
            None => req,
        }
    }

    async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, ProviderError> {
        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<T>()
                .await
                .map_err(|e| ProviderError::Decode(e.to_string()));
        }

        let body = resp.text().await.unwrap_or_default();
        let err = match serde_json::from_str::<StripeErrorEnvelope>(&body) {
            Ok(envelope) => envelope.into_provider_error(status.as_u16()),
            Err(_) => ProviderError::Stripe {
                kind: StripeErrorType::Unknown,
                message: Some(body),
                code: None,
                status: status.as_u16(),
            },
        };
        warn!(status = status.as_u16(), error = %err, "stripe request failed");
        Err(err)
    }
}

#[async_trait]
impl PaymentProvider for StripeClient {
    #[instrument(skip(self))]
    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<CheckoutSession, ProviderError> {
        let url = self.endpoint(&["v1", "checkout", "sessions", session_id]);
        debug!(%url, "retrieving checkout session");
        let resp = self.authorized(self.http.get(url)).send().await?;
        Self::decode(resp).await
    }

    #[instrument(skip(self, request), fields(items = request.line_items.len()))]
    async fn create_checkout_session(
        &self,
        request: &CreateCheckoutSession,
    ) -> Result<CheckoutSession, ProviderError> {
        let url = self.endpoint(&["v1", "checkout", "sessions"]);
        let resp = self
            .authorized(self.http.post(url))
            .form(&request.form_params())
            .send()
            .await?;
        Self::decode(resp).await
    }
}
