pub mod checkout;
pub mod payments;
pub mod promo_codes;
pub mod purchases;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::repositories::{PurchaseStore, SeaOrmPurchaseStore};
use crate::services::{
    checkout::CheckoutService, payments::PaymentsService, promotions::PromotionService,
    reconciliation::CompletionReconciler, webhooks::WebhookProcessor,
};
use crate::stripe::PaymentProvider;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub checkout: Arc<CheckoutService>,
    pub payments: Arc<PaymentsService>,
    pub promotions: Arc<PromotionService>,
    pub webhooks: Arc<WebhookProcessor>,
}

impl AppServices {
    /// Wires every service over one store and one payment provider.
    pub fn new(
        db_pool: Arc<DbPool>,
        provider: Arc<dyn PaymentProvider>,
        config: &AppConfig,
    ) -> Self {
        let store: Arc<dyn PurchaseStore> = Arc::new(SeaOrmPurchaseStore::new(db_pool.clone()));
        let reconciler = CompletionReconciler::new(store.clone());
        let promotions = PromotionService::new(db_pool);

        let checkout = Arc::new(CheckoutService::new(
            store.clone(),
            provider.clone(),
            promotions.clone(),
            config.currency.clone(),
            config.public_base_url.clone(),
        ));
        let payments = Arc::new(PaymentsService::new(
            provider,
            store,
            reconciler.clone(),
            config.pending_sweep_limit,
        ));
        let webhooks = Arc::new(WebhookProcessor::new(
            reconciler,
            config.webhook_secret().map(str::to_string),
            config.stripe_webhook_tolerance_secs,
        ));

        Self {
            checkout,
            payments,
            promotions: Arc::new(promotions),
            webhooks,
        }
    }
}
