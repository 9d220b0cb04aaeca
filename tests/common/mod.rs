#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::Utc;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, Set};
use serde_json::Value;
use sop_marketplace::{
    auth::JwtIdentityResolver,
    config::AppConfig,
    db,
    entities::{promo_code, purchase, revenue, sop, DiscountType, PurchaseStatus},
    repositories::SeaOrmPurchaseStore,
    services::{
        reconciliation::CompletionReconciler,
        revenue_split::split,
        session_metadata::{LineItemRef, SessionMetadata},
    },
    stripe::{
        webhook::{signature_header, SIGNATURE_HEADER},
        CheckoutSession, CreateCheckoutSession, PaymentProvider, PaymentStatus, ProviderError,
        StripeErrorType,
    },
    AppState,
};
use tower::ServiceExt;
use uuid::Uuid;

pub const JWT_SECRET: &str = "test_secret_key_for_integration_runs_7Qx";
pub const WEBHOOK_SECRET: &str = "whsec_test_4fK9mZ2pL8sV1qR6";
pub const PUBLIC_BASE_URL: &str = "https://sops.example.test";

/// In-process stand-in for Stripe. Sessions live in a map keyed by id.
#[derive(Default)]
pub struct FakeProvider {
    sessions: Mutex<HashMap<String, CheckoutSession>>,
    created: Mutex<Vec<CreateCheckoutSession>>,
    unavailable: AtomicBool,
    retrievals: AtomicUsize,
    next_id: AtomicUsize,
}

impl FakeProvider {
    pub fn put_session(&self, session: CheckoutSession) {
        self.sessions
            .lock()
            .unwrap()
            .insert(session.id.clone(), session);
    }

    pub fn session(&self, id: &str) -> Option<CheckoutSession> {
        self.sessions.lock().unwrap().get(id).cloned()
    }

    /// Marks a stored session paid, as if the buyer finished the hosted page.
    pub fn mark_paid(&self, id: &str, payment_intent: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.get_mut(id).expect("unknown session");
        session.payment_status = PaymentStatus::Paid;
        session.status = Some("complete".to_string());
        session.payment_intent = Some(payment_intent.to_string());
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn created_requests(&self) -> Vec<CreateCheckoutSession> {
        self.created.lock().unwrap().clone()
    }

    pub fn retrievals(&self) -> usize {
        self.retrievals.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentProvider for FakeProvider {
    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<CheckoutSession, ProviderError> {
        self.retrievals.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ProviderError::Http("connection refused".to_string()));
        }
        self.session(session_id).ok_or_else(|| ProviderError::Stripe {
            kind: StripeErrorType::InvalidRequestError,
            message: Some(format!("No such checkout.session: '{session_id}'")),
            code: Some("resource_missing".to_string()),
            status: 404,
        })
    }

    async fn create_checkout_session(
        &self,
        request: &CreateCheckoutSession,
    ) -> Result<CheckoutSession, ProviderError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ProviderError::Timeout);
        }
        self.created.lock().unwrap().push(request.clone());

        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("cs_test_fake_{n}");
        let session = CheckoutSession {
            id: id.clone(),
            payment_status: PaymentStatus::Unpaid,
            status: Some("open".to_string()),
            payment_intent: None,
            metadata: request.metadata.clone(),
            url: Some(format!("https://checkout.stripe.test/pay/{id}")),
            amount_total: Some(request.line_items.iter().map(|i| i.unit_amount).sum()),
            currency: Some(request.currency.clone()),
        };
        self.put_session(session.clone());
        Ok(session)
    }
}

/// Helper harness for spinning up an application backed by an in-memory SQLite database.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub provider: Arc<FakeProvider>,
    identity: JwtIdentityResolver,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Construct a test application after adjusting the default test configuration.
    pub async fn with_config(configure: impl FnOnce(&mut AppConfig)) -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            JWT_SECRET.to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        // One connection keeps the in-memory database alive and shared.
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.cors_allow_any_origin = true;
        cfg.stripe_webhook_secret = Some(WEBHOOK_SECRET.to_string());
        cfg.public_base_url = PUBLIC_BASE_URL.to_string();
        configure(&mut cfg);

        let pool = db::connect(&cfg)
            .await
            .expect("failed to create test database");
        db::migrate(&pool)
            .await
            .expect("failed to run migrations in tests");

        let provider = Arc::new(FakeProvider::default());
        let identity = JwtIdentityResolver::new(JWT_SECRET, cfg.jwt_issuer.clone());
        let state = AppState::new(
            Arc::new(pool),
            cfg.clone(),
            Arc::new(identity.clone()),
            provider.clone(),
        );
        let router = sop_marketplace::build_router(state.clone());

        Self {
            router,
            state,
            provider,
            identity,
        }
    }

    /// Reconciler over the same database the router uses.
    pub fn reconciler(&self) -> CompletionReconciler {
        CompletionReconciler::new(Arc::new(SeaOrmPurchaseStore::new(self.state.db.clone())))
    }

    pub fn token_for(&self, user_id: &str) -> String {
        self.identity
            .issue_token(user_id, Duration::from_secs(3600))
            .expect("issue test token")
    }

    /// Send a request against the router with an optional bearer token.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);

        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Convenience helper for requests made as `user_id`.
    pub async fn request_as(
        &self,
        user_id: &str,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> Response {
        let token = self.token_for(user_id);
        self.request(method, uri, body, Some(&token)).await
    }

    /// Deliver a webhook with an arbitrary signature header (or none).
    pub async fn post_webhook_raw(&self, payload: Vec<u8>, signature: Option<&str>) -> Response {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/payments/webhook")
            .header("content-type", "application/json");
        if let Some(sig) = signature {
            builder = builder.header(SIGNATURE_HEADER, sig);
        }
        let request = builder
            .body(Body::from(payload))
            .expect("failed to build webhook request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during webhook request")
    }

    /// Deliver a correctly signed webhook event.
    pub async fn post_webhook(&self, event: &Value) -> Response {
        let payload = serde_json::to_vec(event).expect("serialize event");
        let header = signature_header(&payload, WEBHOOK_SECRET, Utc::now().timestamp())
            .expect("sign webhook payload");
        self.post_webhook_raw(payload, Some(&header)).await
    }

    pub async fn seed_sop(&self, author_id: &str, price: i64) -> sop::Model {
        let now = Utc::now();
        sop::ActiveModel {
            id: Set(Uuid::new_v4()),
            author_id: Set(author_id.to_string()),
            title: Set(format!("Procedure {}", &Uuid::new_v4().to_string()[..8])),
            price: Set(price),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed sop")
    }

    pub async fn seed_promo(
        &self,
        code: &str,
        discount_type: DiscountType,
        discount_value: i64,
        max_uses: Option<i32>,
        used_count: i32,
    ) -> promo_code::Model {
        let now = Utc::now();
        promo_code::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(code.to_uppercase()),
            active: Set(true),
            discount_type: Set(discount_type),
            discount_value: Set(discount_value),
            max_discount: Set(None),
            min_purchase: Set(None),
            max_uses: Set(max_uses),
            used_count: Set(used_count),
            starts_at: Set(None),
            expires_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed promo code")
    }

    /// A pending purchase of `sop` at list price, optionally already tied to a session.
    pub async fn seed_purchase(
        &self,
        buyer_id: &str,
        sop: &sop::Model,
        session_id: Option<&str>,
        promo_code_id: Option<Uuid>,
    ) -> purchase::Model {
        let now = Utc::now();
        let parts = split(sop.price);
        purchase::ActiveModel {
            id: Set(Uuid::new_v4()),
            buyer_id: Set(buyer_id.to_string()),
            sop_id: Set(sop.id),
            amount: Set(sop.price),
            platform_fee: Set(parts.platform_fee),
            seller_revenue: Set(parts.seller_revenue),
            promo_code_id: Set(promo_code_id),
            status: Set(PurchaseStatus::Pending),
            stripe_session_id: Set(session_id.map(str::to_string)),
            stripe_payment_id: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed purchase")
    }

    pub async fn set_purchase_status(&self, id: Uuid, status: PurchaseStatus) {
        let mut row: purchase::ActiveModel = self.purchase(id).await.into();
        row.status = Set(status);
        row.update(&*self.state.db)
            .await
            .expect("update purchase status");
    }

    pub async fn backdate_purchase(&self, id: Uuid, age: chrono::Duration) {
        let mut row: purchase::ActiveModel = self.purchase(id).await.into();
        row.created_at = Set(Utc::now() - age);
        row.update(&*self.state.db)
            .await
            .expect("backdate purchase");
    }

    pub async fn purchase(&self, id: Uuid) -> purchase::Model {
        purchase::Entity::find_by_id(id)
            .one(&*self.state.db)
            .await
            .expect("load purchase")
            .expect("purchase exists")
    }

    pub async fn purchases_for(&self, buyer_id: &str) -> Vec<purchase::Model> {
        purchase::Entity::find()
            .filter(purchase::Column::BuyerId.eq(buyer_id))
            .all(&*self.state.db)
            .await
            .expect("load purchases")
    }

    pub async fn promo(&self, id: Uuid) -> promo_code::Model {
        promo_code::Entity::find_by_id(id)
            .one(&*self.state.db)
            .await
            .expect("load promo code")
            .expect("promo code exists")
    }

    pub async fn revenue_count(&self) -> u64 {
        revenue::Entity::find()
            .count(&*self.state.db)
            .await
            .expect("count revenues")
    }

    pub async fn revenues_for(&self, purchase_id: Uuid) -> Vec<revenue::Model> {
        revenue::Entity::find()
            .filter(revenue::Column::PurchaseId.eq(purchase_id))
            .all(&*self.state.db)
            .await
            .expect("load revenues")
    }
}

pub fn metadata_for(buyer_id: &str, purchases: &[purchase::Model]) -> SessionMetadata {
    SessionMetadata::new(
        buyer_id,
        purchases
            .iter()
            .map(|p| LineItemRef {
                purchase_id: p.id,
                sop_id: p.sop_id,
            })
            .collect(),
    )
}

/// Provider-side view of a session referencing `purchases`.
pub fn checkout_session(
    id: &str,
    payment_status: PaymentStatus,
    buyer_id: &str,
    purchases: &[purchase::Model],
) -> CheckoutSession {
    CheckoutSession {
        id: id.to_string(),
        payment_status,
        status: Some(if payment_status.is_paid() { "complete" } else { "open" }.to_string()),
        payment_intent: payment_status.is_paid().then(|| format!("pi_{id}")),
        metadata: metadata_for(buyer_id, purchases).to_metadata(),
        url: None,
        amount_total: Some(purchases.iter().map(|p| p.amount).sum()),
        currency: Some("usd".to_string()),
    }
}

/// A Stripe event envelope around `object`.
pub fn stripe_event(event_type: &str, object: Value) -> Value {
    serde_json::json!({
        "id": format!("evt_{}", Uuid::new_v4().simple()),
        "object": "event",
        "type": event_type,
        "created": Utc::now().timestamp(),
        "livemode": false,
        "data": { "object": object }
    })
}

pub async fn read_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read response body");
    serde_json::from_slice(&bytes).expect("response body is json")
}
