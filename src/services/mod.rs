// Pure calculators
pub mod revenue_split;
pub mod session_metadata;

// Promo codes
pub mod promotions;

// Purchase lifecycle
pub mod checkout;
pub mod payments;
pub mod reconciliation;

// Provider push notifications
pub mod webhooks;
