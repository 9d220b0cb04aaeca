//! Service configuration.
//!
//! Sources, later ones winning: built-in defaults, `config/default.toml`,
//! `config/{RUN_ENV}.toml`, then `APP__*` environment variables
//! (for example `APP__STRIPE_WEBHOOK_SECRET`).

use config::{builder::DefaultState, Config, ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

const CONFIG_DIR: &str = "config";
const DEFAULT_ENV: &str = "development";
const DEV_JWT_SECRET: &str = "sop_marketplace_development_only_secret_9f3k2L7q";

#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub database_url: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// `development`, `staging`, `production`, ...
    pub environment: String,

    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,
    /// Apply pending migrations at startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// Comma-separated list of allowed origins
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,
    /// Permissive CORS outside development
    #[serde(default)]
    pub cors_allow_any_origin: bool,
    #[serde(default)]
    pub cors_allow_credentials: bool,

    #[serde(default = "default_db_max_connections")]
    #[validate(range(min = 1, max = 200))]
    pub db_max_connections: u32,
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Whole-request timeout applied by the HTTP stack (seconds)
    #[serde(default = "default_request_timeout_secs")]
    #[validate(range(min = 1, max = 300))]
    pub request_timeout_secs: u64,

    /// HS256 secret shared with the session issuer
    #[validate(length(min = 32), custom = "validate_jwt_secret")]
    pub jwt_secret: String,
    /// Expected `iss` claim on session tokens
    #[serde(default = "default_jwt_issuer")]
    pub jwt_issuer: String,

    #[serde(default)]
    pub stripe_secret_key: String,
    /// Stripe REST base URL; pointed at a mock server in tests
    #[serde(default = "default_stripe_api_base")]
    #[validate(url)]
    pub stripe_api_base: String,
    /// Sent as `Stripe-Version` when set
    #[serde(default)]
    pub stripe_api_version: Option<String>,
    /// Per-call timeout for Stripe requests. Calls are never retried.
    #[serde(default = "default_stripe_timeout_secs")]
    #[validate(range(min = 1, max = 60))]
    pub stripe_timeout_secs: u64,
    /// Signing secret for `Stripe-Signature` verification
    #[serde(default)]
    pub stripe_webhook_secret: Option<String>,
    /// Accepted age of a webhook signature timestamp (seconds)
    #[serde(default = "default_webhook_tolerance_secs")]
    #[validate(range(min = 1, max = 3600))]
    pub stripe_webhook_tolerance_secs: u64,

    /// ISO 4217 code for checkout sessions
    #[serde(default = "default_currency")]
    #[validate(length(equal = 3))]
    pub currency: String,
    /// Max pending purchases re-verified per sweep call
    #[serde(default = "default_pending_sweep_limit")]
    #[validate(range(min = 1, max = 100))]
    pub pending_sweep_limit: u64,
    /// Origin the hosted checkout redirects buyers back to
    #[serde(default = "default_public_base_url")]
    #[validate(url)]
    pub public_base_url: String,
}

impl AppConfig {
    /// Configuration with defaults for everything but the given fields.
    pub fn new(
        database_url: String,
        jwt_secret: String,
        host: String,
        port: u16,
        environment: String,
    ) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            cors_allowed_origins: None,
            cors_allow_any_origin: false,
            cors_allow_credentials: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            jwt_secret,
            jwt_issuer: default_jwt_issuer(),
            stripe_secret_key: String::new(),
            stripe_api_base: default_stripe_api_base(),
            stripe_api_version: None,
            stripe_timeout_secs: default_stripe_timeout_secs(),
            stripe_webhook_secret: None,
            stripe_webhook_tolerance_secs: default_webhook_tolerance_secs(),
            currency: default_currency(),
            pending_sweep_limit: default_pending_sweep_limit(),
            public_base_url: default_public_base_url(),
        }
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    pub fn stripe_timeout(&self) -> Duration {
        Duration::from_secs(self.stripe_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Webhook secret, treating blank values as unset
    pub fn webhook_secret(&self) -> Option<&str> {
        self.stripe_webhook_secret
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn should_allow_permissive_cors(&self) -> bool {
        self.is_development() || self.cors_allow_any_origin
    }

    /// Checks that only make sense per environment: real Stripe credentials, a secure
    /// redirect origin and an explicit CORS policy once outside development.
    pub fn check_deployment(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        let mut reject = |field: &'static str, code: &'static str, message: &str| {
            let mut err = ValidationError::new(code);
            err.message = Some(message.to_string().into());
            errors.add(field, err);
        };

        let key = self.stripe_secret_key.trim();
        if !key.is_empty() && !(key.starts_with("sk_") || key.starts_with("rk_")) {
            reject(
                "stripe_secret_key",
                "stripe_key_format",
                "expected a secret (sk_) or restricted (rk_) key",
            );
        }
        if let Some(secret) = self.webhook_secret() {
            if !secret.starts_with("whsec_") {
                reject(
                    "stripe_webhook_secret",
                    "webhook_secret_format",
                    "expected a signing secret starting with whsec_",
                );
            }
        }

        if self.is_development() {
            return finish(errors);
        }

        if key.is_empty() {
            reject(
                "stripe_secret_key",
                "stripe_key_required",
                "set APP__STRIPE_SECRET_KEY outside development",
            );
        }
        if self.webhook_secret().is_none() {
            reject(
                "stripe_webhook_secret",
                "webhook_secret_required",
                "set APP__STRIPE_WEBHOOK_SECRET outside development",
            );
        }
        if self.jwt_secret.trim() == DEV_JWT_SECRET {
            reject(
                "jwt_secret",
                "jwt_secret_dev_default",
                "the bundled development JWT secret is not allowed here",
            );
        }
        if self.is_production() {
            if key.starts_with("sk_test_") || key.starts_with("rk_test_") {
                reject(
                    "stripe_secret_key",
                    "stripe_test_key_in_production",
                    "production must use a live Stripe key",
                );
            }
            if !self.public_base_url.starts_with("https://") {
                reject(
                    "public_base_url",
                    "insecure_redirect_origin",
                    "checkout redirects must use https in production",
                );
            }
        }
        let has_origins = self
            .cors_allowed_origins
            .as_deref()
            .is_some_and(|raw| raw.split(',').any(|o| !o.trim().is_empty()));
        if !has_origins && !self.cors_allow_any_origin {
            reject(
                "cors_allowed_origins",
                "cors_policy_required",
                "set APP__CORS_ALLOWED_ORIGINS or opt in with APP__CORS_ALLOW_ANY_ORIGIN=true",
            );
        }

        finish(errors)
    }
}

fn finish(errors: ValidationErrors) -> Result<(), ValidationErrors> {
    if errors.errors().is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("configuration could not be loaded: {0}")]
    Load(#[from] ConfigError),

    #[error("configuration is invalid: {0}")]
    Validation(#[from] ValidationErrors),
}

fn default_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_db_max_connections() -> u32 {
    16
}
fn default_db_min_connections() -> u32 {
    2
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_jwt_issuer() -> String {
    "sop-marketplace".to_string()
}
fn default_stripe_api_base() -> String {
    "https://api.stripe.com".to_string()
}
fn default_stripe_timeout_secs() -> u64 {
    10
}
fn default_webhook_tolerance_secs() -> u64 {
    300
}
fn default_currency() -> String {
    "usd".to_string()
}
fn default_pending_sweep_limit() -> u64 {
    10
}
fn default_public_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    level
        .parse::<tracing::Level>()
        .map(|_| ())
        .map_err(|_| ValidationError::new("log_level"))
}

fn validate_jwt_secret(secret: &str) -> Result<(), ValidationError> {
    let distinct: std::collections::BTreeSet<char> = secret.trim().chars().collect();
    if distinct.len() < 10 {
        let mut err = ValidationError::new("jwt_secret_entropy");
        err.message = Some("JWT secret needs at least 10 distinct characters".into());
        return Err(err);
    }
    Ok(())
}

/// Installs the global subscriber. `RUST_LOG` wins over `level` when set.
pub fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("sop_marketplace={level},tower_http=debug")));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    // a second call (tests, the migration binary) keeps the first subscriber
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

fn base_builder() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("database_url", "sqlite://sop_marketplace.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("environment", DEFAULT_ENV)
}

fn validated(config: Config) -> Result<AppConfig, AppConfigError> {
    let app_config: AppConfig = config.try_deserialize()?;
    app_config.validate()?;
    app_config.check_deployment()?;
    Ok(app_config)
}

/// Loads and validates configuration for the environment named by `RUN_ENV`.
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV").unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!(run_env = %run_env, "loading configuration");

    let config = base_builder()?
        .add_source(File::with_name(&format!("{CONFIG_DIR}/default")).required(false))
        .add_source(File::with_name(&format!("{CONFIG_DIR}/{run_env}")).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    validated(config).map_err(|err| {
        warn!(error = %err, "configuration rejected");
        err
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    const SECRET: &str = "k2P9x7QmZ4vB8nW1rT6yL3sD5fG0hJcA";

    fn from_toml(toml: &str) -> Result<AppConfig, AppConfigError> {
        let config = base_builder()?
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?;
        validated(config)
    }

    fn production() -> AppConfig {
        let mut cfg = AppConfig::new(
            "postgres://db/sops".into(),
            SECRET.into(),
            "0.0.0.0".into(),
            8080,
            "production".into(),
        );
        cfg.stripe_secret_key = "sk_live_51abc".into();
        cfg.stripe_webhook_secret = Some("whsec_abc".into());
        cfg.public_base_url = "https://sops.example.com".into();
        cfg.cors_allowed_origins = Some("https://sops.example.com".into());
        cfg
    }

    fn rejected_fields(cfg: &AppConfig) -> Vec<&'static str> {
        let mut fields: Vec<_> = cfg
            .check_deployment()
            .err()
            .map(|e| e.field_errors().keys().copied().collect())
            .unwrap_or_default();
        fields.sort_unstable();
        fields
    }

    #[test]
    fn development_toml_loads_with_defaults() {
        let cfg = from_toml(&format!("jwt_secret = \"{SECRET}\"")).unwrap();

        assert!(cfg.is_development());
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.currency, "usd");
        assert_eq!(cfg.pending_sweep_limit, 10);
        assert_eq!(cfg.stripe_webhook_tolerance_secs, 300);
        assert!(cfg.webhook_secret().is_none());
    }

    #[test]
    fn unknown_keys_and_bad_values_are_rejected() {
        let typo = from_toml(&format!("jwt_secret = \"{SECRET}\"\nstripe_timeout = 5"));
        assert!(matches!(typo, Err(AppConfigError::Load(_))));

        let sweep = from_toml(&format!("jwt_secret = \"{SECRET}\"\npending_sweep_limit = 0"));
        assert!(matches!(sweep, Err(AppConfigError::Validation(_))));

        let level = from_toml(&format!("jwt_secret = \"{SECRET}\"\nlog_level = \"loud\""));
        assert!(matches!(level, Err(AppConfigError::Validation(_))));

        let weak = from_toml(&format!("jwt_secret = \"{}\"", "a".repeat(40)));
        assert!(matches!(weak, Err(AppConfigError::Validation(_))));
    }

    #[test]
    fn production_ready_config_passes() {
        assert!(rejected_fields(&production()).is_empty());
    }

    #[test]
    fn production_needs_live_stripe_and_https() {
        let mut cfg = production();
        cfg.stripe_secret_key = "sk_test_51abc".into();
        cfg.public_base_url = "http://sops.example.com".into();

        assert_eq!(
            rejected_fields(&cfg),
            vec!["public_base_url", "stripe_secret_key"]
        );
    }

    #[test]
    fn staging_needs_secrets_and_a_cors_policy() {
        let mut cfg = production();
        cfg.environment = "staging".into();
        cfg.stripe_secret_key = "sk_test_51abc".into();
        assert!(rejected_fields(&cfg).is_empty());

        cfg.stripe_webhook_secret = Some("   ".into());
        cfg.cors_allowed_origins = None;
        assert_eq!(
            rejected_fields(&cfg),
            vec!["cors_allowed_origins", "stripe_webhook_secret"]
        );

        cfg.cors_allow_any_origin = true;
        assert_eq!(rejected_fields(&cfg), vec!["stripe_webhook_secret"]);
    }

    #[test]
    fn credential_formats_are_checked_everywhere() {
        let mut cfg = production();
        cfg.environment = "development".into();
        cfg.stripe_secret_key = "pk_live_publishable".into();
        cfg.stripe_webhook_secret = Some("not-a-signing-secret".into());

        assert_eq!(
            rejected_fields(&cfg),
            vec!["stripe_secret_key", "stripe_webhook_secret"]
        );
    }
}
