//! Connection pool and schema setup for the purchase ledger.

use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::migrator::Migrator;
use metrics::gauge;
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;
use std::time::Duration;
use tracing::{debug, info, warn};

pub type DbPool = DatabaseConnection;

/// Pool sizing and timeouts taken from [`AppConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl PoolSettings {
    pub fn for_url(cfg: &AppConfig, url: &str) -> Self {
        let mut settings = Self {
            max_connections: cfg.db_max_connections.max(1),
            min_connections: cfg.db_min_connections.min(cfg.db_max_connections.max(1)),
            connect_timeout: Duration::from_secs(cfg.db_connect_timeout_secs),
            idle_timeout: Duration::from_secs(cfg.db_idle_timeout_secs),
            acquire_timeout: Duration::from_secs(cfg.db_acquire_timeout_secs),
        };

        // every connection to `:memory:` opens its own empty database
        if is_in_memory_sqlite(url) && settings.max_connections != 1 {
            warn!(
                configured = settings.max_connections,
                "in-memory sqlite limited to a single connection"
            );
            settings.max_connections = 1;
            settings.min_connections = 1;
        }
        settings
    }

    fn apply(&self, opts: &mut ConnectOptions) {
        opts.max_connections(self.max_connections)
            .min_connections(self.min_connections)
            .connect_timeout(self.connect_timeout)
            .acquire_timeout(self.acquire_timeout)
            .idle_timeout(self.idle_timeout);
    }
}

/// Backend name for logs, derived from the URL scheme.
pub fn backend_name(url: &str) -> &'static str {
    match url.split(':').next().unwrap_or_default() {
        "postgres" | "postgresql" => "postgres",
        "sqlite" => "sqlite",
        _ => "unknown",
    }
}

fn is_in_memory_sqlite(url: &str) -> bool {
    backend_name(url) == "sqlite" && url.contains(":memory:")
}

/// Opens the pool described by the application config.
pub async fn connect(cfg: &AppConfig) -> Result<DbPool, ServiceError> {
    let url = cfg.database_url();
    let settings = PoolSettings::for_url(cfg, url);

    let mut opts = ConnectOptions::new(url.to_string());
    settings.apply(&mut opts);
    opts.sqlx_logging(cfg.is_development());

    gauge!("db.pool.max_connections", f64::from(settings.max_connections));

    let pool = Database::connect(opts).await?;
    info!(
        backend = backend_name(url),
        max_connections = settings.max_connections,
        "database pool ready"
    );
    Ok(pool)
}

/// Applies pending migrations; a no-op when the schema is current.
pub async fn migrate(pool: &DbPool) -> Result<(), ServiceError> {
    let pending = Migrator::get_pending_migrations(pool).await?.len();
    if pending == 0 {
        debug!("schema up to date");
        return Ok(());
    }

    info!(pending, "applying schema migrations");
    Migrator::up(pool, None).await?;
    Ok(())
}
