use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tokio::signal;
use tracing::{error, info, warn};

use sop_marketplace as api;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = api::config::load_config()?;
    api::config::init_tracing(cfg.log_level(), cfg.log_json);

    // Init DB
    let db_pool = api::db::connect(&cfg)
        .await
        .context("failed to connect to the database")?;
    if cfg.auto_migrate {
        api::db::migrate(&db_pool)
            .await
            .context("failed to apply migrations")?;
    }
    let db_arc = Arc::new(db_pool);

    // Payment provider
    let provider: Arc<dyn api::stripe::PaymentProvider> = Arc::new(
        api::stripe::StripeClient::from_config(&cfg).context("failed to create Stripe client")?,
    );
    if cfg.webhook_secret().is_none() {
        warn!("Stripe webhook secret not configured; webhook deliveries will be rejected");
    }

    // Caller identity
    let identity: Arc<dyn api::auth::IdentityResolver> = Arc::new(
        api::auth::JwtIdentityResolver::new(&cfg.jwt_secret, cfg.jwt_issuer.clone()),
    );

    // Compose shared app state
    let app_state = api::AppState::new(db_arc, cfg.clone(), identity, provider);
    let app = api::build_router(app_state);

    // Bind and serve
    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", cfg.host, cfg.port))?;
    info!("sop-marketplace listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
