//! Liveness and readiness probes.
//!
//! `/health` never touches the database. `/health/ready` answers 503 until the database
//! responds and every migration has been applied, since purchases cannot be reconciled
//! against a stale schema.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use sea_orm_migration::MigratorTrait;
use serde::Serialize;
use tracing::warn;

use crate::migrator::Migrator;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct Liveness {
    pub status: &'static str,
    pub version: &'static str,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct Readiness {
    pub status: &'static str,
    pub database: &'static str,
    /// Migrations not yet applied; absent when the database is down
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_migrations: Option<usize>,
}

impl Readiness {
    fn is_ready(&self) -> bool {
        self.status == "ready"
    }
}

async fn liveness() -> Json<Liveness> {
    Json(Liveness {
        status: "up",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

async fn probe(state: &AppState) -> Readiness {
    if let Err(err) = state.db.ping().await {
        warn!(error = %err, "database ping failed");
        return Readiness {
            status: "not_ready",
            database: "down",
            pending_migrations: None,
        };
    }

    match Migrator::get_pending_migrations(state.db.as_ref()).await {
        Ok(pending) => Readiness {
            status: if pending.is_empty() { "ready" } else { "not_ready" },
            database: "up",
            pending_migrations: Some(pending.len()),
        },
        Err(err) => {
            warn!(error = %err, "could not read migration status");
            Readiness {
                status: "not_ready",
                database: "up",
                pending_migrations: None,
            }
        }
    }
}

async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let report = probe(&state).await;
    let status = if report.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

pub fn health_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(liveness))
        .route("/ready", get(readiness))
}
