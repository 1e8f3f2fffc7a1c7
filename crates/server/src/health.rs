use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use ichigo_db::DbPool;
use serde::Serialize;
use tracing::{error, info};

/// Set while the long-polling runner is alive.
#[derive(Clone, Debug, Default)]
pub struct PollingFlag(Arc<AtomicBool>);

impl PollingFlag {
    pub fn set(&self, running: bool) {
        self.0.store(running, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    polling: PollingFlag,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: HealthCheck,
    pub telegram: HealthCheck,
    pub checked_at: String,
}

pub fn router(db_pool: DbPool, polling: PollingFlag) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { db_pool, polling })
}

pub async fn spawn(
    bind_address: &str,
    port: u16,
    db_pool: DbPool,
    polling: PollingFlag,
) -> std::io::Result<()> {
    let address = format!("{bind_address}:{port}");
    let listener = tokio::net::TcpListener::bind(&address).await?;

    info!(event_name = "system.health.start", bind_address = %address, "health endpoint started");

    tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, router(db_pool, polling)).await {
            error!(
                event_name = "system.health.error",
                error = %error,
                "health endpoint server terminated unexpectedly"
            );
        }
    });

    Ok(())
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let telegram = if state.polling.is_running() {
        HealthCheck { status: "ready", detail: "long polling is running".to_string() }
    } else {
        HealthCheck { status: "degraded", detail: "long polling is not running".to_string() }
    };
    let ready = database.status == "ready" && telegram.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        database,
        telegram,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await {
        Ok(_) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}
