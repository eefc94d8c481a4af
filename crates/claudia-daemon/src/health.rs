//! Health Endpoint
//!
//! Minimal HTTP surface on loopback: `/` and `/health` for liveness,
//! `/status` for component states, `/stats` for row counts.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::scheduler::Scheduler;
use crate::services::Services;

#[derive(Clone)]
pub struct HealthState {
    pub services: Arc<Services>,
    pub scheduler: Arc<Scheduler>,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/stats", get(stats))
        .with_state(state)
}

/// Bind and serve on localhost. Spawned as a background task; a bind
/// failure is logged, never fatal to the daemon.
pub async fn serve(state: HealthState, port: u16) {
    let addr = format!("127.0.0.1:{}", port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!("health server could not bind {}: {}", addr, e);
            return;
        }
    };
    info!("health server listening on {}", addr);
    if let Err(e) = axum::serve(listener, router(state)).await {
        warn!("health server stopped: {}", e);
    }
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "service": "claudia-memory",
    }))
}

async fn status(State(state): State<HealthState>) -> Json<Value> {
    let scheduler_ok = state.scheduler.is_running();

    // The embedding probe is blocking HTTP; keep it off the async workers
    let services = state.services.clone();
    let (database_ok, embeddings_ok) = tokio::task::spawn_blocking(move || {
        (
            services.store.count("memories").is_ok(),
            services.embeddings.is_available(),
        )
    })
    .await
    .unwrap_or((false, false));

    Json(json!({
        "status": if database_ok && scheduler_ok { "healthy" } else { "degraded" },
        "timestamp": Utc::now().to_rfc3339(),
        "components": {
            "database": if database_ok { "ok" } else { "error" },
            "embeddings": if embeddings_ok { "ok" } else { "unavailable" },
            "scheduler": if scheduler_ok { "running" } else { "stopped" },
        },
        "model_mismatch": state.services.store.model_mismatch(),
    }))
}

async fn stats(State(state): State<HealthState>) -> Json<Value> {
    let count = |table: &str| state.services.store.count(table).unwrap_or(0);

    let active_patterns: i64 = state
        .services
        .store
        .read(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM patterns WHERE is_active = 1",
                [],
                |row| row.get(0),
            )?)
        })
        .unwrap_or(0);
    let pending_predictions: i64 = state
        .services
        .store
        .read(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM predictions WHERE is_shown = 0",
                [],
                |row| row.get(0),
            )?)
        })
        .unwrap_or(0);

    Json(json!({
        "timestamp": Utc::now().to_rfc3339(),
        "counts": {
            "memories": count("memories"),
            "entities": count("entities"),
            "relationships": count("relationships"),
            "episodes": count("episodes"),
            "active_patterns": active_patterns,
            "pending_predictions": pending_predictions,
        },
    }))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::test_services;

    fn test_state() -> (HealthState, tempfile::TempDir) {
        let (services, dir) = test_services();
        let scheduler = Arc::new(Scheduler::new(services.clone(), dir.path().join("vault")));
        (
            HealthState {
                services,
                scheduler,
            },
            dir,
        )
    }

    #[tokio::test]
    async fn health_reports_service_name() {
        let response = health().await;
        assert_eq!(response.0["status"], "healthy");
        assert_eq!(response.0["service"], "claudia-memory");
    }

    #[tokio::test]
    async fn status_reports_components() {
        let (state, _dir) = test_state();
        let response = status(State(state)).await;
        assert_eq!(response.0["components"]["database"], "ok");
        assert_eq!(response.0["components"]["embeddings"], "unavailable");
        assert_eq!(response.0["components"]["scheduler"], "stopped");
        assert_eq!(response.0["model_mismatch"], false);
    }

    #[tokio::test]
    async fn stats_counts_rows() {
        let (state, _dir) = test_state();
        state
            .services
            .remember
            .remember_fact(claudia_core::remember::FactInput::new("stat me"))
            .unwrap();

        let response = stats(State(state)).await;
        assert_eq!(response.0["counts"]["memories"], 1);
        assert_eq!(response.0["counts"]["entities"], 0);
    }
}
