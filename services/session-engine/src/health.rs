//! Health check endpoints for load balancers and monitoring

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::observability::MetricsSnapshot;
use crate::AppState;

/// Basic health check - fast, touches nothing
pub async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// Detailed health check with governance state and metrics
///
/// Reports `degraded` while the maintenance lock is engaged or a recovery
/// is running; it still answers 200 so dashboards can read the body.
pub async fn health_detail(State(state): State<Arc<AppState>>) -> Json<DetailedHealthResponse> {
    let mut checks = vec![];
    let mut all_ok = true;

    let lock = state.maintenance.snapshot();
    if lock.active {
        all_ok = false;
    }
    checks.push(HealthCheck {
        name: "maintenance".to_string(),
        status: if lock.active {
            format!("engaged: {}", state.maintenance.message())
        } else {
            "ok".to_string()
        },
    });

    let recovering = state.recovery.is_in_progress();
    if recovering {
        all_ok = false;
    }
    checks.push(HealthCheck {
        name: "recovery".to_string(),
        status: if recovering { "in_progress" } else { "idle" }.to_string(),
    });

    let cost = state.cost.get_status().await;
    checks.push(HealthCheck {
        name: "cost".to_string(),
        status: if cost.within_limits { "ok" } else { "ceiling_reached" }.to_string(),
    });

    let metrics = state.metrics.snapshot().await;

    Json(DetailedHealthResponse {
        status: if all_ok { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_sessions: state.manager.store().active_count(),
        event_subscribers: state.broadcaster.subscriber_count(),
        checks,
        metrics,
    })
}

#[derive(Serialize)]
pub struct DetailedHealthResponse {
    pub status: String,
    pub version: String,
    pub active_sessions: usize,
    pub event_subscribers: usize,
    pub checks: Vec<HealthCheck>,
    pub metrics: MetricsSnapshot,
}

#[derive(Serialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: String,
}
