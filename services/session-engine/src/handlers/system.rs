//! Governance status handlers

use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::alerting::AlertRecord;
use crate::cost::CostStatus;
use crate::maintenance::MaintenanceLock;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct MaintenanceStatusResponse {
    pub maintenance_mode: bool,
    pub message: String,
    pub lock: MaintenanceLock,
}

#[derive(Debug, Deserialize)]
pub struct AlertsQuery {
    #[serde(default = "default_alert_limit")]
    pub limit: usize,
}

fn default_alert_limit() -> usize {
    50
}

#[derive(Debug, Serialize)]
pub struct AlertsResponse {
    pub alerts: Vec<AlertRecord>,
    pub total: usize,
}

/// GET /maintenance-status
pub async fn maintenance_status(State(state): State<Arc<AppState>>) -> Json<MaintenanceStatusResponse> {
    let lock = state.maintenance.snapshot();
    Json(MaintenanceStatusResponse {
        maintenance_mode: lock.active,
        message: state.maintenance.message(),
        lock,
    })
}

/// GET /cost/status
pub async fn cost_status(State(state): State<Arc<AppState>>) -> Json<CostStatus> {
    Json(state.cost.get_status().await)
}

/// GET /alerts
pub async fn alerts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AlertsQuery>,
) -> Json<AlertsResponse> {
    let alerts = state.alerts.recent(query.limit).await;
    let total = alerts.len();
    Json(AlertsResponse { alerts, total })
}
