//! Process-wide bot controls
//!
//! `pause` and `start` only touch the manual hold on the maintenance lock;
//! holds from the cost monitor or a recovery stay in place.

use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{api_error, ApiError};
use crate::maintenance::MaintenanceSource;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct BotControlResponse {
    pub maintenance_mode: bool,
    pub message: String,
    pub active_sessions: usize,
}

#[derive(Debug, Deserialize)]
pub struct StopQuery {
    pub session_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub stopped: usize,
    pub session_id: Option<Uuid>,
}

fn control_response(state: &AppState) -> BotControlResponse {
    BotControlResponse {
        maintenance_mode: state.maintenance.is_active(),
        message: state.maintenance.message(),
        active_sessions: state.manager.store().active_count(),
    }
}

/// POST /bot/start - Lift the manual pause
pub async fn start(State(state): State<Arc<AppState>>) -> Result<Json<BotControlResponse>, ApiError> {
    let released = state
        .maintenance
        .release(MaintenanceSource::Manual)
        .await
        .map_err(api_error)?;
    if released {
        info!("Manual pause lifted");
    } else if state.maintenance.is_active() {
        warn!("Start requested while maintenance is held: {}", state.maintenance.message());
    }
    Ok(Json(control_response(&state)))
}

/// POST /bot/pause - Pause every running session until started again
pub async fn pause(State(state): State<Arc<AppState>>) -> Result<Json<BotControlResponse>, ApiError> {
    state
        .maintenance
        .engage(MaintenanceSource::Manual, "Paused by operator", false, true)
        .await
        .map_err(api_error)?;
    Ok(Json(control_response(&state)))
}

/// POST /bot/stop[?session_id=] - Stop one session or all of them
pub async fn stop(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StopQuery>,
) -> Result<Json<StopResponse>, ApiError> {
    let stopped = match query.session_id {
        Some(id) => {
            state.manager.stop_session(id).map_err(api_error)?;
            1
        }
        None => {
            let stopped = state.manager.stop_all();
            info!("Stopped {} sessions", stopped);
            stopped
        }
    };

    Ok(Json(StopResponse {
        stopped,
        session_id: query.session_id,
    }))
}
