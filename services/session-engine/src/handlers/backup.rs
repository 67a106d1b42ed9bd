//! Backup and recovery handlers

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::backup::{BackupMetadata, BackupReason, BackupStatus};
use crate::error::{api_error, ApiError};
use crate::recovery::{RecoverySession, RestoreFlags};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct ListBackupsResponse {
    pub backups: Vec<BackupMetadata>,
    pub total: usize,
}

/// Backup id, epoch milliseconds, or RFC 3339 timestamp
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum BackupReference {
    Millis(i64),
    Text(String),
}

impl BackupReference {
    fn as_reference(&self) -> String {
        match self {
            BackupReference::Millis(millis) => millis.to_string(),
            BackupReference::Text(text) => text.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct InitiateRecoveryRequest {
    pub backup_timestamp: BackupReference,
    #[serde(default)]
    pub restore_flags: RestoreFlags,
}

#[derive(Debug, Serialize)]
pub struct RecoveryStatusResponse {
    pub in_progress: bool,
    pub recovery: Option<RecoverySession>,
    pub history: Vec<RecoverySession>,
}

/// GET /backup/status
pub async fn status(State(state): State<Arc<AppState>>) -> Json<BackupStatus> {
    Json(state.backups.status().await)
}

/// GET /backup/list
pub async fn list(State(state): State<Arc<AppState>>) -> Json<ListBackupsResponse> {
    let backups = state.backups.list_backups().await;
    let total = backups.len();
    Json(ListBackupsResponse { backups, total })
}

/// POST /backup/create - Full backup on demand
pub async fn create(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<BackupMetadata>), ApiError> {
    let metadata = state
        .backups
        .create_backup(BackupReason::OnDemand)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(metadata)))
}

/// POST /recovery/initiate
pub async fn initiate_recovery(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InitiateRecoveryRequest>,
) -> Result<(StatusCode, Json<RecoverySession>), ApiError> {
    let recovery = state
        .recovery
        .initiate_recovery(&req.backup_timestamp.as_reference(), req.restore_flags)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::ACCEPTED, Json(recovery)))
}

/// GET /recovery/status
pub async fn recovery_status(State(state): State<Arc<AppState>>) -> Json<RecoveryStatusResponse> {
    Json(RecoveryStatusResponse {
        in_progress: state.recovery.is_in_progress(),
        recovery: state.recovery.status(),
        history: state.recovery.history(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_accepts_millis_and_text() {
        let req: InitiateRecoveryRequest =
            serde_json::from_str(r#"{"backup_timestamp": 1718000000000}"#).unwrap();
        assert_eq!(req.backup_timestamp.as_reference(), "1718000000000");
        assert_eq!(req.restore_flags, RestoreFlags::default());

        let req: InitiateRecoveryRequest = serde_json::from_str(
            r#"{"backup_timestamp": "backup-1718000000000-full", "restore_flags": {"sessions": false}}"#,
        )
        .unwrap();
        assert_eq!(req.backup_timestamp.as_reference(), "backup-1718000000000-full");
        assert!(!req.restore_flags.sessions);
        assert!(req.restore_flags.transactions);
    }
}
