//! Engine error taxonomy

use axum::http::StatusCode;
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::types::SessionState;

/// Errors surfaced by the session engine and its collaborators
#[derive(Error, Debug)]
pub enum EngineError {
    // Caller input
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("Maintenance mode: {0}")]
    Maintenance(String),

    // Collaborator failures
    #[error("Transient infrastructure error: {0}")]
    TransientInfra(String),

    #[error("Trade rejected: {0}")]
    PersistentTrade(String),

    // State machine
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidTransition { from: SessionState, to: SessionState },

    // Backup and recovery
    #[error("Recovery step '{step}' failed: {reason}")]
    RecoveryStep { step: String, reason: String },

    #[error("Recovery {0} already in progress")]
    RecoveryInProgress(Uuid),

    #[error("Backup not found: {0}")]
    BackupNotFound(String),

    #[error("Backup integrity check failed: {0}")]
    BackupCorrupt(String),

    // Governance
    #[error("Daily cost ceiling exceeded: {current} >= {limit}")]
    CostCeilingExceeded { current: Decimal, limit: Decimal },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Error half of every handler's return type
pub type ApiError = (StatusCode, String);

/// Map an engine error onto its HTTP response
pub fn api_error(e: EngineError) -> ApiError {
    (e.status_code(), e.to_string())
}

impl EngineError {
    /// Whether a retry has a chance of succeeding
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::TransientInfra(_) => true,
            EngineError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            EngineError::Validation(_) | EngineError::InvalidTransition { .. } => {
                StatusCode::BAD_REQUEST
            }
            EngineError::SessionNotFound(_) | EngineError::BackupNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            EngineError::RecoveryInProgress(_) => StatusCode::CONFLICT,
            EngineError::Maintenance(_) | EngineError::CostCeilingExceeded { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            EngineError::TransientInfra(_)
            | EngineError::PersistentTrade(_)
            | EngineError::Http(_) => StatusCode::BAD_GATEWAY,
            EngineError::RecoveryStep { .. }
            | EngineError::BackupCorrupt(_)
            | EngineError::Io(_)
            | EngineError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(EngineError::TransientInfra("rpc timeout".into()).is_transient());
        assert!(!EngineError::PersistentTrade("slippage".into()).is_transient());
        assert!(!EngineError::Validation("bad mint".into()).is_transient());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            EngineError::Validation("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            EngineError::SessionNotFound(Uuid::nil()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            EngineError::RecoveryInProgress(Uuid::nil()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            EngineError::Maintenance("ceiling".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            EngineError::CostCeilingExceeded {
                current: Decimal::from(51),
                limit: Decimal::from(50),
            }
            .status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            EngineError::TransientInfra("rpc".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_transition_message() {
        let err = EngineError::InvalidTransition {
            from: SessionState::Completed,
            to: SessionState::Trading,
        };
        assert_eq!(
            err.to_string(),
            "Invalid state transition: from completed to trading"
        );
    }
}
