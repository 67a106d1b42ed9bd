//! Session handlers

use axum::{
    extract::{Path, Query, State},
    Json,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::engine::{CreateSessionRequest, FundingAck};
use crate::error::{api_error, ApiError};
use crate::types::{Session, Transaction};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub session_id: Uuid,
    pub wallet_address: String,
    pub min_funding_amount: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct ListSessionsQuery {
    /// Only non-terminal sessions
    #[serde(default)]
    pub active: bool,
}

#[derive(Debug, Serialize)]
pub struct ListSessionsResponse {
    pub sessions: Vec<Session>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct ListTransactionsResponse {
    pub session_id: Uuid,
    pub transactions: Vec<Transaction>,
    pub total: usize,
}

#[derive(Debug, Deserialize)]
pub struct FundSessionRequest {
    pub amount: Decimal,
}

/// POST /sessions - Provision a wallet and start watching it
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    state.cost.ensure_within_limits().await.map_err(api_error)?;
    let session = state.manager.create_session(req).await.map_err(api_error)?;
    info!(session_id = %session.id, "Session created for {}", session.token_address);

    Ok(Json(CreateSessionResponse {
        session_id: session.id,
        wallet_address: session.wallet_address,
        min_funding_amount: state.manager.settings().funding.min_funding_sol,
    }))
}

/// GET /sessions
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListSessionsQuery>,
) -> Json<ListSessionsResponse> {
    let sessions = if query.active {
        state.manager.list_active_sessions()
    } else {
        state.manager.list_sessions()
    };
    let total = sessions.len();
    Json(ListSessionsResponse { sessions, total })
}

/// GET /sessions/{id}
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Session>, ApiError> {
    state.manager.get_session(id).map(Json).map_err(api_error)
}

/// GET /sessions/{id}/transactions
pub async fn list_transactions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ListTransactionsResponse>, ApiError> {
    let transactions = state.manager.session_transactions(id).map_err(api_error)?;
    let total = transactions.len();
    Ok(Json(ListTransactionsResponse {
        session_id: id,
        transactions,
        total,
    }))
}

/// POST /sessions/{id}/fund
pub async fn fund_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<FundSessionRequest>,
) -> Result<Json<FundingAck>, ApiError> {
    state
        .manager
        .fund_session(id, req.amount)
        .await
        .map(Json)
        .map_err(api_error)
}

/// POST /sessions/{id}/stop
pub async fn stop_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Session>, ApiError> {
    state.manager.stop_session(id).map(Json).map_err(api_error)
}
