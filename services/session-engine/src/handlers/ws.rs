//! Real-time event channel

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::{api_error, ApiError};
use crate::events::{Subscription, Topic};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Restrict the stream to one session's events
    pub session_id: Option<Uuid>,
}

/// GET /ws[?session_id=]
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let topic = match query.session_id {
        Some(id) => {
            state.manager.get_session(id).map_err(api_error)?;
            Topic::Session(id)
        }
        None => Topic::AllSessions,
    };

    // Subscribe before upgrading so nothing published in between is missed
    let subscription = state.broadcaster.subscribe(topic);
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, subscription)))
}

async fn handle_socket(socket: WebSocket, mut subscription: Subscription) {
    let (mut sender, mut receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to serialize event: {}", e);
                    continue;
                }
            };

            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        // Topic closed (session finished): close the socket
        let _ = sender.send(Message::Close(None)).await;
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Close(_) => break,
            other => debug!("Ignoring client message: {:?}", other),
        }
    }

    send_task.abort();
    info!("WebSocket connection closed");
}
