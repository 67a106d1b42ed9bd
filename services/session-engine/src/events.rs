//! Event broadcaster - fan-out of session and trade events
//!
//! Each topic is a `tokio::sync::broadcast` channel: publishing never waits
//! on subscribers, and a subscriber that falls behind loses its oldest
//! buffered events instead of stalling producers.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::{Session, SessionState, TradeDirection};

/// Events delivered over the real-time channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// One per lifecycle transition
    BotStatus {
        session_id: Uuid,
        status: LifecycleStatus,
    },
    TradeExecuted {
        session_id: Uuid,
        trade_type: TradeDirection,
        amount: Decimal,
        signature: String,
        total_trades: u32,
        total_volume: Decimal,
        remaining_balance: Decimal,
    },
    SessionUpdate {
        session_id: Uuid,
        total_trades: u32,
        total_volume: Decimal,
        is_active: bool,
    },
    AllSessionsUpdate {
        sessions: Vec<SessionSummary>,
    },
}

impl EngineEvent {
    /// Session the event belongs to, if any
    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            EngineEvent::BotStatus { session_id, .. }
            | EngineEvent::TradeExecuted { session_id, .. }
            | EngineEvent::SessionUpdate { session_id, .. } => Some(*session_id),
            EngineEvent::AllSessionsUpdate { .. } => None,
        }
    }
}

/// Milestone carried by a `bot_status` event, tagged by the state entered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LifecycleStatus {
    AwaitingFunding {
        wallet_address: String,
        min_funding: Decimal,
    },
    Funded {
        amount: Decimal,
    },
    Trading {
        trading_balance: Decimal,
        revenue_amount: Decimal,
        revenue_signature: String,
    },
    Paused {
        reason: String,
    },
    Resumed {
        resumed_state: SessionState,
    },
    Completed {
        total_trades: u32,
        total_volume: Decimal,
        stopped: bool,
    },
    Failed {
        reason: String,
    },
}

/// Compact per-session view for `all_sessions_update`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub token_address: String,
    pub state: SessionState,
    pub trading_balance: Decimal,
    pub total_trades: u32,
    pub total_volume: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl From<&Session> for SessionSummary {
    fn from(s: &Session) -> Self {
        Self {
            session_id: s.id,
            token_address: s.token_address.clone(),
            state: s.state,
            trading_balance: s.trading_balance,
            total_trades: s.total_trades,
            total_volume: s.total_volume,
            updated_at: s.updated_at,
        }
    }
}

/// Subscription topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    AllSessions,
    Session(Uuid),
}

/// Publish/subscribe registry keyed by topic
pub struct EventBroadcaster {
    all: broadcast::Sender<EngineEvent>,
    sessions: RwLock<HashMap<Uuid, broadcast::Sender<EngineEvent>>>,
    capacity: usize,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (all, _) = broadcast::channel(capacity.max(1));
        Self {
            all,
            sessions: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Deliver a copy of `event` to every current subscriber of its topics
    pub fn publish(&self, event: EngineEvent) {
        if let Some(session_id) = event.session_id() {
            let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
            if let Some(tx) = sessions.get(&session_id) {
                // Err only means nobody is listening right now
                let _ = tx.send(event.clone());
            }
        }

        let delivered = self.all.send(event).unwrap_or(0);
        debug!("Event delivered to {} all-sessions subscribers", delivered);
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let rx = match topic {
            Topic::AllSessions => self.all.subscribe(),
            Topic::Session(id) => {
                let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
                sessions
                    .entry(id)
                    .or_insert_with(|| broadcast::channel(self.capacity).0)
                    .subscribe()
            }
        };
        Subscription { rx, topic }
    }

    /// Drop a session topic once its session is terminal; live receivers see
    /// the channel close after draining.
    pub fn close_session(&self, session_id: Uuid) {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions.remove(&session_id);
    }

    pub fn subscriber_count(&self) -> usize {
        let per_session: usize = self
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|tx| tx.receiver_count())
            .sum();
        self.all.receiver_count() + per_session
    }
}

/// Receiving half of a topic subscription
pub struct Subscription {
    rx: broadcast::Receiver<EngineEvent>,
    topic: Topic,
}

impl Subscription {
    /// Next event, skipping over anything dropped while lagging. `None` once
    /// the topic is closed.
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(topic = ?self.topic, skipped, "Subscriber lagging, dropped oldest events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking poll
    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(session_id: Uuid, n: u32) -> EngineEvent {
        EngineEvent::SessionUpdate {
            session_id,
            total_trades: n,
            total_volume: Decimal::ZERO,
            is_active: true,
        }
    }

    #[tokio::test]
    async fn test_fan_out_to_both_topics() {
        let broadcaster = EventBroadcaster::new(16);
        let id = Uuid::new_v4();
        let mut all = broadcaster.subscribe(Topic::AllSessions);
        let mut one = broadcaster.subscribe(Topic::Session(id));
        let mut other = broadcaster.subscribe(Topic::Session(Uuid::new_v4()));

        broadcaster.publish(update(id, 1));

        assert_eq!(all.recv().await, Some(update(id, 1)));
        assert_eq!(one.recv().await, Some(update(id, 1)));
        assert!(other.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let broadcaster = EventBroadcaster::new(4);
        let id = Uuid::new_v4();
        let mut slow = broadcaster.subscribe(Topic::Session(id));

        for n in 0..10 {
            broadcaster.publish(update(id, n));
        }

        // Only the newest `capacity` events survive, still in order
        let mut seen = vec![];
        while let Some(EngineEvent::SessionUpdate { total_trades, .. }) = slow.try_recv() {
            seen.push(total_trades);
        }
        assert_eq!(seen, vec![6, 7, 8, 9]);
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let broadcaster = EventBroadcaster::new(4);
        broadcaster.publish(update(Uuid::new_v4(), 1));
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn test_status_serialization_is_tagged() {
        let event = EngineEvent::BotStatus {
            session_id: Uuid::nil(),
            status: LifecycleStatus::Funded {
                amount: Decimal::ONE,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "bot_status");
        assert_eq!(json["status"]["state"], "funded");
        assert_eq!(json["status"]["amount"], "1");
    }

    #[tokio::test]
    async fn test_close_session_ends_subscription() {
        let broadcaster = EventBroadcaster::new(4);
        let id = Uuid::new_v4();
        let mut sub = broadcaster.subscribe(Topic::Session(id));
        broadcaster.publish(update(id, 1));
        broadcaster.close_session(id);

        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
    }
}
