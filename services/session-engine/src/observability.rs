//! Process metrics and structured log lines
//!
//! Counters and gauges live in memory only and restart at zero with the
//! process; `/health` serves them sorted by name.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Registry {
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, f64>,
}

/// Cloneable handle to the process-wide metric registry
#[derive(Clone)]
pub struct MetricsCollector {
    registry: Arc<RwLock<Registry>>,
    started_at: DateTime<Utc>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(RwLock::new(Registry::default())),
            started_at: Utc::now(),
        }
    }

    /// Add `by` to counter `name`
    pub async fn increment(&self, name: &str, by: u64) {
        let mut registry = self.registry.write().await;
        match registry.counters.get_mut(name) {
            Some(total) => *total = total.saturating_add(by),
            None => {
                registry.counters.insert(name.to_owned(), by);
            }
        }
    }

    pub async fn gauge(&self, name: &str, value: f64) {
        self.registry
            .write()
            .await
            .gauges
            .insert(name.to_owned(), value);
    }

    pub async fn get_counter(&self, name: &str) -> u64 {
        self.registry
            .read()
            .await
            .counters
            .get(name)
            .copied()
            .unwrap_or_default()
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let registry = self.registry.read().await;
        let uptime = Utc::now() - self.started_at;
        MetricsSnapshot {
            started_at: self.started_at,
            uptime_secs: uptime.num_seconds().max(0) as u64,
            counters: registry.counters.clone(),
            gauges: registry.gauges.clone(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, f64>,
}

/// Structured log lines shared by the session and governance components
pub struct Logger;

impl Logger {
    pub fn session_event(session_id: Uuid, event: &str, details: &str) {
        tracing::info!(
            session_id = %session_id,
            event = %event,
            details = %details,
            "session_event"
        );
    }

    pub fn recovery_step(recovery_id: Uuid, step: &str, status: &str) {
        tracing::info!(
            recovery_id = %recovery_id,
            step = %step,
            status = %status,
            "recovery_step"
        );
    }
}

/// Metric names
pub mod metrics {
    pub const SESSION_CREATED: &str = "sessions_created_total";
    pub const SESSION_COMPLETED: &str = "sessions_completed_total";
    pub const SESSION_FAILED: &str = "sessions_failed_total";
    pub const SESSION_REJECTED: &str = "sessions_rejected_total";
    pub const ACTIVE_SESSIONS: &str = "sessions_active";

    pub const FUNDING_DETECTED: &str = "funding_detected_total";
    pub const FUNDING_POLL_ERRORS: &str = "funding_poll_errors_total";
    pub const REVENUE_COLLECTED: &str = "revenue_transfers_total";

    pub const TRADE_EXECUTED: &str = "trades_executed_total";
    pub const TRADE_FAILED: &str = "trades_failed_total";
    pub const TRADE_RETRIES: &str = "trade_retries_total";

    pub const BACKUP_CREATED: &str = "backups_created_total";
    pub const BACKUP_FAILED: &str = "backups_failed_total";
    pub const RECOVERY_COMPLETED: &str = "recoveries_completed_total";
    pub const RECOVERY_FAILED: &str = "recoveries_failed_total";

    pub const DAILY_COST_USD: &str = "cost_daily_usd";
    pub const MAINTENANCE_ENGAGED: &str = "maintenance_engaged_total";
}
