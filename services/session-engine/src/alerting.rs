//! Threshold alerts for cost, trading and durability failures
//!
//! Every fired alert is logged through `tracing` at its severity and kept in
//! a bounded in-memory log served by `GET /alerts`.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

const ALERT_LOG_CAPACITY: usize = 200;
const COST_WARNING_COOLDOWN_MINS: i64 = 60;
const TRADE_FAILURE_COOLDOWN_MINS: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlertType {
    CostWarning { current: Decimal, limit: Decimal },
    CostCeiling { current: Decimal, limit: Decimal },
    RepeatedTradeFailed {
        session_id: Uuid,
        consecutive_fails: u32,
    },
    SessionFailed { session_id: Uuid, reason: String },
    BackupFailed { reason: String },
    RecoveryFailed {
        recovery_id: Uuid,
        step: String,
        reason: String,
    },
}

impl AlertType {
    /// `(title, message)` as shown in the alert log
    fn describe(&self) -> (String, String) {
        match self {
            AlertType::CostWarning { current, limit } => (
                "Daily Cost Approaching Ceiling".to_string(),
                format!("${} spent of ${}", current.round_dp(4), limit),
            ),
            AlertType::CostCeiling { current, limit } => (
                "Daily Cost Ceiling Reached".to_string(),
                format!(
                    "${} spent of ${}; new sessions blocked and active sessions paused",
                    current.round_dp(4),
                    limit
                ),
            ),
            AlertType::RepeatedTradeFailed {
                session_id,
                consecutive_fails,
            } => (
                format!("Repeated Trade Failures [{}]", session_id),
                format!("{} consecutive failed ticks", consecutive_fails),
            ),
            AlertType::SessionFailed { session_id, reason } => {
                (format!("Session Failed [{}]", session_id), reason.clone())
            }
            AlertType::BackupFailed { reason } => ("Backup Failed".to_string(), reason.clone()),
            AlertType::RecoveryFailed {
                recovery_id,
                step,
                reason,
            } => (
                format!("Recovery Failed [{}]", recovery_id),
                format!("step {}: {}", step, reason),
            ),
        }
    }
}

/// A fired alert as returned by `GET /alerts`
#[derive(Debug, Clone, Serialize)]
pub struct AlertRecord {
    pub timestamp: DateTime<Utc>,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct AlertConfig {
    /// Fraction of the daily ceiling that triggers a warning
    pub cost_warning_ratio: Decimal,
    /// Consecutive failed ticks before alerting
    pub trade_failure_threshold: u32,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cost_warning_ratio: Decimal::new(8, 1),
            trade_failure_threshold: 3,
        }
    }
}

#[derive(Clone)]
pub struct AlertManager {
    config: AlertConfig,
    /// Last time each rate-limited alert key fired
    cooldowns: Arc<RwLock<HashMap<String, DateTime<Utc>>>>,
    trade_failures: Arc<RwLock<HashMap<Uuid, u32>>>,
    log: Arc<RwLock<VecDeque<AlertRecord>>>,
}

impl AlertManager {
    pub fn new(config: AlertConfig) -> Self {
        Self {
            config,
            cooldowns: Arc::new(RwLock::new(HashMap::new())),
            trade_failures: Arc::new(RwLock::new(HashMap::new())),
            log: Arc::new(RwLock::new(VecDeque::new())),
        }
    }

    /// Claim `key` unless it fired within `cooldown`
    async fn claim(&self, key: String, cooldown: Duration) -> bool {
        let now = Utc::now();
        let mut cooldowns = self.cooldowns.write().await;
        match cooldowns.get(&key) {
            Some(last) if now - *last < cooldown => false,
            _ => {
                cooldowns.insert(key, now);
                true
            }
        }
    }

    /// Classify the day's cost against its ceiling
    ///
    /// The ceiling alert ignores cooldowns so every breach is on record.
    pub async fn check_cost(
        &self,
        current: Decimal,
        limit: Decimal,
    ) -> Option<(AlertType, AlertSeverity)> {
        if current >= limit {
            return Some((AlertType::CostCeiling { current, limit }, AlertSeverity::Critical));
        }

        if current >= limit * self.config.cost_warning_ratio {
            let cooldown = Duration::minutes(COST_WARNING_COOLDOWN_MINS);
            if self.claim("cost_warning".to_string(), cooldown).await {
                return Some((AlertType::CostWarning { current, limit }, AlertSeverity::Warning));
            }
        }

        None
    }

    /// Record a failed trade tick and check for repeated failures
    pub async fn record_trade_failure(&self, session_id: Uuid) -> Option<AlertType> {
        let consecutive_fails = {
            let mut failures = self.trade_failures.write().await;
            let count = failures.entry(session_id).or_insert(0);
            *count += 1;
            *count
        };

        if consecutive_fails < self.config.trade_failure_threshold {
            return None;
        }
        let cooldown = Duration::minutes(TRADE_FAILURE_COOLDOWN_MINS);
        self.claim(format!("trade_failures:{}", session_id), cooldown)
            .await
            .then_some(AlertType::RepeatedTradeFailed {
                session_id,
                consecutive_fails,
            })
    }

    pub async fn reset_trade_failures(&self, session_id: Uuid) {
        self.trade_failures.write().await.remove(&session_id);
    }

    /// Log the alert and append it to the alert log
    pub async fn fire_alert(&self, alert: &AlertType, severity: AlertSeverity) {
        let (title, message) = alert.describe();

        match severity {
            AlertSeverity::Info => info!(alert = ?alert, "{}: {}", title, message),
            AlertSeverity::Warning => warn!(alert = ?alert, "{}: {}", title, message),
            AlertSeverity::Critical => error!(alert = ?alert, "{}: {}", title, message),
        }

        let mut log = self.log.write().await;
        if log.len() >= ALERT_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(AlertRecord {
            timestamp: Utc::now(),
            severity,
            title,
            message,
        });
    }

    /// Most recent alerts, newest first
    pub async fn recent(&self, limit: usize) -> Vec<AlertRecord> {
        let log = self.log.read().await;
        log.iter().rev().take(limit).cloned().collect()
    }
}

impl Default for AlertManager {
    fn default() -> Self {
        Self::new(AlertConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cost_thresholds() {
        let alerts = AlertManager::default();
        let limit = Decimal::from(10);

        assert!(alerts.check_cost(Decimal::from(5), limit).await.is_none());

        let (alert, severity) = alerts.check_cost(Decimal::from(8), limit).await.unwrap();
        assert!(matches!(alert, AlertType::CostWarning { .. }));
        assert_eq!(severity, AlertSeverity::Warning);

        // Warning is rate limited
        assert!(alerts.check_cost(Decimal::from(9), limit).await.is_none());

        // Ceiling is not
        let (alert, severity) = alerts.check_cost(Decimal::from(10), limit).await.unwrap();
        assert!(matches!(alert, AlertType::CostCeiling { .. }));
        assert_eq!(severity, AlertSeverity::Critical);
        assert!(alerts.check_cost(Decimal::from(11), limit).await.is_some());
    }

    #[tokio::test]
    async fn test_repeated_trade_failures() {
        let alerts = AlertManager::default();
        let id = Uuid::new_v4();

        assert!(alerts.record_trade_failure(id).await.is_none());
        assert!(alerts.record_trade_failure(id).await.is_none());
        assert_eq!(
            alerts.record_trade_failure(id).await,
            Some(AlertType::RepeatedTradeFailed {
                session_id: id,
                consecutive_fails: 3
            })
        );

        alerts.reset_trade_failures(id).await;
        assert!(alerts.record_trade_failure(id).await.is_none());
    }

    #[tokio::test]
    async fn test_alert_log_newest_first() {
        let alerts = AlertManager::default();
        alerts
            .fire_alert(&AlertType::BackupFailed { reason: "disk".into() }, AlertSeverity::Warning)
            .await;
        alerts
            .fire_alert(
                &AlertType::CostCeiling {
                    current: Decimal::from(51),
                    limit: Decimal::from(50),
                },
                AlertSeverity::Critical,
            )
            .await;

        let recent = alerts.recent(10).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].severity, AlertSeverity::Critical);
        assert_eq!(recent[1].title, "Backup Failed");
    }
}
