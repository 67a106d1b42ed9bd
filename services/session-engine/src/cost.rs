//! Cost Monitor - daily running-cost estimate with a hard ceiling
//!
//! Each check adds `hours × (base_per_hour + per_session_hour × active) +
//! per_transaction × new_transactions` to the day's record. The record is
//! persisted to `cost/<YYYY-MM-DD>.json` and starts over at the UTC day
//! boundary. Reaching the ceiling engages the maintenance lock, which blocks
//! new sessions and pauses running ones until the next day.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::alerting::{AlertManager, AlertSeverity};
use crate::config::CostConfig;
use crate::error::{EngineError, Result};
use crate::maintenance::{MaintenanceGuard, MaintenanceSource};
use crate::observability::{metrics, MetricsCollector};
use crate::state::StateFiles;
use crate::store::SessionStore;

const MILLIS_PER_HOUR: i64 = 3_600_000;

/// The day's accumulated estimate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostRecord {
    pub date: NaiveDate,
    pub accumulated_cost: Decimal,
    pub active_sessions: usize,
    pub transaction_count: u64,
    pub last_check: DateTime<Utc>,
    pub last_reset: DateTime<Utc>,
}

impl CostRecord {
    fn fresh(date: NaiveDate, at: DateTime<Utc>) -> Self {
        Self {
            date,
            accumulated_cost: Decimal::ZERO,
            active_sessions: 0,
            transaction_count: 0,
            last_check: at,
            last_reset: at,
        }
    }
}

pub fn cost_path(date: NaiveDate) -> String {
    format!("cost/{}.json", date.format("%Y-%m-%d"))
}

#[derive(Debug, Clone, Serialize)]
pub struct CostStatus {
    pub within_limits: bool,
    pub current_cost: Decimal,
    pub limit: Decimal,
    pub date: NaiveDate,
    pub active_sessions: usize,
    pub transaction_count: u64,
    pub last_check: DateTime<Utc>,
    pub maintenance_engaged: bool,
}

struct MonitorState {
    record: CostRecord,
    /// Store transaction counter at the previous check
    seen_transactions: u64,
    /// Bumped by every check
    revision: u64,
}

pub struct CostMonitor {
    config: CostConfig,
    files: StateFiles,
    store: Arc<SessionStore>,
    maintenance: Arc<MaintenanceGuard>,
    alerts: AlertManager,
    metrics: MetricsCollector,
    state: Mutex<MonitorState>,
    /// Revision last written to disk; serializes writes so an older record
    /// never lands over a newer one
    persisted: Mutex<u64>,
}

impl CostMonitor {
    /// Reload today's record, or start a new one
    pub async fn load(
        config: CostConfig,
        files: StateFiles,
        store: Arc<SessionStore>,
        maintenance: Arc<MaintenanceGuard>,
        alerts: AlertManager,
        metrics: MetricsCollector,
    ) -> Result<Self> {
        let now = Utc::now();
        let today = now.date_naive();
        let record = match files.read_json::<CostRecord>(cost_path(today)).await {
            Ok(Some(record)) => {
                info!(
                    "Restored cost record for {}: ${}",
                    record.date, record.accumulated_cost
                );
                record
            }
            Ok(None) => CostRecord::fresh(today, now),
            Err(e) => {
                warn!("Ignoring unreadable cost record for {}: {}", today, e);
                CostRecord::fresh(today, now)
            }
        };
        let seen_transactions = store.transactions_recorded();

        Ok(Self {
            config,
            files,
            store,
            maintenance,
            alerts,
            metrics,
            state: Mutex::new(MonitorState {
                record,
                seen_transactions,
                revision: 0,
            }),
            persisted: Mutex::new(0),
        })
    }

    /// Replace the live record
    pub async fn restore_record(&self, record: CostRecord) {
        self.state.lock().await.record = record;
    }

    pub async fn check(&self) -> Result<CostStatus> {
        self.check_at(Utc::now()).await
    }

    /// Accrue cost up to `now`, persist it and apply the ceiling
    pub async fn check_at(&self, now: DateTime<Utc>) -> Result<CostStatus> {
        let (record, rolled_over, revision) = {
            let mut state = self.state.lock().await;

            let today = now.date_naive();
            let rolled_over = state.record.date != today;
            if rolled_over {
                let midnight = today
                    .and_hms_opt(0, 0, 0)
                    .map(|t| Utc.from_utc_datetime(&t))
                    .unwrap_or(now);
                info!(
                    "Cost day rolled over: {} closed at ${}",
                    state.record.date, state.record.accumulated_cost
                );
                state.record = CostRecord::fresh(today, midnight);
            }

            let elapsed_ms = (now - state.record.last_check).num_milliseconds().max(0);
            let hours = Decimal::from(elapsed_ms) / Decimal::from(MILLIS_PER_HOUR);
            let active = self.store.active_count();
            let recorded = self.store.transactions_recorded();
            let new_transactions = recorded.saturating_sub(state.seen_transactions);
            state.seen_transactions = recorded;
            state.revision += 1;
            let revision = state.revision;

            let increment = hours
                * (self.config.base_per_hour
                    + self.config.per_session_hour * Decimal::from(active as u64))
                + self.config.per_transaction * Decimal::from(new_transactions);

            let record = &mut state.record;
            record.accumulated_cost += increment;
            record.active_sessions = active;
            record.transaction_count += new_transactions;
            record.last_check = now;

            debug!(
                "Cost check: +${} over {}ms ({} active, {} new transactions)",
                increment.round_dp(6),
                elapsed_ms,
                active,
                new_transactions
            );

            (record.clone(), rolled_over, revision)
        };

        // Written outside the state lock
        {
            let mut persisted = self.persisted.lock().await;
            if revision > *persisted {
                self.files.write_json(cost_path(record.date), &record).await?;
                *persisted = revision;
            }
        }

        self.metrics
            .gauge(
                metrics::DAILY_COST_USD,
                record.accumulated_cost.to_f64().unwrap_or(0.0),
            )
            .await;

        if rolled_over && self.maintenance.release(MaintenanceSource::CostMonitor).await? {
            info!("Cost ceiling lock lifted for {}", record.date);
        }

        let limit = self.config.daily_limit_usd;
        match self.alerts.check_cost(record.accumulated_cost, limit).await {
            Some((alert, AlertSeverity::Critical)) => {
                if !self.maintenance.holds(MaintenanceSource::CostMonitor) {
                    self.maintenance
                        .engage(
                            MaintenanceSource::CostMonitor,
                            format!(
                                "Daily cost ceiling reached: ${} of ${}",
                                record.accumulated_cost.round_dp(2),
                                limit
                            ),
                            true,
                            true,
                        )
                        .await?;
                    self.alerts.fire_alert(&alert, AlertSeverity::Critical).await;
                    self.metrics.increment(metrics::MAINTENANCE_ENGAGED, 1).await;
                }
            }
            Some((alert, severity)) => self.alerts.fire_alert(&alert, severity).await,
            None => {}
        }

        Ok(self.status_for(&record))
    }

    /// Refuse new work while today's figure is at or over the ceiling
    ///
    /// A record left over from an earlier day does not count.
    pub async fn ensure_within_limits(&self) -> Result<()> {
        let record = self.state.lock().await.record.clone();
        let limit = self.config.daily_limit_usd;
        if record.date == Utc::now().date_naive() && record.accumulated_cost >= limit {
            return Err(EngineError::CostCeilingExceeded {
                current: record.accumulated_cost,
                limit,
            });
        }
        Ok(())
    }

    /// Current figures without accruing anything
    pub async fn get_status(&self) -> CostStatus {
        let record = self.state.lock().await.record.clone();
        self.status_for(&record)
    }

    fn status_for(&self, record: &CostRecord) -> CostStatus {
        CostStatus {
            within_limits: record.accumulated_cost < self.config.daily_limit_usd,
            current_cost: record.accumulated_cost,
            limit: self.config.daily_limit_usd,
            date: record.date,
            active_sessions: record.active_sessions,
            transaction_count: record.transaction_count,
            last_check: record.last_check,
            maintenance_engaged: self.maintenance.holds(MaintenanceSource::CostMonitor),
        }
    }

    /// Run a check every `cost.check_interval`
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = self.clone();
        let every = self
            .config
            .check_interval()
            .max(std::time::Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = monitor.check().await {
                    warn!("Cost check failed: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TradeDirection, Transaction};
    use chrono::Duration;
    use uuid::Uuid;

    struct Fixture {
        monitor: CostMonitor,
        store: Arc<SessionStore>,
        maintenance: Arc<MaintenanceGuard>,
        alerts: AlertManager,
        metrics: MetricsCollector,
        files: StateFiles,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let files = StateFiles::new(dir.path());
        let store = Arc::new(SessionStore::new());
        let maintenance = Arc::new(MaintenanceGuard::load(files.clone()).await.unwrap());
        let alerts = AlertManager::default();
        let metrics = MetricsCollector::new();
        let monitor = CostMonitor::load(
            CostConfig::default(),
            files.clone(),
            store.clone(),
            maintenance.clone(),
            alerts.clone(),
            metrics.clone(),
        )
        .await
        .unwrap();

        Fixture {
            monitor,
            store,
            maintenance,
            alerts,
            metrics,
            files,
            _dir: dir,
        }
    }

    fn record_at(now: DateTime<Utc>, cost: Decimal) -> CostRecord {
        CostRecord {
            accumulated_cost: cost,
            last_check: now - Duration::hours(1),
            ..CostRecord::fresh(now.date_naive(), now - Duration::hours(1))
        }
    }

    #[tokio::test]
    async fn test_accrues_base_rate_per_hour() {
        let f = fixture().await;
        let now = Utc::now();
        f.monitor.restore_record(record_at(now, Decimal::ZERO)).await;

        let status = f.monitor.check_at(now).await.unwrap();
        assert_eq!(status.current_cost, Decimal::new(10, 2));
        assert!(status.within_limits);
        assert!(!f.maintenance.is_active());
    }

    #[tokio::test]
    async fn test_new_transactions_are_charged() {
        let f = fixture().await;
        let now = Utc::now();
        f.monitor
            .restore_record(CostRecord {
                last_check: now,
                ..record_at(now, Decimal::ZERO)
            })
            .await;

        for _ in 0..2 {
            f.store.record_transaction(
                Transaction::pending(Uuid::new_v4(), TradeDirection::Buy, Decimal::ONE)
                    .fail("x".into(), 1),
            );
        }

        let status = f.monitor.check_at(now).await.unwrap();
        assert_eq!(status.current_cost, Decimal::new(10, 4));
        assert_eq!(status.transaction_count, 2);

        // Already counted
        let status = f.monitor.check_at(now).await.unwrap();
        assert_eq!(status.transaction_count, 2);
    }

    #[tokio::test]
    async fn test_ceiling_engages_maintenance_once() {
        let f = fixture().await;
        let now = Utc::now();
        f.monitor
            .restore_record(record_at(now, Decimal::new(4995, 2)))
            .await;

        let status = f.monitor.check_at(now).await.unwrap();
        assert!(!status.within_limits);
        assert!(status.maintenance_engaged);
        assert!(f.maintenance.blocks_new_sessions());
        assert!(f.maintenance.pauses_sessions());

        f.monitor.check_at(now).await.unwrap();
        assert_eq!(f.metrics.get_counter(metrics::MAINTENANCE_ENGAGED).await, 1);

        let alerts = f.alerts.recent(10).await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);
    }

    #[tokio::test]
    async fn test_warning_without_lock() {
        let f = fixture().await;
        let now = Utc::now();
        f.monitor.restore_record(record_at(now, Decimal::from(41))).await;

        let status = f.monitor.check_at(now).await.unwrap();
        assert!(status.within_limits);
        assert!(!f.maintenance.is_active());

        let alerts = f.alerts.recent(10).await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::Warning);
    }

    #[tokio::test]
    async fn test_day_rollover_resets_and_releases() {
        let f = fixture().await;
        let now = Utc::now();
        let yesterday = now - Duration::days(1);
        f.monitor
            .restore_record(record_at(yesterday, Decimal::from(60)))
            .await;
        f.maintenance
            .engage(MaintenanceSource::CostMonitor, "ceiling", true, true)
            .await
            .unwrap();

        let status = f.monitor.check_at(now).await.unwrap();
        assert_eq!(status.date, now.date_naive());
        assert!(status.current_cost < Decimal::new(25, 1));
        assert!(status.within_limits);
        assert!(!f.maintenance.is_active());
    }

    #[tokio::test]
    async fn test_record_is_persisted_and_reloaded() {
        let f = fixture().await;
        let now = Utc::now();
        f.monitor.restore_record(record_at(now, Decimal::ONE)).await;
        let status = f.monitor.check_at(now).await.unwrap();

        assert!(f.files.path(cost_path(now.date_naive())).exists());
        let reloaded = CostMonitor::load(
            CostConfig::default(),
            f.files.clone(),
            f.store.clone(),
            f.maintenance.clone(),
            AlertManager::default(),
            MetricsCollector::new(),
        )
        .await
        .unwrap();
        assert_eq!(reloaded.get_status().await.current_cost, status.current_cost);
    }

    #[tokio::test]
    async fn test_status_readable_while_record_is_written() {
        let f = fixture().await;
        let now = Utc::now();
        f.monitor.restore_record(record_at(now, Decimal::ONE)).await;

        let monitor = &f.monitor;
        let held = monitor.persisted.lock().await;
        let check = monitor.check_at(now);
        let read = async move {
            tokio::task::yield_now().await;
            let status = tokio::time::timeout(
                std::time::Duration::from_secs(1),
                monitor.get_status(),
            )
            .await;
            drop(held);
            status
        };

        let (checked, seen) = tokio::join!(check, read);
        let seen = seen.expect("status read waited on the cost write");
        assert_eq!(seen.current_cost, Decimal::new(110, 2));
        assert_eq!(checked.unwrap().current_cost, Decimal::new(110, 2));
        assert!(f.files.path(cost_path(now.date_naive())).exists());
    }

    #[tokio::test]
    async fn test_ensure_within_limits() {
        let f = fixture().await;
        let now = Utc::now();
        f.monitor.restore_record(record_at(now, Decimal::from(49))).await;
        assert!(f.monitor.ensure_within_limits().await.is_ok());

        f.monitor.restore_record(record_at(now, Decimal::from(50))).await;
        let err = f.monitor.ensure_within_limits().await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::CostCeilingExceeded { current, limit }
                if current == Decimal::from(50) && limit == Decimal::from(50)
        ));

        // Yesterday's total no longer applies
        f.monitor
            .restore_record(record_at(now - Duration::days(1), Decimal::from(60)))
            .await;
        assert!(f.monitor.ensure_within_limits().await.is_ok());
    }

    #[tokio::test]
    async fn test_get_status_does_not_accrue() {
        let f = fixture().await;
        let now = Utc::now();
        f.monitor.restore_record(record_at(now, Decimal::ONE)).await;

        let first = f.monitor.get_status().await;
        let second = f.monitor.get_status().await;
        assert_eq!(first.current_cost, Decimal::ONE);
        assert_eq!(second.current_cost, Decimal::ONE);
        assert!(!f.files.path(cost_path(now.date_naive())).exists());
    }
}
