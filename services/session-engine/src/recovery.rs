//! Recovery Service - restores a backup in ordered steps
//!
//! Only one recovery runs at a time. New sessions are blocked through the
//! maintenance lock for the duration and an emergency backup of the current
//! state is taken before anything is touched. A failing step stops the run;
//! steps already applied stay applied.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::alerting::{AlertManager, AlertSeverity, AlertType};
use crate::backup::{BackupMetadata, BackupPayload, BackupReason, BackupService};
use crate::engine::SessionManager;
use crate::error::{EngineError, Result};
use crate::maintenance::{MaintenanceGuard, MaintenanceSource};
use crate::observability::{metrics, Logger, MetricsCollector};

const HISTORY_LIMIT: usize = 50;

pub const STEP_EMERGENCY_BACKUP: &str = "emergency_backup";
pub const STEP_VERIFY_BACKUP: &str = "verify_backup";
pub const STEP_RESTORE_TRANSACTIONS: &str = "restore_transactions";
pub const STEP_RESTORE_SESSIONS: &str = "restore_sessions";
pub const STEP_RESTORE_CONFIGURATION: &str = "restore_configuration";
pub const STEP_RESUME_SESSIONS: &str = "resume_sessions";

const TOTAL_STEPS: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl RecoveryStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, RecoveryStatus::Completed | RecoveryStatus::Failed)
    }
}

/// Which parts of the backup to restore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreFlags {
    #[serde(default = "restore_by_default")]
    pub transactions: bool,
    #[serde(default = "restore_by_default")]
    pub sessions: bool,
    #[serde(default = "restore_by_default")]
    pub configuration: bool,
}

fn restore_by_default() -> bool {
    true
}

impl Default for RestoreFlags {
    fn default() -> Self {
        Self {
            transactions: true,
            sessions: true,
            configuration: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryProgress {
    pub current_step: Option<String>,
    pub total_steps: u32,
    pub completed_steps: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverySession {
    pub id: Uuid,
    pub status: RecoveryStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub source_backup: BackupMetadata,
    pub emergency_backup: Option<BackupMetadata>,
    pub flags: RestoreFlags,
    pub progress: RecoveryProgress,
    pub skipped_steps: Vec<String>,
    pub errors: Vec<String>,
}

pub struct RecoveryService {
    backups: Arc<BackupService>,
    manager: Arc<SessionManager>,
    maintenance: Arc<MaintenanceGuard>,
    metrics: MetricsCollector,
    alerts: AlertManager,
    in_progress: AtomicBool,
    current: RwLock<Option<RecoverySession>>,
    history: RwLock<Vec<RecoverySession>>,
}

impl RecoveryService {
    pub fn new(
        backups: Arc<BackupService>,
        manager: Arc<SessionManager>,
        maintenance: Arc<MaintenanceGuard>,
        metrics: MetricsCollector,
        alerts: AlertManager,
    ) -> Self {
        Self {
            backups,
            manager,
            maintenance,
            metrics,
            alerts,
            in_progress: AtomicBool::new(false),
            current: RwLock::new(None),
            history: RwLock::new(Vec::new()),
        }
    }

    /// Start restoring the backup identified by `backup_reference` (id,
    /// epoch millis or RFC 3339 timestamp)
    ///
    /// Fails with `RecoveryInProgress` while another recovery runs; nothing
    /// is recorded for the rejected request.
    pub async fn initiate_recovery(
        self: &Arc<Self>,
        backup_reference: &str,
        flags: RestoreFlags,
    ) -> Result<RecoverySession> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let running = self
                .read_current()
                .map(|r| r.id)
                .unwrap_or_else(Uuid::nil);
            warn!("Recovery rejected: {} already in progress", running);
            return Err(EngineError::RecoveryInProgress(running));
        }

        let source = match self.backups.resolve(backup_reference).await {
            Ok(source) => source,
            Err(e) => {
                self.in_progress.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let recovery = RecoverySession {
            id: Uuid::new_v4(),
            status: RecoveryStatus::Pending,
            started_at: Utc::now(),
            ended_at: None,
            source_backup: source,
            emergency_backup: None,
            flags,
            progress: RecoveryProgress {
                current_step: None,
                total_steps: TOTAL_STEPS,
                completed_steps: 0,
            },
            skipped_steps: Vec::new(),
            errors: Vec::new(),
        };
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(recovery.clone());

        info!(
            recovery_id = %recovery.id,
            "Recovery from {} initiated",
            recovery.source_backup.id
        );

        let service = self.clone();
        tokio::spawn(async move { service.run().await });

        Ok(recovery)
    }

    /// Current recovery, or the last finished one
    pub fn status(&self) -> Option<RecoverySession> {
        self.read_current().or_else(|| {
            self.history
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .last()
                .cloned()
        })
    }

    /// Finished recoveries, newest first
    pub fn history(&self) -> Vec<RecoverySession> {
        let history = self.history.read().unwrap_or_else(|e| e.into_inner());
        history.iter().rev().cloned().collect()
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    fn read_current(&self) -> Option<RecoverySession> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn update(&self, mutate: impl FnOnce(&mut RecoverySession)) {
        if let Some(recovery) = self
            .current
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .as_mut()
        {
            mutate(recovery);
        }
    }

    async fn run(self: Arc<Self>) {
        let Some(recovery) = self.read_current() else {
            self.in_progress.store(false, Ordering::SeqCst);
            return;
        };
        let recovery_id = recovery.id;
        self.update(|r| r.status = RecoveryStatus::InProgress);

        let outcome = match self
            .maintenance
            .engage(
                MaintenanceSource::Recovery,
                format!("Recovery {} in progress", recovery_id),
                true,
                false,
            )
            .await
        {
            Ok(()) => self.execute(&recovery).await,
            Err(e) => Err(EngineError::RecoveryStep {
                step: "maintenance".to_string(),
                reason: e.to_string(),
            }),
        };

        match outcome {
            Ok(()) => {
                self.update(|r| {
                    r.status = RecoveryStatus::Completed;
                    r.progress.current_step = None;
                });
                info!(recovery_id = %recovery_id, "Recovery completed");
                self.metrics.increment(metrics::RECOVERY_COMPLETED, 1).await;
            }
            Err(e) => {
                let (step, reason) = match &e {
                    EngineError::RecoveryStep { step, reason } => (step.clone(), reason.clone()),
                    other => ("unknown".to_string(), other.to_string()),
                };
                error!(recovery_id = %recovery_id, step = %step, "Recovery failed: {}", reason);
                self.update(|r| {
                    r.status = RecoveryStatus::Failed;
                    r.errors.push(e.to_string());
                });
                self.metrics.increment(metrics::RECOVERY_FAILED, 1).await;
                self.alerts
                    .fire_alert(
                        &AlertType::RecoveryFailed {
                            recovery_id,
                            step,
                            reason,
                        },
                        AlertSeverity::Critical,
                    )
                    .await;
            }
        }

        if let Err(e) = self.maintenance.release(MaintenanceSource::Recovery).await {
            error!(recovery_id = %recovery_id, "Could not release maintenance: {}", e);
        }

        let finished = {
            let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
            current.take().map(|mut r| {
                r.ended_at = Some(Utc::now());
                r
            })
        };
        if let Some(finished) = finished {
            let mut history = self.history.write().unwrap_or_else(|e| e.into_inner());
            history.push(finished);
            if history.len() > HISTORY_LIMIT {
                let excess = history.len() - HISTORY_LIMIT;
                history.drain(..excess);
            }
        }
        self.in_progress.store(false, Ordering::SeqCst);
    }

    async fn execute(&self, recovery: &RecoverySession) -> Result<()> {
        let recovery_id = recovery.id;
        let flags = recovery.flags;

        self.begin(recovery_id, STEP_EMERGENCY_BACKUP);
        let emergency = self
            .backups
            .create_backup(BackupReason::PreRecovery)
            .await
            .map_err(|e| step_error(STEP_EMERGENCY_BACKUP, e))?;
        self.update(|r| r.emergency_backup = Some(emergency));
        self.complete(recovery_id, STEP_EMERGENCY_BACKUP);

        self.begin(recovery_id, STEP_VERIFY_BACKUP);
        let payload: BackupPayload = self
            .backups
            .load_snapshot(&recovery.source_backup)
            .await
            .map_err(|e| step_error(STEP_VERIFY_BACKUP, e))?;
        self.complete(recovery_id, STEP_VERIFY_BACKUP);

        let BackupPayload {
            sessions,
            transactions,
            settings,
            ..
        } = payload;

        if flags.transactions {
            self.begin(recovery_id, STEP_RESTORE_TRANSACTIONS);
            let count = transactions.len();
            self.manager.store().replace_transactions(transactions);
            info!(recovery_id = %recovery_id, "Restored {} transactions", count);
            self.complete(recovery_id, STEP_RESTORE_TRANSACTIONS);
        } else {
            self.skip(recovery_id, STEP_RESTORE_TRANSACTIONS);
        }

        if flags.sessions {
            self.begin(recovery_id, STEP_RESTORE_SESSIONS);
            let count = self.manager.replace_sessions(sessions);
            info!(recovery_id = %recovery_id, "Restored {} sessions", count);
            self.complete(recovery_id, STEP_RESTORE_SESSIONS);
        } else {
            self.skip(recovery_id, STEP_RESTORE_SESSIONS);
        }

        if flags.configuration {
            self.begin(recovery_id, STEP_RESTORE_CONFIGURATION);
            self.manager.apply_settings(settings);
            self.complete(recovery_id, STEP_RESTORE_CONFIGURATION);
        } else {
            self.skip(recovery_id, STEP_RESTORE_CONFIGURATION);
        }

        self.begin(recovery_id, STEP_RESUME_SESSIONS);
        let resumed = self.manager.resume_sessions();
        info!(recovery_id = %recovery_id, "Resumed {} sessions", resumed);
        self.complete(recovery_id, STEP_RESUME_SESSIONS);

        Ok(())
    }

    fn begin(&self, recovery_id: Uuid, step: &str) {
        Logger::recovery_step(recovery_id, step, "started");
        self.update(|r| r.progress.current_step = Some(step.to_string()));
    }

    fn complete(&self, recovery_id: Uuid, step: &str) {
        Logger::recovery_step(recovery_id, step, "completed");
        self.update(|r| r.progress.completed_steps += 1);
    }

    fn skip(&self, recovery_id: Uuid, step: &str) {
        Logger::recovery_step(recovery_id, step, "skipped");
        self.update(|r| {
            r.skipped_steps.push(step.to_string());
            r.progress.completed_steps += 1;
        });
    }
}

fn step_error(step: &str, e: EngineError) -> EngineError {
    EngineError::RecoveryStep {
        step: step.to_string(),
        reason: e.to_string(),
    }
}
