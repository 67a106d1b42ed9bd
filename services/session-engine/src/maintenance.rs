//! Maintenance lock - process-wide switch that blocks new sessions and/or
//! pauses active ones
//!
//! Several sources can hold the lock at once (the cost monitor and a running
//! recovery, say). The effective lock is the union of all holds, so one
//! source releasing never lifts another's hold.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::Result;
use crate::state::StateFiles;

const MAINTENANCE_FILE: &str = "maintenance.json";

/// Who engaged the lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceSource {
    CostMonitor,
    Recovery,
    Manual,
}

/// One source's hold on the lock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceHold {
    pub source: MaintenanceSource,
    pub reason: String,
    pub block_new_sessions: bool,
    pub pause_sessions: bool,
    pub set_at: DateTime<Utc>,
}

/// Persisted lock state (`maintenance.json`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceLock {
    pub active: bool,
    pub reason: Option<String>,
    pub source: Option<MaintenanceSource>,
    pub set_at: Option<DateTime<Utc>>,
    pub cleared_at: Option<DateTime<Utc>>,
    pub block_new_sessions: bool,
    pub pause_sessions: bool,
    #[serde(default)]
    pub holds: Vec<MaintenanceHold>,
}

impl MaintenanceLock {
    /// Recompute the effective flags from the holds
    fn refresh(&mut self) {
        let was_active = self.active;
        self.active = !self.holds.is_empty();
        self.block_new_sessions = self.holds.iter().any(|h| h.block_new_sessions);
        self.pause_sessions = self.holds.iter().any(|h| h.pause_sessions);

        match self.holds.last() {
            Some(latest) => {
                self.reason = Some(latest.reason.clone());
                self.source = Some(latest.source);
                self.set_at = Some(latest.set_at);
            }
            None => {
                self.reason = None;
                self.source = None;
                if was_active {
                    self.cleared_at = Some(Utc::now());
                }
            }
        }
    }
}

/// Shared handle to the maintenance lock
pub struct MaintenanceGuard {
    lock: RwLock<MaintenanceLock>,
    files: StateFiles,
    /// Serializes mutate-then-persist so the file never lags an older write
    persist: Mutex<()>,
}

impl MaintenanceGuard {
    /// Reload the persisted lock, starting unlocked when none exists
    pub async fn load(files: StateFiles) -> Result<Self> {
        let lock = match files.read_json::<MaintenanceLock>(MAINTENANCE_FILE).await {
            Ok(Some(lock)) => {
                if lock.active {
                    warn!(
                        "Maintenance lock restored from disk: {}",
                        lock.reason.as_deref().unwrap_or("no reason")
                    );
                }
                lock
            }
            Ok(None) => MaintenanceLock::default(),
            Err(e) => {
                warn!("Ignoring unreadable {}: {}", MAINTENANCE_FILE, e);
                MaintenanceLock::default()
            }
        };

        Ok(Self {
            lock: RwLock::new(lock),
            files,
            persist: Mutex::new(()),
        })
    }

    /// Engage (or replace) `source`'s hold
    pub async fn engage(
        &self,
        source: MaintenanceSource,
        reason: impl Into<String>,
        block_new_sessions: bool,
        pause_sessions: bool,
    ) -> Result<()> {
        let reason = reason.into();
        info!(
            ?source,
            block_new_sessions, pause_sessions, "Maintenance engaged: {}", reason
        );

        self.update(|lock| {
            lock.holds.retain(|h| h.source != source);
            lock.holds.push(MaintenanceHold {
                source,
                reason,
                block_new_sessions,
                pause_sessions,
                set_at: Utc::now(),
            });
        })
        .await
    }

    /// Drop `source`'s hold; returns whether it held one
    pub async fn release(&self, source: MaintenanceSource) -> Result<bool> {
        let mut released = false;
        self.update(|lock| {
            let before = lock.holds.len();
            lock.holds.retain(|h| h.source != source);
            released = lock.holds.len() != before;
        })
        .await?;

        if released {
            info!(?source, "Maintenance hold released");
        }
        Ok(released)
    }

    async fn update(&self, mutate: impl FnOnce(&mut MaintenanceLock)) -> Result<()> {
        let _persist = self.persist.lock().await;
        let snapshot = {
            let mut lock = self.lock.write().unwrap_or_else(|e| e.into_inner());
            mutate(&mut lock);
            lock.refresh();
            lock.clone()
        };
        self.files.write_json(MAINTENANCE_FILE, &snapshot).await?;
        Ok(())
    }

    pub fn snapshot(&self) -> MaintenanceLock {
        self.lock.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_active(&self) -> bool {
        self.lock.read().unwrap_or_else(|e| e.into_inner()).active
    }

    pub fn blocks_new_sessions(&self) -> bool {
        self.lock
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .block_new_sessions
    }

    pub fn pauses_sessions(&self) -> bool {
        self.lock
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .pause_sessions
    }

    pub fn holds(&self, source: MaintenanceSource) -> bool {
        self.lock
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .holds
            .iter()
            .any(|h| h.source == source)
    }

    /// Human-readable status line
    pub fn message(&self) -> String {
        let lock = self.snapshot();
        match (&lock.reason, lock.active) {
            (Some(reason), true) => reason.clone(),
            _ => "System operational".to_string(),
        }
    }
}
