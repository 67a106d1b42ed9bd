//! Backup Service - checksummed snapshots of sessions, transactions and
//! runtime settings
//!
//! Layout under the state directory:
//! - `backups/index.json`: every retained [`BackupMetadata`], oldest first
//! - `backups/backup-<millis>-<kind>.json`: `{checksum, payload}` where the
//!   checksum is the SHA-256 of the payload string
//!
//! Incremental backups hold only the sessions updated and transactions
//! recorded since their base full backup; loading one overlays it on the base.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::alerting::{AlertManager, AlertSeverity, AlertType};
use crate::config::{BackupConfig, RuntimeSettings};
use crate::engine::SessionManager;
use crate::error::{EngineError, Result};
use crate::observability::{metrics, MetricsCollector};
use crate::state::StateFiles;
use crate::types::{Session, Transaction};

const INDEX_FILE: &str = "backups/index.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Full,
    Incremental,
}

impl std::fmt::Display for BackupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupKind::Full => write!(f, "full"),
            BackupKind::Incremental => write!(f, "incremental"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupReason {
    Scheduled,
    OnDemand,
    PreRecovery,
}

/// Index entry for one artifact; never changed after creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Instant the state was copied; the next incremental starts here
    pub taken_at: DateTime<Utc>,
    /// Store lineage at `taken_at`; incrementals only build on a base of
    /// the same lineage
    #[serde(default)]
    pub lineage: Option<Uuid>,
    pub kind: BackupKind,
    pub reason: BackupReason,
    pub base_id: Option<String>,
    pub size_bytes: u64,
    pub checksum: String,
    pub session_count: usize,
    pub transaction_count: usize,
}

impl BackupMetadata {
    fn path(&self) -> String {
        artifact_path(&self.id)
    }
}

fn artifact_path(id: &str) -> String {
    format!("backups/{}.json", id)
}

/// Restorable content of a backup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupPayload {
    pub created_at: DateTime<Utc>,
    pub taken_at: DateTime<Utc>,
    pub kind: BackupKind,
    pub base_id: Option<String>,
    pub sessions: Vec<Session>,
    pub transactions: Vec<Transaction>,
    pub settings: RuntimeSettings,
}

/// On-disk artifact
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    checksum: String,
    payload: String,
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupStatus {
    pub last_backup: Option<BackupMetadata>,
    pub last_full_backup: Option<BackupMetadata>,
    pub backup_count: usize,
    pub interval_secs: u64,
    pub retention: usize,
    pub next_scheduled_at: Option<DateTime<Utc>>,
}

pub struct BackupService {
    files: StateFiles,
    manager: Arc<SessionManager>,
    config: BackupConfig,
    /// Retained backups, oldest first; held across creation and pruning
    index: Mutex<Vec<BackupMetadata>>,
    scheduled_runs: AtomicU32,
    next_scheduled_at: std::sync::RwLock<Option<DateTime<Utc>>>,
    metrics: MetricsCollector,
    alerts: AlertManager,
}

impl BackupService {
    /// Open the backup directory, reading the existing index
    pub async fn load(
        files: StateFiles,
        manager: Arc<SessionManager>,
        config: BackupConfig,
        metrics: MetricsCollector,
        alerts: AlertManager,
    ) -> Result<Self> {
        let index: Vec<BackupMetadata> = files.read_json(INDEX_FILE).await?.unwrap_or_default();
        if !index.is_empty() {
            info!("Loaded backup index with {} entries", index.len());
        }

        Ok(Self {
            files,
            manager,
            config,
            index: Mutex::new(index),
            scheduled_runs: AtomicU32::new(0),
            next_scheduled_at: std::sync::RwLock::new(None),
            metrics,
            alerts,
        })
    }

    /// On-demand full backup
    pub async fn create_backup(&self, reason: BackupReason) -> Result<BackupMetadata> {
        self.create(BackupKind::Full, reason).await
    }

    /// Backup run by the scheduler: full every `full_every` runs, or when
    /// no full backup exists yet
    pub async fn run_scheduled(&self) -> Result<BackupMetadata> {
        let run = self.scheduled_runs.fetch_add(1, Ordering::SeqCst);
        let full_every = self.config.full_every.max(1);
        let kind = if run % full_every == 0 {
            BackupKind::Full
        } else {
            BackupKind::Incremental
        };
        self.create(kind, BackupReason::Scheduled).await
    }

    async fn create(&self, kind: BackupKind, reason: BackupReason) -> Result<BackupMetadata> {
        // Copy state under the index lock so snapshots follow index order
        let mut index = self.index.lock().await;
        let snapshot = self.manager.store().snapshot();
        let settings = self.manager.settings();

        let base = match kind {
            BackupKind::Full => None,
            BackupKind::Incremental => index
                .iter()
                .rev()
                .find(|m| m.kind == BackupKind::Full)
                .filter(|m| m.lineage == Some(snapshot.lineage))
                .cloned(),
        };
        // No base from this lineage (none yet, a restart, or a restore since):
        // fall back to a full backup
        let kind = if kind == BackupKind::Incremental && base.is_none() {
            BackupKind::Full
        } else {
            kind
        };

        let (sessions, transactions) = match &base {
            Some(base) => (
                snapshot
                    .sessions
                    .into_iter()
                    .filter(|s| s.updated_at >= base.taken_at)
                    .collect(),
                snapshot
                    .transactions
                    .into_iter()
                    .filter(|t| t.timestamp >= base.taken_at)
                    .collect(),
            ),
            None => (snapshot.sessions, snapshot.transactions),
        };

        // Millisecond timestamps identify backups; never reuse one
        let mut timestamp = Utc::now();
        while index
            .iter()
            .any(|m| m.timestamp.timestamp_millis() >= timestamp.timestamp_millis())
        {
            timestamp += chrono::Duration::milliseconds(1);
        }
        let id = format!("backup-{}-{}", timestamp.timestamp_millis(), kind);

        let payload = BackupPayload {
            created_at: timestamp,
            taken_at: snapshot.taken_at,
            kind,
            base_id: base.as_ref().map(|b| b.id.clone()),
            sessions,
            transactions,
            settings,
        };
        let payload_json = serde_json::to_string(&payload)?;
        let checksum = sha256_hex(payload_json.as_bytes());
        let envelope = Envelope {
            checksum: checksum.clone(),
            payload: payload_json,
        };
        let size_bytes = self.files.write_json(artifact_path(&id), &envelope).await?;

        let metadata = BackupMetadata {
            id,
            timestamp,
            taken_at: payload.taken_at,
            lineage: Some(snapshot.lineage),
            kind,
            reason,
            base_id: payload.base_id.clone(),
            size_bytes,
            checksum,
            session_count: payload.sessions.len(),
            transaction_count: payload.transactions.len(),
        };

        index.push(metadata.clone());
        self.prune(&mut index).await;
        self.files.write_json(INDEX_FILE, &*index).await?;
        drop(index);

        info!(
            "Backup {} created ({} sessions, {} transactions, {} bytes)",
            metadata.id, metadata.session_count, metadata.transaction_count, metadata.size_bytes
        );
        self.metrics.increment(metrics::BACKUP_CREATED, 1).await;
        Ok(metadata)
    }

    /// Drop the oldest artifacts beyond retention, keeping any full backup
    /// that a retained incremental builds on
    async fn prune(&self, index: &mut Vec<BackupMetadata>) {
        let retention = self.config.retention.max(1);
        if index.len() <= retention {
            return;
        }

        let excess = index.len() - retention;
        let retained_bases: Vec<String> = index[excess..]
            .iter()
            .filter_map(|m| m.base_id.clone())
            .collect();

        let mut kept = Vec::with_capacity(index.len());
        for (position, metadata) in index.drain(..).enumerate() {
            if position >= excess || retained_bases.contains(&metadata.id) {
                kept.push(metadata);
                continue;
            }
            match self.files.remove(metadata.path()).await {
                Ok(()) => debug!("Pruned backup {}", metadata.id),
                Err(e) => warn!("Failed to prune backup {}: {}", metadata.id, e),
            }
        }
        *index = kept;
    }

    /// Retained backups, newest first
    pub async fn list_backups(&self) -> Vec<BackupMetadata> {
        let index = self.index.lock().await;
        index.iter().rev().cloned().collect()
    }

    pub async fn status(&self) -> BackupStatus {
        let index = self.index.lock().await;
        BackupStatus {
            last_backup: index.last().cloned(),
            last_full_backup: index
                .iter()
                .rev()
                .find(|m| m.kind == BackupKind::Full)
                .cloned(),
            backup_count: index.len(),
            interval_secs: self.config.interval_secs,
            retention: self.config.retention,
            next_scheduled_at: *self
                .next_scheduled_at
                .read()
                .unwrap_or_else(|e| e.into_inner()),
        }
    }

    /// Find a backup by id, epoch milliseconds or RFC 3339 timestamp
    pub async fn resolve(&self, reference: &str) -> Result<BackupMetadata> {
        let reference = reference.trim();
        let millis = reference.parse::<i64>().ok().or_else(|| {
            DateTime::parse_from_rfc3339(reference)
                .ok()
                .map(|t| t.timestamp_millis())
        });

        let index = self.index.lock().await;
        index
            .iter()
            .find(|m| {
                m.id == reference || Some(m.timestamp.timestamp_millis()) == millis
            })
            .cloned()
            .ok_or_else(|| EngineError::BackupNotFound(reference.to_string()))
    }

    /// Read one artifact and verify its checksum against the payload and
    /// the index
    pub async fn load_artifact(&self, metadata: &BackupMetadata) -> Result<BackupPayload> {
        let envelope: Envelope = self
            .files
            .read_json(metadata.path())
            .await
            .map_err(|e| EngineError::BackupCorrupt(format!("{}: {}", metadata.id, e)))?
            .ok_or_else(|| EngineError::BackupNotFound(metadata.id.clone()))?;

        let actual = sha256_hex(envelope.payload.as_bytes());
        if actual != envelope.checksum || actual != metadata.checksum {
            return Err(EngineError::BackupCorrupt(format!(
                "{}: checksum mismatch (expected {}, got {})",
                metadata.id, metadata.checksum, actual
            )));
        }

        serde_json::from_str(&envelope.payload)
            .map_err(|e| EngineError::BackupCorrupt(format!("{}: {}", metadata.id, e)))
    }

    /// Load a backup as restorable state, overlaying incrementals on their base
    pub async fn load_snapshot(&self, metadata: &BackupMetadata) -> Result<BackupPayload> {
        let payload = self.load_artifact(metadata).await?;
        if payload.kind == BackupKind::Full {
            return Ok(payload);
        }

        let base_id = payload.base_id.clone().ok_or_else(|| {
            EngineError::BackupCorrupt(format!("{}: incremental without base", metadata.id))
        })?;
        let base_meta = self.resolve(&base_id).await?;
        let base = self.load_artifact(&base_meta).await?;

        let mut sessions: HashMap<Uuid, Session> =
            base.sessions.into_iter().map(|s| (s.id, s)).collect();
        for session in payload.sessions {
            sessions.insert(session.id, session);
        }
        let mut sessions: Vec<Session> = sessions.into_values().collect();
        sessions.sort_by_key(|s| s.created_at);

        let mut transactions = base.transactions;
        let known: std::collections::HashSet<Uuid> =
            transactions.iter().map(|t| t.id).collect();
        transactions.extend(
            payload
                .transactions
                .into_iter()
                .filter(|t| !known.contains(&t.id)),
        );

        Ok(BackupPayload {
            created_at: payload.created_at,
            taken_at: payload.taken_at,
            kind: BackupKind::Incremental,
            base_id: Some(base_id),
            sessions,
            transactions,
            settings: payload.settings,
        })
    }

    /// Run scheduled backups every `backup.interval`
    pub fn spawn_scheduler(self: &Arc<Self>) -> JoinHandle<()> {
        let service = self.clone();
        let every = self.config.interval().max(std::time::Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = interval(every);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                service.set_next_run(every);
                ticker.tick().await;
                if let Err(e) = service.run_scheduled().await {
                    warn!("Scheduled backup failed: {}", e);
                    service.metrics.increment(metrics::BACKUP_FAILED, 1).await;
                    service
                        .alerts
                        .fire_alert(
                            &AlertType::BackupFailed {
                                reason: e.to_string(),
                            },
                            AlertSeverity::Warning,
                        )
                        .await;
                }
            }
        })
    }

    fn set_next_run(&self, every: std::time::Duration) {
        let next = chrono::Duration::from_std(every)
            .ok()
            .map(|d| Utc::now() + d);
        *self
            .next_scheduled_at
            .write()
            .unwrap_or_else(|e| e.into_inner()) = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::events::EventBroadcaster;
    use crate::maintenance::MaintenanceGuard;
    use crate::paper::PaperLedger;
    use crate::store::SessionStore;
    use crate::types::{SessionState, TokenType, TradeDirection};
    use crate::venue::Collaborators;
    use rust_decimal::Decimal;

    struct Fixture {
        service: Arc<BackupService>,
        manager: Arc<SessionManager>,
        files: StateFiles,
        _dir: tempfile::TempDir,
    }

    async fn fixture(retention: usize, full_every: u32) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let files = StateFiles::new(dir.path());
        let config = EngineConfig::with_state_dir(dir.path());
        let ledger = Arc::new(PaperLedger::new());
        let maintenance = Arc::new(MaintenanceGuard::load(files.clone()).await.unwrap());
        let manager = Arc::new(SessionManager::new(
            &config,
            Arc::new(SessionStore::new()),
            Collaborators::from_backend(ledger),
            Arc::new(EventBroadcaster::new(16)),
            maintenance,
            MetricsCollector::new(),
            AlertManager::default(),
        ));
        let service = BackupService::load(
            files.clone(),
            manager.clone(),
            BackupConfig {
                interval_secs: 60,
                retention,
                full_every,
            },
            MetricsCollector::new(),
            AlertManager::default(),
        )
        .await
        .map(Arc::new)
        .unwrap();

        Fixture {
            service,
            manager,
            files,
            _dir: dir,
        }
    }

    fn seed_session(manager: &SessionManager) -> Session {
        let mut session = Session::new(
            "So11111111111111111111111111111111111111112".into(),
            TokenType::Spl,
            "wallet".into(),
            None,
        );
        session.transition_to(SessionState::AwaitingFunding).unwrap();
        let slot = manager.store().insert(session);
        slot.snapshot()
    }

    #[tokio::test]
    async fn test_full_backup_round_trip() {
        let f = fixture(10, 6).await;
        let session = seed_session(&f.manager);
        f.manager.store().record_transaction(
            Transaction::pending(session.id, TradeDirection::Buy, Decimal::new(1, 1)).succeed(
                Decimal::new(1, 1),
                Decimal::new(5, 6),
                "sig".into(),
                1,
            ),
        );

        let metadata = f.service.create_backup(BackupReason::OnDemand).await.unwrap();
        assert_eq!(metadata.kind, BackupKind::Full);
        assert_eq!(metadata.session_count, 1);
        assert_eq!(metadata.transaction_count, 1);
        assert!(f.files.path(metadata.path()).exists());

        let payload = f.service.load_snapshot(&metadata).await.unwrap();
        assert_eq!(payload.sessions, vec![session]);
        assert_eq!(payload.settings, f.manager.settings());
    }

    #[tokio::test]
    async fn test_tampered_artifact_is_rejected() {
        let f = fixture(10, 6).await;
        seed_session(&f.manager);
        let metadata = f.service.create_backup(BackupReason::OnDemand).await.unwrap();

        let mut envelope: Envelope = f.files.read_json(metadata.path()).await.unwrap().unwrap();
        envelope.payload = envelope.payload.replace("awaiting_funding", "completed");
        f.files.write_json(metadata.path(), &envelope).await.unwrap();

        let err = f.service.load_artifact(&metadata).await.unwrap_err();
        assert!(matches!(err, EngineError::BackupCorrupt(_)));
    }

    #[tokio::test]
    async fn test_incremental_overlays_base() {
        let f = fixture(10, 2).await;
        let first = seed_session(&f.manager);
        let full = f.service.run_scheduled().await.unwrap();
        assert_eq!(full.kind, BackupKind::Full);

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = seed_session(&f.manager);
        let incremental = f.service.run_scheduled().await.unwrap();
        assert_eq!(incremental.kind, BackupKind::Incremental);
        assert_eq!(incremental.base_id.as_deref(), Some(full.id.as_str()));
        assert_eq!(incremental.session_count, 1);

        let restored = f.service.load_snapshot(&incremental).await.unwrap();
        let ids: Vec<_> = restored.sessions.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn test_change_while_backup_waits_is_kept() {
        let f = fixture(10, 2).await;
        let session = seed_session(&f.manager);

        // A backup queued behind another must still copy the latest state
        let index = f.service.index.lock().await;
        let service = f.service.clone();
        let queued = tokio::spawn(async move { service.run_scheduled().await });
        tokio::task::yield_now().await;
        {
            let slot = f.manager.store().get(session.id).unwrap();
            let mut live = slot.lock();
            live.record_funding(Decimal::ONE).unwrap();
            live.transition_to(SessionState::Funded).unwrap();
        }
        drop(index);

        let full = queued.await.unwrap().unwrap();
        assert_eq!(full.kind, BackupKind::Full);
        assert!(full.taken_at <= full.timestamp);
        let incremental = f.service.run_scheduled().await.unwrap();
        assert_eq!(incremental.kind, BackupKind::Incremental);

        let restored = f.service.load_snapshot(&incremental).await.unwrap();
        assert_eq!(restored.sessions.len(), 1);
        assert_eq!(restored.sessions[0].state, SessionState::Funded);
        assert_eq!(restored.sessions[0].detected_funding, Decimal::ONE);
    }

    #[tokio::test]
    async fn test_change_after_snapshot_lands_in_next_incremental() {
        let f = fixture(10, 2).await;
        let session = seed_session(&f.manager);
        let full = f.service.run_scheduled().await.unwrap();

        let slot = f.manager.store().get(session.id).unwrap();
        slot.lock().transition_to(SessionState::Failed).unwrap();
        f.manager.store().record_transaction(
            Transaction::pending(session.id, TradeDirection::Buy, Decimal::ONE)
                .fail("rejected".into(), 1),
        );

        let incremental = f.service.run_scheduled().await.unwrap();
        assert_eq!(incremental.base_id.as_deref(), Some(full.id.as_str()));
        assert_eq!(incremental.session_count, 1);
        assert_eq!(incremental.transaction_count, 1);

        let restored = f.service.load_snapshot(&incremental).await.unwrap();
        assert_eq!(restored.sessions[0].state, SessionState::Failed);
        assert_eq!(restored.transactions.len(), 1);
    }

    #[tokio::test]
    async fn test_restore_forces_next_backup_full() {
        let f = fixture(10, 2).await;
        let session = seed_session(&f.manager);
        let full = f.service.run_scheduled().await.unwrap();
        assert_eq!(full.lineage, Some(f.manager.store().snapshot().lineage));

        f.manager.replace_sessions(vec![]);
        let next = f.service.run_scheduled().await.unwrap();
        assert_eq!(next.kind, BackupKind::Full);
        assert_eq!(next.session_count, 0);

        let restored = f.service.load_snapshot(&next).await.unwrap();
        assert!(restored.sessions.iter().all(|s| s.id != session.id));
    }

    #[tokio::test]
    async fn test_list_is_newest_first_and_pruned() {
        let f = fixture(3, 1).await;
        let mut created = vec![];
        for _ in 0..5 {
            created.push(f.service.create_backup(BackupReason::OnDemand).await.unwrap());
        }

        let listed = f.service.list_backups().await;
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].id, created[4].id);
        assert_eq!(listed[2].id, created[2].id);
        assert!(!f.files.path(created[0].path()).exists());

        let status = f.service.status().await;
        assert_eq!(status.backup_count, 3);
        assert_eq!(status.last_backup.unwrap().id, created[4].id);
    }

    #[tokio::test]
    async fn test_resolve_by_id_millis_and_rfc3339() {
        let f = fixture(10, 6).await;
        let metadata = f.service.create_backup(BackupReason::OnDemand).await.unwrap();
        let millis = metadata.timestamp.timestamp_millis();

        assert_eq!(f.service.resolve(&metadata.id).await.unwrap(), metadata);
        assert_eq!(f.service.resolve(&millis.to_string()).await.unwrap(), metadata);
        let rfc = metadata.timestamp.to_rfc3339();
        assert_eq!(f.service.resolve(&rfc).await.unwrap(), metadata);

        assert!(matches!(
            f.service.resolve("backup-1-full").await,
            Err(EngineError::BackupNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_index_survives_reload() {
        let f = fixture(10, 6).await;
        let metadata = f.service.create_backup(BackupReason::OnDemand).await.unwrap();

        let reopened = BackupService::load(
            f.files.clone(),
            f.manager.clone(),
            BackupConfig::default(),
            MetricsCollector::new(),
            AlertManager::default(),
        )
        .await
        .unwrap();
        assert_eq!(reopened.list_backups().await, vec![metadata]);
    }
}
