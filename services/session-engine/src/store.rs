//! In-memory session and transaction store
//!
//! Each session lives in its own slot with its own lock; the maps are only
//! locked long enough to look a slot up or clone a snapshot.
//!
//! Lock order: commit gate, then a session slot, then the transaction log.
//! Trades hold the gate shared while they update the session and append its
//! transaction; [`SessionStore::snapshot`] holds it exclusively, so a backup
//! never sees one half of a trade.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use uuid::Uuid;

use crate::types::{Session, Transaction};

/// One session record plus the flags its task polls
pub struct SessionSlot {
    session: Mutex<Session>,
    stop: AtomicBool,
    /// Set when recovery replaces this slot; the old task exits silently
    retired: AtomicBool,
}

impl SessionSlot {
    fn new(session: Session) -> Self {
        Self {
            session: Mutex::new(session),
            stop: AtomicBool::new(false),
            retired: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.lock().id
    }

    /// Exclusive access to the record
    pub fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> Session {
        self.lock().clone()
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }
}

/// Consistent copy of the store used by backups
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    /// Watermark: every later change carries a timestamp at or after it
    pub taken_at: DateTime<Utc>,
    /// Identity of the state this snapshot descends from; new for every
    /// store and whenever a restore replaces state wholesale
    pub lineage: Uuid,
    pub sessions: Vec<Session>,
    pub transactions: Vec<Transaction>,
}

pub struct SessionStore {
    commit_gate: RwLock<()>,
    sessions: RwLock<HashMap<Uuid, Arc<SessionSlot>>>,
    transactions: RwLock<HashMap<Uuid, Vec<Transaction>>>,
    /// Monotonic count of transactions ever recorded by this process
    recorded: AtomicU64,
    lineage: RwLock<Uuid>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self {
            commit_gate: RwLock::new(()),
            sessions: RwLock::new(HashMap::new()),
            transactions: RwLock::new(HashMap::new()),
            recorded: AtomicU64::new(0),
            lineage: RwLock::new(Uuid::new_v4()),
        }
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn new_lineage(&self) {
        *self.lineage.write().unwrap_or_else(|e| e.into_inner()) = Uuid::new_v4();
    }

    pub fn insert(&self, session: Session) -> Arc<SessionSlot> {
        let slot = Arc::new(SessionSlot::new(session));
        let id = slot.id();
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, slot.clone());
        slot
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<SessionSlot>> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    pub fn slots(&self) -> Vec<Arc<SessionSlot>> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// All sessions, oldest first
    pub fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.slots().iter().map(|s| s.snapshot()).collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    pub fn list_active(&self) -> Vec<Session> {
        self.list().into_iter().filter(|s| s.is_active()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.slots()
            .iter()
            .filter(|slot| slot.lock().is_active())
            .count()
    }

    /// Append a transaction that leaves its session untouched
    pub fn record_transaction(&self, tx: Transaction) {
        let _gate = self.commit_gate.read().unwrap_or_else(|e| e.into_inner());
        self.append(tx);
    }

    /// Update the session and append `tx` as one step, as seen by
    /// [`SessionStore::snapshot`]
    pub fn commit<R>(
        &self,
        slot: &SessionSlot,
        tx: Transaction,
        apply: impl FnOnce(&mut Session) -> R,
    ) -> R {
        let _gate = self.commit_gate.read().unwrap_or_else(|e| e.into_inner());
        let mut session = slot.lock();
        let result = apply(&mut session);
        self.append(tx);
        result
    }

    /// Caller holds the commit gate; the timestamp is restamped so it is
    /// never older than a snapshot the transaction missed
    fn append(&self, mut tx: Transaction) {
        tx.timestamp = Utc::now();
        self.transactions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(tx.session_id)
            .or_default()
            .push(tx);
        self.recorded.fetch_add(1, Ordering::SeqCst);
    }

    pub fn transactions(&self, session_id: Uuid) -> Vec<Transaction> {
        self.transactions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn transactions_recorded(&self) -> u64 {
        self.recorded.load(Ordering::SeqCst)
    }

    /// Copy every record at one instant
    ///
    /// Sessions changed outside a trade commit are read under their own
    /// lock; such a change that lands after `taken_at` is stamped with an
    /// `updated_at` at or after it.
    pub fn snapshot(&self) -> StoreSnapshot {
        let _gate = self.commit_gate.write().unwrap_or_else(|e| e.into_inner());
        let taken_at = Utc::now();
        let sessions = self.list();
        let mut transactions: Vec<Transaction> = self
            .transactions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .flatten()
            .cloned()
            .collect();
        transactions.sort_by_key(|t| t.timestamp);

        StoreSnapshot {
            taken_at,
            lineage: *self.lineage.read().unwrap_or_else(|e| e.into_inner()),
            sessions,
            transactions,
        }
    }

    /// Replace the transaction log wholesale
    pub fn replace_transactions(&self, transactions: Vec<Transaction>) {
        let mut by_session: HashMap<Uuid, Vec<Transaction>> = HashMap::new();
        for tx in transactions {
            by_session.entry(tx.session_id).or_default().push(tx);
        }
        let _gate = self.commit_gate.write().unwrap_or_else(|e| e.into_inner());
        *self.transactions.write().unwrap_or_else(|e| e.into_inner()) = by_session;
        self.new_lineage();
    }

    /// Replace every session; returns the slots that were displaced so their
    /// tasks can be retired
    pub fn replace_sessions(&self, sessions: Vec<Session>) -> Vec<Arc<SessionSlot>> {
        let fresh: HashMap<Uuid, Arc<SessionSlot>> = sessions
            .into_iter()
            .map(|s| (s.id, Arc::new(SessionSlot::new(s))))
            .collect();

        let _gate = self.commit_gate.write().unwrap_or_else(|e| e.into_inner());
        let mut map = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let old = std::mem::replace(&mut *map, fresh);
        self.new_lineage();
        old.into_values().collect()
    }
}
