//! Session manager - owns every session's lifecycle
//!
//! Each active session is driven by its own task which moves it through
//! funding detection, the revenue split and the trade loop. Lifecycle
//! events are published while the session's lock is held, so subscribers
//! see one session's events in the order its state changed.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::alerting::{AlertManager, AlertSeverity, AlertType};
use crate::amount::{round_sol, validate_address};
use crate::config::{EngineConfig, RuntimeSettings};
use crate::detector::{Detection, FundDetector};
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBroadcaster, LifecycleStatus, SessionSummary};
use crate::executor::{FixedFractionSizing, TickOutcome, TradeExecutor, TradeSizingPolicy};
use crate::maintenance::MaintenanceGuard;
use crate::observability::{metrics, Logger, MetricsCollector};
use crate::retry::{with_retry, RetryConfig};
use crate::splitter::{plan_split, FundSplitter, SplitOutcome};
use crate::store::{SessionSlot, SessionStore};
use crate::types::{Session, SessionState, TokenType, TradeDirection, Transaction};
use crate::venue::{Collaborators, SwapReceipt, TokenVerdict};

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSessionRequest {
    pub token_address: String,
    #[serde(default)]
    pub token_type: TokenType,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Reply to a funding note
#[derive(Debug, Clone, Serialize)]
pub struct FundingAck {
    pub session_id: Uuid,
    pub wallet_address: String,
    /// Whether the wallet was credited directly (paper mode)
    pub credited: bool,
    pub wallet_balance: Option<Decimal>,
    pub message: String,
}

pub struct SessionManager {
    settings: RwLock<RuntimeSettings>,
    store: Arc<SessionStore>,
    collaborators: Collaborators,
    broadcaster: Arc<EventBroadcaster>,
    maintenance: Arc<MaintenanceGuard>,
    splitter: FundSplitter,
    sizing: Arc<dyn TradeSizingPolicy>,
    metrics: MetricsCollector,
    alerts: AlertManager,
    tasks: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(
        config: &EngineConfig,
        store: Arc<SessionStore>,
        collaborators: Collaborators,
        broadcaster: Arc<EventBroadcaster>,
        maintenance: Arc<MaintenanceGuard>,
        metrics: MetricsCollector,
        alerts: AlertManager,
    ) -> Self {
        let splitter = FundSplitter::new(collaborators.chain.clone(), config.collection_address());
        Self {
            settings: RwLock::new(config.runtime_settings()),
            store,
            sizing: Arc::new(FixedFractionSizing::new(config.trading.trade_fraction)),
            collaborators,
            broadcaster,
            maintenance,
            splitter,
            metrics,
            alerts,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the default fixed-fraction sizing
    pub fn with_sizing_policy(mut self, sizing: Arc<dyn TradeSizingPolicy>) -> Self {
        self.sizing = sizing;
        self
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn broadcaster(&self) -> &Arc<EventBroadcaster> {
        &self.broadcaster
    }

    pub fn settings(&self) -> RuntimeSettings {
        self.settings.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Swap in new tunables; running sessions pick them up at their next phase
    pub fn apply_settings(&self, settings: RuntimeSettings) {
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
    }

    // ==================== PUBLIC CONTRACT ====================

    /// Validate the token, provision a wallet and start watching it for funds
    pub async fn create_session(self: &Arc<Self>, request: CreateSessionRequest) -> Result<Session> {
        if self.maintenance.blocks_new_sessions() {
            self.metrics.increment(metrics::SESSION_REJECTED, 1).await;
            return Err(EngineError::Maintenance(self.maintenance.message()));
        }

        let token_address = request.token_address.trim().to_string();
        validate_address(&token_address)?;

        match self
            .collaborators
            .validator
            .validate(&token_address, request.token_type)
            .await?
        {
            TokenVerdict::Tradable { pool } => {
                debug!(
                    "Token {} tradable on {} (liquidity {} SOL)",
                    token_address, pool.dex, pool.liquidity_sol
                );
            }
            TokenVerdict::Rejected { reason } => {
                return Err(EngineError::Validation(format!(
                    "token {} rejected: {}",
                    token_address, reason
                )));
            }
        }

        let settings = self.settings();
        let wallet = self.collaborators.provisioner.provision().await?;
        let baseline = self
            .read_balance(&wallet.address, &RetryConfig::from(&settings.trading))
            .await?;

        let mut session = Session::new(
            token_address,
            request.token_type,
            wallet.address,
            request.user_id,
        );
        session.baseline_balance = baseline;
        let slot = self.store.insert(session);

        let min_funding = settings.funding.min_funding_sol;
        let session = self
            .transition(&slot, SessionState::AwaitingFunding, |s| {
                Ok(LifecycleStatus::AwaitingFunding {
                    wallet_address: s.wallet_address.clone(),
                    min_funding,
                })
            })?
            .ok_or_else(|| EngineError::Validation("session replaced during creation".into()))?;

        Logger::session_event(session.id, "created", &session.token_address);
        self.metrics.increment(metrics::SESSION_CREATED, 1).await;
        self.spawn_driver(slot);
        self.update_active_gauge().await;

        Ok(session)
    }

    pub fn get_session(&self, id: Uuid) -> Result<Session> {
        self.store
            .get(id)
            .map(|slot| slot.snapshot())
            .ok_or(EngineError::SessionNotFound(id))
    }

    /// Stop a session; a no-op once it is terminal
    pub fn stop_session(&self, id: Uuid) -> Result<Session> {
        let slot = self.store.get(id).ok_or(EngineError::SessionNotFound(id))?;
        slot.request_stop();
        if self.complete_stopped(&slot)?.is_some() {
            info!(session_id = %id, "Session stopped");
        }
        Ok(slot.snapshot())
    }

    /// Stop every active session; returns how many were stopped
    pub fn stop_all(&self) -> usize {
        let mut stopped = 0;
        for session in self.store.list_active() {
            match self.stop_session(session.id) {
                Ok(_) => stopped += 1,
                Err(e) => warn!(session_id = %session.id, "Stop failed: {}", e),
            }
        }
        stopped
    }

    pub fn list_active_sessions(&self) -> Vec<Session> {
        self.store.list_active()
    }

    pub fn list_sessions(&self) -> Vec<Session> {
        self.store.list()
    }

    pub fn session_transactions(&self, id: Uuid) -> Result<Vec<Transaction>> {
        if self.store.get(id).is_none() {
            return Err(EngineError::SessionNotFound(id));
        }
        Ok(self.store.transactions(id))
    }

    /// Handle a funding note: paper mode credits the wallet, live mode only
    /// acknowledges since the deposit is detected on-chain
    pub async fn fund_session(&self, id: Uuid, amount: Decimal) -> Result<FundingAck> {
        if amount <= Decimal::ZERO {
            return Err(EngineError::Validation(format!(
                "funding amount must be positive, got {}",
                amount
            )));
        }

        let session = self.get_session(id)?;
        if session.state != SessionState::AwaitingFunding {
            return Err(EngineError::Validation(format!(
                "session {} is {}, not awaiting funding",
                id, session.state
            )));
        }

        match &self.collaborators.funding_hook {
            Some(hook) => {
                let balance = hook.credit(&session.wallet_address, amount).await?;
                Logger::session_event(id, "funding_credited", &amount.to_string());
                Ok(FundingAck {
                    session_id: id,
                    wallet_address: session.wallet_address,
                    credited: true,
                    wallet_balance: Some(balance),
                    message: "Deposit credited; it will be detected on the next poll".to_string(),
                })
            }
            None => {
                info!(session_id = %id, "Manual funding note for {} SOL", amount);
                Ok(FundingAck {
                    session_id: id,
                    message: format!(
                        "Send {} SOL to {}; the deposit is detected automatically",
                        amount, session.wallet_address
                    ),
                    wallet_address: session.wallet_address,
                    credited: false,
                    wallet_balance: None,
                })
            }
        }
    }

    // ==================== RESTORE ====================

    /// Replace every session with `sessions`; tasks driving the displaced
    /// records are retired and aborted
    pub fn replace_sessions(&self, sessions: Vec<Session>) -> usize {
        let count = sessions.len();
        let displaced = self.store.replace_sessions(sessions);
        for slot in &displaced {
            slot.retire();
        }

        let handles: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in handles {
            handle.abort();
        }

        info!(
            "Replaced {} sessions with {} restored ones",
            displaced.len(),
            count
        );
        count
    }

    /// Start a driver for every non-terminal session that lacks one
    pub fn resume_sessions(self: &Arc<Self>) -> usize {
        let mut resumed = 0;
        for slot in self.store.slots() {
            let session = slot.snapshot();
            let running = self
                .tasks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains_key(&session.id);
            if session.is_active() && !running {
                Logger::session_event(session.id, "resumed", &session.state.to_string());
                self.spawn_driver(slot);
                resumed += 1;
            }
        }
        resumed
    }

    // ==================== SNAPSHOTS ====================

    pub async fn publish_snapshot(&self) {
        let sessions: Vec<SessionSummary> =
            self.store.list().iter().map(SessionSummary::from).collect();
        self.broadcaster
            .publish(EngineEvent::AllSessionsUpdate { sessions });
        self.update_active_gauge().await;
    }

    /// Periodically publish `all_sessions_update`
    pub fn spawn_snapshot_publisher(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        let every = every.max(Duration::from_millis(100));
        tokio::spawn(async move {
            let mut ticker = interval(every);
            loop {
                ticker.tick().await;
                manager.publish_snapshot().await;
            }
        })
    }

    async fn update_active_gauge(&self) {
        self.metrics
            .gauge(metrics::ACTIVE_SESSIONS, self.store.active_count() as f64)
            .await;
    }

    // ==================== DRIVER ====================

    fn spawn_driver(self: &Arc<Self>, slot: Arc<SessionSlot>) {
        let session_id = slot.id();
        let manager = self.clone();
        let handle = tokio::spawn(async move { manager.drive(slot).await });

        let previous = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session_id, handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    async fn drive(self: Arc<Self>, slot: Arc<SessionSlot>) {
        let session_id = slot.id();
        debug!(session_id = %session_id, "Session task started");

        loop {
            if slot.is_retired() {
                debug!(session_id = %session_id, "Session task retired");
                return;
            }
            if slot.stop_requested() {
                if let Err(e) = self.complete_stopped(&slot) {
                    error!(session_id = %session_id, "Stop failed: {}", e);
                }
                break;
            }

            let state = slot.lock().state;
            let step = match state {
                SessionState::Created => Err(EngineError::Validation(
                    "session was never provisioned".to_string(),
                )),
                SessionState::AwaitingFunding => self.funding_phase(&slot).await,
                SessionState::Funded => self.split_phase(&slot).await,
                SessionState::Trading => self.trading_phase(&slot).await,
                SessionState::Paused => self.paused_phase(&slot).await,
                SessionState::Completed | SessionState::Failed => break,
            };

            if let Err(e) = step {
                error!(session_id = %session_id, state = %state, "Session step failed: {}", e);
                self.fail(&slot, e.to_string()).await;
            }
        }

        self.finish(&slot).await;
    }

    async fn finish(&self, slot: &SessionSlot) {
        if slot.is_retired() {
            return;
        }

        let session = slot.snapshot();
        match session.state {
            SessionState::Completed => {
                self.metrics.increment(metrics::SESSION_COMPLETED, 1).await;
            }
            SessionState::Failed => {
                self.metrics.increment(metrics::SESSION_FAILED, 1).await;
            }
            _ => {}
        }

        self.alerts.reset_trade_failures(session.id).await;
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&session.id);
        self.update_active_gauge().await;
        debug!(session_id = %session.id, "Session task finished in {}", session.state);
    }

    fn interrupted(slot: &SessionSlot) -> bool {
        slot.is_retired() || slot.stop_requested() || slot.lock().state.is_terminal()
    }

    /// `awaiting_funding`: poll the wallet until a deposit lands
    async fn funding_phase(&self, slot: &SessionSlot) -> Result<()> {
        let session = slot.snapshot();
        let funding = self.settings().funding;
        let detector = FundDetector::new(
            self.collaborators.chain.clone(),
            funding.min_funding_sol,
            funding.poll_interval(),
        )
        .with_metrics(self.metrics.clone());

        let detection = detector
            .watch(&session.wallet_address, session.baseline_balance, || {
                Self::interrupted(slot)
            })
            .await;

        if let Detection::Funded(amount) = detection {
            let amount = round_sol(amount);
            let funded = self.transition(slot, SessionState::Funded, |s| {
                s.record_funding(amount)?;
                Ok(LifecycleStatus::Funded { amount })
            })?;
            if funded.is_some() {
                self.metrics.increment(metrics::FUNDING_DETECTED, 1).await;
            }
        }
        Ok(())
    }

    /// `funded`: collect revenue, then hand the rest to the trade loop
    async fn split_phase(&self, slot: &SessionSlot) -> Result<()> {
        if self.maintenance.pauses_sessions() {
            return self.pause(slot);
        }
        if Self::interrupted(slot) {
            return Ok(());
        }

        let session = slot.snapshot();
        let outcome = match &session.revenue_signature {
            Some(signature) => {
                let plan = plan_split(session.detected_funding);
                SplitOutcome {
                    revenue_amount: plan.revenue,
                    trading_amount: plan.trading,
                    signature: signature.clone(),
                    attempts: 0,
                }
            }
            None => {
                let retry = RetryConfig::from(&self.settings().trading);
                match self
                    .splitter
                    .split(
                        session.id,
                        &session.wallet_address,
                        session.detected_funding,
                        &retry,
                    )
                    .await
                {
                    Ok(outcome) => {
                        self.metrics.increment(metrics::REVENUE_COLLECTED, 1).await;
                        outcome
                    }
                    Err(e) => {
                        self.fail(slot, format!("revenue transfer failed: {}", e))
                            .await;
                        return Ok(());
                    }
                }
            }
        };

        let started = self.transition(slot, SessionState::Trading, |s| {
            s.revenue_amount = outcome.revenue_amount;
            s.revenue_signature = Some(outcome.signature.clone());
            s.trading_balance = outcome.trading_amount;
            Ok(LifecycleStatus::Trading {
                trading_balance: outcome.trading_amount,
                revenue_amount: outcome.revenue_amount,
                revenue_signature: outcome.signature.clone(),
            })
        })?;

        if started.is_none() && !slot.is_retired() {
            // Stopped while the transfer was in flight: the revenue still moved
            let mut s = slot.lock();
            if s.revenue_signature.is_none() {
                s.revenue_amount = outcome.revenue_amount;
                s.revenue_signature = Some(outcome.signature);
                s.updated_at = chrono::Utc::now();
            }
        }
        Ok(())
    }

    /// `trading`: one trade per tick until the allocation is spent
    async fn trading_phase(&self, slot: &SessionSlot) -> Result<()> {
        let trading = self.settings().trading;
        let executor = TradeExecutor::new(
            self.collaborators.venue.clone(),
            self.sizing.clone(),
            RetryConfig::from(&trading),
            trading.min_trade_sol,
        )
        .with_fee_reserve(trading.fee_reserve_sol);
        let max_failures = trading.max_consecutive_failures.max(1);
        let mut consecutive_failures = 0u32;

        loop {
            if Self::interrupted(slot) {
                return Ok(());
            }
            if self.maintenance.pauses_sessions() {
                return self.pause(slot);
            }

            let session = slot.snapshot();
            let direction = if session.total_trades % 2 == 0 {
                TradeDirection::Buy
            } else {
                TradeDirection::Sell
            };

            match executor.execute_tick(&session, direction).await {
                TickOutcome::Done => {
                    self.transition(slot, SessionState::Completed, |s| {
                        Ok(LifecycleStatus::Completed {
                            total_trades: s.total_trades,
                            total_volume: s.total_volume,
                            stopped: false,
                        })
                    })?;
                    return Ok(());
                }
                TickOutcome::Executed {
                    transaction,
                    receipt,
                } => {
                    if slot.is_retired() {
                        return Ok(());
                    }
                    let retries = u64::from(transaction.attempts.saturating_sub(1));
                    self.record_trade(slot, direction, &receipt, transaction);
                    consecutive_failures = 0;
                    self.alerts.reset_trade_failures(session.id).await;
                    self.metrics.increment(metrics::TRADE_EXECUTED, 1).await;
                    self.metrics.increment(metrics::TRADE_RETRIES, retries).await;
                }
                TickOutcome::Exhausted { transaction, error } => {
                    if slot.is_retired() {
                        return Ok(());
                    }
                    let retries = u64::from(transaction.attempts.saturating_sub(1));
                    self.store.record_transaction(transaction);
                    self.metrics.increment(metrics::TRADE_FAILED, 1).await;
                    self.metrics.increment(metrics::TRADE_RETRIES, retries).await;

                    consecutive_failures += 1;
                    if let Some(alert) = self.alerts.record_trade_failure(session.id).await {
                        self.alerts.fire_alert(&alert, AlertSeverity::Warning).await;
                    }
                    if consecutive_failures >= max_failures {
                        self.fail(
                            slot,
                            format!(
                                "{} consecutive failed trades, last error: {}",
                                consecutive_failures, error
                            ),
                        )
                        .await;
                        return Ok(());
                    }
                }
                TickOutcome::Rejected { transaction, error } => {
                    if slot.is_retired() {
                        return Ok(());
                    }
                    self.store.record_transaction(transaction);
                    self.metrics.increment(metrics::TRADE_FAILED, 1).await;
                    self.fail(slot, format!("trade rejected: {}", error)).await;
                    return Ok(());
                }
            }

            let remaining = slot.lock().trading_balance;
            if executor.has_next(remaining) {
                sleep(trading.interval()).await;
            }
        }
    }

    /// `paused`: wait for the maintenance lock to stop pausing sessions
    async fn paused_phase(&self, slot: &SessionSlot) -> Result<()> {
        let wait = self.settings().funding.poll_interval();
        loop {
            if Self::interrupted(slot) {
                return Ok(());
            }

            if !self.maintenance.pauses_sessions() {
                let resume_to = slot.lock().paused_from.unwrap_or(SessionState::Funded);
                let resumed = self.transition(slot, resume_to, |_| {
                    Ok(LifecycleStatus::Resumed {
                        resumed_state: resume_to,
                    })
                })?;
                if let Some(session) = resumed {
                    info!(session_id = %session.id, "Session resumed into {}", resume_to);
                }
                return Ok(());
            }

            sleep(wait).await;
        }
    }

    // ==================== TRANSITIONS ====================

    /// Apply `update` and move to `to` atomically, publishing the resulting
    /// `bot_status` under the session lock
    ///
    /// Returns `None` without touching the record if the session is already
    /// terminal or its slot was retired.
    fn transition<F>(&self, slot: &SessionSlot, to: SessionState, update: F) -> Result<Option<Session>>
    where
        F: FnOnce(&mut Session) -> Result<LifecycleStatus>,
    {
        let mut guard = slot.lock();
        if slot.is_retired() || guard.state.is_terminal() {
            return Ok(None);
        }

        let mut next = guard.clone();
        let status = update(&mut next)?;
        next.transition_to(to)?;
        *guard = next;

        let session_id = guard.id;
        Logger::session_event(session_id, "transition", &to.to_string());
        self.broadcaster
            .publish(EngineEvent::BotStatus { session_id, status });

        if to.is_terminal() {
            self.broadcaster.publish(EngineEvent::SessionUpdate {
                session_id,
                total_trades: guard.total_trades,
                total_volume: guard.total_volume,
                is_active: false,
            });
            self.broadcaster.close_session(session_id);
        }

        Ok(Some(guard.clone()))
    }

    fn complete_stopped(&self, slot: &SessionSlot) -> Result<Option<Session>> {
        self.transition(slot, SessionState::Completed, |s| {
            Ok(LifecycleStatus::Completed {
                total_trades: s.total_trades,
                total_volume: s.total_volume,
                stopped: true,
            })
        })
    }

    fn pause(&self, slot: &SessionSlot) -> Result<()> {
        let reason = self.maintenance.message();
        let paused = self.transition(slot, SessionState::Paused, |_| {
            Ok(LifecycleStatus::Paused {
                reason: reason.clone(),
            })
        })?;
        if let Some(session) = paused {
            warn!(session_id = %session.id, "Session paused: {}", reason);
        }
        Ok(())
    }

    async fn fail(&self, slot: &SessionSlot, reason: String) {
        let failed = self.transition(slot, SessionState::Failed, |s| {
            s.failure_reason = Some(reason.clone());
            Ok(LifecycleStatus::Failed {
                reason: reason.clone(),
            })
        });

        match failed {
            Ok(Some(session)) => {
                error!(session_id = %session.id, "Session failed: {}", reason);
                self.alerts
                    .fire_alert(
                        &AlertType::SessionFailed {
                            session_id: session.id,
                            reason,
                        },
                        AlertSeverity::Warning,
                    )
                    .await;
            }
            Ok(None) => {}
            Err(e) => error!("Could not mark session failed ({}): {}", reason, e),
        }
    }

    /// Book a confirmed swap against the session, together with its
    /// transaction, and announce it
    fn record_trade(
        &self,
        slot: &SessionSlot,
        direction: TradeDirection,
        receipt: &SwapReceipt,
        transaction: Transaction,
    ) {
        let shortfall = self.store.commit(slot, transaction, |session| {
            let shortfall = session.apply_trade(receipt.amount, receipt.fee);

            let session_id = session.id;
            self.broadcaster.publish(EngineEvent::TradeExecuted {
                session_id,
                trade_type: direction,
                amount: receipt.amount,
                signature: receipt.signature.clone(),
                total_trades: session.total_trades,
                total_volume: session.total_volume,
                remaining_balance: session.trading_balance,
            });
            self.broadcaster.publish(EngineEvent::SessionUpdate {
                session_id,
                total_trades: session.total_trades,
                total_volume: session.total_volume,
                is_active: session.is_active(),
            });
            shortfall
        });

        if shortfall > Decimal::ZERO {
            warn!(
                session_id = %slot.id(),
                "Trade {} overdrew the trading balance by {} SOL",
                receipt.signature, shortfall
            );
        }
    }

    async fn read_balance(&self, address: &str, retry: &RetryConfig) -> Result<Decimal> {
        let chain = self.collaborators.chain.clone();
        with_retry(
            || {
                let chain = chain.clone();
                let address = address.to_string();
                async move { chain.get_balance(&address).await }
            },
            retry,
        )
        .await
        .map(|attempted| attempted.value)
        .map_err(|exhausted| exhausted.error)
    }
}
