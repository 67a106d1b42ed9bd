//! Core session types
//!
//! These types are persisted in backups and returned by the API, so field
//! names are part of the external contract.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    AwaitingFunding,
    Funded,
    Trading,
    Paused,
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }

    /// Whether `to` is a legal next state. Resuming from `Paused` is checked
    /// against the recorded origin separately.
    pub fn can_transition_to(&self, to: SessionState) -> bool {
        use SessionState::*;

        if self.is_terminal() {
            return false;
        }

        match (self, to) {
            (_, Failed) | (_, Completed) => true,
            (Created, AwaitingFunding) => true,
            (AwaitingFunding, Funded) => true,
            (Funded, Trading) => true,
            (Funded, Paused) | (Trading, Paused) => true,
            (Paused, Funded) | (Paused, Trading) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Created => "created",
            SessionState::AwaitingFunding => "awaiting_funding",
            SessionState::Funded => "funded",
            SessionState::Trading => "trading",
            SessionState::Paused => "paused",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Token program family, passed through to the validator and venue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    #[default]
    Spl,
    Token2022,
    PumpFun,
}

/// A single funded trading run against one token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Option<String>,
    pub token_address: String,
    pub token_type: TokenType,
    /// Dedicated wallet, never shared with another session
    pub wallet_address: String,
    pub state: SessionState,
    /// State to return to when a pause is lifted
    pub paused_from: Option<SessionState>,
    /// Wallet balance observed right after provisioning
    pub baseline_balance: Decimal,
    pub detected_funding: Decimal,
    pub trading_balance: Decimal,
    pub revenue_amount: Decimal,
    pub revenue_signature: Option<String>,
    pub total_trades: u32,
    pub total_volume: Decimal,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        token_address: String,
        token_type: TokenType,
        wallet_address: String,
        user_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            token_address,
            token_type,
            wallet_address,
            state: SessionState::Created,
            paused_from: None,
            baseline_balance: Decimal::ZERO,
            detected_funding: Decimal::ZERO,
            trading_balance: Decimal::ZERO,
            revenue_amount: Decimal::ZERO,
            revenue_signature: None,
            total_trades: 0,
            total_volume: Decimal::ZERO,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Move to `to`, enforcing the lifecycle graph
    pub fn transition_to(&mut self, to: SessionState) -> Result<()> {
        let legal = match (self.state, to) {
            (SessionState::Paused, SessionState::Funded | SessionState::Trading) => {
                self.paused_from == Some(to)
            }
            (from, to) => from.can_transition_to(to),
        };

        if !legal {
            return Err(EngineError::InvalidTransition {
                from: self.state,
                to,
            });
        }

        if to == SessionState::Paused {
            self.paused_from = Some(self.state);
        } else if self.state == SessionState::Paused {
            self.paused_from = None;
        }

        self.state = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record the one-and-only detected deposit
    pub fn record_funding(&mut self, amount: Decimal) -> Result<()> {
        if self.detected_funding > Decimal::ZERO {
            return Err(EngineError::Validation(format!(
                "session {} already funded with {}",
                self.id, self.detected_funding
            )));
        }
        self.detected_funding = amount;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Deduct a completed trade from the trading allocation
    ///
    /// The balance floors at zero; the part of the trade and fee it could not
    /// cover is returned.
    pub fn apply_trade(&mut self, amount: Decimal, fee: Decimal) -> Decimal {
        let consumed = amount + fee;
        let shortfall = (consumed - self.trading_balance).max(Decimal::ZERO);
        self.trading_balance = (self.trading_balance - consumed).max(Decimal::ZERO);
        self.total_trades += 1;
        self.total_volume += amount;
        self.updated_at = Utc::now();
        shortfall
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeDirection {
    Buy,
    Sell,
}

impl std::fmt::Display for TradeDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeDirection::Buy => write!(f, "buy"),
            TradeDirection::Sell => write!(f, "sell"),
        }
    }
}

/// Transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Success,
    Failed,
}

/// A trade attempt recorded against a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub session_id: Uuid,
    pub direction: TradeDirection,
    pub amount: Decimal,
    pub fee: Decimal,
    pub signature: Option<String>,
    pub status: TransactionStatus,
    pub error: Option<String>,
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
}

impl Transaction {
    /// A trade about to be submitted; settled with [`Transaction::succeed`]
    /// or [`Transaction::fail`] once the venue answers
    pub fn pending(session_id: Uuid, direction: TradeDirection, amount: Decimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            direction,
            amount,
            fee: Decimal::ZERO,
            signature: None,
            status: TransactionStatus::Pending,
            error: None,
            attempts: 0,
            timestamp: Utc::now(),
        }
    }

    /// Settle with the confirmed amount, fee and signature
    pub fn succeed(
        mut self,
        amount: Decimal,
        fee: Decimal,
        signature: String,
        attempts: u32,
    ) -> Self {
        self.amount = amount;
        self.fee = fee;
        self.signature = Some(signature);
        self.status = TransactionStatus::Success;
        self.attempts = attempts;
        self.timestamp = Utc::now();
        self
    }

    pub fn fail(mut self, error: String, attempts: u32) -> Self {
        self.status = TransactionStatus::Failed;
        self.error = Some(error);
        self.attempts = attempts;
        self.timestamp = Utc::now();
        self
    }
}
