//! Collaborator interfaces: wallet provisioning, chain access, swap
//! submission and token validation
//!
//! The engine never talks to a blockchain directly. Paper mode wires every
//! trait to [`crate::paper::PaperLedger`]; live mode to
//! [`crate::gateway::GatewayClient`].

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{TokenType, TradeDirection};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionedWallet {
    pub address: String,
}

/// Generates a fresh wallet per session
#[async_trait]
pub trait WalletProvisioner: Send + Sync {
    async fn provision(&self) -> Result<ProvisionedWallet>;
}

/// Balance reads and native transfers
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// SOL balance of `address`
    async fn get_balance(&self, address: &str) -> Result<Decimal>;

    /// Transfer `amount` SOL and wait for confirmation; returns the signature
    async fn transfer(&self, from: &str, to: &str, amount: Decimal) -> Result<String>;
}

/// Swap request for one trade tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapRequest {
    pub session_id: Uuid,
    pub wallet_address: String,
    pub token_address: String,
    pub token_type: TokenType,
    pub direction: TradeDirection,
    /// SOL amount
    pub amount: Decimal,
}

/// Confirmed swap
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapReceipt {
    pub signature: String,
    pub amount: Decimal,
    pub fee: Decimal,
}

/// Submits swaps to a DEX
#[async_trait]
pub trait TradingVenue: Send + Sync {
    async fn submit_swap(&self, request: &SwapRequest) -> Result<SwapReceipt>;
}

/// Pool metadata returned with a positive verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolInfo {
    pub pool_address: String,
    pub dex: String,
    pub liquidity_sol: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum TokenVerdict {
    Tradable { pool: PoolInfo },
    Rejected { reason: String },
}

/// Token liquidity discovery, treated as a black box
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token_address: &str, token_type: TokenType) -> Result<TokenVerdict>;
}

/// Credits a wallet directly; only the paper ledger implements it
#[async_trait]
pub trait FundingHook: Send + Sync {
    async fn credit(&self, address: &str, amount: Decimal) -> Result<Decimal>;
}

/// The full set of collaborators a session needs
#[derive(Clone)]
pub struct Collaborators {
    pub provisioner: Arc<dyn WalletProvisioner>,
    pub chain: Arc<dyn ChainClient>,
    pub venue: Arc<dyn TradingVenue>,
    pub validator: Arc<dyn TokenValidator>,
    pub funding_hook: Option<Arc<dyn FundingHook>>,
}

impl Collaborators {
    /// Wire every role to one backend
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: WalletProvisioner + ChainClient + TradingVenue + TokenValidator + 'static,
    {
        Self {
            provisioner: backend.clone(),
            chain: backend.clone(),
            venue: backend.clone(),
            validator: backend,
            funding_hook: None,
        }
    }

    pub fn with_funding_hook(mut self, hook: Arc<dyn FundingHook>) -> Self {
        self.funding_hook = Some(hook);
        self
    }
}
