//! Paper ledger - in-memory stand-in for the chain, the DEX and the token
//! validator
//!
//! Wallet balances live in a map; swaps debit the traded SOL plus a flat
//! network fee. Deposits arrive through [`FundingHook::credit`].

use async_trait::async_trait;
use rand::RngCore;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::amount::{round_sol, validate_address};
use crate::error::{EngineError, Result};
use crate::types::TokenType;
use crate::venue::{
    ChainClient, FundingHook, PoolInfo, ProvisionedWallet, SwapReceipt, SwapRequest,
    TokenValidator, TokenVerdict, TradingVenue, WalletProvisioner,
};

/// Flat per-swap network fee (5000 lamports)
pub const PAPER_SWAP_FEE: Decimal = Decimal::from_parts(5, 0, 0, false, 6);

/// A confirmed paper transfer
#[derive(Debug, Clone, PartialEq)]
pub struct PaperTransfer {
    pub from: String,
    pub to: String,
    pub amount: Decimal,
    pub signature: String,
}

#[derive(Default)]
struct LedgerInner {
    balances: HashMap<String, Decimal>,
    transfers: Vec<PaperTransfer>,
}

/// In-memory ledger implementing every collaborator trait
#[derive(Default)]
pub struct PaperLedger {
    inner: Mutex<LedgerInner>,
}

impl PaperLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance_of(&self, address: &str) -> Decimal {
        self.lock()
            .balances
            .get(address)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Every transfer confirmed so far, oldest first
    pub fn transfers(&self) -> Vec<PaperTransfer> {
        self.lock().transfers.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn random_key(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bs58::encode(bytes).into_string()
}

#[async_trait]
impl WalletProvisioner for PaperLedger {
    async fn provision(&self) -> Result<ProvisionedWallet> {
        let address = random_key(32);
        self.lock().balances.insert(address.clone(), Decimal::ZERO);
        debug!("Provisioned paper wallet {}", address);
        Ok(ProvisionedWallet { address })
    }
}

#[async_trait]
impl ChainClient for PaperLedger {
    async fn get_balance(&self, address: &str) -> Result<Decimal> {
        Ok(self.balance_of(address))
    }

    async fn transfer(&self, from: &str, to: &str, amount: Decimal) -> Result<String> {
        if amount <= Decimal::ZERO {
            return Err(EngineError::Validation(format!(
                "transfer amount must be positive, got {}",
                amount
            )));
        }

        let mut inner = self.lock();
        let available = inner.balances.get(from).copied().unwrap_or(Decimal::ZERO);
        if available < amount {
            return Err(EngineError::PersistentTrade(format!(
                "insufficient funds in {}: {} < {}",
                from, available, amount
            )));
        }

        inner.balances.insert(from.to_string(), available - amount);
        *inner.balances.entry(to.to_string()).or_insert(Decimal::ZERO) += amount;

        let signature = random_key(64);
        inner.transfers.push(PaperTransfer {
            from: from.to_string(),
            to: to.to_string(),
            amount,
            signature: signature.clone(),
        });
        Ok(signature)
    }
}

#[async_trait]
impl TradingVenue for PaperLedger {
    async fn submit_swap(&self, request: &SwapRequest) -> Result<SwapReceipt> {
        if request.amount <= Decimal::ZERO {
            return Err(EngineError::PersistentTrade(format!(
                "swap amount must be positive, got {}",
                request.amount
            )));
        }

        let mut inner = self.lock();
        let balance = inner
            .balances
            .entry(request.wallet_address.clone())
            .or_insert(Decimal::ZERO);
        *balance = (*balance - request.amount - PAPER_SWAP_FEE).max(Decimal::ZERO);

        Ok(SwapReceipt {
            signature: random_key(64),
            amount: round_sol(request.amount),
            fee: PAPER_SWAP_FEE,
        })
    }
}

#[async_trait]
impl TokenValidator for PaperLedger {
    async fn validate(&self, token_address: &str, token_type: TokenType) -> Result<TokenVerdict> {
        validate_address(token_address)?;

        let dex = match token_type {
            TokenType::PumpFun => "pump",
            TokenType::Spl | TokenType::Token2022 => "paper",
        };
        Ok(TokenVerdict::Tradable {
            pool: PoolInfo {
                pool_address: random_key(32),
                dex: dex.to_string(),
                liquidity_sol: Decimal::from(1_000),
            },
        })
    }
}

#[async_trait]
impl FundingHook for PaperLedger {
    async fn credit(&self, address: &str, amount: Decimal) -> Result<Decimal> {
        if amount <= Decimal::ZERO {
            return Err(EngineError::Validation(format!(
                "funding amount must be positive, got {}",
                amount
            )));
        }

        let mut inner = self.lock();
        let balance = inner
            .balances
            .entry(address.to_string())
            .or_insert(Decimal::ZERO);
        *balance += amount;
        info!("Paper deposit of {} SOL into {}", amount, address);
        Ok(*balance)
    }
}
