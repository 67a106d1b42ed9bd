//! Engine Configuration
//!
//! Loaded from `ENGINE_*` environment variables; nested sections use `__`
//! (e.g. `ENGINE_TRADING__INTERVAL_MS=7000`). Every field has a default.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::amount::validate_address;

/// Treasury used when running against the paper ledger without an explicit
/// collection address
pub const PAPER_COLLECTION_ADDRESS: &str = "11111111111111111111111111111111";

/// Top-level engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub funding: FundingConfig,
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub cost: CostConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub trading_mode: TradingMode,
    /// Execution gateway base URL (live mode)
    #[serde(default)]
    pub gateway_url: Option<String>,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

impl EngineConfig {
    /// Load from the environment
    pub fn load() -> anyhow::Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(
                ::config::Environment::with_prefix("ENGINE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: EngineConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults rooted at a specific state directory (tests, tooling)
    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.trading_mode == TradingMode::Live {
            if self.gateway_url.is_none() {
                anyhow::bail!("gateway_url is required in live mode");
            }
            if self.funding.collection_address.is_none() {
                anyhow::bail!("funding.collection_address is required in live mode");
            }
        }
        if let Some(addr) = &self.funding.collection_address {
            validate_address(addr)
                .map_err(|e| anyhow::anyhow!("funding.collection_address: {}", e))?;
        }
        if self.trading.trade_fraction <= Decimal::ZERO || self.trading.trade_fraction > Decimal::ONE {
            anyhow::bail!("trading.trade_fraction must be in (0, 1]");
        }
        if self.trading.fee_reserve_sol < Decimal::ZERO {
            anyhow::bail!("trading.fee_reserve_sol must not be negative");
        }
        if self.backup.retention == 0 {
            anyhow::bail!("backup.retention must be at least 1");
        }
        Ok(())
    }

    pub fn collection_address(&self) -> &str {
        self.funding
            .collection_address
            .as_deref()
            .unwrap_or(PAPER_COLLECTION_ADDRESS)
    }

    /// Tunables captured in backups and swapped back in by recovery
    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            funding: self.funding.clone(),
            trading: self.trading.clone(),
        }
    }
}

/// Session tunables that can change while the process runs
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct RuntimeSettings {
    #[serde(default)]
    pub funding: FundingConfig,
    #[serde(default)]
    pub trading: TradingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            funding: FundingConfig::default(),
            trading: TradingConfig::default(),
            backup: BackupConfig::default(),
            cost: CostConfig::default(),
            events: EventsConfig::default(),
            trading_mode: TradingMode::default(),
            gateway_url: None,
            state_dir: default_state_dir(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    #[default]
    Paper,
    Live,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

/// Funding detection and revenue collection
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FundingConfig {
    /// Deposits below this are ignored
    #[serde(default = "default_min_funding_sol")]
    pub min_funding_sol: Decimal,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Revenue destination
    #[serde(default)]
    pub collection_address: Option<String>,
}

impl FundingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for FundingConfig {
    fn default() -> Self {
        Self {
            min_funding_sol: default_min_funding_sol(),
            poll_interval_ms: default_poll_interval_ms(),
            collection_address: None,
        }
    }
}

/// Trade loop parameters
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TradingConfig {
    #[serde(default = "default_trade_interval_ms")]
    pub interval_ms: u64,
    /// Balances below this end the session
    #[serde(default = "default_min_trade_sol")]
    pub min_trade_sol: Decimal,
    /// Share of the remaining balance traded per tick
    #[serde(default = "default_trade_fraction")]
    pub trade_fraction: Decimal,
    /// Held back from each trade to pay its network fee
    #[serde(default = "default_fee_reserve_sol")]
    pub fee_reserve_sol: Decimal,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Ticks in a row whose retries all failed before the session fails
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

impl TradingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_trade_interval_ms(),
            min_trade_sol: default_min_trade_sol(),
            trade_fraction: default_trade_fraction(),
            fee_reserve_sol: default_fee_reserve_sol(),
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackupConfig {
    #[serde(default = "default_backup_interval_secs")]
    pub interval_secs: u64,
    /// Artifacts kept after pruning
    #[serde(default = "default_backup_retention")]
    pub retention: usize,
    /// Every n-th scheduled backup is full, the rest incremental
    #[serde(default = "default_full_every")]
    pub full_every: u32,
}

impl BackupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_backup_interval_secs(),
            retention: default_backup_retention(),
            full_every: default_full_every(),
        }
    }
}

/// Linear cost model and daily ceiling (USD)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CostConfig {
    #[serde(default = "default_cost_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_daily_limit_usd")]
    pub daily_limit_usd: Decimal,
    #[serde(default = "default_base_per_hour")]
    pub base_per_hour: Decimal,
    #[serde(default = "default_per_session_hour")]
    pub per_session_hour: Decimal,
    #[serde(default = "default_per_transaction")]
    pub per_transaction: Decimal,
}

impl CostConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_cost_check_interval_secs(),
            daily_limit_usd: default_daily_limit_usd(),
            base_per_hour: default_base_per_hour(),
            per_session_hour: default_per_session_hour(),
            per_transaction: default_per_transaction(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventsConfig {
    /// Per-subscriber buffer; the oldest events are dropped beyond it
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
        }
    }
}

fn default_port() -> u16 { 8080 }
fn default_min_funding_sol() -> Decimal { Decimal::new(1, 1) }
fn default_poll_interval_ms() -> u64 { 3_000 }
fn default_trade_interval_ms() -> u64 { 7_000 }
fn default_min_trade_sol() -> Decimal { Decimal::new(1, 3) }
fn default_trade_fraction() -> Decimal { Decimal::new(2, 1) }
fn default_fee_reserve_sol() -> Decimal { Decimal::new(5, 6) }
fn default_max_attempts() -> u32 { 3 }
fn default_retry_base_delay_ms() -> u64 { 500 }
fn default_retry_max_delay_ms() -> u64 { 4_000 }
fn default_max_consecutive_failures() -> u32 { 3 }
fn default_backup_interval_secs() -> u64 { 1_800 }
fn default_backup_retention() -> usize { 48 }
fn default_full_every() -> u32 { 6 }
fn default_cost_check_interval_secs() -> u64 { 600 }
fn default_daily_limit_usd() -> Decimal { Decimal::from(50) }
fn default_base_per_hour() -> Decimal { Decimal::new(10, 2) }
fn default_per_session_hour() -> Decimal { Decimal::new(2, 2) }
fn default_per_transaction() -> Decimal { Decimal::new(5, 4) }
fn default_channel_capacity() -> usize { 256 }
fn default_snapshot_interval_secs() -> u64 { 5 }

fn default_state_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("session-engine")
}
