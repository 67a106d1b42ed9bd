//! Fund detector - polls a session wallet until a deposit shows up

use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::observability::{metrics, MetricsCollector};
use crate::venue::ChainClient;

/// Result of watching a wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    /// Increase over the baseline, at or above the funding minimum
    Funded(Decimal),
    Cancelled,
}

pub struct FundDetector {
    chain: Arc<dyn ChainClient>,
    min_funding: Decimal,
    poll_interval: Duration,
    metrics: Option<MetricsCollector>,
}

impl FundDetector {
    pub fn new(chain: Arc<dyn ChainClient>, min_funding: Decimal, poll_interval: Duration) -> Self {
        Self {
            chain,
            min_funding,
            poll_interval,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Poll `wallet` until its balance exceeds `baseline` by at least the
    /// funding minimum, or `cancelled` returns true
    ///
    /// Poll errors never end the watch; they are logged and retried at the
    /// same interval.
    pub async fn watch(
        &self,
        wallet: &str,
        baseline: Decimal,
        cancelled: impl Fn() -> bool,
    ) -> Detection {
        let mut last_ignored = Decimal::ZERO;

        loop {
            if cancelled() {
                debug!("Funding watch on {} cancelled", wallet);
                return Detection::Cancelled;
            }

            match self.chain.get_balance(wallet).await {
                Ok(balance) => {
                    let increase = balance - baseline;
                    if increase >= self.min_funding {
                        info!("Funding of {} SOL detected on {}", increase, wallet);
                        return Detection::Funded(increase);
                    }
                    if increase > Decimal::ZERO && increase != last_ignored {
                        info!(
                            "Ignoring deposit of {} SOL on {} (minimum {})",
                            increase, wallet, self.min_funding
                        );
                        last_ignored = increase;
                    }
                }
                Err(e) => {
                    warn!("Balance poll for {} failed: {}", wallet, e);
                    if let Some(m) = &self.metrics {
                        m.increment(metrics::FUNDING_POLL_ERRORS, 1).await;
                    }
                }
            }

            sleep(self.poll_interval).await;
        }
    }
}
