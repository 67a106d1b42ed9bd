//! Fund splitter - collects the revenue share before trading starts
//!
//! The revenue transfer is keyed by session id: concurrent or repeated
//! calls for the same session share a single transfer and its outcome.
//! Confirmed outcomes are kept for the life of the process, so a session
//! restored from a pre-split backup gets the original transfer back.

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::{error, info};
use uuid::Uuid;

use crate::amount::round_sol;
use crate::error::{EngineError, Result};
use crate::retry::{with_retry, RetryConfig};
use crate::venue::ChainClient;

/// Share of every deposit collected as revenue
pub const REVENUE_FRACTION: Decimal = Decimal::from_parts(25, 0, 0, false, 2);

/// Allocation of one deposit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitPlan {
    pub revenue: Decimal,
    pub trading: Decimal,
}

/// Revenue rounds down to lamports; trading gets the exact remainder
pub fn plan_split(funding: Decimal) -> SplitPlan {
    let revenue = round_sol(funding * REVENUE_FRACTION);
    SplitPlan {
        revenue,
        trading: funding - revenue,
    }
}

/// Confirmed split
#[derive(Debug, Clone, PartialEq)]
pub struct SplitOutcome {
    pub revenue_amount: Decimal,
    pub trading_amount: Decimal,
    pub signature: String,
    pub attempts: u32,
}

pub struct FundSplitter {
    chain: Arc<dyn ChainClient>,
    collection_address: String,
    outcomes: Mutex<HashMap<Uuid, Arc<OnceCell<SplitOutcome>>>>,
}

impl FundSplitter {
    pub fn new(chain: Arc<dyn ChainClient>, collection_address: impl Into<String>) -> Self {
        Self {
            chain,
            collection_address: collection_address.into(),
            outcomes: Mutex::new(HashMap::new()),
        }
    }

    pub fn collection_address(&self) -> &str {
        &self.collection_address
    }

    /// Transfer the revenue share of `funding` out of `wallet`
    ///
    /// A failed attempt leaves no outcome behind, so a later call may try
    /// again; a confirmed one is returned to every later caller unchanged.
    pub async fn split(
        &self,
        session_id: Uuid,
        wallet: &str,
        funding: Decimal,
        retry: &RetryConfig,
    ) -> Result<SplitOutcome> {
        if funding <= Decimal::ZERO {
            return Err(EngineError::Validation(format!(
                "cannot split non-positive funding {}",
                funding
            )));
        }

        let cell = {
            let mut outcomes = self.outcomes.lock().unwrap_or_else(|e| e.into_inner());
            outcomes.entry(session_id).or_default().clone()
        };

        let outcome = cell
            .get_or_try_init(|| self.transfer_revenue(session_id, wallet, funding, retry))
            .await?;
        Ok(outcome.clone())
    }

    async fn transfer_revenue(
        &self,
        session_id: Uuid,
        wallet: &str,
        funding: Decimal,
        retry: &RetryConfig,
    ) -> Result<SplitOutcome> {
        let plan = plan_split(funding);
        info!(
            session_id = %session_id,
            "Collecting revenue {} of {} SOL to {}",
            plan.revenue, funding, self.collection_address
        );

        let chain = self.chain.clone();
        let to = self.collection_address.clone();
        let attempted = with_retry(
            || {
                let chain = chain.clone();
                let to = to.clone();
                let from = wallet.to_string();
                async move { chain.transfer(&from, &to, plan.revenue).await }
            },
            retry,
        )
        .await
        .map_err(|exhausted| {
            error!(
                session_id = %session_id,
                attempts = exhausted.attempts,
                "Revenue transfer failed: {}",
                exhausted.error
            );
            exhausted.error
        })?;

        Ok(SplitOutcome {
            revenue_amount: plan.revenue,
            trading_amount: plan.trading,
            signature: attempted.value,
            attempts: attempted.attempts,
        })
    }
}
