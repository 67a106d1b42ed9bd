//! Trade Executor - sizes and submits one trade per tick

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::amount::round_sol;
use crate::error::EngineError;
use crate::retry::{with_retry, RetryConfig};
use crate::types::{Session, TradeDirection, Transaction};
use crate::venue::{SwapReceipt, SwapRequest, TradingVenue};

/// Decides how much of the remaining balance the next trade uses
pub trait TradeSizingPolicy: Send + Sync {
    /// `None` once the balance is too small to trade
    fn next_trade(&self, remaining: Decimal, min_trade: Decimal) -> Option<Decimal>;
}

/// Trade a fixed fraction of what is left, sweeping the remainder once the
/// fraction drops below the minimum trade size
#[derive(Debug, Clone)]
pub struct FixedFractionSizing {
    fraction: Decimal,
}

impl FixedFractionSizing {
    pub fn new(fraction: Decimal) -> Self {
        Self {
            fraction: fraction.clamp(Decimal::ZERO, Decimal::ONE),
        }
    }
}

impl Default for FixedFractionSizing {
    fn default() -> Self {
        Self::new(Decimal::new(2, 1))
    }
}

impl TradeSizingPolicy for FixedFractionSizing {
    fn next_trade(&self, remaining: Decimal, min_trade: Decimal) -> Option<Decimal> {
        if remaining <= Decimal::ZERO || remaining < min_trade {
            return None;
        }

        let amount = round_sol(remaining * self.fraction);
        if amount < min_trade {
            Some(remaining)
        } else {
            Some(amount.min(remaining))
        }
    }
}

/// What one tick produced
#[derive(Debug)]
pub enum TickOutcome {
    /// Balance is below the minimum trade size
    Done,
    Executed {
        transaction: Transaction,
        receipt: SwapReceipt,
    },
    /// Transient failures outlasted the retry budget
    Exhausted {
        transaction: Transaction,
        error: EngineError,
    },
    /// The venue refused the trade outright
    Rejected {
        transaction: Transaction,
        error: EngineError,
    },
}

pub struct TradeExecutor {
    venue: Arc<dyn TradingVenue>,
    sizing: Arc<dyn TradeSizingPolicy>,
    retry: RetryConfig,
    min_trade: Decimal,
    fee_reserve: Decimal,
}

impl TradeExecutor {
    pub fn new(
        venue: Arc<dyn TradingVenue>,
        sizing: Arc<dyn TradeSizingPolicy>,
        retry: RetryConfig,
        min_trade: Decimal,
    ) -> Self {
        Self {
            venue,
            sizing,
            retry,
            min_trade,
            fee_reserve: Decimal::ZERO,
        }
    }

    /// Hold `fee` back from every trade so the trade and its network fee
    /// together never exceed the balance
    pub fn with_fee_reserve(mut self, fee: Decimal) -> Self {
        self.fee_reserve = fee.max(Decimal::ZERO);
        self
    }

    /// Whether `remaining` still supports another trade
    pub fn has_next(&self, remaining: Decimal) -> bool {
        self.sizing
            .next_trade(self.spendable(remaining), self.min_trade)
            .is_some()
    }

    fn spendable(&self, remaining: Decimal) -> Decimal {
        (remaining - self.fee_reserve).max(Decimal::ZERO)
    }

    /// Size and submit one trade for `session`
    pub async fn execute_tick(&self, session: &Session, direction: TradeDirection) -> TickOutcome {
        let spendable = self.spendable(session.trading_balance);
        let amount = match self.sizing.next_trade(spendable, self.min_trade) {
            Some(amount) => amount.min(spendable),
            None => return TickOutcome::Done,
        };

        let pending = Transaction::pending(session.id, direction, amount);
        debug!(
            session_id = %session.id,
            transaction_id = %pending.id,
            "Submitting {} of {} SOL",
            direction, amount
        );

        let request = SwapRequest {
            session_id: session.id,
            wallet_address: session.wallet_address.clone(),
            token_address: session.token_address.clone(),
            token_type: session.token_type,
            direction,
            amount,
        };

        let venue = self.venue.clone();
        let result = with_retry(
            || {
                let venue = venue.clone();
                let request = request.clone();
                async move { venue.submit_swap(&request).await }
            },
            &self.retry,
        )
        .await;

        match result {
            Ok(attempted) => {
                let receipt = attempted.value;
                info!(
                    session_id = %session.id,
                    "{} {} SOL executed ({})",
                    direction, receipt.amount, receipt.signature
                );
                let transaction = pending.succeed(
                    receipt.amount,
                    receipt.fee,
                    receipt.signature.clone(),
                    attempted.attempts,
                );
                TickOutcome::Executed {
                    transaction,
                    receipt,
                }
            }
            Err(exhausted) => {
                warn!(
                    session_id = %session.id,
                    attempts = exhausted.attempts,
                    "{} of {} SOL failed: {}",
                    direction, amount, exhausted.error
                );
                let transaction = pending.fail(exhausted.error.to_string(), exhausted.attempts);
                if exhausted.error.is_transient() {
                    TickOutcome::Exhausted {
                        transaction,
                        error: exhausted.error,
                    }
                } else {
                    TickOutcome::Rejected {
                        transaction,
                        error: exhausted.error,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::types::{TokenType, TransactionStatus};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn sizing() -> FixedFractionSizing {
        FixedFractionSizing::default()
    }

    #[test]
    fn test_fraction_of_remaining() {
        let min = Decimal::new(1, 3);
        assert_eq!(sizing().next_trade(Decimal::ONE, min), Some(Decimal::new(2, 1)));
    }

    #[test]
    fn test_sweeps_small_remainder() {
        let min = Decimal::new(1, 3);
        // 20% of 0.004 is below 0.001, so trade it all
        let remaining = Decimal::new(4, 3);
        assert_eq!(sizing().next_trade(remaining, min), Some(remaining));
    }

    #[test]
    fn test_done_below_minimum() {
        let min = Decimal::new(1, 3);
        assert_eq!(sizing().next_trade(Decimal::new(9, 4), min), None);
        assert_eq!(sizing().next_trade(Decimal::ZERO, min), None);
    }

    #[test]
    fn test_never_exceeds_remaining() {
        let greedy = FixedFractionSizing::new(Decimal::from(5));
        let remaining = Decimal::new(3, 1);
        assert_eq!(greedy.next_trade(remaining, Decimal::new(1, 3)), Some(remaining));
    }

    #[test]
    fn test_bounded_ticks_to_depletion() {
        let policy = sizing();
        let min = Decimal::new(1, 3);
        let mut remaining = Decimal::new(75, 2);
        let mut ticks = 0;
        while let Some(amount) = policy.next_trade(remaining, min) {
            assert!(amount <= remaining);
            remaining -= amount;
            ticks += 1;
            assert!(ticks < 100);
        }
        assert!(remaining < min);
    }

    struct FlakyVenue {
        failures: AtomicU32,
        persistent: bool,
    }

    #[async_trait]
    impl TradingVenue for FlakyVenue {
        async fn submit_swap(&self, request: &SwapRequest) -> Result<SwapReceipt> {
            if self.persistent {
                return Err(EngineError::PersistentTrade("token frozen".into()));
            }
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(EngineError::TransientInfra("rpc 503".into()));
            }
            Ok(SwapReceipt {
                signature: "sig".into(),
                amount: request.amount,
                fee: Decimal::new(5, 6),
            })
        }
    }

    fn executor(failures: u32, persistent: bool) -> TradeExecutor {
        TradeExecutor::new(
            Arc::new(FlakyVenue {
                failures: AtomicU32::new(failures),
                persistent,
            }),
            Arc::new(sizing()),
            RetryConfig {
                max_attempts: 3,
                base_delay_ms: 1,
                max_delay_ms: 1,
                jitter: false,
            },
            Decimal::new(1, 3),
        )
    }

    fn trading_session(balance: Decimal) -> Session {
        let mut session = Session::new(
            "So11111111111111111111111111111111111111112".into(),
            TokenType::Spl,
            "wallet".into(),
            None,
        );
        session.trading_balance = balance;
        session
    }

    #[tokio::test]
    async fn test_tick_executes_after_transient_retry() {
        let outcome = executor(1, false)
            .execute_tick(&trading_session(Decimal::ONE), TradeDirection::Buy)
            .await;
        match outcome {
            TickOutcome::Executed { transaction, .. } => {
                assert_eq!(transaction.status, TransactionStatus::Success);
                assert_eq!(transaction.attempts, 2);
                assert_eq!(transaction.amount, Decimal::new(2, 1));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tick_exhausts_transient_budget() {
        let outcome = executor(10, false)
            .execute_tick(&trading_session(Decimal::ONE), TradeDirection::Sell)
            .await;
        match outcome {
            TickOutcome::Exhausted { transaction, .. } => {
                assert_eq!(transaction.status, TransactionStatus::Failed);
                assert_eq!(transaction.attempts, 3);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tick_rejected_without_retry() {
        let outcome = executor(0, true)
            .execute_tick(&trading_session(Decimal::ONE), TradeDirection::Buy)
            .await;
        assert!(matches!(outcome, TickOutcome::Rejected { ref transaction, .. } if transaction.attempts == 1));
    }

    #[tokio::test]
    async fn test_final_sweep_leaves_room_for_fee() {
        let fee = Decimal::new(5, 6);
        let executor = executor(0, false).with_fee_reserve(fee);
        let mut session = trading_session(Decimal::new(4, 3));

        let receipt = match executor.execute_tick(&session, TradeDirection::Sell).await {
            TickOutcome::Executed { receipt, .. } => receipt,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(receipt.amount, Decimal::new(3_995, 6));

        let shortfall = session.apply_trade(receipt.amount, receipt.fee);
        assert_eq!(shortfall, Decimal::ZERO);
        assert_eq!(session.trading_balance, Decimal::ZERO);
        assert!(!executor.has_next(session.trading_balance));
    }

    #[tokio::test]
    async fn test_reserve_can_end_trading_early() {
        // 0.001003 minus the reserve is below the minimum trade
        let executor = executor(0, false).with_fee_reserve(Decimal::new(5, 6));
        assert!(!executor.has_next(Decimal::new(1_003, 6)));
        let outcome = executor
            .execute_tick(&trading_session(Decimal::new(1_003, 6)), TradeDirection::Buy)
            .await;
        assert!(matches!(outcome, TickOutcome::Done));
    }

    #[tokio::test]
    async fn test_tick_done_when_depleted() {
        let outcome = executor(0, false)
            .execute_tick(&trading_session(Decimal::new(5, 4)), TradeDirection::Buy)
            .await;
        assert!(matches!(outcome, TickOutcome::Done));
    }
}
