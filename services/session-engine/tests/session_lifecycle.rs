//! End-to-end session lifecycle against the paper ledger
//!
//! create → fund → revenue split → trade loop → completed, plus stop and
//! failure paths.


use mock_venue::{engine, engine_with, fast_config, request, wait_for_state, wait_until, Fault, MockVenue};
use rust_decimal::Decimal;
use session_engine::{
    events::SessionSummary,
    types::TransactionStatus,
    EngineError, EngineEvent, LifecycleStatus, SessionState, Topic,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_funded_session_runs_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let venue = Arc::new(MockVenue::new());
    let state = engine(dir.path(), venue.clone()).await;

    let session = state.manager.create_session(request()).await.unwrap();
    assert_eq!(session.state, SessionState::AwaitingFunding);
    let mut events = state.broadcaster.subscribe(Topic::Session(session.id));

    state.manager.fund_session(session.id, Decimal::ONE).await.unwrap();
    let done = wait_for_state(&state.manager, session.id, SessionState::Completed).await;

    assert_eq!(done.detected_funding, Decimal::ONE);
    assert_eq!(done.revenue_amount, Decimal::new(25, 2));
    assert_eq!(done.trading_balance, Decimal::ZERO);
    assert!(done.total_trades > 0);
    assert!(done.total_volume > Decimal::new(7, 1));
    assert!(done.total_volume <= Decimal::new(75, 2));

    let transfers = venue.transfers();
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].amount, Decimal::new(25, 2));
    assert_eq!(transfers[0].from, session.wallet_address);

    let transactions = state.manager.session_transactions(session.id).unwrap();
    assert_eq!(transactions.len() as u32, done.total_trades);
    assert!(transactions.iter().all(|t| t.status == TransactionStatus::Success));

    // Replay the session's events: ordered lifecycle, shrinking balance
    let mut statuses = vec![];
    let mut last_remaining = Decimal::new(75, 2);
    let mut trades_seen = 0;
    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::BotStatus { status, .. } => statuses.push(status),
            EngineEvent::TradeExecuted {
                remaining_balance,
                total_trades,
                ..
            } => {
                assert!(remaining_balance <= last_remaining);
                assert!(remaining_balance + done.revenue_amount <= done.detected_funding);
                last_remaining = remaining_balance;
                trades_seen += 1;
                assert_eq!(total_trades, trades_seen);
            }
            _ => {}
        }
    }
    assert_eq!(trades_seen, done.total_trades);
    assert!(matches!(statuses[0], LifecycleStatus::Funded { amount } if amount == Decimal::ONE));
    assert!(matches!(
        statuses[1],
        LifecycleStatus::Trading { trading_balance, .. } if trading_balance == Decimal::new(75, 2)
    ));
    assert!(matches!(
        statuses[2],
        LifecycleStatus::Completed { stopped: false, .. }
    ));
    assert_eq!(statuses.len(), 3);
}

#[tokio::test]
async fn test_small_deposit_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let venue = Arc::new(MockVenue::new());
    let state = engine(dir.path(), venue.clone()).await;

    let session = state.manager.create_session(request()).await.unwrap();
    state
        .manager
        .fund_session(session.id, Decimal::new(5, 2))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        state.manager.get_session(session.id).unwrap().state,
        SessionState::AwaitingFunding
    );

    // Topping up past the minimum funds the session with the whole increase
    state
        .manager
        .fund_session(session.id, Decimal::new(5, 2))
        .await
        .unwrap();
    let funded = wait_for_state(&state.manager, session.id, SessionState::Completed).await;
    assert_eq!(funded.detected_funding, Decimal::new(1, 1));
}

#[tokio::test]
async fn test_stop_halts_trading() {
    let dir = tempfile::tempdir().unwrap();
    let venue = Arc::new(MockVenue::new().with_swap_delay(Duration::from_millis(10)));
    let mut config = fast_config(dir.path());
    config.trading.interval_ms = 20;
    let state = engine_with(config, venue.clone()).await;

    let session = state.manager.create_session(request()).await.unwrap();
    state.manager.fund_session(session.id, Decimal::ONE).await.unwrap();
    wait_until(|| state.manager.store().transactions(session.id).len() >= 2).await;

    let stopped = state.manager.stop_session(session.id).unwrap();
    assert_eq!(stopped.state, SessionState::Completed);
    let at_stop = state.manager.store().transactions(session.id).len();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let after_boundary = state.manager.store().transactions(session.id).len();
    assert!(after_boundary <= at_stop + 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        state.manager.store().transactions(session.id).len(),
        after_boundary
    );
    assert!(state.manager.list_active_sessions().is_empty());
}

#[tokio::test]
async fn test_concurrent_sessions_collect_revenue_once_each() {
    let dir = tempfile::tempdir().unwrap();
    let venue = Arc::new(MockVenue::new());
    let state = engine(dir.path(), venue.clone()).await;

    let mut ids = vec![];
    for _ in 0..3 {
        let session = state.manager.create_session(request()).await.unwrap();
        state.manager.fund_session(session.id, Decimal::TWO).await.unwrap();
        ids.push(session.id);
    }
    for id in &ids {
        let done = wait_for_state(&state.manager, *id, SessionState::Completed).await;
        assert_eq!(done.revenue_amount, Decimal::new(5, 1));
    }

    let treasury = state.config.collection_address().to_string();
    let transfers = venue.transfers();
    assert_eq!(transfers.len(), 3);
    assert!(transfers.iter().all(|t| t.to == treasury));
    assert_eq!(venue.ledger().balance_of(&treasury), Decimal::new(15, 1));

    let wallets: Vec<_> = ids
        .iter()
        .map(|id| state.manager.get_session(*id).unwrap().wallet_address)
        .collect();
    assert!(wallets[0] != wallets[1] && wallets[1] != wallets[2] && wallets[0] != wallets[2]);
}

#[tokio::test]
async fn test_transient_transfer_errors_are_retried() {
    let dir = tempfile::tempdir().unwrap();
    let venue = Arc::new(MockVenue::new().fail_transfers([Fault::Transient, Fault::Transient]));
    let state = engine(dir.path(), venue.clone()).await;

    let session = state.manager.create_session(request()).await.unwrap();
    state.manager.fund_session(session.id, Decimal::ONE).await.unwrap();
    let done = wait_for_state(&state.manager, session.id, SessionState::Completed).await;

    assert_eq!(venue.transfer_calls(), 3);
    assert_eq!(venue.transfers().len(), 1);
    assert_eq!(done.revenue_amount, Decimal::new(25, 2));
}

#[tokio::test]
async fn test_failed_revenue_transfer_fails_without_trading() {
    let dir = tempfile::tempdir().unwrap();
    let venue = Arc::new(MockVenue::new().fail_transfers([Fault::Persistent]));
    let state = engine(dir.path(), venue.clone()).await;

    let session = state.manager.create_session(request()).await.unwrap();
    state.manager.fund_session(session.id, Decimal::ONE).await.unwrap();
    let failed = wait_for_state(&state.manager, session.id, SessionState::Failed).await;

    assert!(failed.failure_reason.unwrap().contains("revenue transfer failed"));
    assert_eq!(failed.trading_balance, Decimal::ZERO);
    assert_eq!(failed.total_trades, 0);
    assert_eq!(venue.swap_calls(), 0);
    assert!(state.manager.session_transactions(session.id).unwrap().is_empty());
}

#[tokio::test]
async fn test_rejected_trade_fails_session() {
    let dir = tempfile::tempdir().unwrap();
    let venue = Arc::new(MockVenue::new().fail_swaps([Fault::Persistent]));
    let state = engine(dir.path(), venue.clone()).await;

    let session = state.manager.create_session(request()).await.unwrap();
    state.manager.fund_session(session.id, Decimal::ONE).await.unwrap();
    let failed = wait_for_state(&state.manager, session.id, SessionState::Failed).await;

    assert_eq!(venue.swap_calls(), 1);
    let transactions = state.manager.session_transactions(session.id).unwrap();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].status, TransactionStatus::Failed);
    assert_eq!(failed.trading_balance, Decimal::new(75, 2));
    assert!(state
        .alerts
        .recent(10)
        .await
        .iter()
        .any(|a| a.title.starts_with("Session Failed")));
}

#[tokio::test]
async fn test_exhausted_ticks_fail_after_limit() {
    let dir = tempfile::tempdir().unwrap();
    // 3 ticks × 3 attempts, all transient
    let venue = Arc::new(MockVenue::new().fail_swaps([Fault::Transient; 9]));
    let state = engine(dir.path(), venue.clone()).await;

    let session = state.manager.create_session(request()).await.unwrap();
    state.manager.fund_session(session.id, Decimal::ONE).await.unwrap();
    let failed = wait_for_state(&state.manager, session.id, SessionState::Failed).await;

    assert_eq!(venue.swap_calls(), 9);
    let transactions = state.manager.session_transactions(session.id).unwrap();
    assert_eq!(transactions.len(), 3);
    assert!(transactions.iter().all(|t| t.attempts == 3));
    assert!(failed.failure_reason.unwrap().contains("3 consecutive failed trades"));
}

#[tokio::test]
async fn test_unknown_token_address_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let state = engine(dir.path(), Arc::new(MockVenue::new())).await;

    let err = state
        .manager
        .create_session(session_engine::CreateSessionRequest {
            token_address: "0xdeadbeef".to_string(),
            ..request()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert!(state.manager.list_sessions().is_empty());
}

#[tokio::test]
async fn test_snapshot_lists_every_session() {
    let dir = tempfile::tempdir().unwrap();
    let state = engine(dir.path(), Arc::new(MockVenue::new())).await;
    let mut all = state.broadcaster.subscribe(Topic::AllSessions);

    let a = state.manager.create_session(request()).await.unwrap();
    let b = state.manager.create_session(request()).await.unwrap();
    state.manager.stop_session(b.id).unwrap();
    state.manager.publish_snapshot().await;

    let sessions: Vec<SessionSummary> = loop {
        match all.recv().await {
            Some(EngineEvent::AllSessionsUpdate { sessions }) => break sessions,
            Some(_) => continue,
            None => panic!("all-sessions topic closed"),
        }
    };
    let ids: Vec<_> = sessions.iter().map(|s| s.session_id).collect();
    assert_eq!(ids, vec![a.id, b.id]);
}
