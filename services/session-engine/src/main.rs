//! Session Engine - funded trading sessions behind an HTTP API
//!
//! 1. Loads configuration from `ENGINE_*` environment variables
//! 2. Reloads maintenance, cost and backup state from the state directory
//! 3. Starts the backup scheduler, cost monitor and snapshot publisher
//! 4. Serves the API and real-time channel

use anyhow::Context;
use std::sync::Arc;
use tracing::{info, warn, Level};

use session_engine::gateway::GatewayClient;
use session_engine::paper::PaperLedger;
use session_engine::{app, AppState, Collaborators, EngineConfig, TradingMode};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting Session Engine...");

    let config = EngineConfig::load().context("invalid engine configuration")?;
    info!(
        "Mode: {:?}, state dir: {}",
        config.trading_mode,
        config.state_dir.display()
    );

    let collaborators = match config.trading_mode {
        TradingMode::Paper => {
            warn!("Paper trading mode: wallets and swaps are simulated in memory");
            let ledger = Arc::new(PaperLedger::new());
            Collaborators::from_backend(ledger.clone()).with_funding_hook(ledger)
        }
        TradingMode::Live => {
            let url = config
                .gateway_url
                .as_deref()
                .context("gateway_url is required in live mode")?;
            info!("Execution gateway: {}", url);
            Collaborators::from_backend(Arc::new(GatewayClient::new(url)?))
        }
    };

    let port = config.server.port;
    let state = Arc::new(
        AppState::build(config, collaborators)
            .await
            .context("failed to initialise engine state")?,
    );

    let maintenance = state.maintenance.snapshot();
    if maintenance.active {
        warn!("Starting under maintenance: {}", state.maintenance.message());
    }

    let _background = state.spawn_background();

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .with_context(|| format!("failed to bind port {}", port))?;
    info!("Session Engine listening on port {}", port);

    axum::serve(listener, app(state)).await?;

    Ok(())
}
