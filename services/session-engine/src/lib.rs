//! Session Engine Library
//!
//! Funded trading sessions on Solana: a dedicated wallet per session, funding
//! detection, revenue collection and a trade loop, governed by backups,
//! recovery, a daily cost ceiling and a process-wide maintenance lock.

pub mod alerting;
pub mod amount;
pub mod backup;
pub mod config;
pub mod cost;
pub mod detector;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod gateway;
pub mod health;
pub mod maintenance;
pub mod observability;
pub mod paper;
pub mod recovery;
pub mod retry;
pub mod splitter;
pub mod state;
pub mod store;
pub mod types;
pub mod venue;
pub mod handlers {
    pub mod backup;
    pub mod bot;
    pub mod sessions;
    pub mod system;
    pub mod ws;
}

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use alerting::AlertManager;
pub use backup::BackupService;
pub use config::{EngineConfig, TradingMode};
pub use cost::CostMonitor;
pub use engine::{CreateSessionRequest, SessionManager};
pub use error::{EngineError, Result};
pub use events::{EngineEvent, EventBroadcaster, LifecycleStatus, Topic};
pub use maintenance::{MaintenanceGuard, MaintenanceSource};
pub use observability::{Logger, MetricsCollector};
pub use recovery::{RecoveryService, RestoreFlags};
pub use types::{Session, SessionState, TokenType, TradeDirection, Transaction};
pub use venue::Collaborators;

/// Application state shared across handlers
pub struct AppState {
    pub config: EngineConfig,
    pub manager: Arc<SessionManager>,
    pub backups: Arc<BackupService>,
    pub recovery: Arc<RecoveryService>,
    pub cost: Arc<CostMonitor>,
    pub maintenance: Arc<MaintenanceGuard>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub metrics: MetricsCollector,
    pub alerts: AlertManager,
}

impl AppState {
    /// Wire every service around `collaborators`, reloading persisted state
    /// from `config.state_dir`
    pub async fn build(config: EngineConfig, collaborators: Collaborators) -> Result<Self> {
        let files = state::StateFiles::new(&config.state_dir);
        files.init().await?;

        let metrics = MetricsCollector::new();
        let alerts = AlertManager::default();
        let maintenance = Arc::new(MaintenanceGuard::load(files.clone()).await?);
        let broadcaster = Arc::new(EventBroadcaster::new(config.events.channel_capacity));
        let store = Arc::new(store::SessionStore::new());

        let manager = Arc::new(SessionManager::new(
            &config,
            store.clone(),
            collaborators,
            broadcaster.clone(),
            maintenance.clone(),
            metrics.clone(),
            alerts.clone(),
        ));
        let backups = Arc::new(
            BackupService::load(
                files.clone(),
                manager.clone(),
                config.backup.clone(),
                metrics.clone(),
                alerts.clone(),
            )
            .await?,
        );
        let recovery = Arc::new(RecoveryService::new(
            backups.clone(),
            manager.clone(),
            maintenance.clone(),
            metrics.clone(),
            alerts.clone(),
        ));
        let cost = Arc::new(
            CostMonitor::load(
                config.cost.clone(),
                files,
                store,
                maintenance.clone(),
                alerts.clone(),
                metrics.clone(),
            )
            .await?,
        );

        Ok(Self {
            config,
            manager,
            backups,
            recovery,
            cost,
            maintenance,
            broadcaster,
            metrics,
            alerts,
        })
    }

    /// Start the backup scheduler, cost monitor and snapshot publisher
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        let snapshot_every =
            std::time::Duration::from_secs(self.config.events.snapshot_interval_secs);
        vec![
            self.backups.spawn_scheduler(),
            self.cost.spawn(),
            self.manager.spawn_snapshot_publisher(snapshot_every),
        ]
    }
}

/// Build the API router
pub fn app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route(
            "/sessions",
            get(handlers::sessions::list_sessions).post(handlers::sessions::create_session),
        )
        .route("/sessions/{id}", get(handlers::sessions::get_session))
        .route(
            "/sessions/{id}/transactions",
            get(handlers::sessions::list_transactions),
        )
        .route("/sessions/{id}/fund", post(handlers::sessions::fund_session))
        .route("/sessions/{id}/stop", post(handlers::sessions::stop_session))
        .route("/bot/start", post(handlers::bot::start))
        .route("/bot/pause", post(handlers::bot::pause))
        .route("/bot/stop", post(handlers::bot::stop))
        .route("/backup/status", get(handlers::backup::status))
        .route("/backup/list", get(handlers::backup::list))
        .route("/backup/create", post(handlers::backup::create))
        .route("/recovery/initiate", post(handlers::backup::initiate_recovery))
        .route("/recovery/status", get(handlers::backup::recovery_status))
        .route("/maintenance-status", get(handlers::system::maintenance_status))
        .route("/cost/status", get(handlers::system::cost_status))
        .route("/alerts", get(handlers::system::alerts))
        .route("/ws", get(handlers::ws::websocket_handler));

    Router::new()
        .nest("/v1", api_routes)
        .route("/healthz", get(health::healthz))
        .route("/health", get(health::health_detail))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
