use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use turnstile_engine::{Directory, GateConfig, GateService, RechargeCoordinator};
use turnstile_store::{CompanyRepo, Database, TransactionRepo};
use turnstile_telemetry::TelemetryGuard;

use crate::handlers;

/// Server configuration, supplied by deployment (CLI flags), never a
/// process-wide singleton.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    pub request_timeout_secs: u64,
    pub gate: GateConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            request_timeout_secs: 30,
            gate: GateConfig::default(),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub companies: CompanyRepo,
    pub transactions: TransactionRepo,
    pub coordinator: Arc<RechargeCoordinator>,
    pub gate: Arc<GateService>,
    pub directory: Directory,
    pub telemetry: Option<Arc<TelemetryGuard>>,
}

impl AppState {
    pub fn new(db: Database, gate_config: GateConfig, telemetry: Option<Arc<TelemetryGuard>>) -> Self {
        let companies = CompanyRepo::new(db.clone());
        let transactions = TransactionRepo::new(db);
        let metrics = telemetry.as_ref().and_then(|t| t.metrics());

        let gate = Arc::new(GateService::new(
            Arc::new(companies.clone()),
            gate_config,
            metrics.clone(),
        ));
        let coordinator = Arc::new(RechargeCoordinator::new(
            companies.clone(),
            transactions.clone(),
            gate.clone(),
            metrics,
        ));
        let directory = Directory::new(companies.clone());

        Self {
            companies,
            transactions,
            coordinator,
            gate,
            directory,
            telemetry,
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/all-companies", get(handlers::list_companies))
        .route("/api/companies", post(handlers::create_company))
        .route("/api/payment/recharge", post(handlers::recharge))
        .route("/api/token-status/{company_id}", get(handlers::token_status))
        .route("/api/companies/{company_id}/cap", post(handlers::set_cap))
        .route(
            "/api/companies/{company_id}/subscription",
            post(handlers::set_subscription),
        )
        .route(
            "/api/companies/{company_id}/transactions",
            get(handlers::list_transactions),
        )
        .route("/api/admin/logs", get(handlers::admin_logs))
        .route("/api/admin/metrics", get(handlers::admin_metrics))
        .with_state(state)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        // Widgets embed on arbitrary tenant origins.
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle holding the bound port.
pub async fn start(
    config: ServerConfig,
    db: Database,
    telemetry: Option<Arc<TelemetryGuard>>,
) -> Result<ServerHandle, std::io::Error> {
    let state = AppState::new(db, config.gate.clone(), telemetry);
    let router = build_router(state, Duration::from_secs(config.request_timeout_secs));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "turnstile server started");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server_handle,
    })
}

/// Handle returned by `start()` — keeps the accept loop alive.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
}
