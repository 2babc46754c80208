use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use turnstile_engine::GateConfig;
use turnstile_server::ServerConfig;
use turnstile_store::Database;
use turnstile_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser, Debug)]
#[command(name = "turnstile", about = "Tenant token-quota and gating server")]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Data directory for the ledger and telemetry databases.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Maximum age, in milliseconds, of a cached gate snapshot.
    #[arg(long, default_value_t = 3000)]
    gate_staleness_ms: u64,

    /// Per-company gate query ceiling per second.
    #[arg(long, default_value_t = 30)]
    gate_rate_limit: u32,

    /// Disable the SQLite log and metrics sinks.
    #[arg(long)]
    no_telemetry: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let data_dir = args.data_dir.unwrap_or_else(|| dirs_home().join(".turnstile"));
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        eprintln!("turnstile: cannot create data directory {}: {e}", data_dir.display());
        std::process::exit(1);
    }

    let telemetry = init_telemetry(TelemetryConfig {
        log_to_sqlite: !args.no_telemetry,
        metrics_enabled: !args.no_telemetry,
        log_db_path: data_dir.join("logs.db"),
        metrics_db_path: data_dir.join("metrics.db"),
        ..TelemetryConfig::default()
    });
    let telemetry = Arc::new(telemetry);

    let db_path = data_dir.join("ledger.db");
    let db = match Database::open(&db_path) {
        Ok(db) => db,
        Err(e) => {
            tracing::error!(path = %db_path.display(), error = %e, "cannot open ledger database");
            std::process::exit(1);
        }
    };
    tracing::info!(path = %db_path.display(), "ledger database opened");

    // Periodic metrics flush, plus a prune on startup so the snapshot
    // table does not grow without bound.
    if let Some(recorder) = telemetry.metrics() {
        if let Err(e) = recorder.prune(7) {
            tracing::warn!(error = %e, "metrics prune failed");
        }
        let recorder = recorder.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tick.tick().await;
                if let Err(e) = recorder.snapshot() {
                    tracing::warn!(error = %e, "metrics snapshot failed");
                }
            }
        });
    }

    let config = ServerConfig {
        port: args.port,
        gate: GateConfig {
            max_staleness: Duration::from_millis(args.gate_staleness_ms),
            rate_limit: args.gate_rate_limit,
            ..GateConfig::default()
        },
        ..ServerConfig::default()
    };

    let handle = match turnstile_server::start(config, db, Some(telemetry)).await {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    };
    tracing::info!(port = handle.port, "turnstile server ready");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl+c");
    }
    tracing::info!("shutting down");
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
