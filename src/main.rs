use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use rozet_server::{AppState, NoopEngine, ServerConfig};
use rozet_store::retention::{RetentionPolicy, RetentionSweeper};
use rozet_store::Database;
use rozet_telemetry::{init_telemetry, TelemetryBridge, TelemetryConfig, TracingSink};

/// Control-room orchestration control plane.
#[derive(Parser, Debug)]
#[command(name = "rozet", version, about)]
struct Cli {
    /// Port to listen on (0 picks a free port).
    #[arg(long)]
    port: Option<u16>,

    /// Path to the SQLite database.
    #[arg(long, default_value = "rozet.db")]
    db: PathBuf,

    /// Root directory every session working_dir must live under.
    #[arg(long)]
    workspace_root: Option<PathBuf>,

    /// Skip bearer auth and use a fixed dev principal.
    #[arg(long)]
    auth_disabled: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(&TelemetryConfig::default());

    let mut config = ServerConfig::default();
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(root) = cli.workspace_root {
        config.workspace_root = root;
    }
    if cli.auth_disabled {
        config.auth.disabled = true;
    }

    let db = Database::open(&cli.db)?;

    let cancel = CancellationToken::new();
    let policy = RetentionPolicy {
        idle_archive_days: config.retention.idle_archive_days,
        cold_window_days: config.retention.cold_window_days,
        sweep_interval: config.retention.sweep_interval,
    };
    let sweeper = RetentionSweeper::new(db.clone(), policy).start(cancel.clone());

    let bridge = TelemetryBridge::start(Arc::new(TracingSink));
    let state = AppState::new(config, db, Arc::new(NoopEngine), Some(bridge.handle()));
    let hub = Arc::clone(&state.hub);
    let server = rozet_server::start(state).await?;
    info!(port = server.port, "rozet control room ready");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    cancel.cancel();
    let _ = sweeper.await;
    // The hub's fan-out task holds a bridge handle; stop it first so the
    // bridge drain can see the channel close.
    hub.shutdown();
    bridge.shutdown().await;
    Ok(())
}
