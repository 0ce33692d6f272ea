//! xoxo match server
//!
//! Authoritative tic-tac-toe server. Reads configuration from the
//! environment, creates the win leaderboard and serves WebSocket clients
//! until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use xoxo::{
    TICK_RATE, VERSION,
    network::{auth::AuthConfig, server::{GameServer, ServerConfig}},
    ranking::{InMemoryProfileStore, InMemoryRankingStore, ReporterConfig, ResultReporter},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    let config = ServerConfig::from_env().context("invalid server configuration")?;
    let auth = AuthConfig::from_env();

    info!("xoxo server v{}", VERSION);
    info!("Tick Rate: {} Hz (default {})", config.session.tick_rate, TICK_RATE);
    if !auth.is_configured() && !auth.allow_device_login {
        warn!("No JWT key configured and device login disabled; every login will fail");
    }

    let rankings = Arc::new(InMemoryRankingStore::new());
    let profiles = Arc::new(InMemoryProfileStore::new());
    let reporter = Arc::new(ResultReporter::new(ReporterConfig::from_env(), rankings, profiles.clone()));
    reporter
        .ensure_leaderboard()
        .await
        .context("failed to create leaderboard")?;

    let server = Arc::new(GameServer::new(config, auth, reporter, profiles));
    let listener = server.bind().await.context("failed to bind")?;

    let serving = server.clone();
    let serve_task = tokio::spawn(async move { serving.serve(listener).await });

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("Shutting down ({} active matches)", server.session_count().await);
    server.shutdown();

    serve_task.await.context("server task panicked")??;
    Ok(())
}
