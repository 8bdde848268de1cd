//! Shellgate Agent - device side of the command gateway
//!
//! - Loads its TOML config and command definitions (both fatal on error)
//! - Serves the agent API with per-caller rate limiting
//! - Sweeps expired rate-limit entries in the background

use anyhow::{Context, Result};
use shellgate_agent::http::build_router;
use shellgate_agent::{AgentConfig, AgentService, ExecutionEngine, YamlCommandRepository};
use shellgate_shared::SecurityGate;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("shellgate_agent=info,shellgate_shared=info")),
        )
        .init();

    info!("Shellgate Agent v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = AgentConfig::load().await.context("Failed to load agent config")?;

    let gate = match SecurityGate::new(&config.security) {
        Ok(gate) => Arc::new(gate),
        Err(e) => {
            error!("Invalid security policy: {}", e);
            return Err(e.into());
        }
    };
    if !gate.pin_required() {
        warn!("PIN check disabled: any caller within the rate limit may execute commands");
    }

    let repository = YamlCommandRepository::open(&config.commands_file)
        .with_context(|| format!("Failed to load commands from {}", config.commands_file.display()))?;

    let engine = ExecutionEngine::new();
    info!("Platform: {}", engine.platform());

    let shutdown = CancellationToken::new();
    let sweeper = gate.clone().spawn_sweeper(
        Duration::from_secs(config.sweep_interval_secs.max(1)),
        shutdown.clone(),
    );

    let service = AgentService::new(
        gate,
        engine,
        Arc::new(repository),
        Duration::from_millis(config.max_timeout_ms),
    );
    let app = build_router(Arc::new(service));

    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;
    info!("Agent API listening on http://{}", listener.local_addr()?);

    let token = shutdown.clone();
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
            }
            token.cancel();
        })
        .await
        .context("Agent API server failed")?;

    shutdown.cancel();
    let _ = sweeper.await;
    info!("Agent stopped");
    Ok(())
}
