/**
 * SHELLGATE KERNEL - Point d'entrée du gateway
 *
 * RÔLE : Charge la config, ouvre les connexions aux devices déclarés,
 * démarre le sweeper du rate limiter et sert l'API REST.
 *
 * ARRÊT : Ctrl-C → arrêt gracieux du serveur, annulation des tâches de
 * santé et fermeture de tous les transports.
 */

use anyhow::{Context, Result};
use shellgate_kernel::config::load_config;
use shellgate_kernel::health::HealthTracker;
use shellgate_kernel::http::{build_router, AppState};
use shellgate_kernel::{CommandDispatcher, ConnectionRegistry, HttpConnector};
use shellgate_shared::SecurityGate;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = load_config().await.context("kernel config")?;
    let api_key = cfg.resolved_api_key();
    if api_key.is_none() {
        warn!("no API key configured, the gateway API is open");
    }

    let gate = match SecurityGate::new(&cfg.security) {
        Ok(gate) => Arc::new(gate),
        Err(e) => {
            error!("invalid security policy: {}", e);
            return Err(e.into());
        }
    };
    if cfg.security.pin_required || cfg.security.whitelist_enabled {
        info!(
            "gateway admission (pin_required={}, whitelist_enabled={}) applies to every command; agent per-command flags are not consulted",
            cfg.security.pin_required, cfg.security.whitelist_enabled
        );
    }

    let connector = Arc::new(HttpConnector::new(cfg.registry.connect_timeout()));
    let registry = ConnectionRegistry::new(cfg.registry.clone(), connector);

    // devices déclarés : un échec n'empêche pas le démarrage
    for device in &cfg.devices {
        if let Err(e) = registry.add_connection(&device.id, &device.address).await {
            warn!("device {} not connected at startup: {}", device.id, e);
        }
    }
    info!("{} device(s) registered", registry.len().await);

    let shutdown = CancellationToken::new();
    let sweeper = gate
        .clone()
        .spawn_sweeper(Duration::from_secs(cfg.sweep_interval_secs.max(1)), shutdown.clone());

    let dispatcher = Arc::new(CommandDispatcher::new(gate, registry.clone(), cfg.dispatch.clone()));
    let app = build_router(AppState {
        dispatcher,
        health_tracker: HealthTracker::new(),
        api_key: api_key.map(Arc::from),
    });

    let listener = TcpListener::bind(&cfg.listen)
        .await
        .with_context(|| format!("cannot bind {}", cfg.listen))?;
    info!("listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
            }
        })
        .await
        .context("HTTP server")?;

    shutdown.cancel();
    registry.stop_all().await;
    let _ = sweeper.await;
    info!("kernel stopped");
    Ok(())
}
