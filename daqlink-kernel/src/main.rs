/**
 * DAQLINK KERNEL - Point d'entrée du serveur de télémétrie
 *
 * RÔLE : Orchestration de tous les modules : config, stockage, notifications,
 * coordinateur, listener machines, HTTP.
 *
 * ARCHITECTURE : listener TCP sur son propre runtime -> relais -> coordinateur
 * (agrégation + persistance + canaux live) <- API HTTP / WebSocket.
 */

use anyhow::Context;
use daqlink_kernel::clock::{Clock, SystemClock};
use daqlink_kernel::config::load_config;
use daqlink_kernel::coordinator::Coordinator;
use daqlink_kernel::health::HealthTracker;
use daqlink_kernel::http::{build_router, AppState};
use daqlink_kernel::listener::spawn_dedicated;
use daqlink_kernel::notify::{backend_from_config, NotificationSink};
use daqlink_kernel::persistence::open_store;
use daqlink_kernel::relay::relay;
use daqlink_kernel::stat::StatModes;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = load_config().await;

    // horloge murale locale, résolue une fois
    let system_clock = SystemClock::from_config(cfg.utc_offset_hours);
    info!(offset = %system_clock.offset(), "wall clock ready");
    let clock: Arc<dyn Clock> = Arc::new(system_clock);

    // stockage
    let store = open_store(&cfg.storage).context("failed to open storage")?;
    let backend_name = cfg.storage.backend.name();
    info!(backend = backend_name, path = %cfg.storage.path.display(), "storage ready");

    // notifications rate-limitées
    let notifier = NotificationSink::spawn(
        backend_from_config(&cfg.notification),
        clock.clone(),
        cfg.notification.min_interval(),
    );

    // relais listener -> coordinateur
    let (relay_tx, relay_rx) = relay();
    let counters = relay_tx.counters();

    let coordinator = Coordinator::new(
        store.clone(),
        notifier,
        clock,
        StatModes::new(cfg.stat.clone()),
        cfg.replay_capacity,
        cfg.notification.topic.clone(),
    );
    let (handle, _coordinator_task) = coordinator.spawn(relay_rx);

    // listener machines sur son propre thread
    let listener = spawn_dedicated(cfg.tcp_addr(), cfg.server.listener_threads, relay_tx)
        .with_context(|| format!("failed to bind machine listener on {}", cfg.tcp_addr()))?;
    info!(addr = %listener.local_addr, "accepting machines");

    // fabrique l'état unique pour Axum
    let app_state = AppState {
        coordinator: handle,
        store,
        health_tracker: HealthTracker::new(counters, backend_name),
    };
    let app = build_router(app_state);

    let addr = cfg.http_addr();
    let http = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind http on {addr}"))?;
    info!(%addr, "listening on http");
    axum::serve(http, app).await.context("http server failed")?;
    Ok(())
}
