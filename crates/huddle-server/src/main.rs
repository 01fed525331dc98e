use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use huddle_api::maintenance;
use huddle_api::{AppState, AppStateInner, Settings};
use huddle_gateway::{Registry, handle_connection};
use huddle_store::Store;

#[derive(Clone)]
struct ServerState {
    router: huddle_api::Router,
    registry: Registry,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let host = std::env::var("HUDDLE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = env_or("HUDDLE_PORT", 3000)?;
    let data_dir: PathBuf = std::env::var("HUDDLE_DATA_DIR")
        .unwrap_or_else(|_| "./huddle-data".into())
        .into();
    let sweep_interval = Duration::from_secs(env_or("HUDDLE_SWEEP_INTERVAL_SECS", 3600)?);

    let defaults = Settings::default();
    let settings = Settings {
        inactivity: inactivity_from_days(env_or("HUDDLE_INACTIVITY_DAYS", 90)?)?,
        poll_interval: Duration::from_secs(env_or("HUDDLE_POLL_INTERVAL_SECS", 5)?),
        key_exchange_timeout: Duration::from_secs(env_or("HUDDLE_KEY_TIMEOUT_SECS", 10)?),
        history_limit: env_or("HUDDLE_HISTORY_LIMIT", defaults.history_limit)?,
        ..defaults
    };

    // Init store. Nothing else writes yet, so every lock marker is orphaned.
    let store = Store::open(&data_dir)
        .await
        .with_context(|| format!("opening data directory {}", data_dir.display()))?;
    let recovered = store.recover_locks().await?;
    if recovered > 0 {
        warn!("Removed {} orphaned lock marker(s) left by a previous run", recovered);
    }

    // Shared state
    let registry = Registry::new();
    let app_state: AppState = AppStateInner::new(store, registry.clone(), settings);

    let shutdown = CancellationToken::new();

    // Background maintenance task
    let sweep = tokio::spawn(maintenance::run_maintenance_loop(
        app_state.clone(),
        sweep_interval,
        shutdown.clone(),
    ));

    let state = ServerState {
        router: huddle_api::Router::new(app_state),
        registry: registry.clone(),
        tracker: TaskTracker::new(),
        shutdown,
    };

    let app = Router::new()
        .route("/gateway", get(ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Huddle server listening on {}", addr);
    info!("Data directory: {}", data_dir.display());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.shutdown.clone()))
        .await?;

    // Let a running sweep and every connection finish their current work.
    if let Err(e) = sweep.await {
        warn!("Maintenance task ended abnormally: {}", e);
    }
    state.tracker.close();
    info!("Waiting for {} connection(s) to close", state.tracker.len());
    state.tracker.wait().await;
    registry.clear().await;
    info!("Shutdown complete");

    Ok(())
}

async fn ws_upgrade(State(state): State<ServerState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        let ServerState {
            router,
            registry,
            tracker,
            shutdown,
        } = state;
        tracker.track_future(handle_connection(socket, registry, router, shutdown))
    })
}

fn env_or<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{} has an invalid value: {:?}", name, raw)),
        Err(_) => Ok(default),
    }
}

fn inactivity_from_days(days: i64) -> anyhow::Result<chrono::TimeDelta> {
    chrono::TimeDelta::try_days(days)
        .filter(|d| *d > chrono::TimeDelta::zero())
        .with_context(|| format!("HUDDLE_INACTIVITY_DAYS out of range: {}", days))
}

/// Resolves on Ctrl+C or SIGTERM and tells live connections to wind down.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable ({}), waiting for Ctrl+C only", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
    shutdown.cancel();
}
