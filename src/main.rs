//! Undercover Back binary entrypoint wiring REST, WebSocket and the phase lane.

use std::{env, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::Router;
use tokio::{net::TcpListener, runtime::Handle, time::interval};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use undercover_back::{
    config::AppConfig,
    dao::{kv_store::memory::MemoryStore, users::MemoryUserDirectory},
    routes,
    state::{AppState, SharedState},
};

const PURGE_INTERVAL: Duration = Duration::from_secs(60);

fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = AppConfig::load();

    // Phase flows run on their own workers, apart from request handling.
    let phase_lane = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.phase_workers())
        .thread_name("phase-lane")
        .enable_all()
        .build()
        .context("building phase lane runtime")?;
    let server = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building server runtime")?;

    let result = server.block_on(serve(config, phase_lane.handle().clone()));
    phase_lane.shutdown_background();
    result
}

async fn serve(config: AppConfig, phase_lane: Handle) -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let users = Arc::new(MemoryUserDirectory::new(config.users().to_vec()));
    let app_state = AppState::new(config, store.clone(), users, phase_lane);

    tokio::spawn(run_store_janitor(store));
    // Build the HTTP router once the shared state is ready.
    let app = build_router(app_state.clone());

    let port = env::var("PORT")
        .or_else(|_| env::var("SERVER_PORT"))
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "starting server");

    let listener = TcpListener::bind(addr).await.context("binding server")?;
    let service = app.into_make_service();
    axum::serve(listener, service)
        .with_graceful_shutdown(shutdown_signal(app_state))
        .await
        .context("serving axum")?;

    Ok(())
}

/// Periodically drop expired entries so abandoned rooms do not pile up in memory.
async fn run_store_janitor(store: Arc<MemoryStore>) {
    let mut ticker = interval(PURGE_INTERVAL);
    loop {
        ticker.tick().await;
        let purged = store.purge_expired();
        if purged > 0 {
            debug!(purged, "purged expired store entries");
        }
    }
}

/// Build the top-level router and attach cross-cutting middleware layers.
fn build_router(state: SharedState) -> Router<()> {
    routes::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM, then stop every running phase flow.
async fn shutdown_signal(state: SharedState) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    let cancelled = state.cancel_all_phase_flows();
    info!(cancelled, "shutting down");
}
