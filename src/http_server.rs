//! HTTP server implementation using Axum.

use crate::activity_log::ActivityLog;
use crate::config::ServerConfig;
use crate::engine::Database;
use crate::error::StartupError;
use crate::protocol::{RpcRequest, RpcResponse};
use crate::reaper;
use crate::server::{ServerCore, StopReason};
use crate::state::AppState;
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/rpc", post(rpc))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Validate the configuration, bind, and serve until shutdown.
pub async fn run_server(
    addr: SocketAddr,
    config: ServerConfig,
    db: Arc<dyn Database>,
    log: Option<ActivityLog>,
) -> Result<(), StartupError> {
    config.validate()?;
    info!(
        policy = %config.policy,
        write_dir = ?config.write_dir,
        read_dir = ?config.read_dir,
        client_timeout_secs = config.client_timeout.as_secs(),
        server_timeout_secs = config.server_timeout.as_secs(),
        "Configuration accepted"
    );

    let state = AppState::new(ServerCore::new(config, db, log, Instant::now()));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| StartupError::Bind { addr, source })?;
    info!("Starting HTTP server on {}", addr);

    tokio::spawn({
        let state = state.clone();
        async move {
            termination_signal().await;
            info!("Termination signal received");
            state.stop(StopReason::Signal).await;
        }
    });

    serve(listener, state).await
}

/// Serve on an already bound listener. Also starts the reaper.
pub async fn serve(listener: TcpListener, state: AppState) -> Result<(), StartupError> {
    tokio::spawn(reaper::run_reaper(state.clone()));

    let mut stop = state.subscribe_stop();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = stop.wait_for(|stopped| *stopped).await;
        })
        .await
        .map_err(StartupError::Serve)?;
    info!("HTTP server stopped");
    Ok(())
}

async fn termination_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "Cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn rpc(
    State(state): State<AppState>,
    Json(req): Json<RpcRequest>,
) -> Result<Json<RpcResponse>, (StatusCode, String)> {
    if state.is_stopping() {
        return Ok(Json(RpcResponse::closed("// Server is shutting down")));
    }
    state
        .handle(req)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
