/**
 * XFDocs Server Entry Point
 *
 * Realtime CRDT session service: one in-memory replica per live
 * document, WebSocket fan-out, snapshot + update-log persistence and
 * background compaction.
 */

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

use xfdocs::error::ServiceError;
use xfdocs::routes::{http_router, ws_router};
use xfdocs::server::{init, Config};

#[tokio::main]
async fn main() {
    // Load environment variables from .env file if present
    dotenv::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,xfdocs=debug".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&env_filter))
        .init();

    if let Err(err) = run().await {
        tracing::error!(error = %err, "startup failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ServiceError> {
    let config = Config::from_env()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let state = init::build_state(config, shutdown_rx.clone()).await?;

    // Background compaction worker
    let worker_handle = state.worker.clone().spawn(shutdown_rx.clone());

    // Two listeners: control plane + sessions
    let http_addr = SocketAddr::from(([0, 0, 0, 0], state.config.http_port));
    let ws_addr = SocketAddr::from(([0, 0, 0, 0], state.config.ws_port));
    let http_listener = TcpListener::bind(http_addr)
        .await
        .map_err(|e| ServiceError::transient(format!("failed to bind {}: {}", http_addr, e)))?;
    let ws_listener = TcpListener::bind(ws_addr)
        .await
        .map_err(|e| ServiceError::transient(format!("failed to bind {}: {}", ws_addr, e)))?;

    tracing::info!("control plane listening on {}", http_addr);
    tracing::info!("document sessions listening on {}", ws_addr);

    let mut http_shutdown = shutdown_rx.clone();
    let http_server = axum::serve(http_listener, http_router(state.clone()))
        .with_graceful_shutdown(async move {
            let _ = http_shutdown.changed().await;
        });
    let mut ws_shutdown = shutdown_rx.clone();
    let ws_server = axum::serve(ws_listener, ws_router(state.clone()))
        .with_graceful_shutdown(async move {
            let _ = ws_shutdown.changed().await;
        });

    let mut http_task = tokio::spawn(async move {
        if let Err(err) = http_server.await {
            tracing::error!(error = %err, "http server error");
        }
    });
    let mut ws_task = tokio::spawn(async move {
        if let Err(err) = ws_server.await {
            tracing::error!(error = %err, "websocket server error");
        }
    });

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
        _ = &mut http_task => {
            let _ = shutdown_tx.send(true);
            ws_task.abort();
            return Err(ServiceError::transient("http listener exited unexpectedly"));
        }
        _ = &mut ws_task => {
            let _ = shutdown_tx.send(true);
            http_task.abort();
            return Err(ServiceError::transient("websocket listener exited unexpectedly"));
        }
    }

    // Graceful shutdown: stop accepting, close sessions with 1001, flush
    // every live replica, stop the worker, drain the pool. 10s budget.
    let _ = shutdown_tx.send(true);
    let drain = async {
        state.registry.shutdown().await;
        let _ = http_task.await;
        let _ = ws_task.await;
        let _ = worker_handle.await;
    };
    if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
        tracing::warn!("shutdown budget exceeded, exiting anyway");
    }
    state.db_pool.close().await;

    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
