//! HTTP surface: `POST /execute` (and `/api/execute`), `GET /healthz`, `GET /metrics`.

pub mod handlers;

use crate::config::types::{ExecError, Result};
use crate::service::Executor;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

pub use handlers::{ExecuteBody, ExecuteResponse};

pub struct AppState<E> {
    pub executor: Arc<E>,
}

impl<E> Clone for AppState<E> {
    fn clone(&self) -> Self {
        Self {
            executor: Arc::clone(&self.executor),
        }
    }
}

pub fn router<E: Executor>(executor: Arc<E>) -> Router {
    let body_limit = executor.request_body_limit();
    Router::new()
        .route("/execute", post(handlers::execute::<E>))
        .route("/api/execute", post(handlers::execute::<E>))
        .route("/healthz", get(handlers::healthz::<E>))
        .route("/metrics", get(handlers::metrics::<E>))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { executor })
}

/// Serve until Ctrl-C. In-flight executions finish before this returns.
pub async fn serve<E: Executor>(executor: Arc<E>, bind_addr: &str) -> Result<()> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| ExecError::Config(format!("cannot bind {}: {}", bind_addr, e)))?;
    log::info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, router(executor))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    log::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to install Ctrl-C handler: {}", e);
        std::future::pending::<()>().await;
    }
    log::info!("Shutdown requested");
}
