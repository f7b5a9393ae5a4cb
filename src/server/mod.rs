//! HTTP API and event stream.
//!
//! Routes live under `/api`. The server binds with retry and backoff so a
//! busy port does not stop the agents from running.

mod routes;
mod stream;

use crate::agents::AgentRuntime;
use crate::config::HttpConfig;
use crate::llm::LlmGateway;
use crate::pipeline::Orchestrator;
use axum::{
    Router,
    routing::{get, post},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub llm: Arc<LlmGateway>,
    pub runtimes: Arc<Vec<Arc<AgentRuntime>>>,
    /// Interval of the status push on event streams.
    pub status_interval: Duration,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(
            "/api/pipelines",
            get(routes::list_pipelines).post(routes::create_pipeline),
        )
        .route("/api/pipelines/{id}", get(routes::get_pipeline))
        .route("/api/pipelines/{id}/staging", get(routes::get_staging))
        .route("/api/pipelines/{id}/runbook", get(routes::get_runbook))
        .route("/api/pipelines/{id}/approve", post(routes::approve))
        .route("/api/pipelines/{id}/reject", post(routes::reject))
        .route("/api/pipelines/{id}/rollback", post(routes::rollback))
        .route("/api/pipelines/{id}/stream", get(stream::pipeline_stream))
        .route("/api/pipelines/{id}/terminal", get(routes::get_terminal))
        .route(
            "/api/pipelines/{id}/mode",
            get(routes::get_mode).post(routes::set_mode),
        )
        .route("/api/agents", get(routes::list_agents))
        .route("/api/llm/metrics", get(routes::llm_metrics))
        .route("/api/tools", get(routes::list_tools))
        .route("/api/health", get(routes::health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve on `addr`. Returns a shutdown sender and the bound address.
pub async fn start_server(
    state: AppState,
    addr: SocketAddr,
) -> anyhow::Result<(oneshot::Sender<()>, SocketAddr)> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                info!("HTTP server shutting down");
            })
            .await
        {
            tracing::error!("HTTP server error: {}", e);
        }
    });

    Ok((shutdown_tx, bound_addr))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Running,
    /// Bind failed; retrying in the background.
    Retrying,
    Stopped,
}

/// Lifecycle handle of a server started with [`start_server_with_retry`].
pub struct ServerHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    status_rx: watch::Receiver<ServerStatus>,
}

impl ServerHandle {
    pub fn status(&self) -> ServerStatus {
        *self.status_rx.borrow()
    }

    /// Wait until the status changes from its current value.
    pub async fn changed(&mut self) -> ServerStatus {
        let _ = self.status_rx.changed().await;
        *self.status_rx.borrow()
    }

    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Retry delay with jitter derived from the clock's sub-second nanos.
fn compute_jittered_delay(base_ms: u64, jitter_ms: u64) -> Duration {
    use std::time::SystemTime;

    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);

    let jitter_range = (jitter_ms * 2) as i64;
    let jitter = if jitter_range > 0 {
        (nanos as i64 % jitter_range) - (jitter_ms as i64)
    } else {
        0
    };

    Duration::from_millis((base_ms as i64 + jitter).max(1000) as u64)
}

/// Start the server, retrying with exponential backoff while the port is busy.
pub fn start_server_with_retry(state: AppState, http: &HttpConfig) -> ServerHandle {
    let bind = http.bind.clone();
    let port = http.port;
    let retry_initial_ms = http.retry_initial_ms;
    let retry_jitter_ms = http.retry_jitter_ms;
    let retry_max_ms = http.retry_max_ms;
    let retry_multiplier = http.retry_multiplier;

    let (status_tx, status_rx) = watch::channel(ServerStatus::Retrying);
    let (handle_shutdown_tx, mut handle_shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let addr: SocketAddr = match format!("{}:{}", bind, port).parse() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::error!(bind = %bind, port, error = %e, "Invalid HTTP bind address");
                let _ = status_tx.send(ServerStatus::Stopped);
                return;
            }
        };
        let mut current_delay_ms = retry_initial_ms;

        loop {
            match handle_shutdown_rx.try_recv() {
                Ok(()) | Err(oneshot::error::TryRecvError::Closed) => {
                    let _ = status_tx.send(ServerStatus::Stopped);
                    break;
                }
                Err(oneshot::error::TryRecvError::Empty) => {}
            }

            match start_server(state.clone(), addr).await {
                Ok((server_shutdown_tx, bound_addr)) => {
                    info!("HTTP API listening on http://{}", bound_addr);
                    let _ = status_tx.send(ServerStatus::Running);

                    let _ = (&mut handle_shutdown_rx).await;
                    let _ = server_shutdown_tx.send(());
                    let _ = status_tx.send(ServerStatus::Stopped);
                    break;
                }
                Err(e) => {
                    warn!(
                        "Failed to bind {}: {}. Retrying in {:.1}s...",
                        addr,
                        e,
                        current_delay_ms as f64 / 1000.0
                    );
                    let _ = status_tx.send(ServerStatus::Retrying);

                    tokio::select! {
                        _ = tokio::time::sleep(compute_jittered_delay(current_delay_ms, retry_jitter_ms)) => {}
                        _ = &mut handle_shutdown_rx => {
                            let _ = status_tx.send(ServerStatus::Stopped);
                            break;
                        }
                    }
                    current_delay_ms =
                        ((current_delay_ms as f64 * retry_multiplier) as u64).min(retry_max_ms);
                }
            }
        }
    });

    ServerHandle {
        shutdown_tx: Some(handle_shutdown_tx),
        status_rx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jittered_delay_has_floor_and_bounds() {
        assert_eq!(compute_jittered_delay(10, 0), Duration::from_millis(1000));
        let d = compute_jittered_delay(15_000, 5_000);
        assert!(d >= Duration::from_millis(10_000) && d <= Duration::from_millis(20_000));
    }
}
