//! HTTP server for the status API

use axum::{routing::get, Router};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use super::handlers;
use crate::config::StatusConfig;
use crate::error::{Error, Result};
use crate::session::SessionRegistry;

/// Shared state for the handlers
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            started_at: Utc::now(),
        }
    }
}

pub struct WebServer {
    addr: SocketAddr,
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(config: &StatusConfig, registry: Arc<SessionRegistry>) -> Result<Self> {
        let addr: SocketAddr = format!("{}:{}", config.bind_address, config.http_port)
            .parse()
            .map_err(|e| Error::Config(format!("invalid status address: {}", e)))?;

        Ok(Self {
            addr,
            state: Arc::new(AppState::new(registry)),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Router with every status route
    pub fn router(state: Arc<AppState>) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/api/status", get(handlers::get_status))
            .route("/api/sessions", get(handlers::list_sessions))
            .route("/api/sessions/:id", get(handlers::get_session))
            .route("/api/devices", get(handlers::get_devices))
            .layer(cors)
            .with_state(state)
    }

    /// Serve until the task is aborted
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        tracing::info!("Status API listening on http://{}", listener.local_addr()?);

        axum::serve(listener, Self::router(self.state)).await?;
        Ok(())
    }

    /// Spawn the server on the current runtime
    pub fn start_background(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                tracing::error!("Status API error: {}", e);
            }
        })
    }
}
