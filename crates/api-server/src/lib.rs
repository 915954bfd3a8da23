//! API Server
//!
//! HTTP surface of the signal gate.
//!
//! # Features
//!
//! - **Signal intake**: webhook and bot channels authenticated by shared secret
//! - **Operator commands**: JWT-authenticated pause/resume, tier and mode control, cancellation
//! - **Read APIs**: mode, risk ledger, orders, audit log, metrics
//! - **OpenAPI**: generated document at `/api-docs/openapi.json`
//!
//! # Example
//!
//! ```ignore
//! use api_server::ApiServer;
//!
//! let config = signal_core::config::Config::load()?;
//! let server = ApiServer::new(config, None).await?;
//! server.run().await?;
//! ```

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::{create_router, ApiDoc};
pub use state::{AppState, Stores};

use anyhow::Context;
use axum::extract::DefaultBodyLimit;
use axum::http::Request;
use axum::Router;
use signal_core::config::Config;
use sqlx::PgPool;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultOnResponse, TraceLayer};
use tracing::{info, warn, Level};
use trading_engine::{Scheduler, SchedulerConfig};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Maximum request body size.
    pub body_limit_bytes: usize,
    /// Enable CORS for all origins (development only).
    pub cors_permissive: bool,
}

impl ServerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            host: config.server.host.clone(),
            port: config.server.port,
            body_limit_bytes: config.server.body_limit_bytes,
            cors_permissive: std::env::var("CORS_PERMISSIVE")
                .map(|v| v == "true")
                .unwrap_or(false),
        }
    }

    /// Get the socket address.
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }
}

/// The API server.
pub struct ApiServer {
    config: ServerConfig,
    state: AppState,
}

impl ApiServer {
    /// Create a new API server. Without a pool the server runs on memory
    /// stores.
    pub async fn new(config: Config, pool: Option<PgPool>) -> anyhow::Result<Self> {
        let server_config = ServerConfig::from_config(&config);
        let state = AppState::new(config, pool).await?;
        Ok(Self {
            config: server_config,
            state,
        })
    }

    /// Router with tracing, body limit and CORS applied.
    pub fn router(config: &ServerConfig, state: Arc<AppState>) -> Router {
        create_router(state)
            .layer(
                TraceLayer::new_for_http()
                    .on_request(|request: &Request<_>, _span: &tracing::Span| {
                        tracing::info!(
                            method = %request.method(),
                            uri = %request.uri().path(),
                            "Incoming request"
                        );
                    })
                    .on_response(DefaultOnResponse::new().level(Level::DEBUG))
                    .on_failure(
                        |error: tower_http::classify::ServerErrorsFailureClass,
                         latency: std::time::Duration,
                         _span: &tracing::Span| {
                            tracing::error!(
                                error = %error,
                                latency_ms = latency.as_millis(),
                                "Request failed"
                            );
                        },
                    ),
            )
            .layer(DefaultBodyLimit::max(config.body_limit_bytes))
            .layer(if config.cors_permissive {
                CorsLayer::permissive()
            } else {
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any)
            })
    }

    /// Restore state, reconcile, start background jobs and serve until
    /// ctrl-c.
    pub async fn run(self) -> anyhow::Result<()> {
        let report = self.state.restore().await?;
        info!(
            checked = report.checked,
            resolved = report.resolved,
            never_submitted = report.never_submitted,
            safe_mode = report.safe_mode,
            "Startup reconciliation complete"
        );

        let state = self.state.into_arc();
        let scheduler = Arc::new(Scheduler::new(
            state.coordinator.clone(),
            SchedulerConfig::from(&state.config.execution),
        ));
        let jobs = scheduler.spawn();

        let router = Self::router(&self.config, state.clone());
        let addr = self.config.socket_addr()?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;

        let mode = state.mode.snapshot();
        info!(
            %addr,
            trading_mode = %mode.trading_mode,
            tier = %mode.tier,
            paused = mode.paused,
            "Signal gate listening"
        );

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        for job in jobs {
            job.abort();
        }
        info!("Server stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received, draining requests");
}
