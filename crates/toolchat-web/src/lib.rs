//! HTTP front end for the toolchat gateway.
//!
//! `toolchat-web` exposes a [`Gateway`](toolchat::config::Gateway) over a
//! small REST API and a Server-Sent Events chat endpoint, and serves the
//! images produced by code execution. It is designed to be paired with a
//! browser UI on `http://localhost:5173` but works with any HTTP client.
//!
//! # Quick start
//!
//! ```ignore
//! use toolchat::config::GatewayConfig;
//! use toolchat_web::{WebConfig, spawn_web};
//!
//! let config = GatewayConfig::default();
//! let gateway = config.build().await?;
//! let addr = spawn_web(gateway, WebConfig::default()).await?;
//! println!("API: http://{addr}");
//! ```
//!
//! # Endpoints
//!
//! | Method | Path | Behavior |
//! |--------|------|----------|
//! | GET | `/api/conversations` | list, newest first |
//! | POST | `/api/conversations` | create `{title?}` (201) |
//! | GET | `/api/conversations/{id}` | conversation with summary and messages |
//! | DELETE | `/api/conversations/{id}` | delete with messages |
//! | POST | `/api/chat` | `{conversation_id?, message}` → SSE turn events |
//! | GET | `/api/code-output/{execution_id}/{file}` | execution artifacts |
//! | GET | `/api/health` | liveness |
//!
//! Each SSE event carries one JSON [`TurnEvent`](toolchat::orchestrator::TurnEvent)
//! in its `data:` line.

mod api;
mod server;

pub use api::{AppState, ApiError, DEFAULT_CONVERSATION_TITLE};
pub use server::{bind, build_router, serve};

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use toolchat::config::{Gateway, GatewayConfig};

/// Default origin of the local UI dev server.
pub const DEFAULT_CORS_ORIGIN: &str = "http://localhost:5173";

/// Configuration for the web server.
#[derive(Debug, Clone)]
pub struct WebConfig {
    /// Address to bind to. Default: `127.0.0.1:8000`.
    pub bind_addr: SocketAddr,
    /// Origins allowed by CORS.
    pub cors_origins: Vec<String>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
            cors_origins: vec![DEFAULT_CORS_ORIGIN.to_string()],
        }
    }
}

fn router_for(gateway: &Gateway, web: &WebConfig) -> axum::Router {
    let state = AppState {
        orchestrator: gateway.orchestrator.clone(),
        store: gateway.store.clone(),
    };
    build_router(state, gateway.artifacts.root(), &web.cors_origins)
}

/// Spawn the web server on a Tokio task and return the bound address.
///
/// The server runs until the Tokio runtime shuts down.
pub async fn spawn_web(gateway: Gateway, config: WebConfig) -> io::Result<SocketAddr> {
    let router = router_for(&gateway, &config);
    let (listener, addr) = bind(config.bind_addr).await?;
    tokio::spawn(async move {
        if let Err(e) = serve(listener, router, std::future::pending()).await {
            tracing::error!("Server error: {e}");
        }
    });
    Ok(addr)
}

/// Serve `gateway` until `shutdown` resolves, then close the store.
pub async fn run_web(
    gateway: Gateway,
    config: WebConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> io::Result<()> {
    let router = router_for(&gateway, &config);
    let (listener, addr) = bind(config.bind_addr).await?;
    tracing::info!("Listening on http://{addr}");
    serve(listener, router, shutdown).await?;
    gateway.shutdown().await;
    Ok(())
}

/// Build the gateway from `config` and serve it until `shutdown` resolves.
pub async fn build_and_run(
    config: &GatewayConfig,
    web: WebConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let gateway = config.build().await?;
    run_web(gateway, web, shutdown).await?;
    Ok(())
}
