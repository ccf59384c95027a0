//! Axum server setup and router construction.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::Path;

use axum::Router;
use axum::http::{HeaderValue, Method, header};
use axum::routing::{get, post};
use tokio::net::TcpListener;
use toolchat::sandbox::ARTIFACT_URL_PREFIX;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::api::{self, AppState};

/// Build the full axum router.
///
/// The router serves:
/// - REST API and the SSE chat endpoint at `/api/*`
/// - Execution artifacts at `/api/code-output/*`, straight from `artifact_root`
pub fn build_router(app_state: AppState, artifact_root: &Path, cors_origins: &[String]) -> Router {
    let api_routes = Router::new()
        .route(
            "/api/conversations",
            get(api::list_conversations).post(api::create_conversation),
        )
        .route(
            "/api/conversations/{id}",
            get(api::get_conversation).delete(api::delete_conversation),
        )
        .route("/api/chat", post(api::post_chat))
        .route("/api/health", get(api::health))
        .with_state(app_state);

    Router::new()
        .merge(api_routes)
        .nest_service(ARTIFACT_URL_PREFIX, ServeDir::new(artifact_root))
        .layer(cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
}

/// CORS for the local UI dev server.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {o}");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .allow_credentials(true)
}

/// Bind the listener and report the actual address.
pub async fn bind(bind_addr: SocketAddr) -> io::Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind(bind_addr).await?;
    let addr = listener.local_addr()?;
    Ok((listener, addr))
}

/// Serve until `shutdown` resolves, then let open requests finish.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> io::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("Server stopped");
    Ok(())
}
