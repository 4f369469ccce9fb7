// Axum HTTP server for the analysis API.
//
// One analysis endpoint plus a health probe. Process-wide state is the
// downbeat capability selected at startup; everything else is request-scoped.

pub mod routes;

use axum::extract::DefaultBodyLimit;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::audio::downbeat::DownbeatTracker;
use crate::config::MAX_UPLOAD_BYTES;

/// Shared state for the analysis server
pub struct AppState {
    /// Downbeat capability, selected once at startup
    pub tracker: Arc<DownbeatTracker>,
}

/// Build the application router.
///
/// The framework body limit sits above the application's upload ceiling so
/// the size check in the pipeline — not the framework default — produces
/// the 413 with its descriptive message.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(routes::api_routes())
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES * 2))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until ctrl-c.
pub async fn start_server(port: u16, tracker: Arc<DownbeatTracker>) -> Result<(), String> {
    let state = Arc::new(AppState { tracker });
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("Failed to bind to {}: {}", addr, e))?;
    let actual_addr = listener
        .local_addr()
        .map_err(|e| format!("Failed to get local addr: {}", e))?;

    tracing::info!("Server listening on {}", actual_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await
        .map_err(|e| format!("Server error: {}", e))
}
