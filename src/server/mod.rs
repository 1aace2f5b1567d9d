use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::info;

pub mod handlers;
pub mod state;

use self::state::AppState;
use handlers::{
    geotag_photo, get_encountered, get_nearby, get_position, proximity_events_stream, reset_encountered,
    vouch_issue,
};

/// Largest photo accepted by `/api/geotag`.
const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

// Create the main application router
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/api/position", get(get_position))
        .route("/api/nearby", get(get_nearby))
        .route("/api/encountered", get(get_encountered))
        .route("/api/encountered/reset", post(reset_encountered))
        .route("/api/issues/:id/vouch", post(vouch_issue))
        .route(
            "/api/geotag",
            post(geotag_photo).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/api/events", get(proximity_events_stream))
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
        .with_state(state)
}

/// Serves on 127.0.0.1:`port` until `shutdown` is cancelled.
pub async fn start_server(state: AppState, port: u16, shutdown: CancellationToken) -> Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    serve(listener, state, shutdown).await
}

pub async fn serve(listener: TcpListener, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let app = create_app(state);
    info!("HTTP server listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server error")?;
    info!("HTTP server stopped");
    Ok(())
}
