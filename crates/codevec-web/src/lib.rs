//! Codevec Relay Gateway
//!
//! Axum server that dispatches questions to the worker queue and relays
//! session channels to WebSocket clients.

pub mod auth;
pub mod backoff;
pub mod error;
pub mod registry;
pub mod routes;
pub mod state;
pub mod subscriber;
pub mod websocket;

use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

pub use auth::TokenVerifier;
pub use registry::ChannelRegistry;
pub use state::{AppState, RelaySettings};

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/query", post(routes::query::submit_query))
        .route("/sessions/{session_id}", get(routes::sessions::get_session));

    Router::new()
        .route("/health", get(routes::health::health))
        .nest("/v1", api_routes)
        .route("/socket/ws/{session_id}", get(websocket::ws_handler))
        .route("/socket/ws/", get(websocket::ws_missing_session))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Run the gateway until `state.shutdown` is cancelled, then give open
/// connections up to `grace` to tear down.
pub async fn run_server(
    state: AppState,
    host: &str,
    port: u16,
    grace: Duration,
) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    let registry = state.registry.clone();
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    info!("Gateway listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    let deadline = tokio::time::Instant::now() + grace;
    while !registry.is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    if !registry.is_empty() {
        warn!(
            connections = registry.total_connections(),
            "Shutting down with connections still open"
        );
    }
    Ok(())
}
