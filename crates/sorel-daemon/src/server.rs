//! Web server setup and routing

use anyhow::{bail, Result};
use axum::{
    routing::{get, post},
    Router,
};
use std::future::IntoFuture;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api;
use crate::mqtt;
use crate::state::AppState;
use crate::ws;

/// Build the REST/WebSocket router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // API routes
        .route("/api/devices", get(api::list_devices))
        .route("/api/devices/{device_key}/values", get(api::device_values))
        .route("/api/metadata", get(api::list_metadata))
        .route("/api/metadata/clear", post(api::clear_metadata))
        // WebSocket for real-time updates
        .route("/ws", get(ws::websocket_handler))
        // CORS
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the MQTT client in the background and serve the API
pub async fn run(state: Arc<AppState>, bind: &str) -> Result<()> {
    let app = router(state.clone());

    // Start MQTT ingestion in background
    let mqtt_state = state.clone();
    let mqtt_config = state.config.mqtt.clone();
    tokio::spawn(async move {
        mqtt::run(mqtt_state, mqtt_config).await;
    });

    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(address = %bind, protocol = "HTTP", "Starting web server");
    tokio::select! {
        result = axum::serve(listener, app).into_future() => result?,
        reason = state.wait_fatal() => bail!("Stopping: {}", reason),
    }
    Ok(())
}
