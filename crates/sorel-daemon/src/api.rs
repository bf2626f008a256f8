//! REST API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use sorel_core::{Device, MetadataSummary};
use std::sync::Arc;
use tracing::{error, info};

use crate::state::AppState;

/// API error response
#[derive(Serialize)]
struct ApiError {
    error: String,
}

impl ApiError {
    fn new(msg: impl Into<String>) -> Self {
        Self { error: msg.into() }
    }
}

#[derive(Serialize)]
struct DeviceResponse {
    #[serde(flatten)]
    device: Device,
    metadata: MetadataSummary,
}

/// List all known devices with their metadata status
pub async fn list_devices(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let devices: Vec<DeviceResponse> = state
        .devices()
        .await
        .into_iter()
        .map(|(device, metadata)| DeviceResponse { device, metadata })
        .collect();
    Json(devices)
}

/// Last decoded values of a device
pub async fn device_values(
    State(state): State<Arc<AppState>>,
    Path(device_key): Path<String>,
) -> impl IntoResponse {
    match state.values(&device_key).await {
        Some(values) => Json(values).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiError::new("Device not found")),
        )
            .into_response(),
    }
}

/// Metadata status of every device type
pub async fn list_metadata(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.metadata_status().await)
}

/// Clear the metadata cache so every device type is fetched again
pub async fn clear_metadata(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    info!("Metadata cache clear requested");
    match state.clear_metadata_cache().await {
        Ok(cleared) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "cleared", "entries": cleared})),
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to clear metadata cache");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::new(format!("{:#}", e))),
            )
                .into_response()
        }
    }
}
