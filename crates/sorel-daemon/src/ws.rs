//! WebSocket handler for real-time telemetry

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use sorel_core::{DecodedValue, Device, DeviceTypeKey, MetadataEvent, MetadataSummary, TelemetryEvent};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::state::AppState;

/// WebSocket message types
#[derive(Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
enum WsMessage {
    DeviceDiscovered {
        device: Device,
        metadata: MetadataSummary,
    },
    ValueChanged(DecodedValue),
    MetadataResolved { device_type_key: DeviceTypeKey },
    MetadataUnavailable { device_type_key: DeviceTypeKey },
    MetadataCleared,
    Pong,
}

impl From<TelemetryEvent> for WsMessage {
    fn from(event: TelemetryEvent) -> Self {
        match event {
            TelemetryEvent::DeviceDiscovered { device, metadata } => {
                WsMessage::DeviceDiscovered { device, metadata }
            }
            TelemetryEvent::ValueChanged(value) => WsMessage::ValueChanged(value),
        }
    }
}

impl WsMessage {
    fn from_metadata(event: MetadataEvent) -> Option<Self> {
        match event {
            MetadataEvent::Resolved(device_type_key) => {
                Some(WsMessage::MetadataResolved { device_type_key })
            }
            MetadataEvent::Unavailable(device_type_key) => {
                Some(WsMessage::MetadataUnavailable { device_type_key })
            }
            MetadataEvent::Cleared => Some(WsMessage::MetadataCleared),
            MetadataEvent::StoreFailed { .. } => None,
        }
    }

    fn to_text(&self) -> Option<Message> {
        match serde_json::to_string(self) {
            Ok(json) => Some(Message::Text(json.into())),
            Err(e) => {
                warn!(error = %e, "Failed to serialize WebSocket message");
                None
            }
        }
    }
}

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut telemetry_events = state.subscribe();
    let mut metadata_events = state.metadata.subscribe();

    info!("WebSocket client connected");

    // Send known devices and their last values on connect
    let mut snapshot = Vec::new();
    for (device, metadata) in state.devices().await {
        let values = state
            .accumulator
            .values(&device.key)
            .await
            .unwrap_or_default();
        snapshot.push(WsMessage::DeviceDiscovered { device, metadata });
        snapshot.extend(values.into_iter().map(WsMessage::ValueChanged));
    }
    for msg in snapshot {
        if let Some(text) = msg.to_text() {
            if sender.send(text).await.is_err() {
                return;
            }
        }
    }

    loop {
        tokio::select! {
            event = telemetry_events.recv() => {
                match event {
                    Ok(event) => {
                        if let Some(text) = WsMessage::from(event).to_text() {
                            if sender.send(text).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!(skipped = n, "WebSocket client lagging, telemetry events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            event = metadata_events.recv() => {
                match event {
                    Ok(event) => {
                        if let Some(text) = WsMessage::from_metadata(event).and_then(|m| m.to_text()) {
                            if sender.send(text).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        debug!(skipped = n, "Metadata event channel lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        if text.as_str() == "ping" {
                            if let Some(pong) = WsMessage::Pong.to_text() {
                                if sender.send(pong).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("WebSocket client disconnected");
}
