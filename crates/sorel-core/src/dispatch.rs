//! Outbound notifications for consumers of decoded telemetry

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::accumulator::DecodedValue;
use crate::device::{Device, MetadataSummary};

/// Event delivered to telemetry consumers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum TelemetryEvent {
    /// First message from a device key
    DeviceDiscovered {
        device: Device,
        metadata: MetadataSummary,
    },
    /// A datapoint decoded to a value different from the last one
    ValueChanged(DecodedValue),
}

/// Fire-and-forget fan-out of [`TelemetryEvent`]s.
///
/// Events for one device are sent while that device's state is locked, so
/// they arrive in order. Slow receivers lag and lose the oldest events.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    tx: broadcast::Sender<TelemetryEvent>,
}

impl Dispatcher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.tx.subscribe()
    }

    pub fn device_discovered(&self, device: Device, metadata: MetadataSummary) {
        self.send(TelemetryEvent::DeviceDiscovered { device, metadata });
    }

    pub fn value_changed(&self, value: DecodedValue) {
        self.send(TelemetryEvent::ValueChanged(value));
    }

    fn send(&self, event: TelemetryEvent) {
        // No receivers is normal
        if self.tx.send(event).is_err() {
            trace!("No telemetry subscribers");
        }
    }
}
