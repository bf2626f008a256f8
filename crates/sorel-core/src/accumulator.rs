//! Register accumulator
//!
//! Keeps the latest raw sample of every register of every device and turns
//! complete register sets into decoded values once metadata is available.
//!
//! Each device has its own lock, so messages for different devices are
//! processed in parallel while the samples and values of one device are only
//! ever mutated by one task at a time.
//!
//! A multi-register datapoint is decoded only when every register it spans
//! is present and all of them were observed within the freshness window of
//! each other. Otherwise decoding waits for the next register update.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::datapoint::DatapointDescriptor;
use crate::decode::{decode, Value};
use crate::device::{Device, DeviceKey, DeviceTypeKey, MetadataSummary};
use crate::dispatch::Dispatcher;
use crate::metadata::{MetadataEngine, MetadataEvent, MetadataStatus};
use crate::payload::{parse_payload, PayloadError};
use crate::topic::ParsedTopic;

/// Default maximum spread between the registers of one value
pub const DEFAULT_FRESHNESS_WINDOW: Duration = Duration::from_secs(10);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    #[error("Payload rejected: {0}")]
    Payload(#[from] PayloadError),
}

/// Latest raw value of one register
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterSample {
    pub device_key: DeviceKey,
    pub unit_id: u8,
    pub address: u16,
    pub raw_value: u16,
    pub observed_at: DateTime<Utc>,
}

/// Last decoded value of one datapoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedValue {
    pub device_key: DeviceKey,
    pub unit_id: u8,
    /// Start address of the datapoint
    pub address: u16,
    pub name: String,
    pub value: Value,
    pub display_unit: Option<String>,
    /// Observation time of the newest register the value was decoded from
    pub decoded_at: DateTime<Utc>,
}

/// Outcome of gathering the registers of one datapoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembly {
    /// All registers present within the window, in address order
    Ready {
        words: Vec<u16>,
        newest: DateTime<Utc>,
    },
    /// No sample yet for this register
    Missing(u16),
    /// Registers present but observed too far apart
    Stale { spread: chrono::TimeDelta },
}

/// What one ingested register led to
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub device_key: DeviceKey,
    /// First message from this device
    pub new_device: bool,
    /// Metadata status of the device type at the time of ingestion
    pub metadata: MetadataStatus,
    /// Values that changed and were dispatched
    pub changed: Vec<DecodedValue>,
}

type RegisterId = (u8, u16);

struct DeviceState {
    device: Device,
    announced: bool,
    samples: HashMap<RegisterId, RegisterSample>,
    values: HashMap<RegisterId, DecodedValue>,
}

impl DeviceState {
    fn assemble(&self, descriptor: &DatapointDescriptor, window: Duration) -> Assembly {
        let mut words = Vec::with_capacity(usize::from(descriptor.register_span));
        let mut oldest: Option<DateTime<Utc>> = None;
        let mut newest: Option<DateTime<Utc>> = None;

        for address in descriptor.registers() {
            let Some(sample) = self.samples.get(&(descriptor.unit_id, address)) else {
                return Assembly::Missing(address);
            };
            words.push(sample.raw_value);
            oldest = Some(oldest.map_or(sample.observed_at, |t| t.min(sample.observed_at)));
            newest = Some(newest.map_or(sample.observed_at, |t| t.max(sample.observed_at)));
        }

        let (Some(oldest), Some(newest)) = (oldest, newest) else {
            return Assembly::Missing(descriptor.address);
        };
        let spread = newest - oldest;
        if spread.to_std().is_ok_and(|s| s > window) {
            return Assembly::Stale { spread };
        }
        Assembly::Ready { words, newest }
    }

    /// Decode one datapoint and store the result. Returns the value if it changed.
    fn try_decode(
        &mut self,
        descriptor: &DatapointDescriptor,
        window: Duration,
    ) -> Option<DecodedValue> {
        let key = self.device.key.clone();
        let (words, newest) = match self.assemble(descriptor, window) {
            Assembly::Ready { words, newest } => (words, newest),
            Assembly::Missing(address) => {
                debug!(device = %key, datapoint = %descriptor.name, missing = address, "Waiting for register");
                return None;
            }
            Assembly::Stale { spread } => {
                debug!(
                    device = %key,
                    datapoint = %descriptor.name,
                    spread_ms = spread.num_milliseconds(),
                    "Registers outside freshness window"
                );
                return None;
            }
        };

        let value = match decode(descriptor, &words) {
            Ok(value) => value,
            Err(e) => {
                warn!(device = %key, datapoint = %descriptor.name, error = %e, "Decode failed");
                return None;
            }
        };

        let id = (descriptor.unit_id, descriptor.address);
        let changed = self.values.get(&id).map_or(true, |last| last.value != value);
        let decoded = DecodedValue {
            device_key: key,
            unit_id: descriptor.unit_id,
            address: descriptor.address,
            name: descriptor.name.clone(),
            value,
            display_unit: descriptor.display_unit.clone(),
            decoded_at: newest,
        };
        self.values.insert(id, decoded.clone());

        if changed {
            Some(decoded)
        } else {
            debug!(device = %decoded.device_key, datapoint = %decoded.name, "Value unchanged");
            None
        }
    }
}

/// Per-device register state and decoding
pub struct RegisterAccumulator {
    metadata: Arc<MetadataEngine>,
    dispatcher: Dispatcher,
    freshness_window: Duration,
    devices: RwLock<HashMap<DeviceKey, Arc<Mutex<DeviceState>>>>,
}

impl RegisterAccumulator {
    pub fn new(
        metadata: Arc<MetadataEngine>,
        dispatcher: Dispatcher,
        freshness_window: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            metadata,
            dispatcher,
            freshness_window,
            devices: RwLock::new(HashMap::new()),
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Parse a payload and record it. Malformed payloads leave all state untouched.
    pub async fn ingest(
        &self,
        topic: &ParsedTopic,
        payload: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<IngestReport, IngestError> {
        let payload = parse_payload(payload)?;
        let observed_at = payload.observed_at.unwrap_or(received_at);
        Ok(self.record(topic, payload.value, observed_at).await)
    }

    /// Store one register sample and decode every datapoint it belongs to
    pub async fn record(
        &self,
        topic: &ParsedTopic,
        raw_value: u16,
        observed_at: DateTime<Utc>,
    ) -> IngestReport {
        let device_key = topic.device_key();
        let type_key = topic.device_type_key();
        let slot = self.device_slot(topic, observed_at).await;
        let mut state = slot.lock().await;

        state.device.touch(observed_at);
        state.samples.insert(
            (topic.unit, topic.address),
            RegisterSample {
                device_key: device_key.clone(),
                unit_id: topic.unit,
                address: topic.address,
                raw_value,
                observed_at,
            },
        );

        let mut entry = self.metadata.resolve(&type_key).await;
        if !entry.is_fresh() && self.metadata.ensure_fetch(&type_key).await {
            entry = self.metadata.resolve(&type_key).await;
        }

        let new_device = !state.announced;
        if new_device {
            state.announced = true;
            info!(
                device = %device_key,
                device_type = %type_key,
                name = %state.device.device_name,
                metadata = ?entry.status,
                "Discovered device"
            );
            self.dispatcher.device_discovered(
                state.device.clone(),
                MetadataSummary {
                    device_type_key: type_key.clone(),
                    status: entry.status,
                    datapoints: entry.catalog.len(),
                },
            );
        }

        let mut changed = Vec::new();
        if entry.is_fresh() {
            for descriptor in entry.catalog.covering(topic.unit, topic.address) {
                if let Some(value) = state.try_decode(descriptor, self.freshness_window) {
                    self.dispatcher.value_changed(value.clone());
                    changed.push(value);
                }
            }
        } else {
            debug!(
                device = %device_key,
                unit = topic.unit,
                address = topic.address,
                metadata = ?entry.status,
                "Decode deferred until metadata is available"
            );
        }

        IngestReport {
            device_key,
            new_device,
            metadata: entry.status,
            changed,
        }
    }

    async fn device_slot(&self, topic: &ParsedTopic, seen_at: DateTime<Utc>) -> Arc<Mutex<DeviceState>> {
        let key = topic.device_key();
        if let Some(slot) = self.devices.read().await.get(&key) {
            return Arc::clone(slot);
        }

        let mut devices = self.devices.write().await;
        Arc::clone(devices.entry(key).or_insert_with(|| {
            Arc::new(Mutex::new(DeviceState {
                device: Device::from_topic(topic, seen_at),
                announced: false,
                samples: HashMap::new(),
                values: HashMap::new(),
            }))
        }))
    }

    /// Decode every datapoint of every device of `type_key` whose registers
    /// are complete. Returns the number of changed values.
    pub async fn reconcile(&self, type_key: &DeviceTypeKey) -> usize {
        let entry = self.metadata.resolve(type_key).await;
        if !entry.is_fresh() {
            return 0;
        }

        let slots: Vec<_> = self.devices.read().await.values().cloned().collect();
        let mut changed = 0;
        for slot in slots {
            let mut state = slot.lock().await;
            if &state.device.type_key != type_key {
                continue;
            }
            for descriptor in entry.catalog.iter() {
                if let Some(value) = state.try_decode(descriptor, self.freshness_window) {
                    self.dispatcher.value_changed(value);
                    changed += 1;
                }
            }
        }

        if changed > 0 {
            info!(device_type = %type_key, values = changed, "Decoded samples received before metadata");
        }
        changed
    }

    /// Reconcile devices whenever metadata for their type resolves
    pub fn spawn_reconciler(self: &Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.metadata.subscribe();
        let accumulator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(MetadataEvent::Resolved(type_key)) => {
                        accumulator.reconcile(&type_key).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Metadata events lagged, reconciling all device types");
                        for type_key in accumulator.device_types().await {
                            accumulator.reconcile(&type_key).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn device_types(&self) -> Vec<DeviceTypeKey> {
        let slots: Vec<_> = self.devices.read().await.values().cloned().collect();
        let mut types = Vec::new();
        for slot in slots {
            let type_key = slot.lock().await.device.type_key.clone();
            if !types.contains(&type_key) {
                types.push(type_key);
            }
        }
        types
    }

    /// Every known device with its current metadata summary
    pub async fn devices(&self) -> Vec<(Device, MetadataSummary)> {
        let slots: Vec<_> = self.devices.read().await.values().cloned().collect();
        let mut devices = Vec::with_capacity(slots.len());
        for slot in slots {
            let device = slot.lock().await.device.clone();
            let entry = self.metadata.resolve(&device.type_key).await;
            let summary = MetadataSummary {
                device_type_key: device.type_key.clone(),
                status: entry.status,
                datapoints: entry.catalog.len(),
            };
            devices.push((device, summary));
        }
        devices.sort_by(|a, b| a.0.key.cmp(&b.0.key));
        devices
    }

    pub async fn device(&self, key: &DeviceKey) -> Option<Device> {
        let slot = self.devices.read().await.get(key).cloned()?;
        let device = slot.lock().await.device.clone();
        Some(device)
    }

    /// Last decoded values of a device, ordered by unit and address
    pub async fn values(&self, key: &DeviceKey) -> Option<Vec<DecodedValue>> {
        let slot = self.devices.read().await.get(key).cloned()?;
        let state = slot.lock().await;
        let mut values: Vec<_> = state.values.values().cloned().collect();
        values.sort_by_key(|v| (v.unit_id, v.address));
        Some(values)
    }

    /// Latest raw samples of a device, ordered by unit and address
    pub async fn samples(&self, key: &DeviceKey) -> Option<Vec<RegisterSample>> {
        let slot = self.devices.read().await.get(key).cloned()?;
        let state = slot.lock().await;
        let mut samples: Vec<_> = state.samples.values().cloned().collect();
        samples.sort_by_key(|s| (s.unit_id, s.address));
        Some(samples)
    }
}
