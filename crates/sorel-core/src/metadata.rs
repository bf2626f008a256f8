//! Metadata cache and retrieval engine
//!
//! Owns one [`MetadataCacheEntry`] per device type. Fetches run on spawned
//! tasks so ingestion never waits on the network. Transient failures are
//! retried on a fixed backoff schedule (5m, 10m, 30m, then hourly); a
//! definitive not-found answer quarantines the device type until the cache
//! is cleared.
//!
//! Fresh and quarantined entries are written through to a [`BlobStore`] and
//! reloaded by [`MetadataEngine::restore`], so a restart re-fetches neither.
//! Pending and retrying entries are not persisted.
//!
//! Every fetch task carries a generation token. A clear bumps the generation
//! of every entry (by removing it), so a fetch that completes after a clear
//! is discarded instead of resurrecting stale state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::datapoint::{DatapointCatalog, DatapointDescriptor};
use crate::device::DeviceTypeKey;
use crate::store::{BlobStore, StoreError};

/// Delays between attempts after consecutive transient failures.
/// The last delay repeats indefinitely.
pub const RETRY_SCHEDULE: [Duration; 4] = [
    Duration::from_secs(5 * 60),
    Duration::from_secs(10 * 60),
    Duration::from_secs(30 * 60),
    Duration::from_secs(60 * 60),
];

const EVENT_CAPACITY: usize = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The metadata service has no data for this device type
    #[error("Device type not found")]
    NotFound,
    /// Network failure, timeout, server error or unreadable response
    #[error("Temporary failure: {0}")]
    Transient(String),
}

/// Source of datapoint descriptors for a device type
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn fetch(&self, key: &DeviceTypeKey) -> Result<Vec<DatapointDescriptor>, FetchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataStatus {
    /// Never requested (or cleared)
    #[default]
    Absent,
    /// First fetch in flight
    Pending,
    Fresh,
    /// Last fetch failed transiently; another attempt is scheduled
    Retrying,
    /// The service reported the device type does not exist
    PermanentlyUnavailable,
}

/// Cached metadata state of one device type
#[derive(Debug, Clone)]
pub struct MetadataCacheEntry {
    pub device_type_key: DeviceTypeKey,
    pub status: MetadataStatus,
    /// Descriptors, empty unless the entry is fresh
    pub catalog: Arc<DatapointCatalog>,
    /// Consecutive transient failures since the last success or clear
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub fetched_at: Option<DateTime<Utc>>,
    generation: u64,
}

impl MetadataCacheEntry {
    fn absent(device_type_key: DeviceTypeKey) -> Self {
        Self {
            device_type_key,
            status: MetadataStatus::Absent,
            catalog: Arc::new(DatapointCatalog::default()),
            retry_count: 0,
            next_retry_at: None,
            last_error: None,
            last_error_at: None,
            fetched_at: None,
            generation: 0,
        }
    }

    pub fn is_fresh(&self) -> bool {
        self.status == MetadataStatus::Fresh
    }

    /// Human readable description of the status
    pub fn message(&self) -> String {
        match self.status {
            MetadataStatus::Absent => "Metadata not requested".to_string(),
            MetadataStatus::Pending => "Fetching metadata".to_string(),
            MetadataStatus::Fresh => format!("Metadata loaded ({} datapoints)", self.catalog.len()),
            MetadataStatus::Retrying => format!(
                "Temporary error - retry scheduled (attempt {})",
                self.retry_count
            ),
            MetadataStatus::PermanentlyUnavailable => {
                "Device not found - metadata unavailable until the cache is cleared".to_string()
            }
        }
    }

    pub fn details(&self) -> MetadataStatusDetails {
        MetadataStatusDetails {
            device_type_key: self.device_type_key.clone(),
            status: self.status,
            datapoints: self.catalog.len(),
            retry_count: self.retry_count,
            next_retry_at: self.next_retry_at,
            last_error: self.last_error.clone(),
            last_error_at: self.last_error_at,
            fetched_at: self.fetched_at,
            message: self.message(),
        }
    }
}

/// Serializable status report for one device type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataStatusDetails {
    pub device_type_key: DeviceTypeKey,
    pub status: MetadataStatus,
    pub datapoints: usize,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub message: String,
}

/// Notifications emitted by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataEvent {
    /// Metadata became fresh; samples of this type can now be decoded
    Resolved(DeviceTypeKey),
    /// The device type was quarantined
    Unavailable(DeviceTypeKey),
    /// Every entry was cleared
    Cleared,
    /// Writing to or deleting from the blob store failed
    StoreFailed { key: String, error: String },
}

/// Blob-store snapshot of a fresh or quarantined entry
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedEntry {
    device_type_key: DeviceTypeKey,
    status: MetadataStatus,
    #[serde(default)]
    descriptors: Vec<DatapointDescriptor>,
    #[serde(default)]
    fetched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    last_error: Option<String>,
    #[serde(default)]
    last_error_at: Option<DateTime<Utc>>,
}

/// Owns the metadata cache of every device type
pub struct MetadataEngine {
    source: Arc<dyn MetadataSource>,
    store: Arc<dyn BlobStore>,
    entries: RwLock<HashMap<DeviceTypeKey, MetadataCacheEntry>>,
    /// Serializes blob-store commits against clear
    persist_lock: Mutex<()>,
    generation: AtomicU64,
    event_tx: broadcast::Sender<MetadataEvent>,
}

impl MetadataEngine {
    pub fn new(source: Arc<dyn MetadataSource>, store: Arc<dyn BlobStore>) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            source,
            store,
            entries: RwLock::new(HashMap::new()),
            persist_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            event_tx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MetadataEvent> {
        self.event_tx.subscribe()
    }

    /// Delay before the next attempt after `retry_count` consecutive failures
    pub fn retry_delay(retry_count: u32) -> Duration {
        let index = (retry_count.max(1) as usize - 1).min(RETRY_SCHEDULE.len() - 1);
        RETRY_SCHEDULE[index]
    }

    /// Current state of a device type; `Absent` if never referenced
    pub async fn resolve(&self, key: &DeviceTypeKey) -> MetadataCacheEntry {
        self.entries
            .read()
            .await
            .get(key)
            .cloned()
            .unwrap_or_else(|| MetadataCacheEntry::absent(key.clone()))
    }

    pub async fn entries(&self) -> Vec<MetadataCacheEntry> {
        let mut entries: Vec<_> = self.entries.read().await.values().cloned().collect();
        entries.sort_by(|a, b| a.device_type_key.cmp(&b.device_type_key));
        entries
    }

    pub async fn status_details(&self, key: &DeviceTypeKey) -> MetadataStatusDetails {
        self.resolve(key).await.details()
    }

    /// Start fetching metadata for `key` unless it is already fresh,
    /// quarantined, or being fetched. Returns `true` if a fetch was started.
    pub async fn ensure_fetch(self: &Arc<Self>, key: &DeviceTypeKey) -> bool {
        let generation = {
            let mut entries = self.entries.write().await;
            let entry = entries
                .entry(key.clone())
                .or_insert_with(|| MetadataCacheEntry::absent(key.clone()));
            if entry.status != MetadataStatus::Absent {
                return false;
            }
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            entry.status = MetadataStatus::Pending;
            entry.generation = generation;
            generation
        };

        debug!(device_type = %key, generation, "Requesting metadata");
        let engine = Arc::clone(self);
        let key = key.clone();
        tokio::spawn(async move {
            engine.run_fetch(key, generation).await;
        });
        true
    }

    /// Fetch until success, not-found, or the entry is cleared
    async fn run_fetch(&self, key: DeviceTypeKey, generation: u64) {
        loop {
            match self.source.fetch(&key).await {
                Ok(descriptors) => {
                    self.commit_fresh(&key, generation, descriptors).await;
                    return;
                }
                Err(FetchError::NotFound) => {
                    self.commit_unavailable(&key, generation).await;
                    return;
                }
                Err(FetchError::Transient(reason)) => {
                    let Some(delay) = self.record_transient(&key, generation, reason).await else {
                        return;
                    };
                    tokio::time::sleep(delay).await;
                    if !self.is_current(&key, generation).await {
                        debug!(device_type = %key, generation, "Retry abandoned after cache clear");
                        return;
                    }
                }
            }
        }
    }

    async fn is_current(&self, key: &DeviceTypeKey, generation: u64) -> bool {
        self.entries
            .read()
            .await
            .get(key)
            .is_some_and(|e| e.generation == generation)
    }

    /// Record a transient failure and return the delay before the next attempt
    async fn record_transient(
        &self,
        key: &DeviceTypeKey,
        generation: u64,
        reason: String,
    ) -> Option<Duration> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(key).filter(|e| e.generation == generation)?;

        let now = Utc::now();
        entry.retry_count += 1;
        let delay = Self::retry_delay(entry.retry_count);
        entry.status = MetadataStatus::Retrying;
        entry.last_error = Some(reason.clone());
        entry.last_error_at = Some(now);
        entry.next_retry_at = chrono::TimeDelta::from_std(delay).ok().map(|d| now + d);

        warn!(
            device_type = %key,
            attempt = entry.retry_count,
            retry_in_secs = delay.as_secs(),
            error = %reason,
            "Metadata fetch failed, retry scheduled"
        );
        Some(delay)
    }

    async fn commit_fresh(
        &self,
        key: &DeviceTypeKey,
        generation: u64,
        descriptors: Vec<DatapointDescriptor>,
    ) {
        let _guard = self.persist_lock.lock().await;
        if !self.is_current(key, generation).await {
            debug!(device_type = %key, generation, "Discarding metadata from a cleared fetch");
            return;
        }

        let fetched_at = Utc::now();
        let snapshot = PersistedEntry {
            device_type_key: key.clone(),
            status: MetadataStatus::Fresh,
            descriptors: descriptors.clone(),
            fetched_at: Some(fetched_at),
            last_error: None,
            last_error_at: None,
        };
        let count = descriptors.len();
        {
            let mut entries = self.entries.write().await;
            if let Some(entry) = entries.get_mut(key) {
                entry.status = MetadataStatus::Fresh;
                entry.catalog = Arc::new(DatapointCatalog::new(descriptors));
                entry.retry_count = 0;
                entry.next_retry_at = None;
                entry.last_error = None;
                entry.last_error_at = None;
                entry.fetched_at = Some(fetched_at);
            }
        }
        info!(device_type = %key, datapoints = count, "Metadata resolved");
        self.persist(&snapshot).await;
        let _ = self.event_tx.send(MetadataEvent::Resolved(key.clone()));
    }

    async fn commit_unavailable(&self, key: &DeviceTypeKey, generation: u64) {
        let _guard = self.persist_lock.lock().await;
        if !self.is_current(key, generation).await {
            debug!(device_type = %key, generation, "Discarding not-found from a cleared fetch");
            return;
        }

        let now = Utc::now();
        let reason = FetchError::NotFound.to_string();
        {
            let mut entries = self.entries.write().await;
            if let Some(entry) = entries.get_mut(key) {
                entry.status = MetadataStatus::PermanentlyUnavailable;
                entry.catalog = Arc::new(DatapointCatalog::default());
                entry.next_retry_at = None;
                entry.last_error = Some(reason.clone());
                entry.last_error_at = Some(now);
            }
        }
        warn!(device_type = %key, "Metadata service does not know this device type, not retrying");
        self.persist(&PersistedEntry {
            device_type_key: key.clone(),
            status: MetadataStatus::PermanentlyUnavailable,
            descriptors: Vec::new(),
            fetched_at: None,
            last_error: Some(reason),
            last_error_at: Some(now),
        })
        .await;
        let _ = self.event_tx.send(MetadataEvent::Unavailable(key.clone()));
    }

    async fn persist(&self, snapshot: &PersistedEntry) {
        let storage_key = snapshot.device_type_key.storage_key();
        let result = match serde_json::to_vec_pretty(snapshot) {
            Ok(bytes) => self.store.put(&storage_key, &bytes).await,
            Err(e) => Err(StoreError::from(e)),
        };
        if let Err(e) = result {
            error!(key = %storage_key, error = %e, "Failed to persist metadata snapshot");
            let _ = self.event_tx.send(MetadataEvent::StoreFailed {
                key: storage_key,
                error: e.to_string(),
            });
        }
    }

    /// Load persisted fresh and quarantined entries. Returns how many were restored.
    pub async fn restore(&self) -> Result<usize, StoreError> {
        let _guard = self.persist_lock.lock().await;
        let mut restored = 0;

        for storage_key in self.store.keys().await? {
            let bytes = match self.store.get(&storage_key).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) => {
                    warn!(key = %storage_key, error = %e, "Failed to read metadata snapshot");
                    continue;
                }
            };
            let snapshot: PersistedEntry = match serde_json::from_slice(&bytes) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(key = %storage_key, error = %e, "Ignoring corrupt metadata snapshot");
                    continue;
                }
            };
            if !matches!(
                snapshot.status,
                MetadataStatus::Fresh | MetadataStatus::PermanentlyUnavailable
            ) {
                debug!(key = %storage_key, status = ?snapshot.status, "Ignoring transient snapshot");
                continue;
            }

            let mut entries = self.entries.write().await;
            let key = snapshot.device_type_key.clone();
            if entries
                .get(&key)
                .is_some_and(|e| e.status != MetadataStatus::Absent)
            {
                continue;
            }

            let mut entry = MetadataCacheEntry::absent(key.clone());
            entry.status = snapshot.status;
            entry.catalog = Arc::new(DatapointCatalog::new(snapshot.descriptors));
            entry.fetched_at = snapshot.fetched_at;
            entry.last_error = snapshot.last_error;
            entry.last_error_at = snapshot.last_error_at;
            entry.generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(device_type = %key, status = ?entry.status, datapoints = entry.catalog.len(), "Restored metadata");
            entries.insert(key, entry);
            restored += 1;
        }

        if restored > 0 {
            info!(count = restored, "Restored metadata cache");
        }
        Ok(restored)
    }

    /// Drop every entry and persisted snapshot. Fetches in flight are
    /// abandoned; the next reference starts over from `Absent`.
    pub async fn clear(&self) -> Result<usize, StoreError> {
        let _guard = self.persist_lock.lock().await;
        let cleared = {
            let mut entries = self.entries.write().await;
            let count = entries.len();
            entries.clear();
            count
        };

        let mut first_error = None;
        for storage_key in self.store.keys().await? {
            if let Err(e) = self.store.delete(&storage_key).await {
                error!(key = %storage_key, error = %e, "Failed to delete metadata snapshot");
                let _ = self.event_tx.send(MetadataEvent::StoreFailed {
                    key: storage_key,
                    error: e.to_string(),
                });
                first_error.get_or_insert(e);
            }
        }

        info!(entries = cleared, "Metadata cache cleared");
        let _ = self.event_tx.send(MetadataEvent::Cleared);
        match first_error {
            Some(e) => Err(e),
            None => Ok(cleared),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::datapoint::{ValueType, WordOrder};
    use crate::store::MemoryBlobStore;
    use std::collections::VecDeque;
    use tokio::sync::mpsc;

    /// Source replaying scripted results and reporting each call
    pub(crate) struct ScriptedSource {
        results: std::sync::Mutex<VecDeque<Result<Vec<DatapointDescriptor>, FetchError>>>,
        fallback: Result<Vec<DatapointDescriptor>, FetchError>,
        calls: mpsc::UnboundedSender<tokio::time::Instant>,
    }

    impl ScriptedSource {
        pub(crate) fn new(
            results: Vec<Result<Vec<DatapointDescriptor>, FetchError>>,
            fallback: Result<Vec<DatapointDescriptor>, FetchError>,
        ) -> (Arc<Self>, mpsc::UnboundedReceiver<tokio::time::Instant>) {
            let (calls, rx) = mpsc::unbounded_channel();
            let source = Arc::new(Self {
                results: std::sync::Mutex::new(results.into()),
                fallback,
                calls,
            });
            (source, rx)
        }
    }

    #[async_trait]
    impl MetadataSource for ScriptedSource {
        async fn fetch(&self, _key: &DeviceTypeKey) -> Result<Vec<DatapointDescriptor>, FetchError> {
            let _ = self.calls.send(tokio::time::Instant::now());
            let next = self.results.lock().unwrap().pop_front();
            next.unwrap_or_else(|| self.fallback.clone())
        }
    }

    pub(crate) fn type_key() -> DeviceTypeKey {
        DeviceTypeKey::new("5", "7")
    }

    pub(crate) fn sample_descriptors() -> Vec<DatapointDescriptor> {
        vec![
            DatapointDescriptor::new(type_key(), 0, 100, ValueType::Uint16, 1, WordOrder::HighFirst, 0.01, "S1")
                .unwrap(),
        ]
    }

    fn transient() -> Result<Vec<DatapointDescriptor>, FetchError> {
        Err(FetchError::Transient("connection refused".to_string()))
    }

    async fn wait_for(
        engine: &MetadataEngine,
        key: &DeviceTypeKey,
        status: MetadataStatus,
    ) -> MetadataCacheEntry {
        for _ in 0..1000 {
            let entry = engine.resolve(key).await;
            if entry.status == status {
                return entry;
            }
            tokio::task::yield_now().await;
        }
        panic!("entry never reached {:?}", status);
    }

    #[test]
    fn test_retry_delay_schedule() {
        let minutes = |n| MetadataEngine::retry_delay(n).as_secs() / 60;
        assert_eq!(minutes(1), 5);
        assert_eq!(minutes(2), 10);
        assert_eq!(minutes(3), 30);
        assert_eq!(minutes(4), 60);
        assert_eq!(minutes(5), 60);
        assert_eq!(minutes(100), 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_follow_backoff() {
        let (source, mut calls) = ScriptedSource::new(vec![], transient());
        let engine = MetadataEngine::new(source, Arc::new(MemoryBlobStore::new()));

        assert!(engine.ensure_fetch(&type_key()).await);
        let mut times = Vec::new();
        for _ in 0..6 {
            times.push(calls.recv().await.unwrap());
        }

        let gaps: Vec<u64> = times
            .windows(2)
            .map(|w| (w[1] - w[0]).as_secs() / 60)
            .collect();
        assert_eq!(gaps, vec![5, 10, 30, 60, 60]);

        let entry = wait_for(&engine, &type_key(), MetadataStatus::Retrying).await;
        assert!(entry.retry_count >= 5);
        assert_eq!(entry.last_error.as_deref(), Some("connection refused"));
        assert!(entry.next_retry_at.is_some());
        assert!(entry.message().starts_with("Temporary error - retry scheduled"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_retry_resets_count() {
        let (source, mut calls) = ScriptedSource::new(vec![transient()], Ok(sample_descriptors()));
        let store = Arc::new(MemoryBlobStore::new());
        let engine = MetadataEngine::new(source, store.clone());
        let mut events = engine.subscribe();

        engine.ensure_fetch(&type_key()).await;
        calls.recv().await.unwrap();
        calls.recv().await.unwrap();

        assert_eq!(events.recv().await.unwrap(), MetadataEvent::Resolved(type_key()));
        let entry = engine.resolve(&type_key()).await;
        assert!(entry.is_fresh());
        assert_eq!(entry.retry_count, 0);
        assert_eq!(entry.catalog.len(), 1);
        assert!(store.get("meta_5_7").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_ensure_fetch_is_idempotent() {
        let (source, mut calls) = ScriptedSource::new(vec![], Ok(sample_descriptors()));
        let engine = MetadataEngine::new(source, Arc::new(MemoryBlobStore::new()));
        let mut events = engine.subscribe();

        assert!(engine.ensure_fetch(&type_key()).await);
        assert!(!engine.ensure_fetch(&type_key()).await);
        events.recv().await.unwrap();
        assert!(!engine.ensure_fetch(&type_key()).await);

        calls.recv().await.unwrap();
        assert!(calls.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_not_found_survives_restart_until_cleared() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());

        let (source, _calls) = ScriptedSource::new(vec![], Err(FetchError::NotFound));
        let engine = MetadataEngine::new(source, store.clone());
        let mut events = engine.subscribe();
        engine.ensure_fetch(&type_key()).await;
        assert_eq!(events.recv().await.unwrap(), MetadataEvent::Unavailable(type_key()));

        // A fresh engine over the same store restores the quarantine
        let (source, mut calls) = ScriptedSource::new(vec![], Ok(sample_descriptors()));
        let engine = MetadataEngine::new(source, store.clone());
        assert_eq!(engine.restore().await.unwrap(), 1);
        let entry = engine.resolve(&type_key()).await;
        assert_eq!(entry.status, MetadataStatus::PermanentlyUnavailable);
        assert!(!engine.ensure_fetch(&type_key()).await);
        assert!(calls.try_recv().is_err());

        let mut events = engine.subscribe();
        assert_eq!(engine.clear().await.unwrap(), 1);
        assert!(store.keys().await.unwrap().is_empty());
        assert_eq!(engine.resolve(&type_key()).await.status, MetadataStatus::Absent);

        assert_eq!(events.recv().await.unwrap(), MetadataEvent::Cleared);
        assert!(engine.ensure_fetch(&type_key()).await);
        assert_eq!(events.recv().await.unwrap(), MetadataEvent::Resolved(type_key()));
        calls.recv().await.unwrap();
    }

    #[tokio::test]
    async fn test_restore_fresh_and_skip_corrupt() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let (source, _calls) = ScriptedSource::new(vec![], Ok(sample_descriptors()));
        let engine = MetadataEngine::new(source, store.clone());
        let mut events = engine.subscribe();
        engine.ensure_fetch(&type_key()).await;
        events.recv().await.unwrap();

        store.put("meta_9_9", b"not json").await.unwrap();

        let (source, mut calls) = ScriptedSource::new(vec![], transient());
        let engine = MetadataEngine::new(source, store);
        assert_eq!(engine.restore().await.unwrap(), 1);

        let entry = engine.resolve(&type_key()).await;
        assert!(entry.is_fresh());
        assert_eq!(entry.catalog.get(0, 100).unwrap().name, "S1");
        assert!(!engine.ensure_fetch(&type_key()).await);
        assert!(calls.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_during_retry_wait_stops_retrying() {
        let (source, mut calls) = ScriptedSource::new(vec![], transient());
        let store = Arc::new(MemoryBlobStore::new());
        let engine = MetadataEngine::new(source, store.clone());

        engine.ensure_fetch(&type_key()).await;
        calls.recv().await.unwrap();
        wait_for(&engine, &type_key(), MetadataStatus::Retrying).await;

        engine.clear().await.unwrap();
        tokio::time::sleep(Duration::from_secs(6 * 60)).await;

        assert!(calls.try_recv().is_err());
        assert_eq!(engine.resolve(&type_key()).await.status, MetadataStatus::Absent);
        assert!(store.keys().await.unwrap().is_empty());
    }

    /// Source that knows every type except those with device id `b_c`
    struct KeyedSource;

    #[async_trait]
    impl MetadataSource for KeyedSource {
        async fn fetch(&self, key: &DeviceTypeKey) -> Result<Vec<DatapointDescriptor>, FetchError> {
            if key.device_id == "b_c" {
                Err(FetchError::NotFound)
            } else {
                Ok(sample_descriptors())
            }
        }
    }

    #[tokio::test]
    async fn test_restore_keeps_types_with_similar_keys_apart() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let known = DeviceTypeKey::new("a_b", "c");
        let unknown = DeviceTypeKey::new("a", "b_c");

        let engine = MetadataEngine::new(Arc::new(KeyedSource), store.clone());
        let mut events = engine.subscribe();
        engine.ensure_fetch(&known).await;
        assert_eq!(events.recv().await.unwrap(), MetadataEvent::Resolved(known.clone()));
        engine.ensure_fetch(&unknown).await;
        assert_eq!(events.recv().await.unwrap(), MetadataEvent::Unavailable(unknown.clone()));
        assert_eq!(store.keys().await.unwrap().len(), 2);

        let engine = MetadataEngine::new(Arc::new(KeyedSource), store);
        assert_eq!(engine.restore().await.unwrap(), 2);
        assert!(engine.resolve(&known).await.is_fresh());
        assert_eq!(
            engine.resolve(&unknown).await.status,
            MetadataStatus::PermanentlyUnavailable
        );
    }

    /// Source that blocks each fetch until released
    pub(crate) struct GatedSource {
        gate: tokio::sync::Semaphore,
    }

    impl GatedSource {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                gate: tokio::sync::Semaphore::new(0),
            })
        }

        pub(crate) fn release(&self, fetches: usize) {
            self.gate.add_permits(fetches);
        }
    }

    #[async_trait]
    impl MetadataSource for GatedSource {
        async fn fetch(&self, _key: &DeviceTypeKey) -> Result<Vec<DatapointDescriptor>, FetchError> {
            let permit = self.gate.acquire().await.unwrap();
            permit.forget();
            Ok(sample_descriptors())
        }
    }

    #[tokio::test]
    async fn test_clear_discards_in_flight_result() {
        let source = GatedSource::new();
        let store = Arc::new(MemoryBlobStore::new());
        let engine = MetadataEngine::new(source.clone(), store.clone());
        let mut events = engine.subscribe();

        engine.ensure_fetch(&type_key()).await;
        tokio::task::yield_now().await;
        engine.clear().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), MetadataEvent::Cleared);

        // Re-trigger, then let both the stale and the new fetch complete
        assert!(engine.ensure_fetch(&type_key()).await);
        source.release(2);

        assert_eq!(events.recv().await.unwrap(), MetadataEvent::Resolved(type_key()));
        let entry = engine.resolve(&type_key()).await;
        assert!(entry.is_fresh());
        assert_eq!(entry.generation, 2);
        assert_eq!(store.keys().await.unwrap(), vec!["meta_5_7"]);

        // Only one of the two completions was committed
        tokio::task::yield_now().await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_status_details() {
        let (source, _calls) = ScriptedSource::new(vec![], Ok(sample_descriptors()));
        let engine = MetadataEngine::new(source, Arc::new(MemoryBlobStore::new()));

        let details = engine.status_details(&type_key()).await;
        assert_eq!(details.status, MetadataStatus::Absent);
        assert_eq!(details.message, "Metadata not requested");

        let mut events = engine.subscribe();
        engine.ensure_fetch(&type_key()).await;
        events.recv().await.unwrap();
        let details = engine.status_details(&type_key()).await;
        assert_eq!(details.status, MetadataStatus::Fresh);
        assert_eq!(details.datapoints, 1);
        assert_eq!(details.message, "Metadata loaded (1 datapoints)");
        assert!(details.fetched_at.is_some());
        assert_eq!(engine.entries().await.len(), 1);
    }
}
