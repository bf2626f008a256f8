//! Application state management

use anyhow::{Context, Result};
use chrono::Utc;
use sorel_core::{
    BlobStore, DecodedValue, Device, DeviceKey, Dispatcher, FileBlobStore, MetadataEngine,
    MetadataEvent, MetadataSource, MetadataStatusDetails, MetadataSummary, ParsedTopic,
    RegisterAccumulator, TelemetryEvent,
};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::metadata_fetch::HttpMetadataSource;

/// Shared application state
pub struct AppState {
    /// Metadata cache and fetch scheduler
    pub metadata: Arc<MetadataEngine>,
    /// Per-device register state and decoding
    pub accumulator: Arc<RegisterAccumulator>,
    /// Configuration
    pub config: Config,
    /// Set once the metadata cache can no longer be written
    fatal: watch::Receiver<Option<String>>,
}

impl AppState {
    /// Create application state backed by the HTTP API and the file cache
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        let source = Arc::new(HttpMetadataSource::new(&config.metadata)?);
        let store = Arc::new(FileBlobStore::new(config.metadata.cache_dir.clone()));
        Self::with_collaborators(config, source, store).await
    }

    /// Create application state over any metadata source and blob store
    pub async fn with_collaborators(
        config: Config,
        source: Arc<dyn MetadataSource>,
        store: Arc<dyn BlobStore>,
    ) -> Result<Arc<Self>> {
        let metadata = MetadataEngine::new(source, store);
        let restored = metadata
            .restore()
            .await
            .context("Failed to restore metadata cache")?;
        debug!(restored, "Metadata cache ready");

        let dispatcher = Dispatcher::new(config.daemon.event_capacity);
        let accumulator = RegisterAccumulator::new(
            metadata.clone(),
            dispatcher,
            config.decoder.freshness_window(),
        );
        accumulator.spawn_reconciler();

        // Store failures need operator attention; repeated ones stop the daemon
        let (fatal_tx, fatal) = watch::channel(None);
        let failure_limit = config.metadata.store_failure_limit.max(1);
        let mut rx = metadata.subscribe();
        tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                match rx.recv().await {
                    Ok(MetadataEvent::StoreFailed { key, error }) => {
                        failures += 1;
                        error!(key = %key, error = %error, failures, "Metadata cache storage failure");
                        if failures >= failure_limit {
                            let _ = fatal_tx.send(Some(format!(
                                "{} metadata cache storage failures, last: {}",
                                failures, error
                            )));
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let state = Arc::new(Self {
            metadata,
            accumulator,
            config,
            fatal,
        });

        Ok(state)
    }

    /// Wait until the daemon hits an error it cannot recover from
    pub async fn wait_fatal(&self) -> String {
        let mut fatal = self.fatal.clone();
        let reason = match fatal.wait_for(Option::is_some).await {
            Ok(reason) => reason.as_deref().unwrap_or_default().to_string(),
            Err(_) => std::future::pending().await,
        };
        reason
    }

    /// Subscribe to telemetry events
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.accumulator.dispatcher().subscribe()
    }

    /// Feed one transport message into the pipeline. Bad messages are logged and dropped.
    pub async fn handle_message(&self, topic: &str, payload: &[u8]) {
        let parsed = match topic.parse::<ParsedTopic>() {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(error = %e, "Ignoring message");
                return;
            }
        };

        match self.accumulator.ingest(&parsed, payload, Utc::now()).await {
            Ok(report) => {
                if !report.changed.is_empty() {
                    debug!(
                        device = %report.device_key,
                        changed = report.changed.len(),
                        "Values updated"
                    );
                }
            }
            Err(e) => {
                warn!(topic = %topic, error = %e, "Dropping message");
            }
        }
    }

    /// Get all devices with their metadata summary
    pub async fn devices(&self) -> Vec<(Device, MetadataSummary)> {
        self.accumulator.devices().await
    }

    /// Last decoded values of a device
    pub async fn values(&self, key: &str) -> Option<Vec<DecodedValue>> {
        self.accumulator.values(&DeviceKey(key.to_lowercase())).await
    }

    /// Metadata status of every known device type
    pub async fn metadata_status(&self) -> Vec<MetadataStatusDetails> {
        self.metadata
            .entries()
            .await
            .iter()
            .map(|entry| entry.details())
            .collect()
    }

    /// Drop all cached metadata so every device type is fetched again
    pub async fn clear_metadata_cache(&self) -> Result<usize> {
        let cleared = self
            .metadata
            .clear()
            .await
            .context("Failed to clear metadata cache")?;
        info!(cleared, "Metadata cache cleared on request");
        Ok(cleared)
    }
}
