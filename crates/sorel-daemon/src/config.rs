//! Configuration loading

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub decoder: DecoderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Bind address for the REST/WebSocket server
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Capacity of the telemetry event channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_event_capacity() -> usize {
    256
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Connect with TLS using the platform root certificates
    #[serde(default)]
    pub tls: bool,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Subscription filter for datapoint topics
    #[serde(default = "default_topic_filter")]
    pub topic_filter: String,
    /// Pause after a connection error before polling again
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            username: None,
            password: None,
            tls: false,
            client_id: default_client_id(),
            keep_alive_secs: default_keep_alive(),
            topic_filter: default_topic_filter(),
            reconnect_delay_secs: default_reconnect_delay(),
        }
    }
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "sorel-bridge".to_string()
}

fn default_keep_alive() -> u64 {
    60
}

fn default_topic_filter() -> String {
    sorel_core::SUBSCRIPTION_FILTER.to_string()
}

fn default_reconnect_delay() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// Host of the metadata API, with or without scheme
    #[serde(default = "default_api_server")]
    pub api_server: String,
    /// Path template; `{organizationId}` and `{deviceEnumId}` are substituted
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Directory holding persisted metadata snapshots
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Cache storage failures tolerated before the daemon stops
    #[serde(default = "default_store_failure_limit")]
    pub store_failure_limit: u32,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            api_server: default_api_server(),
            api_url: default_api_url(),
            timeout_secs: default_timeout(),
            cache_dir: default_cache_dir(),
            store_failure_limit: default_store_failure_limit(),
        }
    }
}

fn default_api_server() -> String {
    "connect.sorel.de".to_string()
}

fn default_api_url() -> String {
    "/api/public/{organizationId}/device/{deviceEnumId}/metadata?language=en".to_string()
}

fn default_timeout() -> u64 {
    15
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./sorel_meta_cache")
}

fn default_store_failure_limit() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Maximum spread between the registers of one multi-register value
    #[serde(default = "default_freshness_window")]
    pub freshness_window_secs: u64,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            freshness_window_secs: default_freshness_window(),
        }
    }
}

impl DecoderConfig {
    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.freshness_window_secs)
    }
}

fn default_freshness_window() -> u64 {
    10
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}
