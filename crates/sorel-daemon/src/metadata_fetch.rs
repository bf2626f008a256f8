//! Remote metadata fetching from the Sorel Connect API
//!
//! Responses are classified for the metadata engine:
//! 1. HTTP 404, or a 200 carrying `{"error": "Device not found"}`, is a
//!    definitive not-found
//! 2. Network errors, timeouts, other error statuses and unreadable bodies
//!    are transient and will be retried

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use sorel_core::{DatapointDescriptor, DeviceTypeKey, FetchError, MetadataDocument, MetadataSource};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::MetadataConfig;

/// Metadata source backed by the HTTP API
pub struct HttpMetadataSource {
    client: reqwest::Client,
    api_server: String,
    api_url: String,
}

impl HttpMetadataSource {
    pub fn new(config: &MetadataConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            api_server: config.api_server.clone(),
            api_url: config.api_url.clone(),
        })
    }

    /// Construct the metadata URL for a device type
    ///
    /// URL pattern: https://{api_server}/api/public/{organizationId}/device/{deviceEnumId}/metadata?language=en
    pub fn construct_url(api_server: &str, api_url: &str, key: &DeviceTypeKey) -> String {
        let server = api_server.trim_end_matches('/');
        let base = if server.starts_with("http://") || server.starts_with("https://") {
            server.to_string()
        } else {
            format!("https://{}", server)
        };
        let path = api_url
            .replace("{organizationId}", &key.oem_id)
            .replace("{deviceEnumId}", &key.device_id);
        if path.starts_with('/') {
            format!("{}{}", base, path)
        } else {
            format!("{}/{}", base, path)
        }
    }
}

/// Turn an HTTP response into descriptors or a fetch error
fn classify(
    key: &DeviceTypeKey,
    status: StatusCode,
    body: &str,
) -> Result<Vec<DatapointDescriptor>, FetchError> {
    if status == StatusCode::NOT_FOUND {
        return Err(FetchError::NotFound);
    }
    if !status.is_success() {
        return Err(FetchError::Transient(format!("HTTP {}", status)));
    }

    let document = MetadataDocument::from_json(body)
        .map_err(|e| FetchError::Transient(format!("Invalid metadata document: {}", e)))?;
    if document.is_not_found() {
        return Err(FetchError::NotFound);
    }
    if let Some(error) = document.error {
        return Err(FetchError::Transient(error));
    }
    Ok(document.into_descriptors(key))
}

#[async_trait]
impl MetadataSource for HttpMetadataSource {
    async fn fetch(&self, key: &DeviceTypeKey) -> Result<Vec<DatapointDescriptor>, FetchError> {
        let url = Self::construct_url(&self.api_server, &self.api_url, key);
        info!(url = %url, device_type = %key, "Fetching device metadata");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FetchError::Transient(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Transient(e.to_string()))?;
        debug!(url = %url, status = %status, bytes = body.len(), "Metadata response");

        classify(key, status, &body)
    }
}
