//! Datapoint topic parsing
//!
//! Controllers publish every register on its own topic:
//!
//! ```text
//! {oem_name}:{oem_id}/device/{mac}/id/{network_id}/{device_name}:{device_id}/dp/{unit_id}/{address}
//! ```
//!
//! `device`, `id` and `dp` are literal anchors. Parsing is all-or-nothing.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

use crate::device::{DeviceKey, DeviceTypeKey};

/// Subscription filter matching every datapoint topic
pub const SUBSCRIPTION_FILTER: &str = "+/device/+/+/+/+/dp/+/+";

const SEGMENT_COUNT: usize = 9;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopicError {
    #[error("Malformed topic '{topic}': {reason}")]
    Malformed { topic: String, reason: &'static str },
}

/// Structured identifiers extracted from a datapoint topic
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParsedTopic {
    pub oem_name: String,
    pub oem_id: String,
    pub mac: String,
    /// Numeric network id, kept in its published form
    pub network_id: String,
    pub device_name: String,
    pub device_id: String,
    /// Numeric unit id, kept in its published form (usually zero padded, e.g. `00`)
    pub unit_id: String,
    /// Unit id as a number
    pub unit: u8,
    /// Register address
    pub address: u16,
}

impl ParsedTopic {
    pub fn device_key(&self) -> DeviceKey {
        DeviceKey::new(&self.mac, &self.network_id)
    }

    pub fn device_type_key(&self) -> DeviceTypeKey {
        DeviceTypeKey::new(&self.oem_id, &self.device_id)
    }
}

impl std::fmt::Display for ParsedTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}/device/{}/id/{}/{}:{}/dp/{}/{}",
            self.oem_name,
            self.oem_id,
            self.mac,
            self.network_id,
            self.device_name,
            self.device_id,
            self.unit_id,
            self.address
        )
    }
}

impl FromStr for ParsedTopic {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

/// Parse a datapoint topic
pub fn parse(topic: &str) -> Result<ParsedTopic, TopicError> {
    let malformed = |reason| TopicError::Malformed {
        topic: topic.to_string(),
        reason,
    };

    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() != SEGMENT_COUNT {
        return Err(malformed("expected 9 segments"));
    }
    if parts.iter().any(|p| p.is_empty()) {
        return Err(malformed("empty segment"));
    }
    if parts[1] != "device" || parts[3] != "id" || parts[6] != "dp" {
        return Err(malformed("missing device/id/dp anchors"));
    }

    let (oem_name, oem_id) =
        split_pair(parts[0]).ok_or_else(|| malformed("expected oem_name:oem_id"))?;
    let (device_name, device_id) =
        split_pair(parts[5]).ok_or_else(|| malformed("expected device_name:device_id"))?;

    let network_id = parts[4];
    if !is_digits(network_id) {
        return Err(malformed("network id is not numeric"));
    }

    let unit_id = parts[7];
    let unit = is_digits(unit_id)
        .then(|| unit_id.parse::<u8>().ok())
        .flatten()
        .ok_or_else(|| malformed("unit id is not a number in 0..=255"))?;

    let address = parse_address(parts[8]).ok_or_else(|| malformed("invalid register address"))?;

    Ok(ParsedTopic {
        oem_name: oem_name.to_string(),
        oem_id: oem_id.to_string(),
        mac: parts[2].to_string(),
        network_id: network_id.to_string(),
        device_name: device_name.to_string(),
        device_id: device_id.to_string(),
        unit_id: unit_id.to_string(),
        unit,
        address,
    })
}

/// Split `name:id` on the first colon, both halves non-empty
fn split_pair(segment: &str) -> Option<(&str, &str)> {
    let (name, id) = segment.split_once(':')?;
    if name.is_empty() || id.is_empty() {
        return None;
    }
    Some((name, id))
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Addresses must be canonical decimal (no sign, no leading zeros)
fn parse_address(s: &str) -> Option<u16> {
    if !is_digits(s) || (s.len() > 1 && s.starts_with('0')) {
        return None;
    }
    s.parse().ok()
}
