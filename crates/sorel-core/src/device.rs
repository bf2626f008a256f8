//! Device identity types for controllers seen on the transport

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metadata::MetadataStatus;
use crate::topic::ParsedTopic;

/// Unique key of one physical device instance: `{mac}::{network_id}`
///
/// A single MAC may host several logical network endpoints, so the network id
/// is part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceKey(pub String);

impl DeviceKey {
    pub const SEPARATOR: &'static str = "::";

    /// Build a key from the MAC and network id segments of a topic
    pub fn new(mac: &str, network_id: &str) -> Self {
        Self(format!(
            "{}{}{}",
            mac.to_lowercase(),
            Self::SEPARATOR,
            network_id.to_lowercase()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a device model (organization + device enum id).
///
/// Metadata is shared by every physical device of the same type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceTypeKey {
    /// Organization id (the `oem_id` topic field)
    pub oem_id: String,
    /// Device enum id (the `device_id` topic field)
    pub device_id: String,
}

impl DeviceTypeKey {
    pub fn new(oem_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            oem_id: oem_id.into(),
            device_id: device_id.into(),
        }
    }

    /// Key under which this type's metadata snapshot is persisted.
    ///
    /// ASCII letters and digits are kept, every other byte becomes `-xx`
    /// (lowercase hex). Fields never contain `_`, so distinct type keys map
    /// to distinct storage keys that are still safe as file names.
    pub fn storage_key(&self) -> String {
        format!(
            "meta_{}_{}",
            escape_key_field(&self.oem_id),
            escape_key_field(&self.device_id)
        )
    }
}

fn escape_key_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for byte in field.bytes() {
        if byte.is_ascii_alphanumeric() {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("-{:02x}", byte));
        }
    }
    out
}

impl std::fmt::Display for DeviceTypeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.oem_id, self.device_id)
    }
}

/// A device discovered on the transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Physical device key
    pub key: DeviceKey,
    /// Device model, used for metadata lookup
    pub type_key: DeviceTypeKey,
    /// Manufacturer name from the topic
    pub oem_name: String,
    /// Human-readable model name from the topic
    pub device_name: String,
    pub mac: String,
    pub network_id: String,
    /// Observation time of the first register seen from this device
    pub first_seen: DateTime<Utc>,
    /// Observation time of the most recent register
    pub last_seen: DateTime<Utc>,
}

impl Device {
    /// Create a device record from the topic of its first message
    pub fn from_topic(topic: &ParsedTopic, seen_at: DateTime<Utc>) -> Self {
        Self {
            key: topic.device_key(),
            type_key: topic.device_type_key(),
            oem_name: topic.oem_name.clone(),
            device_name: topic.device_name.clone(),
            mac: topic.mac.clone(),
            network_id: topic.network_id.clone(),
            first_seen: seen_at,
            last_seen: seen_at,
        }
    }

    /// Update the last seen timestamp. Older observations never move it back.
    pub fn touch(&mut self, seen_at: DateTime<Utc>) {
        if seen_at > self.last_seen {
            self.last_seen = seen_at;
        }
    }
}

/// Metadata state attached to a device discovery notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataSummary {
    pub device_type_key: DeviceTypeKey,
    pub status: MetadataStatus,
    /// Number of datapoints described by the metadata (0 unless fresh)
    pub datapoints: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn topic() -> ParsedTopic {
        "Sorel:5/device/AA:BB:CC:DD:EE:FF/id/12/LTDC:7/dp/00/40037"
            .parse()
            .unwrap()
    }

    #[test]
    fn test_device_key_is_lowercased() {
        let key = DeviceKey::new("AA:BB:CC:DD:EE:FF", "12");
        assert_eq!(key.as_str(), "aa:bb:cc:dd:ee:ff::12");
    }

    #[test]
    fn test_device_type_key_storage_key() {
        let key = DeviceTypeKey::new("5", "7");
        assert_eq!(key.storage_key(), "meta_5_7");
        assert_eq!(key.to_string(), "5:7");
        assert_eq!(DeviceTypeKey::new("org.1", "dev:x").storage_key(), "meta_org-2e1_dev-3ax");
    }

    #[test]
    fn test_storage_keys_do_not_collide() {
        let pairs = [
            (DeviceTypeKey::new("a_b", "c"), DeviceTypeKey::new("a", "b_c")),
            (DeviceTypeKey::new("org.1", "7"), DeviceTypeKey::new("org_1", "7")),
            (DeviceTypeKey::new("a-2e", "7"), DeviceTypeKey::new("a.", "7")),
        ];
        for (left, right) in pairs {
            assert_ne!(left.storage_key(), right.storage_key(), "{} vs {}", left, right);
        }
        let key = DeviceTypeKey::new("Org Ü", "x/y").storage_key();
        assert!(key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
    }

    #[test]
    fn test_device_from_topic() {
        let seen = Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap();
        let device = Device::from_topic(&topic(), seen);
        assert_eq!(device.key, DeviceKey::new("aa:bb:cc:dd:ee:ff", "12"));
        assert_eq!(device.type_key, DeviceTypeKey::new("5", "7"));
        assert_eq!(device.oem_name, "Sorel");
        assert_eq!(device.device_name, "LTDC");
        assert_eq!(device.first_seen, seen);
    }

    #[test]
    fn test_touch_is_monotonic() {
        let seen = Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap();
        let mut device = Device::from_topic(&topic(), seen);

        device.touch(seen + chrono::TimeDelta::seconds(30));
        device.touch(seen);
        assert_eq!(device.last_seen, seen + chrono::TimeDelta::seconds(30));
        assert_eq!(device.first_seen, seen);
    }
}
