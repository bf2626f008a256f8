//! Datapoint descriptors and the per-device-type catalog
//!
//! The metadata API describes each datapoint by start address, byte length,
//! type name and scale ("step"). These are turned into immutable
//! [`DatapointDescriptor`]s and indexed by `(unit_id, address)` so the
//! accumulator can find every descriptor covering an incoming register.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::device::DeviceTypeKey;

/// Longest string datapoint accepted, in registers
pub const MAX_STRING_SPAN: u8 = 32;

/// Error text the metadata API returns for unknown device types
pub const DEVICE_NOT_FOUND: &str = "Device not found";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DescriptorError {
    #[error("Invalid register address: {0}")]
    InvalidAddress(String),
    #[error("Invalid datapoint length: {0}")]
    InvalidLength(String),
    #[error("Unknown datapoint type: {0}")]
    UnknownType(String),
    #[error("{value_type:?} cannot span {span} registers")]
    SpanMismatch { value_type: ValueType, span: u8 },
    #[error("Datapoint at {address} spanning {span} registers exceeds the address space")]
    AddressOverflow { address: u16, span: u8 },
    #[error("Invalid scale factor: {0}")]
    InvalidScale(f64),
}

/// Declared value type of a datapoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Uint8,
    Uint16,
    Int16,
    Uint32,
    Int32,
    Float32,
    Bool,
    String,
}

impl ValueType {
    /// Map a metadata type name (including vendor aliases) to a value type
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        match name.as_str() {
            "uns8" | "uint8" => Some(Self::Uint8),
            "uns16" | "uint16" => Some(Self::Uint16),
            "int16" | "sig16" => Some(Self::Int16),
            "uns32" | "uint32" => Some(Self::Uint32),
            "int32" | "sig32" => Some(Self::Int32),
            "float32" | "float" => Some(Self::Float32),
            "bool" | "boolean" => Some(Self::Bool),
            n if n.starts_with("str") || n.starts_with("char") => Some(Self::String),
            _ => None,
        }
    }

    /// Number of registers a numeric type occupies; `None` for strings
    pub fn natural_span(self) -> Option<u8> {
        match self {
            Self::Uint8 | Self::Uint16 | Self::Int16 | Self::Bool => Some(1),
            Self::Uint32 | Self::Int32 | Self::Float32 => Some(2),
            Self::String => None,
        }
    }
}

/// Order of the two registers of a 32-bit value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WordOrder {
    /// The register at the start address holds the high word
    #[default]
    HighFirst,
    /// The register at the start address holds the low word
    LowFirst,
}

impl WordOrder {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "high_first" | "highfirst" | "big" | "abcd" => Some(Self::HighFirst),
            "low_first" | "lowfirst" | "little" | "swapped" | "cdab" => Some(Self::LowFirst),
            _ => None,
        }
    }
}

/// Immutable description of one datapoint of a device type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatapointDescriptor {
    pub device_type_key: DeviceTypeKey,
    pub unit_id: u8,
    /// First register of the datapoint
    pub address: u16,
    pub value_type: ValueType,
    /// Number of consecutive registers, starting at `address`
    pub register_span: u8,
    #[serde(default)]
    pub word_order: WordOrder,
    pub scale_factor: f64,
    pub display_unit: Option<String>,
    pub name: String,
    /// Labels for enumerated integer values, keyed by the raw (unscaled) value
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<i64, String>,
}

impl DatapointDescriptor {
    /// Build a validated descriptor
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device_type_key: DeviceTypeKey,
        unit_id: u8,
        address: u16,
        value_type: ValueType,
        register_span: u8,
        word_order: WordOrder,
        scale_factor: f64,
        name: impl Into<String>,
    ) -> Result<Self, DescriptorError> {
        let span_ok = match value_type.natural_span() {
            Some(natural) => register_span == natural,
            None => (1..=MAX_STRING_SPAN).contains(&register_span),
        };
        if !span_ok {
            return Err(DescriptorError::SpanMismatch {
                value_type,
                span: register_span,
            });
        }
        if u32::from(address) + u32::from(register_span) - 1 > u32::from(u16::MAX) {
            return Err(DescriptorError::AddressOverflow {
                address,
                span: register_span,
            });
        }
        if !scale_factor.is_finite() || scale_factor == 0.0 {
            return Err(DescriptorError::InvalidScale(scale_factor));
        }

        Ok(Self {
            device_type_key,
            unit_id,
            address,
            value_type,
            register_span,
            word_order,
            scale_factor,
            display_unit: None,
            name: name.into(),
            labels: BTreeMap::new(),
        })
    }

    pub fn with_display_unit(mut self, unit: impl Into<String>) -> Self {
        self.display_unit = Some(unit.into());
        self
    }

    pub fn with_labels(mut self, labels: BTreeMap<i64, String>) -> Self {
        self.labels = labels;
        self
    }

    /// Build a descriptor from one API datapoint entry
    pub fn from_raw(
        device_type_key: &DeviceTypeKey,
        raw: &RawDatapoint,
    ) -> Result<Self, DescriptorError> {
        let address = raw
            .address
            .as_i64()
            .and_then(|a| u16::try_from(a).ok())
            .ok_or_else(|| DescriptorError::InvalidAddress(raw.address.to_string()))?;
        let length = raw
            .length
            .as_i64()
            .filter(|l| (1..=i64::from(MAX_STRING_SPAN) * 2).contains(l))
            .ok_or_else(|| DescriptorError::InvalidLength(raw.length.to_string()))?;
        let value_type = ValueType::from_name(&raw.data_type)
            .ok_or_else(|| DescriptorError::UnknownType(raw.data_type.clone()))?;
        let span = u8::try_from((length + 1) / 2)
            .map_err(|_| DescriptorError::InvalidLength(length.to_string()))?;
        let word_order = raw
            .word_order
            .as_deref()
            .and_then(WordOrder::from_name)
            .unwrap_or_default();
        let name = raw
            .name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("Datapoint {}", address));

        let mut descriptor = Self::new(
            device_type_key.clone(),
            raw.unit_id.unwrap_or(0),
            address,
            value_type,
            span,
            word_order,
            raw.step.unwrap_or(1.0),
            name,
        )?;
        descriptor.display_unit = raw.unit.clone().filter(|u| !u.trim().is_empty());
        descriptor.labels = raw.format.as_deref().map(parse_labels).unwrap_or_default();
        Ok(descriptor)
    }

    /// Last register address covered by this datapoint
    pub fn end_address(&self) -> u16 {
        self.address + u16::from(self.register_span) - 1
    }

    pub fn covers(&self, unit_id: u8, address: u16) -> bool {
        self.unit_id == unit_id && (self.address..=self.end_address()).contains(&address)
    }

    /// Register addresses making up this datapoint, in address order
    pub fn registers(&self) -> impl Iterator<Item = u16> {
        self.address..=self.end_address()
    }
}

/// Parse a `format` mapping such as `{"0": "Off", "1": "Daily"}`
fn parse_labels(format: &str) -> BTreeMap<i64, String> {
    if format.trim().is_empty() {
        return BTreeMap::new();
    }
    let object: serde_json::Map<String, serde_json::Value> = match serde_json::from_str(format) {
        Ok(object) => object,
        Err(e) => {
            debug!(format = %format, error = %e, "Ignoring datapoint format that is not a label map");
            return BTreeMap::new();
        }
    };
    object
        .into_iter()
        .filter_map(|(key, label)| {
            let key = key.trim().parse::<i64>().ok()?;
            let label = match label {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            Some((key, label))
        })
        .collect()
}

/// A number that the API sometimes sends as a string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Numeric {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Numeric {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            Self::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Self::Float(_) => None,
            Self::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl std::fmt::Display for Numeric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{}", n),
            Self::Float(x) => write!(f, "{}", x),
            Self::Text(s) => write!(f, "{:?}", s),
        }
    }
}

/// One datapoint as described by the metadata API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawDatapoint {
    pub address: Numeric,
    /// Length in bytes
    pub length: Numeric,
    #[serde(rename = "type", default)]
    pub data_type: String,
    #[serde(default)]
    pub step: Option<f64>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub unit_id: Option<u8>,
    #[serde(default)]
    pub word_order: Option<String>,
}

/// Metadata document returned by the API for one device type
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataDocument {
    /// Set when the API reports an error instead of metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Raw datapoint entries; decoded one by one so a bad entry does not
    /// invalidate the rest
    #[serde(default)]
    pub datapoints: Vec<serde_json::Value>,
}

impl MetadataDocument {
    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    /// The API answers unknown device types with an error body
    pub fn is_not_found(&self) -> bool {
        self.error.as_deref() == Some(DEVICE_NOT_FOUND)
    }

    /// Convert every valid datapoint; invalid ones are logged and skipped
    pub fn into_descriptors(self, device_type_key: &DeviceTypeKey) -> Vec<DatapointDescriptor> {
        let mut descriptors = Vec::with_capacity(self.datapoints.len());
        for (index, value) in self.datapoints.into_iter().enumerate() {
            let raw: RawDatapoint = match serde_json::from_value(value) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(device_type = %device_type_key, index, error = %e, "Skipping unreadable datapoint");
                    continue;
                }
            };
            match DatapointDescriptor::from_raw(device_type_key, &raw) {
                Ok(descriptor) => descriptors.push(descriptor),
                Err(e) => {
                    warn!(
                        device_type = %device_type_key,
                        index,
                        name = ?raw.name,
                        error = %e,
                        "Skipping invalid datapoint"
                    );
                }
            }
        }
        descriptors
    }
}

/// Descriptors of one device type, indexed by `(unit_id, start address)`
#[derive(Debug, Clone, Default)]
pub struct DatapointCatalog {
    by_start: BTreeMap<(u8, u16), DatapointDescriptor>,
    max_span: u8,
}

impl DatapointCatalog {
    pub fn new(descriptors: impl IntoIterator<Item = DatapointDescriptor>) -> Self {
        let mut catalog = Self::default();
        for descriptor in descriptors {
            catalog.max_span = catalog.max_span.max(descriptor.register_span);
            let key = (descriptor.unit_id, descriptor.address);
            if let Some(previous) = catalog.by_start.insert(key, descriptor) {
                warn!(
                    unit = key.0,
                    address = key.1,
                    replaced = %previous.name,
                    "Duplicate datapoint address, keeping the last one"
                );
            }
        }
        catalog
    }

    pub fn len(&self) -> usize {
        self.by_start.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_start.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DatapointDescriptor> {
        self.by_start.values()
    }

    /// Descriptor starting exactly at `(unit_id, address)`
    pub fn get(&self, unit_id: u8, address: u16) -> Option<&DatapointDescriptor> {
        self.by_start.get(&(unit_id, address))
    }

    /// Every descriptor whose register range contains `(unit_id, address)`.
    ///
    /// A register can be the first or a later half of a multi-register value,
    /// so all start addresses from `address - (max_span - 1)` are checked.
    pub fn covering(&self, unit_id: u8, address: u16) -> impl Iterator<Item = &DatapointDescriptor> {
        let lowest = address.saturating_sub(u16::from(self.max_span.saturating_sub(1)));
        self.by_start
            .range((unit_id, lowest)..=(unit_id, address))
            .map(|(_, d)| d)
            .filter(move |d| d.covers(unit_id, address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> DeviceTypeKey {
        DeviceTypeKey::new("5", "7")
    }

    fn descriptor(address: u16, value_type: ValueType, span: u8) -> DatapointDescriptor {
        DatapointDescriptor::new(key(), 0, address, value_type, span, WordOrder::HighFirst, 1.0, "dp")
            .unwrap()
    }

    #[test]
    fn test_value_type_aliases() {
        assert_eq!(ValueType::from_name("UNS16"), Some(ValueType::Uint16));
        assert_eq!(ValueType::from_name("sig16"), Some(ValueType::Int16));
        assert_eq!(ValueType::from_name("sig32"), Some(ValueType::Int32));
        assert_eq!(ValueType::from_name("float"), Some(ValueType::Float32));
        assert_eq!(ValueType::from_name("boolean"), Some(ValueType::Bool));
        assert_eq!(ValueType::from_name("string"), Some(ValueType::String));
        assert_eq!(ValueType::from_name("char[8]"), Some(ValueType::String));
        assert_eq!(ValueType::from_name("int64"), None);
    }

    #[test]
    fn test_span_validation() {
        assert!(matches!(
            DatapointDescriptor::new(key(), 0, 1, ValueType::Float32, 1, WordOrder::HighFirst, 1.0, "x"),
            Err(DescriptorError::SpanMismatch { .. })
        ));
        assert!(matches!(
            DatapointDescriptor::new(key(), 0, 1, ValueType::String, 33, WordOrder::HighFirst, 1.0, "x"),
            Err(DescriptorError::SpanMismatch { .. })
        ));
        assert!(matches!(
            DatapointDescriptor::new(key(), 0, u16::MAX, ValueType::Uint32, 2, WordOrder::HighFirst, 1.0, "x"),
            Err(DescriptorError::AddressOverflow { .. })
        ));
        assert!(matches!(
            DatapointDescriptor::new(key(), 0, 1, ValueType::Uint16, 1, WordOrder::HighFirst, 0.0, "x"),
            Err(DescriptorError::InvalidScale(_))
        ));
    }

    #[test]
    fn test_document_conversion() {
        let json = r#"{
            "datapoints": [
                {"address": 40037, "length": 2, "type": "uns16", "step": 0.1, "name": "S1", "unit": "°C", "format": ""},
                {"address": "40100", "length": 4, "type": "float32", "name": "Flow", "wordOrder": "low_first"},
                {"address": 40200, "length": 1, "type": "uns8", "name": "Mode", "format": "{\"0\": \"Off\", \"1\": \"Daily\"}"},
                {"address": 40300, "length": 2, "type": "mystery"},
                {"address": -4, "length": 2, "type": "uns16"},
                {"address": 40400, "length": 9223372036854775807, "type": "uns16"},
                {"address": 40401, "length": 0, "type": "uns16"},
                {"name": "no address"}
            ]
        }"#;
        let document = MetadataDocument::from_json(json).unwrap();
        assert!(!document.is_not_found());

        let descriptors = document.into_descriptors(&key());
        assert_eq!(descriptors.len(), 3);

        let s1 = &descriptors[0];
        assert_eq!(s1.address, 40037);
        assert_eq!(s1.value_type, ValueType::Uint16);
        assert_eq!(s1.register_span, 1);
        assert_eq!(s1.scale_factor, 0.1);
        assert_eq!(s1.display_unit.as_deref(), Some("°C"));
        assert!(s1.labels.is_empty());

        let flow = &descriptors[1];
        assert_eq!(flow.address, 40100);
        assert_eq!(flow.register_span, 2);
        assert_eq!(flow.word_order, WordOrder::LowFirst);
        assert_eq!(flow.scale_factor, 1.0);

        let mode = &descriptors[2];
        assert_eq!(mode.labels.get(&1).map(String::as_str), Some("Daily"));
    }

    #[test]
    fn test_not_found_document() {
        let document = MetadataDocument::from_json(r#"{"error": "Device not found"}"#).unwrap();
        assert!(document.is_not_found());
        assert!(document.datapoints.is_empty());
    }

    #[test]
    fn test_catalog_covering_checks_both_halves() {
        let catalog = DatapointCatalog::new(vec![
            descriptor(100, ValueType::Uint16, 1),
            descriptor(101, ValueType::Float32, 2),
            descriptor(200, ValueType::String, 4),
        ]);
        assert_eq!(catalog.len(), 3);

        let at = |address| -> Vec<u16> { catalog.covering(0, address).map(|d| d.address).collect() };
        assert_eq!(at(100), vec![100]);
        assert_eq!(at(101), vec![101]);
        assert_eq!(at(102), vec![101]);
        assert_eq!(at(103), Vec::<u16>::new());
        assert_eq!(at(203), vec![200]);
        assert_eq!(at(204), Vec::<u16>::new());
        assert_eq!(catalog.covering(1, 100).count(), 0);
    }

    #[test]
    fn test_catalog_duplicate_keeps_last() {
        let mut second = descriptor(100, ValueType::Int16, 1);
        second.name = "second".to_string();
        let catalog = DatapointCatalog::new(vec![descriptor(100, ValueType::Uint16, 1), second]);
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get(0, 100).unwrap().name, "second");
    }
}
