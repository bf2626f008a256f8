//! Sorel Core - Telemetry decoding and metadata resolution
//!
//! This crate turns raw register messages from Sorel controllers into typed values:
//! - Topic parsing into device, unit and register identifiers
//! - Register accumulation with multi-register freshness checks
//! - Typed decoding driven by per-device-type datapoint metadata
//! - Metadata caching with retry backoff, quarantine and blob-store persistence

pub mod accumulator;
pub mod datapoint;
pub mod decode;
pub mod device;
pub mod dispatch;
pub mod metadata;
pub mod payload;
pub mod store;
pub mod topic;

pub use accumulator::{
    Assembly, DecodedValue, IngestError, IngestReport, RegisterAccumulator, RegisterSample,
    DEFAULT_FRESHNESS_WINDOW,
};
pub use datapoint::{
    DatapointCatalog, DatapointDescriptor, DescriptorError, MetadataDocument, ValueType, WordOrder,
};
pub use decode::{decode, DecodeError, Value};
pub use device::{Device, DeviceKey, DeviceTypeKey, MetadataSummary};
pub use dispatch::{Dispatcher, TelemetryEvent};
pub use metadata::{
    FetchError, MetadataCacheEntry, MetadataEngine, MetadataEvent, MetadataSource, MetadataStatus,
    MetadataStatusDetails, RETRY_SCHEDULE,
};
pub use payload::{parse_payload, PayloadError, RegisterPayload};
pub use store::{BlobStore, FileBlobStore, MemoryBlobStore, StoreError};
pub use topic::{ParsedTopic, TopicError, SUBSCRIPTION_FILTER};
