//! Telemetry API wire types.
//!
//! Request types for the subscription call and the envelope of the event
//! batches Lambda pushes to the collector once subscribed. See
//! <https://docs.aws.amazon.com/lambda/latest/dg/telemetry-api-reference.html>.

use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

/// Schema version of the 2022-07-01 Telemetry API.
pub const SCHEMA_VERSION_2022_07_01: &str = "2022-07-01";

/// Schema version used for new subscriptions.
pub const SCHEMA_VERSION_LATEST: &str = SCHEMA_VERSION_2022_07_01;

const MAX_ITEMS_BOUNDS: RangeInclusive<u32> = 1_000..=10_000;
const MAX_BYTES_BOUNDS: RangeInclusive<u32> = 262_144..=1_048_576;
const TIMEOUT_MS_BOUNDS: RangeInclusive<u32> = 25..=30_000;

/// Categories of telemetry the extension can subscribe to.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryType {
    /// Platform events (init, start, runtimeDone, report, ...).
    Platform,
    /// Function logs from stdout/stderr.
    Function,
    /// Extension logs.
    Extension,
}

impl TelemetryType {
    /// The type set subscribed to when nothing else is configured.
    pub fn defaults() -> Vec<TelemetryType> {
        vec![TelemetryType::Platform]
    }
}

/// Controls how Lambda batches events before pushing them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferingConfig {
    /// Maximum number of events per batch.
    pub max_items: u32,
    /// Maximum batch size in bytes.
    pub max_bytes: u32,
    /// Maximum time to buffer a batch, in milliseconds.
    pub timeout_ms: u32,
}

impl Default for BufferingConfig {
    fn default() -> Self {
        Self {
            max_items: 1000,
            max_bytes: 256 * 1024,
            timeout_ms: 100,
        }
    }
}

impl BufferingConfig {
    /// Checks the thresholds against the bounds the Telemetry API accepts.
    ///
    /// Returns a description of the first field that is out of range.
    pub fn validate(&self) -> Result<(), String> {
        check_bound("maxItems", self.max_items, &MAX_ITEMS_BOUNDS)?;
        check_bound("maxBytes", self.max_bytes, &MAX_BYTES_BOUNDS)?;
        check_bound("timeoutMs", self.timeout_ms, &TIMEOUT_MS_BOUNDS)
    }
}

fn check_bound(field: &str, value: u32, bounds: &RangeInclusive<u32>) -> Result<(), String> {
    if bounds.contains(&value) {
        Ok(())
    } else {
        Err(format!(
            "{field} must be between {} and {}, got {value}",
            bounds.start(),
            bounds.end()
        ))
    }
}

/// Transport used to push events to the destination.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DestinationProtocol {
    /// Plain HTTP.
    #[default]
    #[serde(rename = "HTTP")]
    Http,
}

/// HTTP method Lambda uses against the destination.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HttpMethod {
    /// POST.
    #[default]
    #[serde(rename = "POST")]
    Post,
}

/// Payload encoding of pushed batches.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Encoding {
    /// JSON array of events.
    #[default]
    #[serde(rename = "JSON")]
    Json,
}

/// Where Lambda pushes batched telemetry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    /// Transport protocol.
    pub protocol: DestinationProtocol,
    /// HTTP method.
    pub method: HttpMethod,
    /// Payload encoding.
    pub encoding: Encoding,
    /// Listener address of the collector.
    #[serde(rename = "URI")]
    pub uri: String,
}

impl Destination {
    /// HTTP/POST/JSON destination for the given listener.
    pub fn http(uri: impl Into<String>) -> Self {
        Self {
            protocol: DestinationProtocol::Http,
            method: HttpMethod::Post,
            encoding: Encoding::Json,
            uri: uri.into(),
        }
    }
}

/// Body of `PUT /2022-07-01/telemetry`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    /// Schema version of the request.
    pub schema_version: String,
    /// Telemetry categories to deliver.
    pub types: Vec<TelemetryType>,
    /// Batching thresholds.
    pub buffering: BufferingConfig,
    /// Push target.
    pub destination: Destination,
}

impl SubscriptionRequest {
    /// Creates a request for the given types with default buffering.
    pub fn new(types: Vec<TelemetryType>, listener_uri: impl Into<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION_LATEST.to_string(),
            types,
            buffering: BufferingConfig::default(),
            destination: Destination::http(listener_uri),
        }
    }

    /// Creates a request for platform events only.
    pub fn platform_events(listener_uri: impl Into<String>) -> Self {
        Self::new(TelemetryType::defaults(), listener_uri)
    }

    /// Sets custom buffering thresholds.
    pub fn with_buffering(mut self, buffering: BufferingConfig) -> Self {
        self.buffering = buffering;
        self
    }
}

/// One event of a batch pushed by the Telemetry API.
///
/// The record is kept as raw JSON; interpreting it belongs to the pipeline
/// consuming the batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Event time in ISO 8601 format.
    pub time: String,
    /// Event type, e.g. `platform.start` or `function`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event record.
    pub record: serde_json::Value,
}

impl TelemetryEvent {
    /// Whether this is a `platform.*` event.
    pub fn is_platform(&self) -> bool {
        self.event_type.starts_with("platform.")
    }
}
