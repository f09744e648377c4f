//! # Event Envelope
//!
//! CloudEvents-shaped envelope carried by every record the connector routes.
//!
//! ## Envelope Fields
//!
//! - `id`: Unique event identifier; may arrive empty and is filled in by enrichment
//! - `source` / `type`: Producer and event kind, always supplied by the producer
//! - `time`: When the event was generated
//! - `correlationid`: Shared by every envelope causally derived from one origin
//! - `createdfrom`: Id of the envelope this one was manufactured from
//! - `route`: Traversal trail, see [`RouteLedger`]
//! - `routingslip`: Stack of destination sets still to visit
//! - `istestmessage` / `filteroutbeforetopic`: Test traffic diversion
//! - `expirydate`: Envelope must not be delivered after this instant
//! - `iserrormessage` / `errormessage`: Set on error wrappers only
//! - `data`: Opaque payload (generic type parameter)
//!
//! Any other top-level attribute is an extension and survives a decode/encode
//! cycle untouched.
//!
//! An explicit `null` on a defaulted attribute decodes the same as an absent
//! one. `"data": null` is kept as a present null payload, distinct from no
//! `data` at all.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::route::RouteLedger;

/// CloudEvents spec version stamped on envelopes that do not carry one
pub const SPEC_VERSION: &str = "1.0";

/// Attribute names owned by the envelope; they can never be extensions
const RESERVED_ATTRIBUTES: &[&str] = &[
    "id",
    "source",
    "type",
    "specversion",
    "time",
    "subject",
    "datacontenttype",
    "dataschema",
    "correlationid",
    "createdfrom",
    "route",
    "routingslip",
    "istestmessage",
    "filteroutbeforetopic",
    "expirydate",
    "iserrormessage",
    "errormessage",
    "data",
];

/// Routed event envelope
///
/// # Type Parameter
///
/// * `T` - The payload type. The routing pipeline never looks inside it and
///   works with `serde_json::Value`.
///
/// # Examples
///
/// ```rust
/// use event_bus::EventEnvelope;
/// use serde_json::json;
///
/// let envelope = EventEnvelope::new("orders-service", "order.created")
///     .with_id("evt-1")
///     .with_data(json!({"order_id": 42}))
///     .with_correlation_id("checkout-7");
///
/// let bytes = envelope.encode().unwrap();
/// let decoded = EventEnvelope::decode(&bytes).unwrap();
/// assert_eq!(envelope, decoded);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct EventEnvelope<T = Value> {
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,

    pub source: String,

    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(
        default = "default_spec_version",
        deserialize_with = "null_as_spec_version"
    )]
    pub specversion: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataschema: Option<String>,

    #[serde(
        rename = "correlationid",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,

    #[serde(rename = "createdfrom", default, skip_serializing_if = "Option::is_none")]
    pub created_from: Option<String>,

    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "RouteLedger::is_empty"
    )]
    pub route: RouteLedger,

    /// Destination sets still to visit; the last entry is the next hop
    #[serde(
        rename = "routingslip",
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub routing_slip: Vec<Vec<String>>,

    #[serde(
        rename = "istestmessage",
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "is_false"
    )]
    pub is_test_message: bool,

    #[serde(
        rename = "filteroutbeforetopic",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub filter_out_before_topic: Option<String>,

    #[serde(rename = "expirydate", default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,

    #[serde(
        rename = "iserrormessage",
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "is_false"
    )]
    pub is_error_message: bool,

    #[serde(rename = "errormessage", default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// `Some(Value::Null)` encodes as `"data": null` and decodes back unchanged
    #[serde(
        default,
        deserialize_with = "present_as_some",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<T>,

    /// Unknown attributes, kept as-is
    #[serde(flatten)]
    pub extensions: BTreeMap<String, Value>,
}

fn default_spec_version() -> String {
    SPEC_VERSION.to_string()
}

fn null_as_default<'de, D, V>(deserializer: D) -> Result<V, D::Error>
where
    D: Deserializer<'de>,
    V: Default + Deserialize<'de>,
{
    Option::<V>::deserialize(deserializer).map(Option::unwrap_or_default)
}

fn null_as_spec_version<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(|v| v.unwrap_or_else(default_spec_version))
}

// Only called when the key is present, so a literal null reaches `T`.
fn present_as_some<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl<T> EventEnvelope<T> {
    /// Create an envelope without id, time or payload
    ///
    /// Id and time are filled in when the envelope passes through enrichment.
    pub fn new(source: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            source: source.into(),
            event_type: event_type.into(),
            specversion: default_spec_version(),
            time: None,
            subject: None,
            datacontenttype: None,
            dataschema: None,
            correlation_id: None,
            created_from: None,
            route: RouteLedger::new(),
            routing_slip: Vec::new(),
            is_test_message: false,
            filter_out_before_topic: None,
            expiry: None,
            is_error_message: false,
            error_message: None,
            data: None,
            extensions: BTreeMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_route(mut self, route: RouteLedger) -> Self {
        self.route = route;
        self
    }

    /// Push a destination set on top of the routing slip
    pub fn with_routing_slip_entry(mut self, destinations: Vec<String>) -> Self {
        self.routing_slip.push(destinations);
        self
    }

    /// Mark as test traffic that must be diverted instead of reaching `topic`
    pub fn as_test_message(mut self, filter_out_before_topic: impl Into<String>) -> Self {
        self.is_test_message = true;
        self.filter_out_before_topic = Some(filter_out_before_topic.into());
        self
    }

    pub fn with_expiry(mut self, expiry: DateTime<Utc>) -> Self {
        self.expiry = Some(expiry);
        self
    }

    pub fn with_data(mut self, data: T) -> Self {
        self.data = Some(data);
        self
    }

    /// Add an extension attribute
    ///
    /// Reserved attribute names are refused and `false` is returned.
    pub fn insert_extension(&mut self, key: impl Into<String>, value: Value) -> bool {
        let key = key.into();
        if RESERVED_ATTRIBUTES.contains(&key.as_str()) {
            return false;
        }
        self.extensions.insert(key, value);
        true
    }

    pub fn extension(&self, key: &str) -> Option<&Value> {
        self.extensions.get(key)
    }

    /// Replace the payload, keeping every metadata attribute
    pub fn map_data<U>(self, f: impl FnOnce(Option<T>) -> Option<U>) -> EventEnvelope<U> {
        EventEnvelope {
            id: self.id,
            source: self.source,
            event_type: self.event_type,
            specversion: self.specversion,
            time: self.time,
            subject: self.subject,
            datacontenttype: self.datacontenttype,
            dataschema: self.dataschema,
            correlation_id: self.correlation_id,
            created_from: self.created_from,
            route: self.route,
            routing_slip: self.routing_slip,
            is_test_message: self.is_test_message,
            filter_out_before_topic: self.filter_out_before_topic,
            expiry: self.expiry,
            is_error_message: self.is_error_message,
            error_message: self.error_message,
            data: f(self.data),
            extensions: self.extensions,
        }
    }
}

impl<T: Serialize> EventEnvelope<T> {
    /// Encode to the JSON wire format
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl<T: DeserializeOwned> EventEnvelope<T> {
    /// Decode from the JSON wire format
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Validate the envelope attributes of a raw JSON record
///
/// # Validation Rules
///
/// - The record must be a JSON object
/// - `source`: must be a non-empty string
/// - `type`: must be a non-empty string
/// - `id`, `specversion`, `subject`, `correlationid`: strings when present
/// - `istestmessage`, `iserrormessage`: booleans when present
/// - `route`, `routingslip`: arrays when present
///
/// # Errors
///
/// Returns a descriptive error string if validation fails
pub fn validate_envelope_fields(envelope: &Value) -> Result<(), String> {
    let object = envelope
        .as_object()
        .ok_or("Envelope must be a JSON object")?;

    let source = object
        .get("source")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid source")?;

    if source.trim().is_empty() {
        return Err("source cannot be empty".to_string());
    }

    let event_type = object
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid type")?;

    if event_type.trim().is_empty() {
        return Err("type cannot be empty".to_string());
    }

    for key in ["id", "specversion", "subject", "correlationid"] {
        if let Some(value) = object.get(key) {
            if !value.is_string() && !value.is_null() {
                return Err(format!("{} must be a string", key));
            }
        }
    }

    for key in ["istestmessage", "iserrormessage"] {
        if let Some(value) = object.get(key) {
            if !value.is_boolean() && !value.is_null() {
                return Err(format!("{} must be a boolean", key));
            }
        }
    }

    for key in ["route", "routingslip"] {
        if let Some(value) = object.get(key) {
            if !value.is_array() && !value.is_null() {
                return Err(format!("{} must be an array", key));
            }
        }
    }

    Ok(())
}
