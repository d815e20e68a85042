use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use ispforge_core::{DomainError, DomainResult, EventId, require_name};

use crate::headers;

/// Business message body: ordered mapping of string keys to structured values.
pub type Payload = serde_json::Map<String, JsonValue>;

/// Transport-agnostic metadata carried next to the payload.
pub type Headers = BTreeMap<String, String>;

pub const DEFAULT_CONTENT_TYPE: &str = "application/json";
pub const DEFAULT_ENCODING: &str = "utf-8";

/// Identity, timing and causality information of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    id: EventId,
    timestamp: DateTime<Utc>,
    content_type: String,
    encoding: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    producer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    causation_id: Option<String>,
}

impl EventMetadata {
    /// Fresh metadata: new id, current time, JSON content type.
    pub fn new() -> Self {
        Self {
            id: EventId::new(),
            timestamp: Utc::now(),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            encoding: DEFAULT_ENCODING.to_string(),
            producer: None,
            correlation_id: None,
            causation_id: None,
        }
    }

    pub fn with_id(mut self, id: EventId) -> Self {
        self.id = id;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = encoding.into();
        self
    }

    pub fn with_producer(mut self, producer: impl Into<String>) -> Self {
        self.producer = Some(producer.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_causation_id(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn encoding(&self) -> &str {
        &self.encoding
    }

    pub fn producer(&self) -> Option<&str> {
        self.producer.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn causation_id(&self) -> Option<&str> {
        self.causation_id.as_deref()
    }
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable message envelope exchanged over the bus.
///
/// Notes:
/// - `metadata.id` is generated once, at construction. Every `with_*`
///   derivation returns a new value sharing that id; only `with_metadata`
///   can replace it.
/// - `tenant_id`, when set, is mirrored into the `x-tenant-id` header.
/// - The serialized form is the wire shape used by [`crate::JsonCodec`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    topic: String,
    payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    #[serde(default, skip_serializing_if = "Headers::is_empty")]
    headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tenant_id: Option<String>,
    metadata: EventMetadata,
}

impl Event {
    pub fn new(topic: impl Into<String>, payload: Payload) -> DomainResult<Self> {
        let topic = topic.into();
        require_name("topic", &topic)?;
        Ok(Self {
            topic,
            payload,
            key: None,
            headers: Headers::new(),
            tenant_id: None,
            metadata: EventMetadata::new(),
        })
    }

    /// Build an event from a JSON value, which must be an object.
    pub fn from_json(topic: impl Into<String>, payload: JsonValue) -> DomainResult<Self> {
        match payload {
            JsonValue::Object(map) => Self::new(topic, map),
            other => Err(DomainError::validation(format!(
                "payload must be a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    pub fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    pub fn id(&self) -> EventId {
        self.metadata.id
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    pub fn with_key(&self, key: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.key = Some(key.into());
        next
    }

    pub fn with_tenant_id(&self, tenant_id: impl Into<String>) -> Self {
        let tenant_id = tenant_id.into();
        let mut next = self.clone();
        next.headers
            .insert(headers::TENANT_ID.to_string(), tenant_id.clone());
        next.tenant_id = Some(tenant_id);
        next
    }

    /// Merge `extra` into the headers; later values win.
    pub fn with_headers<K, V>(&self, extra: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut next = self.clone();
        next.headers
            .extend(extra.into_iter().map(|(k, v)| (k.into(), v.into())));
        next
    }

    /// Copy without the named headers.
    pub fn without_headers(&self, names: &[&str]) -> Self {
        let mut next = self.clone();
        next.headers.retain(|k, _| !names.contains(&k.as_str()));
        next
    }

    /// Replace the metadata wholesale (including the id).
    pub fn with_metadata(&self, metadata: EventMetadata) -> Self {
        let mut next = self.clone();
        next.metadata = metadata;
        next
    }

    pub fn with_correlation_id(&self, correlation_id: impl Into<String>) -> Self {
        self.with_metadata(self.metadata.clone().with_correlation_id(correlation_id))
    }

    pub fn with_causation_id(&self, causation_id: impl Into<String>) -> Self {
        self.with_metadata(self.metadata.clone().with_causation_id(causation_id))
    }

    pub fn with_producer(&self, producer: impl Into<String>) -> Self {
        self.with_metadata(self.metadata.clone().with_producer(producer))
    }

    /// Same event addressed to another topic (id preserved).
    pub fn with_topic(&self, topic: impl Into<String>) -> DomainResult<Self> {
        let topic = topic.into();
        require_name("topic", &topic)?;
        let mut next = self.clone();
        next.topic = topic;
        Ok(next)
    }

    /// A new event carrying the same content: fresh id and timestamp,
    /// `causation_id` pointing at this event.
    pub fn renewed(&self) -> Self {
        let metadata = EventMetadata {
            id: EventId::new(),
            timestamp: Utc::now(),
            causation_id: Some(self.metadata.id.to_string()),
            ..self.metadata.clone()
        };
        self.with_metadata(metadata)
    }

    /// Topic a reply to this event goes to.
    pub fn reply_topic(&self) -> String {
        self.header(headers::REPLY_TO)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}.reply", self.topic))
    }

    /// Build the reply to a request event.
    pub fn reply(&self, payload: Payload) -> DomainResult<Self> {
        let mut metadata =
            EventMetadata::new().with_causation_id(self.metadata.id.to_string());
        if let Some(correlation_id) = self.metadata.correlation_id() {
            metadata = metadata.with_correlation_id(correlation_id);
        }
        let mut reply = Self::new(self.reply_topic(), payload)?.with_metadata(metadata);
        if let Some(tenant_id) = self.tenant_id() {
            reply = reply.with_tenant_id(tenant_id);
        }
        Ok(reply)
    }

    /// Custom headers plus the standard identity headers, for transports that
    /// expose message headers natively.
    pub fn transport_headers(&self) -> Headers {
        let mut out = self.headers.clone();
        let m = &self.metadata;
        out.insert(headers::EVENT_ID.to_string(), m.id.to_string());
        out.insert(
            headers::TIMESTAMP.to_string(),
            m.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
        );
        out.insert(headers::CONTENT_TYPE.to_string(), m.content_type.clone());
        out.insert(headers::ENCODING.to_string(), m.encoding.clone());
        if let Some(producer) = &m.producer {
            out.insert(headers::PRODUCER.to_string(), producer.clone());
        }
        if let Some(correlation_id) = &m.correlation_id {
            out.insert(headers::CORRELATION_ID.to_string(), correlation_id.clone());
        }
        if let Some(causation_id) = &m.causation_id {
            out.insert(headers::CAUSATION_ID.to_string(), causation_id.clone());
        }
        if let Some(tenant_id) = &self.tenant_id {
            out.insert(headers::TENANT_ID.to_string(), tenant_id.clone());
        }
        out
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn order_created() -> Event {
        Event::from_json("orders.created", json!({"order_id": 1})).unwrap()
    }

    #[test]
    fn empty_topic_is_rejected() {
        assert!(Event::new("", Payload::new()).is_err());
        assert!(Event::from_json("orders.created", json!([1, 2])).is_err());
    }

    #[test]
    fn derivations_keep_the_id() {
        let event = order_created();
        let derived = event
            .with_headers([("x-source", "billing")])
            .with_key("customer-7")
            .with_correlation_id("corr-1");

        assert_eq!(derived.id(), event.id());
        assert_eq!(derived.header("x-source"), Some("billing"));
        assert_eq!(derived.key(), Some("customer-7"));
        assert_eq!(derived.metadata().correlation_id(), Some("corr-1"));
        // The original value is untouched.
        assert!(event.headers().is_empty());
        assert_eq!(event.key(), None);
    }

    #[test]
    fn explicit_metadata_overrides_the_id() {
        let event = order_created();
        let id = EventId::new();
        let derived = event.with_metadata(EventMetadata::new().with_id(id));
        assert_eq!(derived.id(), id);
        assert_ne!(derived.id(), event.id());
    }

    #[test]
    fn tenant_is_mirrored_into_headers() {
        let event = order_created().with_tenant_id("tenant-a");
        assert_eq!(event.tenant_id(), Some("tenant-a"));
        assert_eq!(event.header(headers::TENANT_ID), Some("tenant-a"));
    }

    #[test]
    fn renewed_event_points_back_at_its_cause() {
        let event = order_created();
        let renewed = event.renewed();
        assert_ne!(renewed.id(), event.id());
        assert_eq!(
            renewed.metadata().causation_id(),
            Some(event.id().to_string().as_str())
        );
        assert_eq!(renewed.payload(), event.payload());
    }

    #[test]
    fn reply_follows_reply_to_and_correlation() {
        let request = Event::from_json("svc.ping", json!({}))
            .unwrap()
            .with_correlation_id("c-42")
            .with_headers([(headers::REPLY_TO, "svc.ping.reply")]);

        let reply = request.reply(Payload::new()).unwrap();
        assert_eq!(reply.topic(), "svc.ping.reply");
        assert_eq!(reply.metadata().correlation_id(), Some("c-42"));
        assert_eq!(
            reply.metadata().causation_id(),
            Some(request.id().to_string().as_str())
        );
    }

    #[test]
    fn transport_headers_include_standard_set() {
        let event = order_created()
            .with_producer("billing")
            .with_tenant_id("tenant-a");
        let h = event.transport_headers();
        assert_eq!(h.get(headers::EVENT_ID), Some(&event.id().to_string()));
        assert_eq!(
            h.get(headers::CONTENT_TYPE).map(String::as_str),
            Some(DEFAULT_CONTENT_TYPE)
        );
        assert_eq!(h.get(headers::PRODUCER).map(String::as_str), Some("billing"));
        assert_eq!(h.get(headers::TENANT_ID).map(String::as_str), Some("tenant-a"));
        assert!(h.contains_key(headers::TIMESTAMP));
    }
}
