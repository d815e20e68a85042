//! Event <-> bytes codecs.
//!
//! A codec owns the `content-type` header: `encode` stamps it into the wire
//! headers and `decode` checks and removes it, so the headers a producer set
//! are exactly the headers a consumer sees.

use crate::error::CodecError;
use crate::event::DEFAULT_CONTENT_TYPE;
use crate::{Event, headers};

pub trait Codec: Send + Sync + core::fmt::Debug {
    /// MIME type written into the `content-type` header.
    fn content_type(&self) -> &str;

    fn encode(&self, event: &Event) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<Event, CodecError>;
}

/// Default codec: the JSON wire shape of [`Event`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Codec for JsonCodec {
    fn content_type(&self) -> &str {
        DEFAULT_CONTENT_TYPE
    }

    fn encode(&self, event: &Event) -> Result<Vec<u8>, CodecError> {
        let stamped = event.with_headers([(headers::CONTENT_TYPE, self.content_type())]);
        serde_json::to_vec(&stamped).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Event, CodecError> {
        let event: Event =
            serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))?;

        if event.topic().trim().is_empty() {
            return Err(CodecError::Decode("event topic is empty".to_string()));
        }

        if let Some(found) = event.header(headers::CONTENT_TYPE) {
            if found != self.content_type() {
                return Err(CodecError::ContentTypeMismatch {
                    expected: self.content_type().to_string(),
                    found: found.to_string(),
                });
            }
        }

        Ok(event.without_headers(&[headers::CONTENT_TYPE]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn decode_restores_payload_headers_and_metadata() {
        let event = Event::from_json("orders.created", json!({"order_id": 1, "lines": [1, 2]}))
            .unwrap()
            .with_key("customer-7")
            .with_tenant_id("tenant-a")
            .with_headers([("x-source", "billing")])
            .with_correlation_id("corr-1");

        let codec = JsonCodec::new();
        let decoded = codec.decode(&codec.encode(&event).unwrap()).unwrap();

        assert_eq!(decoded, event);
    }

    #[test]
    fn wire_shape_matches_contract() {
        let event = Event::from_json("orders.created", json!({"order_id": 1})).unwrap();
        let bytes = JsonCodec.encode(&event).unwrap();
        let wire: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(wire["topic"], "orders.created");
        assert_eq!(wire["payload"], json!({"order_id": 1}));
        assert_eq!(wire["headers"]["content-type"], "application/json");
        assert_eq!(wire["metadata"]["id"], event.id().to_string());
        assert_eq!(wire["metadata"]["content_type"], "application/json");
        assert!(wire["metadata"]["timestamp"].is_string());
    }

    #[test]
    fn malformed_bytes_fail_with_decode_error() {
        let err = JsonCodec.decode(b"{not json").unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));

        let err = JsonCodec
            .decode(br#"{"topic":"","payload":{},"metadata":{"id":"0190a0a0-0000-7000-8000-000000000000","timestamp":"2024-01-01T00:00:00Z","content_type":"application/json","encoding":"utf-8"}}"#)
            .unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn foreign_content_type_is_rejected() {
        let event = Event::from_json("orders.created", json!({}))
            .unwrap()
            .with_headers([(headers::CONTENT_TYPE, "application/x-protobuf")]);
        let bytes = serde_json::to_vec(&event).unwrap();

        let err = JsonCodec.decode(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::ContentTypeMismatch { .. }));
    }

    proptest! {
        #[test]
        fn round_trip_preserves_payload_and_headers(
            topic in "[a-z]{1,8}(\\.[a-z]{1,8}){0,2}",
            fields in proptest::collection::btree_map("[a-z_]{1,10}", any::<i64>(), 0..6),
            extra in proptest::collection::btree_map("x-[a-z]{1,8}", "[ -~]{0,16}", 0..4),
        ) {
            let payload: crate::Payload = fields
                .into_iter()
                .map(|(k, v)| (k, json!(v)))
                .collect();
            let event = Event::new(topic, payload).unwrap().with_headers(extra);

            let decoded = JsonCodec.decode(&JsonCodec.encode(&event).unwrap()).unwrap();
            prop_assert_eq!(decoded.payload(), event.payload());
            prop_assert_eq!(decoded.headers(), event.headers());
            prop_assert_eq!(decoded.id(), event.id());
        }
    }
}
