//! Event bus error taxonomy.

use std::time::Duration;

use thiserror::Error;

use ispforge_core::DomainError;

use crate::Event;

pub type EventBusResult<T> = Result<T, EventBusError>;

/// Encoding/decoding failure of a codec.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("content type mismatch: expected {expected}, found {found}")]
    ContentTypeMismatch { expected: String, found: String },
}

/// Base error of every bus operation.
#[derive(Debug, Error)]
pub enum EventBusError {
    /// The event could not be written to the transport.
    #[error("failed to publish event {} to '{}': {cause}", .event.id(), .event.topic())]
    Publish { event: Box<Event>, cause: String },

    /// A subscription could not be started or a message could not be consumed.
    #[error("failed to consume from '{topic}': {cause}")]
    Consume { topic: String, cause: String },

    /// A request/reply deadline elapsed.
    #[error("request on '{subject}' timed out after {timeout:?}")]
    Timeout { subject: String, timeout: Duration },

    /// The adapter lacks the requested capability.
    #[error("{adapter} adapter does not support {capability}")]
    NotSupported { adapter: String, capability: String },

    /// Sending to, listing or reprocessing the dead letter queue failed.
    #[error("dead letter queue error: {0}")]
    Dlq(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("event bus is closed")]
    Closed,

    #[error(transparent)]
    Validation(#[from] DomainError),
}

impl EventBusError {
    pub fn publish(event: &Event, cause: impl ToString) -> Self {
        Self::Publish {
            event: Box::new(event.clone()),
            cause: cause.to_string(),
        }
    }

    pub fn consume(topic: impl Into<String>, cause: impl ToString) -> Self {
        Self::Consume {
            topic: topic.into(),
            cause: cause.to_string(),
        }
    }

    pub fn not_supported(adapter: impl Into<String>, capability: impl Into<String>) -> Self {
        Self::NotSupported {
            adapter: adapter.into(),
            capability: capability.into(),
        }
    }

    pub fn dlq(msg: impl Into<String>) -> Self {
        Self::Dlq(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn publish_error_carries_the_event() {
        let event = Event::from_json("orders.created", json!({"order_id": 1})).unwrap();
        let err = EventBusError::publish(&event, "broker unreachable");

        match &err {
            EventBusError::Publish { event: failed, cause } => {
                assert_eq!(failed.id(), event.id());
                assert_eq!(cause, "broker unreachable");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("orders.created"));
    }

    #[test]
    fn capability_helpers() {
        assert!(EventBusError::not_supported("kafka", "request_reply").is_not_supported());
        assert!(!EventBusError::Closed.is_not_supported());
        assert!(
            EventBusError::Timeout {
                subject: "svc.ping".into(),
                timeout: Duration::from_secs(1),
            }
            .is_timeout()
        );
    }
}
