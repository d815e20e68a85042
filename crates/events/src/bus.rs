//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus is a uniform publish/subscribe contract implemented by every
//! transport adapter (memory, Redis Streams, Kafka):
//!
//! - **At-least-once delivery**: events may be delivered more than once;
//!   handlers must be idempotent.
//! - **Ordering only within a partition** (stream, single-topic queue).
//! - **Capabilities, not types**: callers ask an adapter what it supports via
//!   [`AdapterMetadata`] instead of inspecting its concrete type.
//!
//! Subscriptions run as background loops owned by the adapter; `close()`
//! stops them all.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ispforge_core::{DomainResult, require_name};

use crate::error::{EventBusError, EventBusResult};
use crate::event::{Event, Headers, Payload};
use crate::handler::SharedHandler;

/// Capability tags an adapter can advertise.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Publish,
    Subscribe,
    ConsumerGroups,
    AtLeastOnceDelivery,
    RequestReply,
    Partitioning,
    /// Past events can be read back (`read_history`).
    PersistentHistory,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Publish => "publish",
            Capability::Subscribe => "subscribe",
            Capability::ConsumerGroups => "consumer_groups",
            Capability::AtLeastOnceDelivery => "at_least_once_delivery",
            Capability::RequestReply => "request_reply",
            Capability::Partitioning => "partitioning",
            Capability::PersistentHistory => "persistent_history",
        }
    }
}

impl core::fmt::Display for Capability {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Self-description of an adapter, used for capability queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterMetadata {
    name: String,
    version: String,
    description: String,
    supported_features: BTreeSet<Capability>,
}

impl AdapterMetadata {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
        features: impl IntoIterator<Item = Capability>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: description.into(),
            supported_features: features.into_iter().collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn supported_features(&self) -> &BTreeSet<Capability> {
        &self.supported_features
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.supported_features.contains(&capability)
    }
}

/// Per-call publish options: partition key override and extra headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub key: Option<String>,
    pub headers: Headers,
}

impl PublishOptions {
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// The event as it will be written: extra headers merged, key overridden.
    pub fn apply(&self, event: &Event) -> Event {
        let mut out = if self.headers.is_empty() {
            event.clone()
        } else {
            event.with_headers(self.headers.clone())
        };
        if let Some(key) = &self.key {
            out = out.with_key(key.clone());
        }
        out
    }
}

/// Where a brand-new consumer group starts reading.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetReset {
    Earliest,
    #[default]
    Latest,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

pub const DEFAULT_GROUP: &str = "default";

/// Subscription options; immutable for the lifetime of the subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub group: String,
    pub concurrency: usize,
    pub auto_offset_reset: OffsetReset,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            group: DEFAULT_GROUP.to_string(),
            concurrency: 1,
            auto_offset_reset: OffsetReset::Latest,
        }
    }
}

impl SubscribeOptions {
    pub fn group(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            ..Self::default()
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_offset_reset(mut self, reset: OffsetReset) -> Self {
        self.auto_offset_reset = reset;
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        require_name("consumer group", &self.group)?;
        if self.concurrency == 0 {
            return Err(ispforge_core::DomainError::validation(
                "concurrency must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Transport-agnostic event bus.
///
/// ## Thread Safety
///
/// Implementations are `Send + Sync`; `publish` may be called concurrently
/// from many tasks without external locking.
///
/// ## Optional operations
///
/// `request` and `read_history` default to [`EventBusError::NotSupported`];
/// adapters override them when they advertise [`Capability::RequestReply`] /
/// [`Capability::PersistentHistory`].
#[async_trait]
pub trait EventBus: Send + Sync {
    fn metadata(&self) -> &AdapterMetadata;

    fn supports(&self, capability: Capability) -> bool {
        self.metadata().supports(capability)
    }

    /// Merge options into the event, encode it and write it to the transport.
    async fn publish_with(&self, event: &Event, options: PublishOptions) -> EventBusResult<()>;

    async fn publish(&self, event: &Event) -> EventBusResult<()> {
        self.publish_with(event, PublishOptions::default()).await
    }

    /// Start background consumption of `topic`.
    ///
    /// Returns once the consumer loops are running, not once anything has
    /// been processed.
    async fn subscribe(
        &self,
        topic: &str,
        handler: SharedHandler,
        options: SubscribeOptions,
    ) -> EventBusResult<()>;

    /// Synchronous request/reply; returns the reply payload.
    async fn request(
        &self,
        _subject: &str,
        _payload: Payload,
        _timeout: Duration,
    ) -> EventBusResult<Payload> {
        Err(EventBusError::not_supported(
            self.metadata().name(),
            Capability::RequestReply.as_str(),
        ))
    }

    /// Read stored events of a topic, oldest first.
    async fn read_history(
        &self,
        _topic: &str,
        _limit: Option<usize>,
        _since: Option<DateTime<Utc>>,
    ) -> EventBusResult<Vec<Event>> {
        Err(EventBusError::not_supported(
            self.metadata().name(),
            Capability::PersistentHistory.as_str(),
        ))
    }

    /// Stop every consumer loop and release transport connections.
    ///
    /// Idempotent: a second call is a no-op.
    async fn close(&self) -> EventBusResult<()>;
}

#[async_trait]
impl<B> EventBus for Arc<B>
where
    B: EventBus + ?Sized,
{
    fn metadata(&self) -> &AdapterMetadata {
        (**self).metadata()
    }

    async fn publish_with(&self, event: &Event, options: PublishOptions) -> EventBusResult<()> {
        (**self).publish_with(event, options).await
    }

    async fn publish(&self, event: &Event) -> EventBusResult<()> {
        (**self).publish(event).await
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: SharedHandler,
        options: SubscribeOptions,
    ) -> EventBusResult<()> {
        (**self).subscribe(topic, handler, options).await
    }

    async fn request(
        &self,
        subject: &str,
        payload: Payload,
        timeout: Duration,
    ) -> EventBusResult<Payload> {
        (**self).request(subject, payload, timeout).await
    }

    async fn read_history(
        &self,
        topic: &str,
        limit: Option<usize>,
        since: Option<DateTime<Utc>>,
    ) -> EventBusResult<Vec<Event>> {
        (**self).read_history(topic, limit, since).await
    }

    async fn close(&self) -> EventBusResult<()> {
        (**self).close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn publish_options_merge_headers_and_override_key() {
        let event = Event::from_json("orders.created", json!({}))
            .unwrap()
            .with_key("a")
            .with_headers([("x-one", "1")]);

        let written = PublishOptions::default()
            .with_key("b")
            .with_header("x-two", "2")
            .apply(&event);

        assert_eq!(written.key(), Some("b"));
        assert_eq!(written.header("x-one"), Some("1"));
        assert_eq!(written.header("x-two"), Some("2"));
        assert_eq!(written.id(), event.id());
    }

    #[test]
    fn subscribe_options_validation() {
        assert!(SubscribeOptions::default().validate().is_ok());
        assert!(SubscribeOptions::group(" ").validate().is_err());
        assert!(SubscribeOptions::default().with_concurrency(0).validate().is_err());
    }

    #[test]
    fn metadata_capability_queries() {
        let meta = AdapterMetadata::new(
            "test",
            "0.1.0",
            "test adapter",
            [Capability::Publish, Capability::ConsumerGroups],
        );
        assert!(meta.supports(Capability::ConsumerGroups));
        assert!(!meta.supports(Capability::RequestReply));
        assert_eq!(
            serde_json::to_value(&meta).unwrap()["supported_features"],
            json!(["publish", "consumer_groups"])
        );
    }
}
