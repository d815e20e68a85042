//! Transport-agnostic event bus.
//!
//! Producers publish [`Event`]s and consumers subscribe handlers through the
//! [`EventBus`] trait; adapters (in-memory here, Redis Streams and Kafka in
//! `ispforge-infra`) supply the transport. Delivery is at-least-once: wrap
//! handlers in a [`RetryingHandler`] to bound retries and hand permanent
//! failures to the [`DeadLetterQueue`].

pub mod bus;
pub mod codec;
pub mod config;
pub mod dlq;
pub mod error;
pub mod event;
pub mod handler;
pub mod headers;
pub mod hooks;
pub mod in_memory_bus;
pub mod registry;
pub mod retry;

pub use bus::{
    AdapterMetadata, Capability, DEFAULT_GROUP, EventBus, OffsetReset, PublishOptions,
    SubscribeOptions,
};
pub use codec::{Codec, JsonCodec};
pub use config::{
    Acks, BusConfig, Compression, ConnectionSettings, EnvSecretSource, KafkaConfig,
    MemoryBusConfig, RedisStreamsConfig, Secret, SecretSource, SecurityProtocol,
};
pub use dlq::{DeadLetterQueue, DlqEntry};
pub use error::{CodecError, EventBusError, EventBusResult};
pub use event::{Event, EventMetadata, Headers, Payload};
pub use handler::{
    Delivery, EventHandler, HandlerError, Outcome, SharedHandler, deliver, handler_fn, invoke,
};
pub use hooks::{EventBusHooks, HookSet};
pub use in_memory_bus::InMemoryEventBus;
pub use registry::{AdapterFactory, AdapterRegistry};
pub use retry::{BackoffPolicy, RetryPolicy, RetryingHandler, subscribe_with_retry};
