//! Infrastructure event bus implementations.
//!
//! The core event bus abstraction lives in `ispforge-events` as pure mechanics.
//! This module provides transport-backed implementations, each behind its
//! cargo feature (`redis`, `kafka`).

#[cfg(feature = "kafka")]
pub mod kafka;
#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "kafka")]
pub use kafka::KafkaEventBus;
#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsError, RedisStreamsEventBus};
