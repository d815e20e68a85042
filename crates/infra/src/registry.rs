//! Default adapter registry.
//!
//! `memory` is always available. `redis` and `kafka` are registered either as
//! real factories or, when their cargo feature is off, as factories that
//! report [`EventBusError::NotSupported`], so callers selecting an adapter by
//! configuration get an error value instead of a build failure.

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use ispforge_events::{AdapterFactory, AdapterRegistry, BusConfig, EventBus, EventBusError, EventBusResult, HookSet};

pub fn default_registry() -> AdapterRegistry {
    let mut registry = AdapterRegistry::with_memory();
    registry.register("redis", redis_factory());
    registry.register("kafka", kafka_factory());
    registry
}

#[cfg(any(feature = "redis", feature = "kafka"))]
fn wrong_config(expected: &str, config: &BusConfig) -> EventBusError {
    EventBusError::config(format!(
        "{expected} adapter cannot be built from {} configuration",
        config.adapter_name()
    ))
}

#[cfg(not(all(feature = "redis", feature = "kafka")))]
fn unavailable(adapter: &'static str, feature: &'static str) -> AdapterFactory {
    Arc::new(move |_config: BusConfig, _hooks: HookSet| -> BoxFuture<'static, EventBusResult<Arc<dyn EventBus>>> {
        async move {
            Err(EventBusError::not_supported(
                adapter,
                format!("transport (build with the `{feature}` feature)"),
            ))
        }
        .boxed()
    })
}

#[cfg(feature = "redis")]
fn redis_factory() -> AdapterFactory {
    use crate::event_bus::RedisStreamsEventBus;

    Arc::new(|config: BusConfig, hooks: HookSet| -> BoxFuture<'static, EventBusResult<Arc<dyn EventBus>>> {
        async move {
            match config {
                BusConfig::Redis(redis) => {
                    let bus = RedisStreamsEventBus::connect(redis, hooks).await?;
                    Ok(Arc::new(bus) as Arc<dyn EventBus>)
                }
                other => Err(wrong_config("redis", &other)),
            }
        }
        .boxed()
    })
}

#[cfg(not(feature = "redis"))]
fn redis_factory() -> AdapterFactory {
    unavailable("redis", "redis")
}

#[cfg(feature = "kafka")]
fn kafka_factory() -> AdapterFactory {
    use crate::event_bus::KafkaEventBus;

    Arc::new(|config: BusConfig, hooks: HookSet| -> BoxFuture<'static, EventBusResult<Arc<dyn EventBus>>> {
        async move {
            match config {
                BusConfig::Kafka(kafka) => {
                    let bus = KafkaEventBus::new(kafka, hooks)?;
                    Ok(Arc::new(bus) as Arc<dyn EventBus>)
                }
                other => Err(wrong_config("kafka", &other)),
            }
        }
        .boxed()
    })
}

#[cfg(not(feature = "kafka"))]
fn kafka_factory() -> AdapterFactory {
    unavailable("kafka", "kafka")
}
