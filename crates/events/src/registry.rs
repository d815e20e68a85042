//! Adapter discovery by name.
//!
//! Transports register a factory under their adapter name; applications pick
//! one at runtime from [`BusConfig`] without depending on concrete types.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::info;

use crate::bus::EventBus;
use crate::config::BusConfig;
use crate::error::{EventBusError, EventBusResult};
use crate::hooks::HookSet;
use crate::in_memory_bus::InMemoryEventBus;

pub type AdapterFactory = Arc<
    dyn Fn(BusConfig, HookSet) -> BoxFuture<'static, EventBusResult<Arc<dyn EventBus>>>
        + Send
        + Sync,
>;

#[derive(Clone, Default)]
pub struct AdapterRegistry {
    factories: BTreeMap<String, AdapterFactory>,
}

impl core::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("adapters", &self.names())
            .finish()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the in-process adapter.
    pub fn with_memory() -> Self {
        let mut registry = Self::new();
        registry.register("memory", Arc::new(|config: BusConfig, hooks: HookSet| {
            Box::pin(async move {
                match config {
                    BusConfig::Memory(memory) => {
                        let bus = InMemoryEventBus::with_config(memory)?.with_hooks(hooks);
                        Ok(Arc::new(bus) as Arc<dyn EventBus>)
                    }
                    other => Err(EventBusError::config(format!(
                        "memory adapter cannot be built from {} configuration",
                        other.adapter_name()
                    ))),
                }
            }) as BoxFuture<'static, _>
        }));
        registry
    }

    /// Register (or replace) the factory for `name`.
    pub fn register(&mut self, name: impl Into<String>, factory: AdapterFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Build the adapter named by `config`.
    pub async fn create(
        &self,
        config: BusConfig,
        hooks: HookSet,
    ) -> EventBusResult<Arc<dyn EventBus>> {
        let name = config.adapter_name();
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| EventBusError::not_supported(name, "adapter registration"))?
            .clone();
        let bus = factory(config, hooks).await?;
        info!(adapter = name, version = bus.metadata().version(), "event bus created");
        Ok(bus)
    }
}
