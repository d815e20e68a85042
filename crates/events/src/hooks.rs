//! Observability callback points.
//!
//! Adapters, the retry wrapper and the DLQ call these unconditionally. A hook
//! that errors or panics is logged and skipped; it never aborts the publish
//! or consume path.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::dlq::DlqEntry;
use crate::error::EventBusError;
use crate::handler::HandlerError;
use crate::Event;

/// Sink for bus lifecycle callbacks (metrics, tracing, audit ...).
///
/// Every method has a no-op default so implementations pick what they need.
pub trait EventBusHooks: Send + Sync {
    fn on_publish(&self, _event: &Event) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_consume(&self, _event: &Event, _group: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_handler_error(
        &self,
        _event: &Event,
        _error: &HandlerError,
        _attempt: u32,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_retry(&self, _event: &Event, _retry: u32, _delay: Duration) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_dead_letter(&self, _entry: &DlqEntry) -> anyhow::Result<()> {
        Ok(())
    }

    /// A message could not be turned into an event (decode failure ...).
    fn on_consume_error(&self, _error: &EventBusError) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Ordered collection of hooks invoked together.
#[derive(Clone, Default)]
pub struct HookSet {
    hooks: Vec<Arc<dyn EventBusHooks>>,
}

impl core::fmt::Debug for HookSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HookSet")
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

impl HookSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, hook: Arc<dyn EventBusHooks>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn push(&mut self, hook: Arc<dyn EventBusHooks>) {
        self.hooks.push(hook);
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn publish(&self, event: &Event) {
        self.invoke("on_publish", |h| h.on_publish(event));
    }

    pub fn consume(&self, event: &Event, group: &str) {
        self.invoke("on_consume", |h| h.on_consume(event, group));
    }

    pub fn handler_error(&self, event: &Event, error: &HandlerError, attempt: u32) {
        self.invoke("on_handler_error", |h| {
            h.on_handler_error(event, error, attempt)
        });
    }

    pub fn retry(&self, event: &Event, retry: u32, delay: Duration) {
        self.invoke("on_retry", |h| h.on_retry(event, retry, delay));
    }

    pub fn dead_letter(&self, entry: &DlqEntry) {
        self.invoke("on_dead_letter", |h| h.on_dead_letter(entry));
    }

    pub fn consume_error(&self, error: &EventBusError) {
        self.invoke("on_consume_error", |h| h.on_consume_error(error));
    }

    fn invoke(&self, point: &'static str, call: impl Fn(&dyn EventBusHooks) -> anyhow::Result<()>) {
        for hook in &self.hooks {
            match catch_unwind(AssertUnwindSafe(|| call(hook.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(hook = point, error = %err, "observability hook failed"),
                Err(_) => warn!(hook = point, "observability hook panicked"),
            }
        }
    }
}
