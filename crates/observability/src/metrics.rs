//! Process-local counters fed by bus hooks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use ispforge_events::{DlqEntry, Event, EventBusError, EventBusHooks, HandlerError};

#[derive(Debug, Default)]
pub struct MetricsHooks {
    published: AtomicU64,
    consumed: AtomicU64,
    handler_errors: AtomicU64,
    retries: AtomicU64,
    retry_delay_ms: AtomicU64,
    dead_letters: AtomicU64,
    consume_errors: AtomicU64,
}

/// Point-in-time copy of [`MetricsHooks`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub published: u64,
    pub consumed: u64,
    pub handler_errors: u64,
    pub retries: u64,
    /// Total backoff scheduled across all retries.
    pub retry_delay_ms: u64,
    pub dead_letters: u64,
    pub consume_errors: u64,
}

impl MetricsHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            consumed: self.consumed.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            retry_delay_ms: self.retry_delay_ms.load(Ordering::Relaxed),
            dead_letters: self.dead_letters.load(Ordering::Relaxed),
            consume_errors: self.consume_errors.load(Ordering::Relaxed),
        }
    }
}

impl EventBusHooks for MetricsHooks {
    fn on_publish(&self, _event: &Event) -> anyhow::Result<()> {
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn on_consume(&self, _event: &Event, _group: &str) -> anyhow::Result<()> {
        self.consumed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn on_handler_error(&self, _event: &Event, _error: &HandlerError, _attempt: u32) -> anyhow::Result<()> {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn on_retry(&self, _event: &Event, _retry: u32, delay: Duration) -> anyhow::Result<()> {
        self.retries.fetch_add(1, Ordering::Relaxed);
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.retry_delay_ms.fetch_add(millis, Ordering::Relaxed);
        Ok(())
    }

    fn on_dead_letter(&self, _entry: &DlqEntry) -> anyhow::Result<()> {
        self.dead_letters.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn on_consume_error(&self, _error: &EventBusError) -> anyhow::Result<()> {
        self.consume_errors.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
