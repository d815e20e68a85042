use std::time::Duration;

use ispforge_events::{DlqEntry, Event, EventBusError, EventBusHooks, HandlerError};

/// Logs every bus callback as a structured `tracing` event.
///
/// Publishes and consumes go to `debug`, failures to `warn`, dead letters and
/// consume errors to `error`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingHooks;

impl TracingHooks {
    pub fn new() -> Self {
        Self
    }
}

impl EventBusHooks for TracingHooks {
    fn on_publish(&self, event: &Event) -> anyhow::Result<()> {
        ::tracing::debug!(
            topic = event.topic(),
            event_id = %event.id(),
            key = event.key(),
            tenant_id = event.tenant_id(),
            "event published"
        );
        Ok(())
    }

    fn on_consume(&self, event: &Event, group: &str) -> anyhow::Result<()> {
        ::tracing::debug!(
            topic = event.topic(),
            group,
            event_id = %event.id(),
            correlation_id = event.metadata().correlation_id(),
            "event consumed"
        );
        Ok(())
    }

    fn on_handler_error(&self, event: &Event, error: &HandlerError, attempt: u32) -> anyhow::Result<()> {
        ::tracing::warn!(
            topic = event.topic(),
            event_id = %event.id(),
            attempt,
            error_type = error.kind(),
            error = error.message(),
            retryable = error.is_retryable(),
            "event handler failed"
        );
        Ok(())
    }

    fn on_retry(&self, event: &Event, retry: u32, delay: Duration) -> anyhow::Result<()> {
        ::tracing::info!(
            topic = event.topic(),
            event_id = %event.id(),
            retry,
            delay_ms = delay.as_millis() as u64,
            "retrying event"
        );
        Ok(())
    }

    fn on_dead_letter(&self, entry: &DlqEntry) -> anyhow::Result<()> {
        ::tracing::error!(
            original_topic = %entry.original_topic,
            dlq_topic = %entry.dlq_topic,
            event_id = %entry.original_event.id(),
            retry_count = entry.retry_count,
            error_type = %entry.error_type,
            error = %entry.error,
            "event dead-lettered"
        );
        Ok(())
    }

    fn on_consume_error(&self, error: &EventBusError) -> anyhow::Result<()> {
        ::tracing::error!(error = %error, "message could not be consumed");
        Ok(())
    }
}
