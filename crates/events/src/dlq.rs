//! Dead letter queue for events whose handlers keep failing.
//!
//! A dead-lettered event is the original event re-addressed to a DLQ topic
//! (default `topic + ".dlq"`) and annotated with `x-*` failure headers. The DLQ
//! publishes through an ordinary [`EventBus`], so it works on every adapter;
//! listing entries requires an adapter with persistent history.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::error::{EventBusError, EventBusResult};
use crate::handler::HandlerError;
use crate::headers::dlq as h;
use crate::hooks::HookSet;
use crate::retry::DEFAULT_DLQ_SUFFIX;
use crate::Event;

/// A permanently failed event as recorded in the DLQ.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DlqEntry {
    pub original_event: Event,
    pub original_topic: String,
    pub error: String,
    pub error_type: String,
    pub retry_count: u32,
    pub first_failure_time: DateTime<Utc>,
    pub last_failure_time: DateTime<Utc>,
    pub dlq_topic: String,
    pub dlq_timestamp: DateTime<Utc>,
}

impl DlqEntry {
    /// Rebuild an entry from an event stored on a DLQ topic.
    pub fn from_dlq_event(event: &Event) -> EventBusResult<Self> {
        let original_topic = required(event, h::ORIGINAL_TOPIC)?.to_string();
        let retry_count = required(event, h::RETRY_COUNT)?
            .parse::<u32>()
            .map_err(|e| EventBusError::dlq(format!("{}: {e}", h::RETRY_COUNT)))?;
        let dlq_timestamp = timestamp(event, h::DLQ_TIMESTAMP)?;
        let last_failure_time = timestamp(event, h::LAST_FAILURE_TIME)?;
        let first_failure_time = match event.header(h::FIRST_FAILURE_TIME) {
            Some(_) => timestamp(event, h::FIRST_FAILURE_TIME)?,
            None => last_failure_time,
        };

        let original_event = event
            .without_headers(h::STRIPPED_ON_REPROCESS)
            .with_topic(original_topic.clone())?;

        Ok(Self {
            original_event,
            original_topic,
            error: event.header(h::ERROR).unwrap_or_default().to_string(),
            error_type: event.header(h::ERROR_TYPE).unwrap_or_default().to_string(),
            retry_count,
            first_failure_time,
            last_failure_time,
            dlq_topic: event.topic().to_string(),
            dlq_timestamp,
        })
    }
}

fn required<'a>(event: &'a Event, name: &str) -> EventBusResult<&'a str> {
    event
        .header(name)
        .ok_or_else(|| EventBusError::dlq(format!("event {} has no {name} header", event.id())))
}

fn timestamp(event: &Event, name: &str) -> EventBusResult<DateTime<Utc>> {
    let raw = required(event, name)?;
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| EventBusError::dlq(format!("{name}={raw}: {e}")))
}

fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Predicate used by [`DeadLetterQueue::reprocess_all`].
pub type EntryFilter<'a> = &'a (dyn Fn(&DlqEntry) -> bool + Send + Sync);

pub struct DeadLetterQueue {
    bus: Arc<dyn EventBus>,
    suffix: String,
    hooks: HookSet,
}

impl core::fmt::Debug for DeadLetterQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeadLetterQueue")
            .field("adapter", &self.bus.metadata().name())
            .field("suffix", &self.suffix)
            .finish()
    }
}

impl DeadLetterQueue {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self {
            bus,
            suffix: DEFAULT_DLQ_SUFFIX.to_string(),
            hooks: HookSet::new(),
        }
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    pub fn with_hooks(mut self, hooks: HookSet) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn dlq_topic_for(&self, topic: &str) -> String {
        format!("{topic}{}", self.suffix)
    }

    /// Publish `event` to its DLQ topic with failure annotations.
    ///
    /// `x-first-failure-time` already present on the event is preserved;
    /// `x-last-failure-time` is always the current time.
    pub async fn send_to_dlq(
        &self,
        event: &Event,
        error: &HandlerError,
        retry_count: u32,
        dlq_topic: Option<&str>,
    ) -> EventBusResult<DlqEntry> {
        let dlq_topic = dlq_topic
            .map(str::to_string)
            .unwrap_or_else(|| self.dlq_topic_for(event.topic()));
        let now = Utc::now();
        let first_failure = event
            .header(h::FIRST_FAILURE_TIME)
            .map(str::to_string)
            .unwrap_or_else(|| rfc3339(now));

        let dead = event
            .with_topic(dlq_topic.clone())
            .map_err(|e| EventBusError::dlq(e.to_string()))?
            .with_headers([
                (h::ORIGINAL_TOPIC, event.topic().to_string()),
                (h::RETRY_COUNT, retry_count.to_string()),
                (h::ERROR, error.message().to_string()),
                (h::ERROR_TYPE, error.kind().to_string()),
                (h::DLQ_TIMESTAMP, rfc3339(now)),
                (h::FIRST_FAILURE_TIME, first_failure),
                (h::LAST_FAILURE_TIME, rfc3339(now)),
            ]);

        self.bus.publish(&dead).await.map_err(|e| {
            EventBusError::dlq(format!("failed to publish to '{dlq_topic}': {e}"))
        })?;

        let entry = DlqEntry::from_dlq_event(&dead)?;
        self.hooks.dead_letter(&entry);
        Ok(entry)
    }

    /// Read entries back from a DLQ topic.
    ///
    /// Adapters without persistent history report
    /// [`EventBusError::NotSupported`]. Stored events that lack DLQ
    /// annotations are skipped.
    pub async fn list_entries(
        &self,
        dlq_topic: &str,
        limit: Option<usize>,
        since: Option<DateTime<Utc>>,
    ) -> EventBusResult<Vec<DlqEntry>> {
        let events = match self.bus.read_history(dlq_topic, limit, since).await {
            Ok(events) => events,
            Err(err @ EventBusError::NotSupported { .. }) => return Err(err),
            Err(err) => {
                return Err(EventBusError::dlq(format!(
                    "failed to read '{dlq_topic}': {err}"
                )));
            }
        };

        let mut entries = Vec::with_capacity(events.len());
        for event in &events {
            match DlqEntry::from_dlq_event(event) {
                Ok(entry) if since.is_none_or(|s| entry.dlq_timestamp >= s) => entries.push(entry),
                Ok(_) => {}
                Err(err) => warn!(
                    dlq_topic,
                    event_id = %event.id(),
                    error = %err,
                    "skipping malformed dead letter entry"
                ),
            }
        }
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    /// Republish the original event to its original topic.
    ///
    /// The republished event is a fresh event (new id, `causation_id` = the
    /// failed event) without DLQ annotations, tagged `x-dlq-reprocessing`.
    pub async fn reprocess_event(&self, entry: &DlqEntry) -> EventBusResult<Event> {
        let event = entry
            .original_event
            .renewed()
            .without_headers(h::STRIPPED_ON_REPROCESS)
            .with_topic(entry.original_topic.clone())
            .map_err(|e| EventBusError::dlq(e.to_string()))?
            .with_headers([
                (h::REPROCESSING, "true".to_string()),
                (h::ORIGINAL_RETRY_COUNT, entry.retry_count.to_string()),
                (h::REPROCESS_TIMESTAMP, rfc3339(Utc::now())),
            ]);

        self.bus.publish(&event).await.map_err(|e| {
            EventBusError::dlq(format!(
                "failed to republish to '{}': {e}",
                entry.original_topic
            ))
        })?;

        info!(
            original_topic = %entry.original_topic,
            dlq_topic = %entry.dlq_topic,
            event_id = %event.id(),
            "dead letter reprocessed"
        );
        Ok(event)
    }

    /// Reprocess every (matching) entry; returns how many were republished.
    pub async fn reprocess_all(
        &self,
        dlq_topic: &str,
        filter: Option<EntryFilter<'_>>,
    ) -> EventBusResult<usize> {
        let entries = self.list_entries(dlq_topic, None, None).await?;
        let mut count = 0;
        for entry in entries.iter().filter(|e| filter.is_none_or(|f| f(e))) {
            self.reprocess_event(entry).await?;
            count += 1;
        }
        Ok(count)
    }
}
