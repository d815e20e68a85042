//! Handler retry with backoff, ending in the dead letter queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::bus::{EventBus, SubscribeOptions};
use crate::dlq::DeadLetterQueue;
use crate::error::EventBusResult;
use crate::handler::{EventHandler, HandlerError, Outcome, SharedHandler, invoke};
use crate::hooks::HookSet;
use crate::{Event, headers};

pub const DEFAULT_DLQ_SUFFIX: &str = ".dlq";

/// Delay between handler attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    Fixed {
        #[serde(with = "crate::config::millis")]
        delay: Duration,
    },
    /// `base * multiplier^(retry - 1)`, capped at `max`; jitter adds a
    /// random 0-25% on top.
    Exponential {
        #[serde(with = "crate::config::millis")]
        base: Duration,
        #[serde(with = "crate::config::millis")]
        max: Duration,
        multiplier: f64,
        jitter: bool,
    },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_millis(100), Duration::from_secs(30))
    }
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed { delay }
    }

    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self::Exponential {
            base,
            max,
            multiplier: 2.0,
            jitter: true,
        }
    }

    pub fn without_jitter(self) -> Self {
        match self {
            Self::Exponential {
                base,
                max,
                multiplier,
                ..
            } => Self::Exponential {
                base,
                max,
                multiplier,
                jitter: false,
            },
            fixed => fixed,
        }
    }

    /// Delay before retry number `retry` (1-indexed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        match *self {
            Self::Fixed { delay } => delay,
            Self::Exponential {
                base,
                max,
                multiplier,
                jitter,
            } => {
                let base_ms = base.as_millis() as f64;
                let max_ms = max.as_millis() as f64;
                let exp = multiplier.max(1.0).powi((retry - 1) as i32);
                let delay_ms = (base_ms * exp).min(max_ms);
                let jitter_ms = if jitter {
                    delay_ms * 0.25 * rand::random::<f64>()
                } else {
                    0.0
                };
                Duration::from_millis((delay_ms + jitter_ms).max(0.0) as u64)
            }
        }
    }
}

/// Retry configuration of one subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = single attempt).
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
    /// Explicit DLQ topic; defaults to `topic + dlq_suffix`.
    pub dlq_topic: Option<String>,
    pub dlq_suffix: String,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffPolicy::default(),
            dlq_topic: None,
            dlq_suffix: DEFAULT_DLQ_SUFFIX.to_string(),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            backoff: BackoffPolicy::fixed(delay),
            ..Default::default()
        }
    }

    pub fn exponential(max_retries: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_retries,
            backoff: BackoffPolicy::exponential(base, max),
            ..Default::default()
        }
    }

    pub fn with_dlq_topic(mut self, topic: impl Into<String>) -> Self {
        self.dlq_topic = Some(topic.into());
        self
    }

    pub fn with_dlq_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.dlq_suffix = suffix.into();
        self
    }

    pub fn dlq_topic_for(&self, topic: &str) -> String {
        self.dlq_topic
            .clone()
            .unwrap_or_else(|| format!("{topic}{}", self.dlq_suffix))
    }

    /// Whether another attempt is allowed after `retries_done` retries.
    pub fn should_retry(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }
}

/// Handler wrapper: retries failures per the policy, then dead-letters.
///
/// Once an event has been handed to the DLQ the wrapper reports success, so
/// transports that acknowledge do not redeliver it. A failing DLQ send is
/// logged and the event is still reported as handled (liveness over zero
/// loss).
pub struct RetryingHandler {
    inner: SharedHandler,
    policy: RetryPolicy,
    dlq: Arc<DeadLetterQueue>,
    hooks: HookSet,
}

impl RetryingHandler {
    pub fn new(inner: SharedHandler, policy: RetryPolicy, dlq: Arc<DeadLetterQueue>) -> Self {
        Self {
            inner,
            policy,
            dlq,
            hooks: HookSet::new(),
        }
    }

    pub fn with_hooks(mut self, hooks: HookSet) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn dead_letter(&self, event: &Event, error: &HandlerError, retries: u32) {
        let dlq_topic = self.policy.dlq_topic_for(event.topic());
        match self
            .dlq
            .send_to_dlq(event, error, retries, Some(&dlq_topic))
            .await
        {
            Ok(entry) => {
                warn!(
                    topic = event.topic(),
                    dlq_topic = %entry.dlq_topic,
                    event_id = %event.id(),
                    retry_count = retries,
                    error = %error,
                    "event moved to dead letter queue"
                );
            }
            Err(err) => {
                error!(
                    topic = event.topic(),
                    dlq_topic = %dlq_topic,
                    event_id = %event.id(),
                    error = %err,
                    "failed to send event to dead letter queue; dropping it"
                );
            }
        }
    }
}

#[async_trait]
impl EventHandler for RetryingHandler {
    async fn handle(&self, event: Event) -> Result<(), HandlerError> {
        let mut retries = 0u32;
        let mut first_failure: Option<DateTime<Utc>> = None;

        let last_error = loop {
            let (err, terminal) = match invoke(self.inner.as_ref(), event.clone()).await {
                Outcome::Success => return Ok(()),
                Outcome::TerminalFailure(err) => (err, true),
                Outcome::RetryableFailure(err) => (err, false),
            };
            first_failure.get_or_insert_with(Utc::now);

            self.hooks.handler_error(&event, &err, retries + 1);
            if terminal || !self.policy.should_retry(retries) {
                break err;
            }

            retries += 1;
            let delay = self.policy.backoff.delay_for_retry(retries);
            self.hooks.retry(&event, retries, delay);
            debug!(
                topic = event.topic(),
                event_id = %event.id(),
                retry = retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying event handler"
            );
            tokio::time::sleep(delay).await;
        };

        // An earlier DLQ trip already recorded the first failure.
        let recorded = event.header(headers::dlq::FIRST_FAILURE_TIME).is_some();
        let failed = match (recorded, first_failure) {
            (false, Some(at)) => event.with_headers([(
                headers::dlq::FIRST_FAILURE_TIME,
                at.to_rfc3339_opts(SecondsFormat::Micros, true),
            )]),
            _ => event,
        };
        self.dead_letter(&failed, &last_error, retries).await;
        Ok(())
    }
}

/// Subscribe `handler` wrapped in a [`RetryingHandler`] whose DLQ publishes to
/// the same bus.
pub async fn subscribe_with_retry(
    bus: Arc<dyn EventBus>,
    topic: &str,
    handler: SharedHandler,
    options: SubscribeOptions,
    policy: RetryPolicy,
    hooks: HookSet,
) -> EventBusResult<()> {
    let dlq = Arc::new(
        DeadLetterQueue::new(bus.clone())
            .with_suffix(policy.dlq_suffix.clone())
            .with_hooks(hooks.clone()),
    );
    let wrapped = RetryingHandler::new(handler, policy, dlq).with_hooks(hooks);
    bus.subscribe(topic, Arc::new(wrapped), options).await
}
