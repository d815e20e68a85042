use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tracing::warn;

use crate::Event;
use crate::hooks::HookSet;

/// Failure reported by an event handler.
///
/// `kind` is the error category (recorded as `x-error-type` when the event
/// ends up in the dead letter queue). Terminal failures skip any remaining
/// retries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct HandlerError {
    kind: String,
    message: String,
    retryable: bool,
}

impl HandlerError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that retrying cannot fix (malformed payload, unknown entity ...).
    pub fn terminal(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            ..Self::new(kind, message)
        }
    }

    /// Wrap a typed error; the kind is the error's short type name.
    pub fn from_error<E>(err: &E) -> Self
    where
        E: std::error::Error + ?Sized,
    {
        Self::new(short_type_name::<E>(), err.to_string())
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::new("Error", format!("{err:#}"))
    }
}

fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    // Strip generic arguments before taking the last path segment.
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

/// Consumer-side callback invoked for every delivered event.
///
/// Handlers must be idempotent: every transport delivers at least once.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event) -> Result<(), HandlerError>;
}

pub type SharedHandler = Arc<dyn EventHandler>;

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, event: Event) -> Result<(), HandlerError> {
        (self.f)(event).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> SharedHandler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Result of one handler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    RetryableFailure(HandlerError),
    TerminalFailure(HandlerError),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

impl From<Result<(), HandlerError>> for Outcome {
    fn from(result: Result<(), HandlerError>) -> Self {
        match result {
            Ok(()) => Outcome::Success,
            Err(err) if err.is_retryable() => Outcome::RetryableFailure(err),
            Err(err) => Outcome::TerminalFailure(err),
        }
    }
}

/// Invoke a handler once, converting a panic into a terminal failure.
pub async fn invoke(handler: &dyn EventHandler, event: Event) -> Outcome {
    match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
        Ok(result) => result.into(),
        Err(panic) => Outcome::TerminalFailure(HandlerError::terminal(
            "Panic",
            panic_message(panic.as_ref()),
        )),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// What a consumer loop does with a message after its handler ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Handled: acknowledge / commit.
    Ack,
    /// Not handled: leave the message redeliverable where the transport allows.
    Nack(HandlerError),
}

/// Per-message supervisor step shared by every adapter's consumer loop.
///
/// Never fails: handler errors and panics become [`Delivery::Nack`] so one
/// bad message cannot stop the loop.
pub async fn deliver(
    handler: &dyn EventHandler,
    event: Event,
    group: &str,
    hooks: &HookSet,
) -> Delivery {
    hooks.consume(&event, group);

    match invoke(handler, event.clone()).await {
        Outcome::Success => Delivery::Ack,
        Outcome::RetryableFailure(err) | Outcome::TerminalFailure(err) => {
            hooks.handler_error(&event, &err, 1);
            warn!(
                topic = event.topic(),
                group,
                event_id = %event.id(),
                error = %err,
                "event handler failed"
            );
            Delivery::Nack(err)
        }
    }
}
