//! Tracing, logging, metrics (shared setup).

use std::sync::Arc;

use ispforge_events::{ConnectionSettings, HookSet};

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Structured logging of event bus callbacks.
pub mod logging;

/// In-process event bus counters.
pub mod metrics;

pub use logging::TracingHooks;
pub use metrics::{MetricsHooks, MetricsSnapshot};

/// Hooks an adapter should run with, honouring the connection's
/// `enable_tracing` / `enable_metrics` switches. The metrics handle is
/// returned so the caller can read snapshots.
pub fn hooks_for(settings: &ConnectionSettings) -> (HookSet, Option<Arc<MetricsHooks>>) {
    let mut hooks = HookSet::new();
    if settings.enable_tracing {
        hooks.push(Arc::new(TracingHooks::new()));
    }
    let metrics = settings.enable_metrics.then(|| Arc::new(MetricsHooks::new()));
    if let Some(metrics) = &metrics {
        hooks.push(metrics.clone());
    }
    (hooks, metrics)
}
