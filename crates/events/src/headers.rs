//! Well-known header names.
//!
//! Headers are plain `string -> string` pairs carried next to the payload.
//! Transports that support native headers (Kafka) or flat fields (Redis
//! Streams) expose the standard set below so a message can be inspected
//! without decoding its body.

pub const EVENT_ID: &str = "x-event-id";
pub const TIMESTAMP: &str = "x-timestamp";
pub const CONTENT_TYPE: &str = "content-type";
pub const ENCODING: &str = "encoding";
pub const PRODUCER: &str = "x-producer";
pub const CORRELATION_ID: &str = "x-correlation-id";
pub const CAUSATION_ID: &str = "x-causation-id";
pub const TENANT_ID: &str = "x-tenant-id";

/// Topic a reply to a request event should be published to.
pub const REPLY_TO: &str = "x-reply-to";

/// Dead letter annotations stamped by the DLQ.
pub mod dlq {
    pub const ORIGINAL_TOPIC: &str = "x-original-topic";
    pub const RETRY_COUNT: &str = "x-retry-count";
    pub const ERROR: &str = "x-error";
    pub const ERROR_TYPE: &str = "x-error-type";
    pub const DLQ_TIMESTAMP: &str = "x-dlq-timestamp";
    pub const FIRST_FAILURE_TIME: &str = "x-first-failure-time";
    pub const LAST_FAILURE_TIME: &str = "x-last-failure-time";

    pub const REPROCESSING: &str = "x-dlq-reprocessing";
    pub const ORIGINAL_RETRY_COUNT: &str = "x-original-retry-count";
    pub const REPROCESS_TIMESTAMP: &str = "x-dlq-reprocess-timestamp";

    /// Annotations removed when an entry is turned back into its original event.
    ///
    /// `x-first-failure-time` is kept so a reprocessed event that fails again
    /// still reports when it first failed.
    pub const STRIPPED_ON_REPROCESS: &[&str] = &[
        ORIGINAL_TOPIC,
        RETRY_COUNT,
        ERROR,
        ERROR_TYPE,
        DLQ_TIMESTAMP,
        LAST_FAILURE_TIME,
        REPROCESSING,
        ORIGINAL_RETRY_COUNT,
        REPROCESS_TIMESTAMP,
    ];
}
