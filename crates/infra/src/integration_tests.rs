//! Integration tests for the full delivery pipeline.
//!
//! Tests: Registry → EventBus → RetryingHandler → DeadLetterQueue → reprocess
//!
//! Verifies:
//! - Exhausted handlers land in the DLQ exactly once with failure annotations
//! - Reprocessed events reach the original topic as fresh events
//! - Observability hooks see every step
//!
//! The Redis and Kafka variants need a live broker (`REDIS_URL`,
//! `KAFKA_BOOTSTRAP_SERVERS`) and are `#[ignore]`d.

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use serde_json::json;

    use ispforge_events::headers::dlq as dlq_headers;
    use ispforge_events::{
        BusConfig, DeadLetterQueue, DlqEntry, Event, EventBus, HandlerError, HookSet,
        MemoryBusConfig, Payload, RetryPolicy, SubscribeOptions, handler_fn, subscribe_with_retry,
    };
    use ispforge_observability::{MetricsHooks, TracingHooks};

    use crate::default_registry;

    type Sink = Arc<Mutex<Vec<Event>>>;

    fn hooks() -> (HookSet, Arc<MetricsHooks>) {
        ispforge_observability::init();
        let metrics = Arc::new(MetricsHooks::new());
        let hooks = HookSet::new()
            .with(Arc::new(TracingHooks::new()))
            .with(metrics.clone());
        (hooks, metrics)
    }

    async fn memory_bus(hooks: HookSet) -> Arc<dyn EventBus> {
        default_registry()
            .create(BusConfig::Memory(MemoryBusConfig::default()), hooks)
            .await
            .unwrap()
    }

    async fn collect(bus: &Arc<dyn EventBus>, topic: &str, group: &str) -> Sink {
        let sink: Sink = Arc::new(Mutex::new(Vec::new()));
        let target = sink.clone();
        bus.subscribe(
            topic,
            handler_fn(move |event| {
                let target = target.clone();
                async move {
                    target.lock().unwrap().push(event);
                    Ok(())
                }
            }),
            SubscribeOptions::group(group),
        )
        .await
        .unwrap();
        sink
    }

    /// Poll until `sink` holds `count` events or two seconds pass.
    async fn wait_for(sink: &Sink, count: usize) -> Vec<Event> {
        for _ in 0..200 {
            if sink.lock().unwrap().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        sink.lock().unwrap().clone()
    }

    /// Fails every delivery that is not a DLQ reprocess.
    fn handler_healed_by_reprocessing(processed: Sink) -> ispforge_events::SharedHandler {
        handler_fn(move |event: Event| {
            let processed = processed.clone();
            async move {
                if event.header(dlq_headers::REPROCESSING) != Some("true") {
                    return Err(HandlerError::new("ConnectionError", "ledger unavailable"));
                }
                processed.lock().unwrap().push(event);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn failing_handler_is_dead_lettered_then_reprocessed() {
        let (hooks, metrics) = hooks();
        let bus = memory_bus(hooks.clone()).await;
        let dead = collect(&bus, "orders.created.dlq", "dlq-inspector").await;
        let processed: Sink = Arc::new(Mutex::new(Vec::new()));

        subscribe_with_retry(
            bus.clone(),
            "orders.created",
            handler_healed_by_reprocessing(processed.clone()),
            SubscribeOptions::group("billing"),
            RetryPolicy::fixed(2, Duration::from_millis(10)),
            hooks.clone(),
        )
        .await
        .unwrap();

        let order = Event::from_json("orders.created", json!({ "order_id": 42 }))
            .unwrap()
            .with_key("customer-7")
            .with_tenant_id("acme");
        bus.publish(&order).await.unwrap();

        let dead = wait_for(&dead, 1).await;
        assert_eq!(dead.len(), 1);
        let entry = DlqEntry::from_dlq_event(&dead[0]).unwrap();
        assert_eq!(entry.original_topic, "orders.created");
        assert_eq!(entry.retry_count, 2);
        assert_eq!(entry.error_type, "ConnectionError");
        assert_eq!(entry.error, "ledger unavailable");
        assert_eq!(entry.original_event.id(), order.id());
        assert!(entry.first_failure_time <= entry.last_failure_time);

        let dlq = DeadLetterQueue::new(bus.clone()).with_hooks(hooks);
        let republished = dlq.reprocess_event(&entry).await.unwrap();

        let processed = wait_for(&processed, 1).await;
        assert_eq!(processed.len(), 1);
        let replayed = &processed[0];
        assert_eq!(replayed.id(), republished.id());
        assert_ne!(replayed.id(), order.id());
        assert_eq!(
            replayed.metadata().causation_id(),
            Some(order.id().to_string().as_str())
        );
        assert_eq!(replayed.key(), Some("customer-7"));
        assert_eq!(replayed.tenant_id(), Some("acme"));
        assert_eq!(replayed.header(dlq_headers::ORIGINAL_RETRY_COUNT), Some("2"));
        assert!(replayed.header(dlq_headers::ERROR).is_none());
        assert!(replayed.header(dlq_headers::FIRST_FAILURE_TIME).is_some());

        let counters = metrics.snapshot();
        assert_eq!(counters.published, 3);
        assert_eq!(counters.handler_errors, 3);
        assert_eq!(counters.retries, 2);
        assert_eq!(counters.dead_letters, 1);
        assert!(counters.consumed >= 3);

        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn memory_dlq_cannot_be_listed() {
        let (hooks, _) = hooks();
        let bus = memory_bus(hooks).await;
        let dlq = DeadLetterQueue::new(bus.clone());

        let err = dlq
            .list_entries("orders.created.dlq", None, None)
            .await
            .unwrap_err();
        assert!(err.is_not_supported());

        let err = dlq.reprocess_all("orders.created.dlq", None).await.unwrap_err();
        assert!(err.is_not_supported());
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn request_reply_through_the_registry() {
        let (hooks, _) = hooks();
        let bus = memory_bus(hooks).await;
        let responder = bus.clone();
        bus.subscribe(
            "pricing.quote",
            handler_fn(move |event: Event| {
                let responder = responder.clone();
                async move {
                    let sku = event.payload().get("sku").cloned().unwrap_or_default();
                    let mut quote = Payload::new();
                    quote.insert("sku".to_string(), sku);
                    quote.insert("price_cents".to_string(), json!(1299));
                    let reply = event.reply(quote).map_err(|e| HandlerError::from_error(&e))?;
                    responder
                        .publish(&reply)
                        .await
                        .map_err(|e| HandlerError::from_error(&e))
                }
            }),
            SubscribeOptions::group("pricing"),
        )
        .await
        .unwrap();

        let mut ask = Payload::new();
        ask.insert("sku".to_string(), json!("fiber-1g"));
        let quote = bus
            .request("pricing.quote", ask, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(quote.get("sku"), Some(&json!("fiber-1g")));
        assert_eq!(quote.get("price_cents"), Some(&json!(1299)));
        bus.close().await.unwrap();
    }

    #[cfg(feature = "redis")]
    #[tokio::test]
    #[ignore = "requires a Redis server at REDIS_URL"]
    async fn redis_dead_letters_can_be_listed_and_reprocessed() {
        use ispforge_events::RedisStreamsConfig;

        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let (hooks, metrics) = hooks();
        let bus = default_registry()
            .create(BusConfig::Redis(RedisStreamsConfig::new(url)), hooks.clone())
            .await
            .unwrap();
        assert_dlq_roundtrip_with_history(bus, hooks).await;
        assert_eq!(metrics.snapshot().dead_letters, 1);
    }

    #[cfg(feature = "redis")]
    #[tokio::test]
    #[ignore = "requires a Redis server at REDIS_URL"]
    async fn redis_redelivers_a_failed_event_to_its_group() {
        use ispforge_events::RedisStreamsConfig;

        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let mut config = RedisStreamsConfig::new(url);
        config.redelivery_delay = Duration::from_millis(200);
        let bus = default_registry()
            .create(BusConfig::Redis(config), HookSet::new())
            .await
            .unwrap();
        assert_failed_delivery_is_redelivered(bus).await;
    }

    #[cfg(feature = "kafka")]
    #[tokio::test]
    #[ignore = "requires a Kafka broker at KAFKA_BOOTSTRAP_SERVERS"]
    async fn kafka_dead_letters_can_be_listed_and_reprocessed() {
        use ispforge_events::KafkaConfig;

        let servers = std::env::var("KAFKA_BOOTSTRAP_SERVERS")
            .unwrap_or_else(|_| "127.0.0.1:9092".into());
        let (hooks, metrics) = hooks();
        let bus = default_registry()
            .create(BusConfig::Kafka(KafkaConfig::new(servers)), hooks.clone())
            .await
            .unwrap();
        assert_dlq_roundtrip_with_history(bus, hooks).await;
        assert_eq!(metrics.snapshot().dead_letters, 1);
    }

    #[cfg(feature = "kafka")]
    #[tokio::test]
    #[ignore = "requires a Kafka broker at KAFKA_BOOTSTRAP_SERVERS"]
    async fn kafka_redelivers_a_failed_event_to_its_group() {
        use ispforge_events::KafkaConfig;

        let servers = std::env::var("KAFKA_BOOTSTRAP_SERVERS")
            .unwrap_or_else(|_| "127.0.0.1:9092".into());
        let mut config = KafkaConfig::new(servers);
        config.connection.retry_delay = Duration::from_millis(200);
        let bus = default_registry()
            .create(BusConfig::Kafka(config), HookSet::new())
            .await
            .unwrap();
        assert_failed_delivery_is_redelivered(bus).await;
    }

    /// A plain subscription (no retry wrapper) whose handler fails once must
    /// see the same event again.
    #[cfg(any(feature = "redis", feature = "kafka"))]
    async fn assert_failed_delivery_is_redelivered(bus: Arc<dyn EventBus>) {
        let topic = format!("it.payments.{}", uuid::Uuid::now_v7().simple());
        let seen: Sink = Arc::new(Mutex::new(Vec::new()));
        let target = seen.clone();

        bus.subscribe(
            &topic,
            handler_fn(move |event: Event| {
                let target = target.clone();
                async move {
                    let first = {
                        let mut seen = target.lock().unwrap();
                        seen.push(event);
                        seen.len() == 1
                    };
                    if first {
                        Err(HandlerError::new("ConnectionError", "gateway reset"))
                    } else {
                        Ok(())
                    }
                }
            }),
            SubscribeOptions::group("payments")
                .with_offset_reset(ispforge_events::OffsetReset::Earliest),
        )
        .await
        .unwrap();

        let payment = Event::from_json(topic.clone(), json!({ "payment_id": 9 })).unwrap();
        bus.publish(&payment).await.unwrap();

        let mut deliveries = Vec::new();
        for _ in 0..100 {
            deliveries = seen.lock().unwrap().clone();
            if deliveries.len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(deliveries.len() >= 2, "failed event was not redelivered");
        assert!(deliveries.iter().all(|e| e.id() == payment.id()));
        bus.close().await.unwrap();
    }

    #[cfg(any(feature = "redis", feature = "kafka"))]
    async fn assert_dlq_roundtrip_with_history(bus: Arc<dyn EventBus>, hooks: HookSet) {
        let topic = format!("it.orders.{}", uuid::Uuid::now_v7().simple());
        let dlq_topic = format!("{topic}.dlq");
        let processed: Sink = Arc::new(Mutex::new(Vec::new()));

        subscribe_with_retry(
            bus.clone(),
            &topic,
            handler_healed_by_reprocessing(processed.clone()),
            SubscribeOptions::group("billing")
                .with_offset_reset(ispforge_events::OffsetReset::Earliest),
            RetryPolicy::fixed(1, Duration::from_millis(10)),
            hooks.clone(),
        )
        .await
        .unwrap();

        let order = Event::from_json(topic.clone(), json!({ "order_id": 7 })).unwrap();
        bus.publish(&order).await.unwrap();

        let dlq = DeadLetterQueue::new(bus.clone()).with_hooks(hooks);
        let mut entries = Vec::new();
        for _ in 0..100 {
            entries = dlq.list_entries(&dlq_topic, None, None).await.unwrap();
            if !entries.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].retry_count, 1);
        assert_eq!(entries[0].original_event.id(), order.id());

        let reprocessed = dlq.reprocess_all(&dlq_topic, None).await.unwrap();
        assert_eq!(reprocessed, 1);

        let mut done = Vec::new();
        for _ in 0..100 {
            done = processed.lock().unwrap().clone();
            if !done.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(done.len(), 1);
        assert_eq!(
            done[0].metadata().causation_id(),
            Some(order.id().to_string().as_str())
        );
        bus.close().await.unwrap();
    }
}
