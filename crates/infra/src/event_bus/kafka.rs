//! Kafka-backed event bus (partitioned, at-least-once delivery).
//!
//! - Each topic is a Kafka topic; the event key selects the partition, so
//!   ordering holds per key.
//! - Subscriptions use Kafka's native consumer groups. `concurrency` consumers
//!   join the group and the broker distributes partitions among them.
//! - Offsets are committed manually, only after the handler succeeded. A failed
//!   message is re-read by seeking back to it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, Message, OwnedHeaders, OwnedMessage};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use ispforge_events::{
    AdapterMetadata, BackoffPolicy, Capability, Codec, Delivery, Event, EventBus, EventBusError,
    EventBusResult, HookSet, JsonCodec, KafkaConfig, PublishOptions, SharedHandler,
    SubscribeOptions, deliver,
};

const ADAPTER_NAME: &str = "kafka";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn millis(d: Duration) -> String {
    d.as_millis().min(i32::MAX as u128).to_string()
}

/// Properties shared by producers and consumers.
fn client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", config.bootstrap_servers())
        .set("client.id", &config.client_id)
        .set("security.protocol", config.security_protocol.as_str())
        .set("socket.connection.setup.timeout.ms", millis(config.connection.connect_timeout));
    if let Some(mechanism) = &config.sasl_mechanism {
        client.set("sasl.mechanism", mechanism);
    }
    if let Some(username) = &config.connection.username {
        client.set("sasl.username", username);
    }
    if let Some(password) = &config.connection.password {
        client.set("sasl.password", password.expose());
    }
    client
}

fn apply_extra(client: &mut ClientConfig, config: &KafkaConfig) {
    for (key, value) in &config.extra {
        client.set(key, value);
    }
}

fn producer_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = client_config(config);
    client
        .set("compression.type", config.compression.as_str())
        .set("batch.size", config.batch_size.to_string())
        .set("linger.ms", millis(config.linger))
        .set("acks", config.acks.as_str())
        .set("retries", config.producer_retries.to_string())
        .set("message.timeout.ms", millis(config.connection.operation_timeout));
    apply_extra(&mut client, config);
    client
}

fn consumer_config(config: &KafkaConfig, group: &str, offset_reset: &str) -> ClientConfig {
    let mut client = client_config(config);
    client
        .set("group.id", group)
        .set("enable.auto.commit", "false")
        .set("enable.auto.offset.store", "false")
        .set("auto.offset.reset", offset_reset)
        .set("session.timeout.ms", millis(config.session_timeout));
    apply_extra(&mut client, config);
    client
}

fn kafka_headers(event: &Event) -> OwnedHeaders {
    event
        .transport_headers()
        .iter()
        .fold(OwnedHeaders::new(), |headers, (key, value)| {
            headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_bytes()),
            })
        })
}

pub struct KafkaEventBus {
    config: Arc<KafkaConfig>,
    producer: FutureProducer,
    metadata: AdapterMetadata,
    hooks: HookSet,
    codec: Arc<dyn Codec>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl core::fmt::Debug for KafkaEventBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KafkaEventBus")
            .field("bootstrap_servers", &self.config.bootstrap_servers())
            .field("codec", &self.codec)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl KafkaEventBus {
    pub fn new(config: KafkaConfig, hooks: HookSet) -> EventBusResult<Self> {
        config.validate()?;
        let producer: FutureProducer = producer_config(&config)
            .create()
            .map_err(|e| EventBusError::config(format!("cannot create kafka producer: {e}")))?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config: Arc::new(config),
            producer,
            metadata: AdapterMetadata::new(
                ADAPTER_NAME,
                env!("CARGO_PKG_VERSION"),
                "Kafka with native consumer groups",
                [
                    Capability::Publish,
                    Capability::Subscribe,
                    Capability::ConsumerGroups,
                    Capability::AtLeastOnceDelivery,
                    Capability::Partitioning,
                    Capability::PersistentHistory,
                ],
            ),
            hooks,
            codec: Arc::new(JsonCodec::new()),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn config(&self) -> &KafkaConfig {
        &self.config
    }

    fn ensure_open(&self) -> EventBusResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EventBusError::Closed);
        }
        Ok(())
    }

    /// Send with application-level retries on top of librdkafka's own.
    #[instrument(skip(self, event, payload), fields(topic = event.topic(), event_id = %event.id()), err)]
    async fn send(&self, event: &Event, payload: &[u8]) -> Result<(i32, i64), KafkaError> {
        let settings = &self.config.connection;
        let backoff = BackoffPolicy::exponential(settings.retry_delay, settings.retry_delay * 16);
        let mut retries = 0u32;

        loop {
            let mut record = FutureRecord::<str, [u8]>::to(event.topic())
                .payload(payload)
                .headers(kafka_headers(event));
            if let Some(key) = event.key() {
                record = record.key(key);
            }

            match self
                .producer
                .send(record, Timeout::After(settings.operation_timeout))
                .await
            {
                Ok(delivered) => {
                    if retries > 0 {
                        info!(retries, "kafka send succeeded after retry");
                    }
                    return Ok(delivered);
                }
                Err((err, _)) if retries < settings.max_retries => {
                    retries += 1;
                    let delay = backoff.delay_for_retry(retries);
                    warn!(
                        attempt = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "kafka send failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err((err, _)) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl EventBus for KafkaEventBus {
    fn metadata(&self) -> &AdapterMetadata {
        &self.metadata
    }

    async fn publish_with(&self, event: &Event, options: PublishOptions) -> EventBusResult<()> {
        self.ensure_open()?;
        let event = options.apply(event);
        let payload = self.codec.encode(&event)?;

        let (partition, offset) = self
            .send(&event, &payload)
            .await
            .map_err(|e| EventBusError::publish(&event, e))?;

        self.hooks.publish(&event);
        debug!(topic = event.topic(), partition, offset, event_id = %event.id(), "event produced");
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: SharedHandler,
        options: SubscribeOptions,
    ) -> EventBusResult<()> {
        self.ensure_open()?;
        options.validate()?;

        let mut consumers = Vec::with_capacity(options.concurrency);
        for _ in 0..options.concurrency {
            let consumer: StreamConsumer =
                consumer_config(&self.config, &options.group, options.auto_offset_reset.as_str())
                    .create()
                    .map_err(|e| EventBusError::consume(topic, e))?;
            consumer
                .subscribe(&[topic])
                .map_err(|e| EventBusError::consume(topic, e))?;
            consumers.push(consumer);
        }

        let mut tasks = lock(&self.tasks);
        for consumer in consumers {
            tasks.push(tokio::spawn(
                ConsumeLoop {
                    consumer,
                    topic: topic.to_string(),
                    group: options.group.clone(),
                    handler: handler.clone(),
                    hooks: self.hooks.clone(),
                    codec: self.codec.clone(),
                    config: self.config.clone(),
                    shutdown: self.shutdown.subscribe(),
                }
                .run(),
            ));
        }
        info!(
            adapter = ADAPTER_NAME,
            topic,
            group = %options.group,
            concurrency = options.concurrency,
            "subscription started"
        );
        Ok(())
    }

    async fn read_history(
        &self,
        topic: &str,
        limit: Option<usize>,
        since: Option<DateTime<Utc>>,
    ) -> EventBusResult<Vec<Event>> {
        self.ensure_open()?;
        let config = self.config.clone();
        let codec = self.codec.clone();
        let owned_topic = topic.to_string();

        tokio::task::spawn_blocking(move || read_partitions(&config, codec.as_ref(), &owned_topic, limit, since))
            .await
            .map_err(|e| EventBusError::consume(topic, e))?
            .map_err(|e| EventBusError::consume(topic, e))
    }

    async fn close(&self) -> EventBusResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.send_replace(true);

        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for task in tasks {
            if let Err(err) = task.await {
                error!(adapter = ADAPTER_NAME, error = %err, "consumer task ended abnormally");
            }
        }
        if let Err(err) = self.producer.flush(Timeout::After(self.config.connection.operation_timeout)) {
            warn!(adapter = ADAPTER_NAME, error = %err, "producer flush failed on close");
        }
        info!(adapter = ADAPTER_NAME, "event bus closed");
        Ok(())
    }
}

/// Read every partition of `topic` from the beginning up to its current high
/// watermark, with a throwaway group that never commits.
fn read_partitions(
    config: &KafkaConfig,
    codec: &dyn Codec,
    topic: &str,
    limit: Option<usize>,
    since: Option<DateTime<Utc>>,
) -> Result<Vec<Event>, KafkaError> {
    let timeout = config.connection.operation_timeout;
    let group = format!("{}-history-{}", config.client_id, uuid::Uuid::now_v7().simple());
    let consumer: BaseConsumer = consumer_config(config, &group, "earliest").create()?;

    let metadata = consumer.fetch_metadata(Some(topic), timeout)?;
    let mut assignment = TopicPartitionList::new();
    let mut remaining = Vec::new();
    for partition in metadata.topics().iter().flat_map(|t| t.partitions()) {
        let (low, high) = consumer.fetch_watermarks(topic, partition.id(), timeout)?;
        if high > low {
            assignment.add_partition_offset(topic, partition.id(), Offset::Beginning)?;
            remaining.push((partition.id(), high));
        }
    }
    if remaining.is_empty() {
        return Ok(Vec::new());
    }
    consumer.assign(&assignment)?;

    let mut records = Vec::new();
    while !remaining.is_empty() {
        let message = match consumer.poll(timeout) {
            Some(message) => message?,
            // Idle for a whole operation timeout: the rest is unreachable.
            None => break,
        };
        let (partition, offset) = (message.partition(), message.offset());
        if let Some(payload) = message.payload() {
            match codec.decode(payload) {
                Ok(event) => {
                    let written = message
                        .timestamp()
                        .to_millis()
                        .unwrap_or_else(|| event.metadata().timestamp().timestamp_millis());
                    records.push((written, event));
                }
                Err(err) => warn!(topic, partition, offset, error = %err, "skipping undecodable message"),
            }
        }
        remaining.retain(|(p, high)| !(*p == partition && offset + 1 >= *high));
    }

    Ok(select_history(records, limit, since))
}

/// Order, filter and page history by the time each message was written to
/// Kafka (millisecond resolution), not by the event's creation time: a
/// re-published event (DLQ, reprocess) keeps its original metadata.
fn select_history(
    mut records: Vec<(i64, Event)>,
    limit: Option<usize>,
    since: Option<DateTime<Utc>>,
) -> Vec<Event> {
    if let Some(since) = since {
        let since = since.timestamp_millis();
        records.retain(|(written, _)| *written >= since);
    }
    records.sort_by_key(|(written, _)| *written);
    let events = records.into_iter().map(|(_, event)| event);
    match limit {
        Some(limit) => events.take(limit).collect(),
        None => events.collect(),
    }
}

/// One member of a consumer group.
struct ConsumeLoop {
    consumer: StreamConsumer,
    topic: String,
    group: String,
    handler: SharedHandler,
    hooks: HookSet,
    codec: Arc<dyn Codec>,
    config: Arc<KafkaConfig>,
    shutdown: watch::Receiver<bool>,
}

impl ConsumeLoop {
    async fn run(mut self) {
        debug!(topic = %self.topic, group = %self.group, "consumer loop started");
        while !*self.shutdown.borrow() {
            let received = tokio::select! {
                _ = self.shutdown.changed() => break,
                received = self.consumer.recv() => received.map(|m| m.detach()),
            };
            match received {
                Ok(message) => self.process(message).await,
                Err(err) => {
                    let err = EventBusError::consume(&self.topic, err);
                    self.hooks.consume_error(&err);
                    error!(topic = %self.topic, group = %self.group, error = %err, "kafka receive failed");
                    self.pause(self.config.connection.retry_delay).await;
                }
            }
        }
        debug!(topic = %self.topic, group = %self.group, "consumer loop stopped");
    }

    async fn process(&mut self, message: OwnedMessage) {
        let decoded = match message.payload() {
            Some(payload) => self.codec.decode(payload).map_err(|e| e.to_string()),
            None => Err("message has no payload".to_string()),
        };
        let event = match decoded {
            Ok(event) => event,
            Err(cause) => {
                let err = EventBusError::consume(
                    &self.topic,
                    format!(
                        "partition {} offset {}: {cause}",
                        message.partition(),
                        message.offset()
                    ),
                );
                self.hooks.consume_error(&err);
                error!(topic = %self.topic, error = %err, "undecodable message; committing past it");
                self.commit(&message);
                return;
            }
        };

        match deliver(self.handler.as_ref(), event, &self.group, &self.hooks).await {
            Delivery::Ack => self.commit(&message),
            Delivery::Nack(_) => {
                self.pause(self.config.connection.retry_delay).await;
                self.rewind(&message);
            }
        }
    }

    fn commit(&self, message: &OwnedMessage) {
        let mut offsets = TopicPartitionList::new();
        let result = offsets
            .add_partition_offset(
                message.topic(),
                message.partition(),
                Offset::Offset(message.offset() + 1),
            )
            .and_then(|()| self.consumer.commit(&offsets, CommitMode::Async));
        if let Err(err) = result {
            error!(
                topic = message.topic(),
                partition = message.partition(),
                offset = message.offset(),
                error = %err,
                "offset commit failed"
            );
        }
    }

    /// Seek back so the failed message is consumed again.
    fn rewind(&self, message: &OwnedMessage) {
        if let Err(err) = self.consumer.seek(
            message.topic(),
            message.partition(),
            Offset::Offset(message.offset()),
            Timeout::After(self.config.connection.operation_timeout),
        ) {
            warn!(
                topic = message.topic(),
                partition = message.partition(),
                offset = message.offset(),
                error = %err,
                "seek for redelivery failed; message will be redelivered after rebalance"
            );
        }
    }

    async fn pause(&mut self, delay: Duration) {
        tokio::select! {
            _ = self.shutdown.changed() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
