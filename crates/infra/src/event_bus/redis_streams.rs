//! Redis Streams-backed event bus (durable, at-least-once delivery).
//!
//! This implementation uses Redis Streams (XADD/XREADGROUP) to provide:
//! - **Durable delivery**: entries persist until acknowledged
//! - **At-least-once**: an entry is acknowledged only after its handler succeeded
//! - **Consumer groups**: every subscription group is a stream consumer group
//! - **Recovery**: unacknowledged entries are re-read, and entries stuck with
//!   dead consumers are claimed (`XAUTOCLAIM`)
//!
//! ## Architecture
//!
//! - **Stream Key**: `{key_prefix}{topic}` (one stream per topic)
//! - **Entry fields**: `data` (codec bytes) plus the event's headers, flattened
//! - **Consumers**: one read loop per unit of concurrency, named
//!   `{group}-{uuid}-{n}`, each on its own connection

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{IntoConnectionInfo, Value};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use ispforge_events::{
    AdapterMetadata, Capability, Codec, Delivery, Event, EventBus, EventBusError,
    EventBusResult, HookSet, JsonCodec, OffsetReset, PublishOptions, RedisStreamsConfig,
    SharedHandler, SubscribeOptions, deliver,
};

const ADAPTER_NAME: &str = "redis";

/// Stream field holding the encoded event.
const DATA_FIELD: &str = "data";

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Consumer group error: {0}")]
    ConsumerGroup(String),

    #[error("Malformed stream entry: {0}")]
    Entry(String),
}

impl RedisStreamsError {
    fn command(name: &str, err: redis::RedisError) -> Self {
        if is_connectivity(&err) {
            Self::Connection(format!("{name} failed: {err}"))
        } else {
            Self::Command(format!("{name} failed: {err}"))
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

fn is_connectivity(err: &redis::RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One stream entry: its id and raw field values.
#[derive(Debug, Clone)]
struct StreamEntry {
    id: String,
    fields: HashMap<String, Vec<u8>>,
}

impl StreamEntry {
    fn data(&self) -> Option<&[u8]> {
        self.fields.get(DATA_FIELD).map(Vec::as_slice)
    }
}

fn bytes_of(value: &Value) -> Option<&[u8]> {
    match value {
        Value::Data(data) => Some(data.as_slice()),
        Value::Status(status) => Some(status.as_bytes()),
        _ => None,
    }
}

/// Parse `[id, [field, value, ...]]`. Entries deleted while pending come back
/// as `[id, nil]` and yield `None`.
fn parse_entry(value: &Value) -> Result<Option<StreamEntry>, RedisStreamsError> {
    let Value::Bulk(parts) = value else {
        return Err(RedisStreamsError::Entry("entry is not an array".to_string()));
    };
    let [id, fields, ..] = parts.as_slice() else {
        return Err(RedisStreamsError::Entry("entry too short".to_string()));
    };
    let id = bytes_of(id)
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .ok_or_else(|| RedisStreamsError::Entry("invalid entry id".to_string()))?;

    let fields = match fields {
        Value::Bulk(items) => items,
        Value::Nil => return Ok(None),
        _ => return Err(RedisStreamsError::Entry(format!("invalid fields of {id}"))),
    };
    let mut map = HashMap::with_capacity(fields.len() / 2);
    for pair in fields.chunks(2) {
        if let [key, value] = pair {
            if let (Some(key), Some(value)) = (bytes_of(key), bytes_of(value)) {
                map.insert(String::from_utf8_lossy(key).into_owned(), value.to_vec());
            }
        }
    }
    Ok(Some(StreamEntry { id, fields: map }))
}

fn parse_entries(value: &Value) -> Result<Vec<StreamEntry>, RedisStreamsError> {
    match value {
        Value::Nil => Ok(Vec::new()),
        Value::Bulk(items) => {
            let mut entries = Vec::with_capacity(items.len());
            for item in items {
                if let Some(entry) = parse_entry(item)? {
                    entries.push(entry);
                }
            }
            Ok(entries)
        }
        _ => Err(RedisStreamsError::Entry("entry list is not an array".to_string())),
    }
}

/// `XREADGROUP` reply: nil on timeout, else `[[stream, [entry, ...]], ...]`.
fn parse_read_reply(value: &Value) -> Result<Vec<StreamEntry>, RedisStreamsError> {
    let Value::Bulk(streams) = value else {
        return Ok(Vec::new());
    };
    let mut entries = Vec::new();
    for stream in streams {
        if let Value::Bulk(parts) = stream {
            if let Some(list) = parts.get(1) {
                entries.extend(parse_entries(list)?);
            }
        }
    }
    Ok(entries)
}

/// `XAUTOCLAIM` reply: `[next_cursor, [entry, ...], (deleted ids)]`.
fn parse_autoclaim_reply(value: &Value) -> Result<(String, Vec<StreamEntry>), RedisStreamsError> {
    let Value::Bulk(parts) = value else {
        return Err(RedisStreamsError::Entry("XAUTOCLAIM reply is not an array".to_string()));
    };
    let cursor = parts
        .first()
        .and_then(bytes_of)
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_else(|| "0-0".to_string());
    let entries = match parts.get(1) {
        Some(list) => parse_entries(list)?,
        None => Vec::new(),
    };
    Ok((cursor, entries))
}

fn client_for(config: &RedisStreamsConfig) -> EventBusResult<redis::Client> {
    let url = config
        .connection
        .primary_endpoint()
        .ok_or_else(|| EventBusError::config("redis endpoint is required"))?;
    let mut info = url
        .into_connection_info()
        .map_err(|e| EventBusError::config(format!("invalid redis url: {e}")))?;
    if let Some(username) = &config.connection.username {
        info.redis.username = Some(username.clone());
    }
    if let Some(password) = &config.connection.password {
        info.redis.password = Some(password.expose().to_string());
    }
    redis::Client::open(info).map_err(|e| EventBusError::config(e.to_string()))
}

/// Connect, retrying up to `max_retries` times.
async fn open_connection(
    client: &redis::Client,
    config: &RedisStreamsConfig,
) -> Result<ConnectionManager, RedisStreamsError> {
    let settings = &config.connection;
    let mut attempt = 0u32;
    loop {
        let cause =
            match tokio::time::timeout(settings.connect_timeout, ConnectionManager::new(client.clone()))
                .await
            {
                Ok(Ok(conn)) => return Ok(conn),
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("timed out after {:?}", settings.connect_timeout),
            };
        if attempt >= settings.max_retries {
            return Err(RedisStreamsError::Connection(cause));
        }
        attempt += 1;
        warn!(adapter = ADAPTER_NAME, attempt, error = %cause, "redis connection failed; retrying");
        tokio::time::sleep(settings.retry_delay).await;
    }
}

async fn query(
    cmd: &redis::Cmd,
    conn: &mut ConnectionManager,
    name: &str,
    timeout: Duration,
) -> Result<Value, RedisStreamsError> {
    match tokio::time::timeout(timeout, cmd.query_async::<_, Value>(conn)).await {
        Ok(result) => result.map_err(|e| RedisStreamsError::command(name, e)),
        Err(_) => Err(RedisStreamsError::Connection(format!(
            "{name} timed out after {timeout:?}"
        ))),
    }
}

pub struct RedisStreamsEventBus {
    config: Arc<RedisStreamsConfig>,
    client: redis::Client,
    metadata: AdapterMetadata,
    hooks: HookSet,
    codec: Arc<dyn Codec>,
    publisher: tokio::sync::Mutex<Option<ConnectionManager>>,
    /// One permit per connection; the publisher holds none.
    connections: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl core::fmt::Debug for RedisStreamsEventBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStreamsEventBus")
            .field("key_prefix", &self.config.key_prefix)
            .field("codec", &self.codec)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl RedisStreamsEventBus {
    /// Create the bus. Connections are opened lazily: the publisher's on first
    /// use, one per read loop on `subscribe`.
    pub fn new(config: RedisStreamsConfig, hooks: HookSet) -> EventBusResult<Self> {
        config.validate()?;
        let client = client_for(&config)?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            connections: Arc::new(Semaphore::new(config.connection.max_connections.max(1))),
            config: Arc::new(config),
            client,
            metadata: AdapterMetadata::new(
                ADAPTER_NAME,
                env!("CARGO_PKG_VERSION"),
                "Redis Streams with consumer groups",
                [
                    Capability::Publish,
                    Capability::Subscribe,
                    Capability::ConsumerGroups,
                    Capability::AtLeastOnceDelivery,
                    Capability::PersistentHistory,
                ],
            ),
            hooks,
            codec: Arc::new(JsonCodec::new()),
            publisher: tokio::sync::Mutex::new(None),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// [`Self::new`] followed by a connectivity check, for fail-fast startup.
    pub async fn connect(config: RedisStreamsConfig, hooks: HookSet) -> EventBusResult<Self> {
        let bus = Self::new(config, hooks)?;
        bus.publisher_connection()
            .await
            .map_err(|e| EventBusError::config(format!("cannot reach redis: {e}")))?;
        Ok(bus)
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn config(&self) -> &RedisStreamsConfig {
        &self.config
    }

    fn ensure_open(&self) -> EventBusResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EventBusError::Closed);
        }
        Ok(())
    }

    async fn publisher_connection(&self) -> Result<ConnectionManager, RedisStreamsError> {
        let mut slot = self.publisher.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = open_connection(&self.client, &self.config).await?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Ensure a consumer group exists (idempotent).
    async fn ensure_consumer_group(
        &self,
        conn: &mut ConnectionManager,
        stream_key: &str,
        group: &str,
        reset: OffsetReset,
    ) -> Result<(), RedisStreamsError> {
        let start = match reset {
            OffsetReset::Earliest => "0",
            OffsetReset::Latest => "$",
        };
        let mut cmd = redis::cmd("XGROUP");
        cmd.arg("CREATE")
            .arg(stream_key)
            .arg(group)
            .arg(start)
            .arg("MKSTREAM");
        match cmd.query_async::<_, Value>(conn).await {
            Ok(_) => Ok(()),
            // Group already exists: reuse it with its current position.
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(RedisStreamsError::ConsumerGroup(format!(
                "XGROUP CREATE {stream_key} {group}: {e}"
            ))),
        }
    }

    #[instrument(
        skip(self, event, bytes),
        fields(event_id = %event.id()),
        err
    )]
    async fn xadd(
        &self,
        stream_key: &str,
        event: &Event,
        bytes: &[u8],
    ) -> Result<String, RedisStreamsError> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream_key)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.config.max_stream_length)
            .arg("*")
            .arg(DATA_FIELD)
            .arg(bytes);
        for (name, value) in event.transport_headers() {
            if name != DATA_FIELD {
                cmd.arg(name).arg(value);
            }
        }

        let settings = &self.config.connection;
        let mut attempt = 0u32;
        loop {
            let result = match self.publisher_connection().await {
                Ok(mut conn) => query(&cmd, &mut conn, "XADD", settings.operation_timeout).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(id) => {
                    return Ok(bytes_of(&id)
                        .map(|b| String::from_utf8_lossy(b).into_owned())
                        .unwrap_or_default());
                }
                Err(e) if e.is_retryable() && attempt < settings.max_retries => {
                    attempt += 1;
                    warn!(attempt, error = %e, "XADD failed; retrying");
                    tokio::time::sleep(settings.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl EventBus for RedisStreamsEventBus {
    fn metadata(&self) -> &AdapterMetadata {
        &self.metadata
    }

    async fn publish_with(&self, event: &Event, options: PublishOptions) -> EventBusResult<()> {
        self.ensure_open()?;
        let event = options.apply(event);
        let bytes = self.codec.encode(&event)?;
        let stream_key = self.config.stream_key(event.topic());

        let entry_id = self
            .xadd(&stream_key, &event, &bytes)
            .await
            .map_err(|e| EventBusError::publish(&event, e))?;

        self.hooks.publish(&event);
        debug!(stream_key, entry_id, event_id = %event.id(), "event appended to stream");
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
        let stream_key = self.config.stream_key(topic);

        let mut permits = Vec::with_capacity(options.concurrency);
        for _ in 0..options.concurrency {
            let permit = Arc::clone(&self.connections).try_acquire_owned().map_err(|_| {
                EventBusError::consume(
                    topic,
                    format!(
                        "connection limit of {} reached",
                        self.config.connection.max_connections
                    ),
                )
            })?;
            permits.push(permit);
        }

        let mut setup = self
            .publisher_connection()
            .await
            .map_err(|e| EventBusError::consume(topic, e))?;
        self.ensure_consumer_group(&mut setup, &stream_key, &options.group, options.auto_offset_reset)
            .await
            .map_err(|e| EventBusError::consume(topic, e))?;

        let instance = uuid::Uuid::now_v7().simple().to_string();
        let mut loops = Vec::with_capacity(options.concurrency);
        for (n, permit) in permits.into_iter().enumerate() {
            let conn = open_connection(&self.client, &self.config)
                .await
                .map_err(|e| EventBusError::consume(topic, e))?;
            loops.push(ReadLoop {
                conn,
                stream_key: stream_key.clone(),
                topic: topic.to_string(),
                group: options.group.clone(),
                consumer: format!("{}-{instance}-{n}", options.group),
                handler: handler.clone(),
                hooks: self.hooks.clone(),
                codec: self.codec.clone(),
                config: self.config.clone(),
                shutdown: self.shutdown.subscribe(),
                _permit: permit,
            });
        }

        let mut tasks = lock(&self.tasks);
        for read_loop in loops {
            tasks.push(tokio::spawn(read_loop.run()));
        }
        info!(
            adapter = ADAPTER_NAME,
            stream_key,
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
        let stream_key = self.config.stream_key(topic);
        let start = since
            .map(|t| format!("{}-0", t.timestamp_millis().max(0)))
            .unwrap_or_else(|| "-".to_string());

        let mut cmd = redis::cmd("XRANGE");
        cmd.arg(&stream_key).arg(start).arg("+");
        if let Some(limit) = limit {
            cmd.arg("COUNT").arg(limit);
        }

        let mut conn = self
            .publisher_connection()
            .await
            .map_err(|e| EventBusError::consume(topic, e))?;
        let reply = query(&cmd, &mut conn, "XRANGE", self.config.connection.operation_timeout)
            .await
            .map_err(|e| EventBusError::consume(topic, e))?;
        let entries = parse_entries(&reply).map_err(|e| EventBusError::consume(topic, e))?;

        let mut events = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry.data().map(|data| self.codec.decode(data)) {
                Some(Ok(event)) => events.push(event),
                Some(Err(err)) => warn!(stream_key, entry_id = %entry.id, error = %err, "skipping undecodable entry"),
                None => warn!(stream_key, entry_id = %entry.id, "skipping entry without data field"),
            }
        }
        Ok(events)
    }

    async fn close(&self) -> EventBusResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.send_replace(true);

        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for task in tasks {
            if let Err(err) = task.await {
                error!(adapter = ADAPTER_NAME, error = %err, "read loop ended abnormally");
            }
        }
        self.publisher.lock().await.take();
        info!(adapter = ADAPTER_NAME, "event bus closed");
        Ok(())
    }
}

/// A single consumer of a group, reading on its own connection.
struct ReadLoop {
    conn: ConnectionManager,
    stream_key: String,
    topic: String,
    group: String,
    consumer: String,
    handler: SharedHandler,
    hooks: HookSet,
    codec: Arc<dyn Codec>,
    config: Arc<RedisStreamsConfig>,
    shutdown: watch::Receiver<bool>,
    _permit: OwnedSemaphorePermit,
}

impl ReadLoop {
    async fn run(mut self) {
        let started = Instant::now();
        let mut last_pending_read = started;
        let mut last_claim = started;
        let mut claim_cursor = "0-0".to_string();

        debug!(stream_key = %self.stream_key, consumer = %self.consumer, "read loop started");
        while !*self.shutdown.borrow() {
            if last_pending_read.elapsed() >= self.config.redelivery_delay {
                last_pending_read = Instant::now();
                match self.read_group("0", None).await {
                    Ok(entries) => self.process(entries).await,
                    Err(e) => self.read_failed(e).await,
                }
            }

            if last_claim.elapsed() >= self.config.claim_interval {
                last_claim = Instant::now();
                match self.autoclaim(&claim_cursor).await {
                    Ok((cursor, entries)) => {
                        claim_cursor = cursor;
                        if !entries.is_empty() {
                            info!(
                                stream_key = %self.stream_key,
                                consumer = %self.consumer,
                                claimed = entries.len(),
                                "claimed idle pending entries"
                            );
                        }
                        self.process(entries).await;
                    }
                    Err(e) => self.read_failed(e).await,
                }
            }

            let mut shutdown = self.shutdown.clone();
            let block = Some(self.config.block_time);
            let read = tokio::select! {
                _ = shutdown.changed() => break,
                read = self.read_group(">", block) => read,
            };
            match read {
                Ok(entries) => self.process(entries).await,
                Err(e) => self.read_failed(e).await,
            }
        }
        debug!(stream_key = %self.stream_key, consumer = %self.consumer, "read loop stopped");
    }

    async fn read_group(
        &mut self,
        id: &str,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, RedisStreamsError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(self.config.prefetch_count);
        let mut timeout = self.config.connection.operation_timeout;
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(block.as_millis() as u64);
            timeout += block;
        }
        cmd.arg("STREAMS").arg(&self.stream_key).arg(id);

        let reply = query(&cmd, &mut self.conn, "XREADGROUP", timeout).await?;
        parse_read_reply(&reply)
    }

    async fn autoclaim(
        &mut self,
        cursor: &str,
    ) -> Result<(String, Vec<StreamEntry>), RedisStreamsError> {
        let mut cmd = redis::cmd("XAUTOCLAIM");
        cmd.arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.config.claim_min_idle.as_millis() as u64)
            .arg(cursor)
            .arg("COUNT")
            .arg(self.config.prefetch_count);
        let reply = query(
            &cmd,
            &mut self.conn,
            "XAUTOCLAIM",
            self.config.connection.operation_timeout,
        )
        .await?;
        parse_autoclaim_reply(&reply)
    }

    async fn process(&mut self, entries: Vec<StreamEntry>) {
        for entry in entries {
            let decoded = match entry.data() {
                Some(data) => self.codec.decode(data).map_err(|e| e.to_string()),
                None => Err(format!("entry has no '{DATA_FIELD}' field")),
            };
            let event = match decoded {
                Ok(event) => event,
                Err(cause) => {
                    let err = EventBusError::consume(&self.topic, format!("entry {}: {cause}", entry.id));
                    self.hooks.consume_error(&err);
                    error!(
                        stream_key = %self.stream_key,
                        entry_id = %entry.id,
                        error = %err,
                        "undecodable stream entry; acknowledging it"
                    );
                    self.ack(&entry.id).await;
                    continue;
                }
            };

            match deliver(self.handler.as_ref(), event, &self.group, &self.hooks).await {
                Delivery::Ack => self.ack(&entry.id).await,
                Delivery::Nack(_) => debug!(
                    stream_key = %self.stream_key,
                    entry_id = %entry.id,
                    "entry left pending for redelivery"
                ),
            }
        }
    }

    async fn ack(&mut self, entry_id: &str) {
        let mut cmd = redis::cmd("XACK");
        cmd.arg(&self.stream_key).arg(&self.group).arg(entry_id);
        if let Err(e) = query(&cmd, &mut self.conn, "XACK", self.config.connection.operation_timeout).await {
            // Stays pending; redelivered on the next pending read.
            error!(stream_key = %self.stream_key, entry_id, error = %e, "failed to acknowledge entry");
        }
    }

    async fn read_failed(&mut self, err: RedisStreamsError) {
        let err = EventBusError::consume(&self.topic, err);
        self.hooks.consume_error(&err);
        error!(stream_key = %self.stream_key, consumer = %self.consumer, error = %err, "stream read failed");

        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = shutdown.changed() => {}
            _ = tokio::time::sleep(self.config.connection.retry_delay) => {}
        }
    }
}
