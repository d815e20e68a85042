//! Adapter configuration.
//!
//! Configuration is plain data, constructed explicitly and handed to an
//! adapter at creation time. `from_env` helpers read the conventional
//! environment variables through a [`SecretSource`] so credentials never have
//! to live in code.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EventBusError, EventBusResult};

/// Credential material; `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Debug for Secret {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("Secret(**redacted**)")
    }
}

/// Where configuration values and credentials come from.
pub trait SecretSource {
    fn get(&self, name: &str) -> Option<String>;
}

/// Process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSecretSource;

impl SecretSource for EnvSecretSource {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.is_empty())
    }
}

impl SecretSource for HashMap<String, String> {
    fn get(&self, name: &str) -> Option<String> {
        HashMap::get(self, name).cloned()
    }
}

fn parse_var<T>(source: &dyn SecretSource, name: &str) -> EventBusResult<Option<T>>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    source
        .get(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| EventBusError::config(format!("{name}={raw}: {e}")))
        })
        .transpose()
}

fn parse_millis(source: &dyn SecretSource, name: &str) -> EventBusResult<Option<Duration>> {
    Ok(parse_var::<u64>(source, name)?.map(Duration::from_millis))
}

/// Durations are written as integer milliseconds in config files.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Connection settings shared by networked adapters.
///
/// `max_retries`/`retry_delay` bound transport-level reconnects and write
/// retries; they are unrelated to handler retry policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub endpoints: Vec<String>,
    pub username: Option<String>,
    pub password: Option<Secret>,
    pub max_connections: usize,
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    #[serde(with = "millis")]
    pub operation_timeout: Duration,
    pub max_retries: u32,
    #[serde(with = "millis")]
    pub retry_delay: Duration,
    pub enable_metrics: bool,
    pub enable_tracing: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            username: None,
            password: None,
            max_connections: 16,
            connect_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            enable_metrics: true,
            enable_tracing: true,
        }
    }
}

impl ConnectionSettings {
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoints.push(endpoint.into());
        self
    }

    pub fn primary_endpoint(&self) -> Option<&str> {
        self.endpoints.first().map(String::as_str)
    }

    /// Read `{PREFIX}_MAX_CONNECTIONS`, `{PREFIX}_CONNECT_TIMEOUT_MS`,
    /// `{PREFIX}_OPERATION_TIMEOUT_MS`, `{PREFIX}_MAX_RETRIES` and
    /// `{PREFIX}_RETRY_DELAY_MS` on top of `self`.
    fn overlay(mut self, source: &dyn SecretSource, prefix: &str) -> EventBusResult<Self> {
        if let Some(v) = parse_var(source, &format!("{prefix}_MAX_CONNECTIONS"))? {
            self.max_connections = v;
        }
        if let Some(v) = parse_millis(source, &format!("{prefix}_CONNECT_TIMEOUT_MS"))? {
            self.connect_timeout = v;
        }
        if let Some(v) = parse_millis(source, &format!("{prefix}_OPERATION_TIMEOUT_MS"))? {
            self.operation_timeout = v;
        }
        if let Some(v) = parse_var(source, &format!("{prefix}_MAX_RETRIES"))? {
            self.max_retries = v;
        }
        if let Some(v) = parse_millis(source, &format!("{prefix}_RETRY_DELAY_MS"))? {
            self.retry_delay = v;
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryBusConfig {
    /// Capacity of each topic's queue; publishing to a full queue fails.
    pub queue_capacity: usize,
    /// Buffer between a topic's queue and each subscription.
    pub subscriber_buffer: usize,
    /// Event ids remembered per consumer group for deduplication.
    pub dedup_capacity: usize,
    /// Idle wake-up interval of consumer loops.
    #[serde(with = "millis")]
    pub poll_interval: Duration,
}

impl Default for MemoryBusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            subscriber_buffer: 256,
            dedup_capacity: 100_000,
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl MemoryBusConfig {
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn validate(&self) -> EventBusResult<()> {
        if self.queue_capacity == 0 || self.subscriber_buffer == 0 {
            return Err(EventBusError::config(
                "memory bus queue and subscriber buffer capacities must be at least 1",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisStreamsConfig {
    pub connection: ConnectionSettings,
    /// Prepended to every topic to form the stream key.
    pub key_prefix: String,
    /// Approximate `MAXLEN` applied on every `XADD`.
    pub max_stream_length: usize,
    /// `BLOCK` time of `XREADGROUP`.
    #[serde(with = "millis")]
    pub block_time: Duration,
    /// `COUNT` of `XREADGROUP`.
    pub prefetch_count: usize,
    /// Pending entries idle for longer than this are claimed from other consumers.
    #[serde(with = "millis")]
    pub claim_min_idle: Duration,
    #[serde(with = "millis")]
    pub claim_interval: Duration,
    /// Pause before re-reading this consumer's own unacknowledged entries.
    #[serde(with = "millis")]
    pub redelivery_delay: Duration,
}

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

impl Default for RedisStreamsConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionSettings::default().with_endpoint(DEFAULT_REDIS_URL),
            key_prefix: "ispforge:".to_string(),
            max_stream_length: 100_000,
            block_time: Duration::from_millis(1000),
            prefetch_count: 10,
            claim_min_idle: Duration::from_secs(60),
            claim_interval: Duration::from_secs(30),
            redelivery_delay: Duration::from_millis(1000),
        }
    }
}

impl RedisStreamsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            connection: ConnectionSettings {
                endpoints: vec![url.into()],
                ..ConnectionSettings::default()
            },
            ..Self::default()
        }
    }

    pub fn from_env() -> EventBusResult<Self> {
        Self::from_source(&EnvSecretSource)
    }

    /// `REDIS_URL`, `REDIS_USERNAME`, `REDIS_PASSWORD`, `REDIS_KEY_PREFIX`,
    /// `REDIS_STREAM_MAXLEN`, `REDIS_BLOCK_MS`, `REDIS_PREFETCH_COUNT` plus the
    /// shared `REDIS_*` connection settings.
    pub fn from_source(source: &dyn SecretSource) -> EventBusResult<Self> {
        let mut config = Self::new(
            source
                .get("REDIS_URL")
                .unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
        );
        config.connection = config.connection.overlay(source, "REDIS")?;
        config.connection.username = source.get("REDIS_USERNAME");
        config.connection.password = source.get("REDIS_PASSWORD").map(Secret::new);
        if let Some(prefix) = source.get("REDIS_KEY_PREFIX") {
            config.key_prefix = prefix;
        }
        if let Some(v) = parse_var(source, "REDIS_STREAM_MAXLEN")? {
            config.max_stream_length = v;
        }
        if let Some(v) = parse_millis(source, "REDIS_BLOCK_MS")? {
            config.block_time = v;
        }
        if let Some(v) = parse_var(source, "REDIS_PREFETCH_COUNT")? {
            config.prefetch_count = v;
        }
        Ok(config)
    }

    pub fn stream_key(&self, topic: &str) -> String {
        format!("{}{}", self.key_prefix, topic)
    }

    pub fn validate(&self) -> EventBusResult<()> {
        if self.connection.primary_endpoint().is_none() {
            return Err(EventBusError::config("redis endpoint is required"));
        }
        if self.prefetch_count == 0 {
            return Err(EventBusError::config("prefetch_count must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "plaintext",
            SecurityProtocol::Ssl => "ssl",
            SecurityProtocol::SaslPlaintext => "sasl_plaintext",
            SecurityProtocol::SaslSsl => "sasl_ssl",
        }
    }

    pub fn uses_sasl(&self) -> bool {
        matches!(self, SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl)
    }
}

impl FromStr for SecurityProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plaintext" => Ok(Self::Plaintext),
            "ssl" => Ok(Self::Ssl),
            "sasl_plaintext" => Ok(Self::SaslPlaintext),
            "sasl_ssl" => Ok(Self::SaslSsl),
            other => Err(format!("unknown security protocol '{other}'")),
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    None,
    Gzip,
    Snappy,
    #[default]
    Lz4,
    Zstd,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Snappy => "snappy",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        }
    }
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "gzip" => Ok(Self::Gzip),
            "snappy" => Ok(Self::Snappy),
            "lz4" => Ok(Self::Lz4),
            "zstd" => Ok(Self::Zstd),
            other => Err(format!("unknown compression '{other}'")),
        }
    }
}

/// Producer acknowledgment level.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Acks {
    None,
    Leader,
    #[default]
    All,
}

impl Acks {
    pub fn as_str(&self) -> &'static str {
        match self {
            Acks::None => "0",
            Acks::Leader => "1",
            Acks::All => "all",
        }
    }
}

impl FromStr for Acks {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "0" | "none" => Ok(Self::None),
            "1" | "leader" => Ok(Self::Leader),
            "all" | "-1" => Ok(Self::All),
            other => Err(format!("unknown acks level '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    pub connection: ConnectionSettings,
    pub client_id: String,
    pub security_protocol: SecurityProtocol,
    pub sasl_mechanism: Option<String>,
    pub compression: Compression,
    /// Producer `batch.size` in bytes.
    pub batch_size: usize,
    /// Producer `linger.ms`.
    #[serde(with = "millis")]
    pub linger: Duration,
    pub acks: Acks,
    /// librdkafka-internal producer retries (`retries`).
    pub producer_retries: u32,
    #[serde(with = "millis")]
    pub session_timeout: Duration,
    /// Raw librdkafka properties applied last.
    pub extra: BTreeMap<String, String>,
}

pub const DEFAULT_KAFKA_BOOTSTRAP: &str = "localhost:9092";

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionSettings::default().with_endpoint(DEFAULT_KAFKA_BOOTSTRAP),
            client_id: "ispforge".to_string(),
            security_protocol: SecurityProtocol::Plaintext,
            sasl_mechanism: None,
            compression: Compression::Lz4,
            batch_size: 16_384,
            linger: Duration::from_millis(5),
            acks: Acks::All,
            producer_retries: 5,
            session_timeout: Duration::from_secs(30),
            extra: BTreeMap::new(),
        }
    }
}

impl KafkaConfig {
    pub fn new(bootstrap_servers: impl AsRef<str>) -> Self {
        Self {
            connection: ConnectionSettings {
                endpoints: split_endpoints(bootstrap_servers.as_ref()),
                ..ConnectionSettings::default()
            },
            ..Self::default()
        }
    }

    pub fn from_env() -> EventBusResult<Self> {
        Self::from_source(&EnvSecretSource)
    }

    /// `KAFKA_BOOTSTRAP_SERVERS`, `KAFKA_CLIENT_ID`, `KAFKA_SECURITY_PROTOCOL`,
    /// `KAFKA_SASL_MECHANISM`, `KAFKA_SASL_USERNAME`, `KAFKA_SASL_PASSWORD`,
    /// `KAFKA_COMPRESSION`, `KAFKA_BATCH_SIZE`, `KAFKA_LINGER_MS`, `KAFKA_ACKS`,
    /// `KAFKA_PRODUCER_RETRIES` plus the shared `KAFKA_*` connection settings.
    pub fn from_source(source: &dyn SecretSource) -> EventBusResult<Self> {
        let mut config = Self::new(
            source
                .get("KAFKA_BOOTSTRAP_SERVERS")
                .unwrap_or_else(|| DEFAULT_KAFKA_BOOTSTRAP.to_string()),
        );
        config.connection = config.connection.overlay(source, "KAFKA")?;
        config.connection.username = source.get("KAFKA_SASL_USERNAME");
        config.connection.password = source.get("KAFKA_SASL_PASSWORD").map(Secret::new);
        if let Some(client_id) = source.get("KAFKA_CLIENT_ID") {
            config.client_id = client_id;
        }
        if let Some(v) = parse_var(source, "KAFKA_SECURITY_PROTOCOL")? {
            config.security_protocol = v;
        }
        config.sasl_mechanism = source.get("KAFKA_SASL_MECHANISM");
        if let Some(v) = parse_var(source, "KAFKA_COMPRESSION")? {
            config.compression = v;
        }
        if let Some(v) = parse_var(source, "KAFKA_BATCH_SIZE")? {
            config.batch_size = v;
        }
        if let Some(v) = parse_millis(source, "KAFKA_LINGER_MS")? {
            config.linger = v;
        }
        if let Some(v) = parse_var(source, "KAFKA_ACKS")? {
            config.acks = v;
        }
        if let Some(v) = parse_var(source, "KAFKA_PRODUCER_RETRIES")? {
            config.producer_retries = v;
        }
        Ok(config)
    }

    pub fn bootstrap_servers(&self) -> String {
        self.connection.endpoints.join(",")
    }

    pub fn validate(&self) -> EventBusResult<()> {
        if self.connection.endpoints.is_empty() {
            return Err(EventBusError::config("kafka bootstrap servers are required"));
        }
        if self.security_protocol.uses_sasl()
            && (self.connection.username.is_none() || self.connection.password.is_none())
        {
            return Err(EventBusError::config(format!(
                "security protocol {} requires SASL username and password",
                self.security_protocol.as_str()
            )));
        }
        Ok(())
    }
}

fn split_endpoints(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Configuration of any registered adapter, tagged by adapter name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "adapter", rename_all = "snake_case")]
pub enum BusConfig {
    Memory(MemoryBusConfig),
    Redis(RedisStreamsConfig),
    Kafka(KafkaConfig),
}

impl BusConfig {
    pub fn adapter_name(&self) -> &'static str {
        match self {
            BusConfig::Memory(_) => "memory",
            BusConfig::Redis(_) => "redis",
            BusConfig::Kafka(_) => "kafka",
        }
    }

    /// Pick the adapter from `EVENT_BUS_ADAPTER` (default `memory`).
    pub fn from_env() -> EventBusResult<Self> {
        Self::from_source(&EnvSecretSource)
    }

    pub fn from_source(source: &dyn SecretSource) -> EventBusResult<Self> {
        let adapter = source
            .get("EVENT_BUS_ADAPTER")
            .unwrap_or_else(|| "memory".to_string());
        match adapter.to_ascii_lowercase().as_str() {
            "memory" => Ok(BusConfig::Memory(MemoryBusConfig::default())),
            "redis" => Ok(BusConfig::Redis(RedisStreamsConfig::from_source(source)?)),
            "kafka" => Ok(BusConfig::Kafka(KafkaConfig::from_source(source)?)),
            other => Err(EventBusError::config(format!("unknown adapter '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn redis_config_reads_overrides() {
        let src = source(&[
            ("REDIS_URL", "redis://cache:6380"),
            ("REDIS_PASSWORD", "hunter2"),
            ("REDIS_STREAM_MAXLEN", "500"),
            ("REDIS_BLOCK_MS", "250"),
            ("REDIS_MAX_RETRIES", "7"),
        ]);
        let config = RedisStreamsConfig::from_source(&src).unwrap();

        assert_eq!(config.connection.primary_endpoint(), Some("redis://cache:6380"));
        assert_eq!(config.max_stream_length, 500);
        assert_eq!(config.block_time, Duration::from_millis(250));
        assert_eq!(config.connection.max_retries, 7);
        assert_eq!(config.connection.password.as_ref().map(Secret::expose), Some("hunter2"));
        assert_eq!(config.stream_key("orders.created"), "ispforge:orders.created");
    }

    #[test]
    fn malformed_values_are_config_errors() {
        let src = source(&[("REDIS_STREAM_MAXLEN", "lots")]);
        let err = RedisStreamsConfig::from_source(&src).unwrap_err();
        assert!(matches!(err, EventBusError::Config(msg) if msg.contains("REDIS_STREAM_MAXLEN")));
    }

    #[test]
    fn kafka_sasl_requires_credentials() {
        let src = source(&[
            ("KAFKA_BOOTSTRAP_SERVERS", "k1:9092, k2:9092"),
            ("KAFKA_SECURITY_PROTOCOL", "SASL_SSL"),
        ]);
        let config = KafkaConfig::from_source(&src).unwrap();
        assert_eq!(config.bootstrap_servers(), "k1:9092,k2:9092");
        assert!(config.validate().is_err());

        let src = source(&[
            ("KAFKA_SECURITY_PROTOCOL", "sasl_ssl"),
            ("KAFKA_SASL_USERNAME", "svc"),
            ("KAFKA_SASL_PASSWORD", "pw"),
            ("KAFKA_COMPRESSION", "zstd"),
            ("KAFKA_ACKS", "1"),
        ]);
        let config = KafkaConfig::from_source(&src).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.compression, Compression::Zstd);
        assert_eq!(config.acks, Acks::Leader);
    }

    #[test]
    fn secrets_are_redacted_in_debug_output() {
        let config = RedisStreamsConfig {
            connection: ConnectionSettings {
                password: Some(Secret::new("hunter2")),
                ..ConnectionSettings::default()
            },
            ..RedisStreamsConfig::default()
        };
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[test]
    fn bus_config_is_tagged_by_adapter() {
        let config: BusConfig = serde_json::from_str(
            r#"{"adapter":"redis","max_stream_length":42,"block_time":200}"#,
        )
        .unwrap();
        match config {
            BusConfig::Redis(redis) => {
                assert_eq!(redis.max_stream_length, 42);
                assert_eq!(redis.block_time, Duration::from_millis(200));
                assert_eq!(redis.key_prefix, "ispforge:");
            }
            other => panic!("unexpected config: {other:?}"),
        }

        let src = source(&[("EVENT_BUS_ADAPTER", "nats")]);
        assert!(BusConfig::from_source(&src).is_err());
    }
}
