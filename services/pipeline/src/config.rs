//! Kafka configuration shared by the ingest and storage services.
//!
//! Deserialised from the `kafka` section of each service's configuration.
//! Every section writes its own librdkafka properties; the producer and
//! consumer builders stack the sections they need on a common base.

use rdkafka::config::ClientConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// `security.protocol`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plaintext => "plaintext",
            Self::Ssl => "ssl",
            Self::SaslPlaintext => "sasl_plaintext",
            Self::SaslSsl => "sasl_ssl",
        }
    }

    fn uses_sasl(self) -> bool {
        matches!(self, Self::SaslPlaintext | Self::SaslSsl)
    }
}

/// `sasl.mechanism`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SaslMechanism {
    #[default]
    Plain,
    ScramSha256,
    ScramSha512,
}

impl SaslMechanism {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::ScramSha256 => "SCRAM-SHA-256",
            Self::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

/// TLS material; paths are handed to librdkafka unchanged
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SslConfig {
    pub ca_location: Option<String>,
    pub certificate_location: Option<String>,
    pub key_location: Option<String>,
    pub key_password: Option<String>,
    pub enable_verification: bool,
}

impl Default for SslConfig {
    fn default() -> Self {
        Self {
            ca_location: None,
            certificate_location: None,
            key_location: None,
            key_password: None,
            enable_verification: true,
        }
    }
}

impl SslConfig {
    fn apply(&self, client: &mut ClientConfig) {
        let paths = [
            ("ssl.ca.location", &self.ca_location),
            ("ssl.certificate.location", &self.certificate_location),
            ("ssl.key.location", &self.key_location),
            ("ssl.key.password", &self.key_password),
        ];
        for (property, value) in paths {
            if let Some(value) = value {
                client.set(property, value);
            }
        }
        if !self.enable_verification {
            client.set("enable.ssl.certificate.verification", "false");
        }
    }
}

/// Credentials, only sent when the protocol is one of the SASL variants
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SaslConfig {
    pub mechanism: SaslMechanism,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl SaslConfig {
    fn apply(&self, client: &mut ClientConfig) {
        client.set("sasl.mechanism", self.mechanism.as_str());
        if let Some(username) = &self.username {
            client.set("sasl.username", username);
        }
        if let Some(password) = &self.password {
            client.set("sasl.password", password);
        }
    }
}

/// Broker acknowledgment and librdkafka-level produce retries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliabilityConfig {
    pub retries: u32,
    pub retry_backoff_ms: u64,
    pub request_timeout_ms: u64,
    /// `0`, `1` or `all`
    pub acks: String,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            retries: 5,
            retry_backoff_ms: 100,
            request_timeout_ms: 30_000,
            acks: "all".to_string(),
        }
    }
}

impl ReliabilityConfig {
    fn apply(&self, client: &mut ClientConfig) {
        client
            .set("retries", self.retries.to_string())
            .set("retry.backoff.ms", self.retry_backoff_ms.to_string())
            .set("request.timeout.ms", self.request_timeout_ms.to_string())
            .set("acks", &self.acks);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    pub linger_ms: u64,
    /// none, gzip, snappy, lz4 or zstd
    pub compression_type: String,
    /// A batch of 25 JPEG frames is well over the broker's 1 MiB default
    pub message_max_bytes: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            linger_ms: 500,
            compression_type: "none".to_string(),
            message_max_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub group_id: String,
    /// earliest, latest or none
    pub auto_offset_reset: String,
    pub enable_auto_commit: bool,
    pub session_timeout_ms: u64,
    /// Must exceed the slowest inference round trip
    pub max_poll_interval_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: "inference-consumer".to_string(),
            auto_offset_reset: "earliest".to_string(),
            enable_auto_commit: false,
            session_timeout_ms: 30_000,
            max_poll_interval_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    /// Frame batches from ingest to storage
    pub frames: String,
    pub dead_letter_queue: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            frames: "video-ingest".to_string(),
            dead_letter_queue: "video-ingest.dlq".to_string(),
        }
    }
}

/// The `kafka` section; only `bootstrap_servers` has no default
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Comma-separated `host:port` list
    pub bootstrap_servers: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub security_protocol: SecurityProtocol,
    #[serde(default)]
    pub ssl: SslConfig,
    #[serde(default)]
    pub sasl: SaslConfig,
    #[serde(default)]
    pub reliability: ReliabilityConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub topics: TopicConfig,
    /// Raw librdkafka properties, applied after everything else
    #[serde(default)]
    pub extra_properties: HashMap<String, String>,
}

fn default_client_id() -> String {
    "vidstream".to_string()
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self::new("localhost:9092")
    }
}

impl KafkaConfig {
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            client_id: default_client_id(),
            security_protocol: SecurityProtocol::default(),
            ssl: SslConfig::default(),
            sasl: SaslConfig::default(),
            reliability: ReliabilityConfig::default(),
            producer: ProducerConfig::default(),
            consumer: ConsumerConfig::default(),
            topics: TopicConfig::default(),
            extra_properties: HashMap::new(),
        }
    }

    /// Client properties for [`crate::KafkaBatchPublisher`]
    pub fn build_producer_config(&self) -> ClientConfig {
        self.client_config(|client| {
            self.reliability.apply(client);
            client
                .set("linger.ms", self.producer.linger_ms.to_string())
                .set("compression.type", &self.producer.compression_type)
                .set("message.max.bytes", self.producer.message_max_bytes.to_string());
        })
    }

    /// Client properties for [`crate::KafkaBatchConsumer`]
    pub fn build_consumer_config(&self) -> ClientConfig {
        let consumer = &self.consumer;
        self.client_config(|client| {
            client
                .set("group.id", &consumer.group_id)
                .set("auto.offset.reset", &consumer.auto_offset_reset)
                .set("enable.auto.commit", consumer.enable_auto_commit.to_string())
                // Positions are stored by `BatchSource::commit` once a batch is handled
                .set("enable.auto.offset.store", "false")
                .set("session.timeout.ms", consumer.session_timeout_ms.to_string())
                .set("max.poll.interval.ms", consumer.max_poll_interval_ms.to_string())
                .set("fetch.message.max.bytes", self.producer.message_max_bytes.to_string());
        })
    }

    fn client_config(&self, role: impl FnOnce(&mut ClientConfig)) -> ClientConfig {
        let mut client = ClientConfig::new();
        client
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("client.id", &self.client_id)
            .set("security.protocol", self.security_protocol.as_str());

        self.ssl.apply(&mut client);
        if self.security_protocol.uses_sasl() {
            self.sasl.apply(&mut client);
        }
        role(&mut client);

        for (property, value) in &self.extra_properties {
            client.set(property, value);
        }
        client
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.reliability.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("kafka.bootstrap_servers", self.bootstrap_servers.trim()),
            ("kafka.consumer.group_id", self.consumer.group_id.trim()),
            ("kafka.topics.frames", self.topics.frames.trim()),
        ];
        if let Some((key, _)) = required.iter().find(|(_, value)| value.is_empty()) {
            return Err(ConfigError::MissingRequired(key.to_string()));
        }

        if self.security_protocol.uses_sasl() && self.sasl.username.is_none() {
            return Err(ConfigError::MissingRequired(format!(
                "kafka.sasl.username (required for {})",
                self.security_protocol.as_str()
            )));
        }

        if self.producer.message_max_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "kafka.producer.message_max_bytes".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = KafkaConfig::default();
        assert_eq!(config.bootstrap_servers, "localhost:9092");
        assert_eq!(config.topics.frames, "video-ingest");
        assert_eq!(config.consumer.group_id, "inference-consumer");
        assert_eq!(config.producer.linger_ms, 500);
        assert_eq!(config.reliability.retries, 5);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_producer_properties() {
        let client = KafkaConfig::new("broker:9092").build_producer_config();

        assert_eq!(client.get("bootstrap.servers"), Some("broker:9092"));
        assert_eq!(client.get("linger.ms"), Some("500"));
        assert_eq!(client.get("retries"), Some("5"));
        assert_eq!(client.get("acks"), Some("all"));
        assert_eq!(client.get("message.max.bytes"), Some("10485760"));
        assert_eq!(client.get("sasl.mechanism"), None);
        assert_eq!(client.get("group.id"), None);
    }

    #[test]
    fn test_consumer_properties() {
        let client = KafkaConfig::new("localhost:9092").build_consumer_config();

        assert_eq!(client.get("group.id"), Some("inference-consumer"));
        assert_eq!(client.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(client.get("enable.auto.commit"), Some("false"));
        assert_eq!(client.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(client.get("fetch.message.max.bytes"), Some("10485760"));
        assert_eq!(client.get("acks"), None);
    }

    #[test]
    fn test_security_properties() {
        let mut config = KafkaConfig::new("localhost:9092");
        config.security_protocol = SecurityProtocol::SaslSsl;
        config.sasl.mechanism = SaslMechanism::ScramSha512;
        config.sasl.username = Some("svc".to_string());
        config.ssl.ca_location = Some("/etc/kafka/ca.pem".to_string());
        config
            .extra_properties
            .insert("client.id".to_string(), "override".to_string());

        let client = config.build_consumer_config();
        assert_eq!(client.get("security.protocol"), Some("sasl_ssl"));
        assert_eq!(client.get("sasl.mechanism"), Some("SCRAM-SHA-512"));
        assert_eq!(client.get("sasl.username"), Some("svc"));
        assert_eq!(client.get("ssl.ca.location"), Some("/etc/kafka/ca.pem"));
        assert_eq!(client.get("client.id"), Some("override"));
    }

    #[test]
    fn test_missing_required_values() {
        assert!(matches!(
            KafkaConfig::new("  ").validate(),
            Err(ConfigError::MissingRequired(key)) if key == "kafka.bootstrap_servers"
        ));

        let mut config = KafkaConfig::default();
        config.security_protocol = SecurityProtocol::SaslPlaintext;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired(_))
        ));

        let mut config = KafkaConfig::default();
        config.producer.message_max_bytes = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let config: KafkaConfig = serde_json::from_str(
            r#"{
                "bootstrap_servers": "kafka:9092",
                "topics": {"frames": "cam-1"},
                "consumer": {"group_id": "annotators"}
            }"#,
        )
        .unwrap();
        assert_eq!(config.topics.frames, "cam-1");
        assert_eq!(config.topics.dead_letter_queue, "video-ingest.dlq");
        assert_eq!(config.consumer.group_id, "annotators");
        assert_eq!(config.consumer.max_poll_interval_ms, 300_000);
        assert_eq!(config.security_protocol, SecurityProtocol::Plaintext);
        assert!(config.ssl.enable_verification);
    }
}
