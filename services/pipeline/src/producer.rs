//! Kafka batch publisher.
//!
//! Batches are published as JSON on the frames topic, keyed by batch id, and
//! the send waits for broker acknowledgment up to a bounded timeout.

use crate::config::KafkaConfig;
use crate::message::Batch;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Errors that can occur during message production
#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("Failed to create producer: {0}")]
    CreationError(String),

    #[error("Failed to serialize message: {0}")]
    SerializationError(String),

    #[error("Failed to send message to topic {topic}: {message}")]
    SendError { topic: String, message: String },

    #[error("Producer timeout after {0:?}")]
    Timeout(Duration),
}

/// Result of a successful message delivery
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryResult {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
}

/// Destination for completed batches
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Publish a batch and wait for acknowledgment
    async fn publish(&self, batch: &Batch) -> Result<DeliveryResult, ProducerError>;

    /// Hand a batch that could not be delivered or processed to the dead-letter topic
    async fn dead_letter(&self, batch: &Batch, reason: &str)
        -> Result<DeliveryResult, ProducerError>;

    /// Flush pending messages
    fn flush(&self, timeout: Duration) -> Result<(), ProducerError>;
}

/// Message to be sent to Kafka
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub topic: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl OutgoingMessage {
    /// Create a new outgoing message with a JSON payload
    pub fn new_json<T: serde::Serialize>(
        topic: impl Into<String>,
        message: &T,
    ) -> Result<Self, ProducerError> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| ProducerError::SerializationError(e.to_string()))?;
        Ok(Self {
            topic: topic.into(),
            key: None,
            payload,
            headers: Vec::new(),
        })
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_message_type(self, msg_type: impl Into<String>) -> Self {
        self.with_header("message-type", msg_type)
    }

    fn owned_headers(&self) -> OwnedHeaders {
        self.headers
            .iter()
            .fold(OwnedHeaders::new(), |headers, (key, value)| {
                headers.insert(Header {
                    key: key.as_str(),
                    value: Some(value.as_str()),
                })
            })
    }
}

/// Build the frames-topic message for a batch
pub fn batch_message(topic: &str, batch: &Batch) -> Result<OutgoingMessage, ProducerError> {
    Ok(OutgoingMessage::new_json(topic, batch)?
        .with_key(batch.batch_id.to_string())
        .with_message_type("frame_batch")
        .with_header("frame-count", batch.len().to_string()))
}

/// Build the dead-letter envelope for a batch
pub fn dead_letter_message(
    dlq_topic: &str,
    original_topic: &str,
    batch: &Batch,
    reason: &str,
) -> Result<OutgoingMessage, ProducerError> {
    let original = serde_json::to_vec(batch)
        .map_err(|e| ProducerError::SerializationError(e.to_string()))?;

    let envelope = serde_json::json!({
        "original_topic": original_topic,
        "batch_id": batch.batch_id,
        "reason": reason,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "payload_base64": STANDARD.encode(original),
    });

    Ok(OutgoingMessage::new_json(dlq_topic, &envelope)?
        .with_key(Uuid::new_v4().to_string())
        .with_message_type("dead_letter")
        .with_header("original-topic", original_topic)
        .with_header("error-reason", reason))
}

/// Kafka-backed [`BatchSink`]
pub struct KafkaBatchPublisher {
    producer: FutureProducer,
    config: KafkaConfig,
    ack_timeout: Duration,
}

impl KafkaBatchPublisher {
    /// Create a publisher that waits up to `ack_timeout` for each delivery
    pub fn new(config: KafkaConfig, ack_timeout: Duration) -> Result<Self, ProducerError> {
        info!(
            brokers = %config.bootstrap_servers,
            topic = %config.topics.frames,
            "Creating Kafka producer"
        );

        let producer: FutureProducer = config
            .build_producer_config()
            .create()
            .map_err(|e| ProducerError::CreationError(e.to_string()))?;

        Ok(Self {
            producer,
            config,
            ack_timeout,
        })
    }

    #[instrument(skip(self, message), fields(topic = %message.topic, key = ?message.key))]
    async fn send(&self, message: OutgoingMessage) -> Result<DeliveryResult, ProducerError> {
        let topic = message.topic.clone();
        let key = message.key.clone();

        let mut record = FutureRecord::to(&topic)
            .payload(&message.payload)
            .headers(message.owned_headers());

        if let Some(ref k) = key {
            record = record.key(k);
        }

        debug!(size = message.payload.len(), "Sending message");

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.ack_timeout))
            .await
            .map_err(|(e, _)| ProducerError::SendError {
                topic: topic.clone(),
                message: e.to_string(),
            })?;

        debug!(partition, offset, "Message delivered");

        Ok(DeliveryResult {
            topic,
            partition,
            offset,
            key,
        })
    }
}

#[async_trait]
impl BatchSink for KafkaBatchPublisher {
    async fn publish(&self, batch: &Batch) -> Result<DeliveryResult, ProducerError> {
        let message = batch_message(&self.config.topics.frames, batch)?;
        let result = self.send(message).await?;
        metrics::counter!("pipeline.batches_published").increment(1);
        Ok(result)
    }

    async fn dead_letter(
        &self,
        batch: &Batch,
        reason: &str,
    ) -> Result<DeliveryResult, ProducerError> {
        let message = dead_letter_message(
            &self.config.topics.dead_letter_queue,
            &self.config.topics.frames,
            batch,
            reason,
        )?;
        let result = self.send(message).await?;
        metrics::counter!("pipeline.batches_dead_lettered").increment(1);
        Ok(result)
    }

    fn flush(&self, timeout: Duration) -> Result<(), ProducerError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|_| ProducerError::Timeout(timeout))
    }
}

impl Drop for KafkaBatchPublisher {
    fn drop(&mut self) {
        info!("Shutting down Kafka producer");
        if let Err(e) = self.producer.flush(Timeout::After(Duration::from_secs(5))) {
            warn!("Failed to flush producer on shutdown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Frame;

    fn sample_batch() -> Batch {
        Batch {
            batch_id: 1_700_000_000_000,
            frames: vec![Frame::from_jpeg(0, 1.5, 4, 4, b"jpeg")],
        }
    }

    #[test]
    fn test_outgoing_message_builder() {
        let message = OutgoingMessage {
            topic: "test".to_string(),
            key: None,
            payload: vec![1, 2, 3],
            headers: vec![],
        }
        .with_key("my-key")
        .with_header("header1", "value1")
        .with_message_type("frame_batch");

        assert_eq!(message.key, Some("my-key".to_string()));
        assert_eq!(message.headers.len(), 2);
    }

    #[test]
    fn test_batch_message_is_keyed_by_batch_id() {
        let message = batch_message("video-ingest", &sample_batch()).unwrap();

        assert_eq!(message.topic, "video-ingest");
        assert_eq!(message.key.as_deref(), Some("1700000000000"));
        let decoded: Batch = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(decoded, sample_batch());
    }

    #[test]
    fn test_dead_letter_envelope() {
        let message =
            dead_letter_message("video-ingest.dlq", "video-ingest", &sample_batch(), "timeout")
                .unwrap();

        assert_eq!(message.topic, "video-ingest.dlq");
        let envelope: serde_json::Value = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(envelope["original_topic"], "video-ingest");
        assert_eq!(envelope["batch_id"], 1_700_000_000_000i64);
        assert_eq!(envelope["reason"], "timeout");

        let original = STANDARD
            .decode(envelope["payload_base64"].as_str().unwrap())
            .unwrap();
        let batch: Batch = serde_json::from_slice(&original).unwrap();
        assert_eq!(batch.batch_id, 1_700_000_000_000);
    }
}
