//! Kafka batch consumer.
//!
//! Wraps an rdkafka `StreamConsumer` subscribed to the frames topic and hands
//! out decoded [`Batch`]es one at a time. A batch's offset is stored and
//! committed only once the caller reports it handled.

use crate::config::KafkaConfig;
use crate::message::Batch;
use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message as KafkaMessage;
use rdkafka::{Offset, TopicPartitionList};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that can occur during message consumption
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to topics: {0}")]
    SubscriptionError(String),

    #[error("Failed to deserialize message at {topic}[{partition}]@{offset}: {message}")]
    Deserialization {
        topic: String,
        partition: i32,
        offset: i64,
        message: String,
    },

    #[error("Failed to commit offset: {0}")]
    CommitError(String),

    #[error("Consumer poll error: {0}")]
    PollError(String),
}

/// Source of frame batches
#[async_trait]
pub trait BatchSource: Send {
    /// Wait up to `idle_timeout` for the next batch; `Ok(None)` when nothing arrived
    async fn next_batch(&mut self, idle_timeout: Duration) -> Result<Option<Batch>, ConsumerError>;

    /// Commit offsets for everything received so far
    fn commit(&self) -> Result<(), ConsumerError>;
}

/// Where a received message sits in the topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl MessageMetadata {
    /// Offset list that marks this message as consumed
    fn consumed_list(&self) -> Result<TopicPartitionList, ConsumerError> {
        let mut list = TopicPartitionList::new();
        list.add_partition_offset(&self.topic, self.partition, Offset::Offset(self.offset + 1))
            .map_err(|e| ConsumerError::CommitError(e.to_string()))?;
        Ok(list)
    }
}

/// A received message with payload and metadata
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub payload: Vec<u8>,
    pub metadata: MessageMetadata,
}

impl IncomingMessage {
    /// Deserialize the payload as JSON
    pub fn decode_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, ConsumerError> {
        serde_json::from_slice(&self.payload).map_err(|e| ConsumerError::Deserialization {
            topic: self.metadata.topic.clone(),
            partition: self.metadata.partition,
            offset: self.metadata.offset,
            message: e.to_string(),
        })
    }

    pub fn from_kafka<M: KafkaMessage>(msg: &M) -> Self {
        IncomingMessage {
            payload: msg.payload().unwrap_or(&[]).to_vec(),
            metadata: MessageMetadata {
                topic: msg.topic().to_string(),
                partition: msg.partition(),
                offset: msg.offset(),
            },
        }
    }
}

/// Kafka-backed [`BatchSource`].
///
/// Offsets are stored only on [`BatchSource::commit`], so the position of a
/// batch that was received but never committed is not written back, not even
/// by the final commit on drop, and the batch is delivered again.
pub struct KafkaBatchConsumer {
    consumer: StreamConsumer,
    config: KafkaConfig,
    /// Last message handed out and not yet committed
    pending: Option<MessageMetadata>,
}

impl KafkaBatchConsumer {
    /// Create a consumer and subscribe it to the frames topic
    pub fn new(config: KafkaConfig) -> Result<Self, ConsumerError> {
        info!(
            brokers = %config.bootstrap_servers,
            group = %config.consumer.group_id,
            topic = %config.topics.frames,
            "Creating Kafka consumer"
        );

        let consumer: StreamConsumer = config
            .build_consumer_config()
            .create()
            .map_err(|e| ConsumerError::CreationError(e.to_string()))?;

        consumer
            .subscribe(&[config.topics.frames.as_str()])
            .map_err(|e| ConsumerError::SubscriptionError(e.to_string()))?;

        Ok(Self {
            consumer,
            config,
            pending: None,
        })
    }

    /// Store the pending position and, without auto-commit, commit it
    fn commit_pending(&self, mode: CommitMode) -> Result<(), ConsumerError> {
        let Some(position) = &self.pending else {
            return Ok(());
        };

        self.consumer
            .store_offsets(&position.consumed_list()?)
            .map_err(|e| ConsumerError::CommitError(e.to_string()))?;

        if self.config.consumer.enable_auto_commit {
            return Ok(());
        }
        self.consumer
            .commit_consumer_state(mode)
            .map_err(|e| ConsumerError::CommitError(e.to_string()))
    }
}

#[async_trait]
impl BatchSource for KafkaBatchConsumer {
    async fn next_batch(&mut self, idle_timeout: Duration) -> Result<Option<Batch>, ConsumerError> {
        let received = match tokio::time::timeout(idle_timeout, self.consumer.recv()).await {
            Err(_) => return Ok(None),
            Ok(Err(e)) => return Err(ConsumerError::PollError(e.to_string())),
            Ok(Ok(message)) => IncomingMessage::from_kafka(&message),
        };

        debug!(
            topic = %received.metadata.topic,
            partition = received.metadata.partition,
            offset = received.metadata.offset,
            "Received message"
        );

        self.pending = Some(received.metadata.clone());

        match received.decode_json::<Batch>() {
            Ok(batch) => Ok(Some(batch)),
            Err(e) => {
                // Poison messages are skipped for good.
                if let Err(commit_error) = self.commit_pending(CommitMode::Async) {
                    warn!(error = %commit_error, "Failed to commit past undecodable message");
                }
                Err(e)
            }
        }
    }

    fn commit(&self) -> Result<(), ConsumerError> {
        self.commit_pending(CommitMode::Async)
    }
}

impl Drop for KafkaBatchConsumer {
    fn drop(&mut self) {
        if self.config.consumer.enable_auto_commit {
            return;
        }
        // Commits stored positions only; an unhandled pending batch stays uncommitted
        if let Err(e) = self.consumer.commit_consumer_state(CommitMode::Sync) {
            warn!("Failed to commit on shutdown: {}", e);
        }
    }
}
