//! Vidstream Pipeline - shared plumbing for the video annotation services
//!
//! This library holds everything the ingest, inference and storage services
//! agree on:
//!
//! - The JSON wire model for frame batches and inference results
//! - Kafka configuration, the batch publisher and the batch consumer
//! - Failure policy, capped exponential backoff and cancellation
//! - Logging and metrics bootstrap
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use vidstream_pipeline::{Batch, BatchSink, KafkaBatchPublisher, KafkaConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let publisher = KafkaBatchPublisher::new(
//!         KafkaConfig::new("localhost:9092"),
//!         Duration::from_secs(10),
//!     )?;
//!     publisher.publish(&Batch::new(Vec::new())).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod consumer;
pub mod message;
pub mod producer;
pub mod retry;
pub mod shutdown;
pub mod telemetry;

pub use config::{
    ConfigError, ConsumerConfig, KafkaConfig, ProducerConfig, ReliabilityConfig, SaslConfig,
    SaslMechanism, SecurityProtocol, SslConfig, TopicConfig,
};
pub use consumer::{BatchSource, ConsumerError, IncomingMessage, KafkaBatchConsumer, MessageMetadata};
pub use message::{
    unix_timestamp, Batch, Detection, Frame, FrameResult, InferenceResponse, PayloadError,
};
pub use producer::{BatchSink, DeliveryResult, KafkaBatchPublisher, OutgoingMessage, ProducerError};
pub use retry::{cancellable_sleep, retry_with_backoff, BackoffConfig, FailureHandling, FailurePolicy};
pub use shutdown::{shutdown_signal, spawn_signal_listener};
pub use telemetry::{init_metrics, init_tracing, TelemetryConfig};

pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
