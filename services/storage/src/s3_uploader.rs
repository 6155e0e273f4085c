use crate::config::S3Config;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, instrument};

const CONTENT_TYPE: &str = "image/jpeg";

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Failed to upload {key}: {message}")]
    Put { key: String, message: String },
}

/// Identifies an annotated frame in object metadata
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMetadata {
    pub batch_id: i64,
    pub frame_id: u64,
    pub detection_count: usize,
}

impl FrameMetadata {
    fn pairs(&self) -> [(&'static str, String); 3] {
        [
            ("batch-id", self.batch_id.to_string()),
            ("frame-id", self.frame_id.to_string()),
            ("detection-count", self.detection_count.to_string()),
        ]
    }
}

/// Durable key/value sink for annotated frames
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_frame(
        &self,
        key: &str,
        body: Vec<u8>,
        metadata: &FrameMetadata,
    ) -> Result<(), UploadError>;
}

/// Object key for an annotated frame: `<prefix>/<batch_id>_<frame_id>.jpg`
pub fn object_key(prefix: &str, batch_id: i64, frame_id: u64) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        format!("{}_{}.jpg", batch_id, frame_id)
    } else {
        format!("{}/{}_{}.jpg", prefix, batch_id, frame_id)
    }
}

/// S3 uploader for annotated frames
pub struct S3Uploader {
    client: S3Client,
    bucket: String,
}

impl S3Uploader {
    /// Create a new S3 uploader
    pub async fn new(config: &S3Config) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            prefix = %config.prefix,
            "S3 uploader initialized"
        );

        Self {
            client,
            bucket: config.bucket.clone(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Uploader {
    #[instrument(skip(self, body, metadata), fields(bucket = %self.bucket, size_bytes = body.len()))]
    async fn put_frame(
        &self,
        key: &str,
        body: Vec<u8>,
        metadata: &FrameMetadata,
    ) -> Result<(), UploadError> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(CONTENT_TYPE)
            .metadata("processed-at", Utc::now().to_rfc3339());

        for (name, value) in metadata.pairs() {
            request = request.metadata(name, value);
        }

        request.send().await.map_err(|e| UploadError::Put {
            key: key.to_string(),
            message: aws_sdk_s3::error::DisplayErrorContext(&e).to_string(),
        })?;

        debug!(key = %key, "Annotated frame uploaded");
        Ok(())
    }
}
