//! HTTP client for the batch inference service.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};
use vidstream_pipeline::{Batch, InferenceResponse};

#[derive(Error, Debug)]
pub enum InferenceClientError {
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Inference request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("Inference service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid inference response: {0}")]
    Decode(#[source] reqwest::Error),
}

/// Synchronous request/response contract of the inference service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InferenceApi: Send + Sync {
    /// Send a whole batch and wait for the enriched result
    async fn infer(&self, batch: &Batch) -> Result<InferenceResponse, InferenceClientError>;
}

/// `reqwest` client for `POST /infer` and `GET /healthz`
pub struct HttpInferenceClient {
    client: reqwest::Client,
    infer_url: String,
    health_url: String,
}

impl HttpInferenceClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, InferenceClientError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(InferenceClientError::Client)?;

        let base = base_url.trim().trim_end_matches('/');
        Ok(Self {
            client,
            infer_url: format!("{}/infer", base),
            health_url: format!("{}/healthz", base),
        })
    }

    /// Check the health endpoint
    pub async fn health(&self) -> Result<(), InferenceClientError> {
        let response = self
            .client
            .get(&self.health_url)
            .send()
            .await
            .map_err(InferenceClientError::Transport)?;
        check_status(response).await.map(|_| ())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, InferenceClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(InferenceClientError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl InferenceApi for HttpInferenceClient {
    #[instrument(skip(self, batch), fields(batch_id = batch.batch_id, frames = batch.len()))]
    async fn infer(&self, batch: &Batch) -> Result<InferenceResponse, InferenceClientError> {
        let response = self
            .client
            .post(&self.infer_url)
            .json(batch)
            .send()
            .await
            .map_err(InferenceClientError::Transport)?;

        let response = check_status(response)
            .await?
            .json::<InferenceResponse>()
            .await
            .map_err(InferenceClientError::Decode)?;

        debug!(results = response.results.len(), "Inference response received");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and return the base URL
    async fn one_shot_server(status_line: &'static str, body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&chunk[..n]);
                if request_complete(&request) {
                    break;
                }
            }
            let response = format!(
                "{}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });

        format!("http://{}/", address)
    }

    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
        let Some(header_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let content_length = text[..header_end]
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        request.len() >= header_end + 4 + content_length
    }

    fn batch() -> Batch {
        Batch {
            batch_id: 17,
            frames: vec![vidstream_pipeline::Frame::from_jpeg(0, 1.0, 2, 2, b"jpeg")],
        }
    }

    #[test]
    fn test_endpoint_urls() {
        let client = HttpInferenceClient::new("http://inference:8000/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.infer_url, "http://inference:8000/infer");
        assert_eq!(client.health_url, "http://inference:8000/healthz");
    }

    #[tokio::test]
    async fn test_infer_decodes_response() {
        let body = serde_json::json!({
            "batch_id": 17,
            "results": [{
                "frame_id": 0, "timestamp": 1.0, "width": 2, "height": 2,
                "detections": [{"bbox": [0, 0, 1, 1], "confidence": 0.5, "class_id": 3}],
                "frame_data": "anBlZw=="
            }]
        })
        .to_string();
        let url = one_shot_server("HTTP/1.1 200 OK", body).await;

        let client = HttpInferenceClient::new(&url, Duration::from_secs(5)).unwrap();
        let response = client.infer(&batch()).await.unwrap();
        assert_eq!(response.batch_id, 17);
        assert_eq!(response.results[0].detections[0].class_id, 3);
    }

    #[tokio::test]
    async fn test_server_error_maps_to_status() {
        let url = one_shot_server(
            "HTTP/1.1 500 Internal Server Error",
            r#"{"error":"boom","code":"MODEL_ERROR"}"#.to_string(),
        )
        .await;

        let client = HttpInferenceClient::new(&url, Duration::from_secs(5)).unwrap();
        match client.infer(&batch()).await {
            Err(InferenceClientError::Status { status, body }) => {
                assert_eq!(status, 500);
                assert!(body.contains("MODEL_ERROR"));
            }
            other => panic!("expected status error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_service_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let client =
            HttpInferenceClient::new(&format!("http://{}", address), Duration::from_secs(2)).unwrap();
        assert!(matches!(
            client.health().await,
            Err(InferenceClientError::Transport(_))
        ));
    }
}
