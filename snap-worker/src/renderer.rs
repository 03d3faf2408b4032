use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use thiserror::Error;

use snap_core::{FailureKind, ResultMetadata, ScreenshotRequest};

/// What a successful render hands back to the worker.
#[derive(Debug, Clone)]
pub struct RenderOutput {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub metadata: ResultMetadata,
}

/// Failure of one render attempt. The variant drives retry classification;
/// the message is operator detail and never shown to API consumers.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("render timed out: {0}")]
    Timeout(String),
    #[error("target could not be reached: {0}")]
    Network(String),
    #[error("target url rejected by renderer: {0}")]
    InvalidUrl(String),
    #[error("page content could not be captured: {0}")]
    Content(String),
    #[error("renderer internal error: {0}")]
    Internal(String),
}

impl RenderError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            RenderError::Timeout(_) => FailureKind::Timeout,
            RenderError::Network(_) => FailureKind::Network,
            RenderError::InvalidUrl(_) => FailureKind::InvalidUrl,
            RenderError::Content(_) => FailureKind::Content,
            RenderError::Internal(_) => FailureKind::Internal,
        }
    }

    /// A renderer that timed out or broke internally may be wedged and is
    /// not returned to the pool.
    pub fn leaves_renderer_healthy(&self) -> bool {
        !matches!(self, RenderError::Timeout(_) | RenderError::Internal(_))
    }
}

/// The rendering engine as the worker sees it. The engine itself (headless
/// browser management, page lifecycle, encoding) is a black box behind this
/// contract.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(
        &self,
        request: &ScreenshotRequest,
        timeout: Duration,
    ) -> Result<RenderOutput, RenderError>;

    /// Cheap check used when an instance comes back to the pool.
    async fn is_healthy(&self) -> bool;

    async fn close(&self);
}

/// Creates renderer instances for the pool, including replacements for
/// instances discarded as unhealthy.
#[async_trait]
pub trait RendererFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn Renderer>, RenderError>;
}

/// Envelope returned by the remote rendering service.
#[derive(Debug, Deserialize)]
struct RenderEnvelope {
    /// Base64 of the artifact bytes.
    data: String,
    content_type: String,
    #[serde(default)]
    page_title: Option<String>,
    #[serde(default)]
    final_url: Option<String>,
    #[serde(default)]
    load_time_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RenderErrorEnvelope {
    error: String,
    #[serde(default)]
    message: String,
}

/// Client for a remote rendering service speaking a small JSON protocol:
/// POST /render with the request, artifact comes back base64-wrapped.
pub struct HttpRenderer {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpRenderer {
    pub fn new(endpoint: &str) -> Self {
        let client = reqwest::Client::builder()
            .build()
            .expect("failed to construct reqwest client for renderer");
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Renderer for HttpRenderer {
    async fn render(
        &self,
        request: &ScreenshotRequest,
        timeout: Duration,
    ) -> Result<RenderOutput, RenderError> {
        let response = self
            .client
            .post(format!("{}/render", self.endpoint))
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    RenderError::Timeout(error.to_string())
                } else {
                    RenderError::Network(error.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<RenderErrorEnvelope>(&body)
                .map(|envelope| format!("{}: {}", envelope.error, envelope.message))
                .unwrap_or(body);
            return Err(match status.as_u16() {
                // The service validates the target before navigating.
                400 | 422 => RenderError::InvalidUrl(detail),
                408 | 504 => RenderError::Timeout(detail),
                _ => RenderError::Internal(detail),
            });
        }

        let envelope: RenderEnvelope = response
            .json()
            .await
            .map_err(|error| RenderError::Internal(format!("bad render envelope: {error}")))?;
        let bytes = BASE64
            .decode(&envelope.data)
            .map_err(|error| RenderError::Internal(format!("bad artifact encoding: {error}")))?;

        let byte_size = bytes.len() as i64;
        Ok(RenderOutput {
            bytes,
            content_type: envelope.content_type,
            metadata: ResultMetadata {
                page_title: envelope.page_title,
                final_url: envelope.final_url,
                byte_size,
                load_time_ms: envelope.load_time_ms,
            },
        })
    }

    async fn is_healthy(&self) -> bool {
        self.client
            .get(format!("{}/healthz", self.endpoint))
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .map(|response| response.status().is_success())
            .unwrap_or(false)
    }

    async fn close(&self) {}
}

pub struct HttpRendererFactory {
    endpoint: String,
}

impl HttpRendererFactory {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
        }
    }
}

#[async_trait]
impl RendererFactory for HttpRendererFactory {
    async fn create(&self) -> Result<Box<dyn Renderer>, RenderError> {
        Ok(Box::new(HttpRenderer::new(&self.endpoint)))
    }
}
