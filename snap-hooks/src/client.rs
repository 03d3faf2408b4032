use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;

/// Transport-level failures of a delivery attempt. All of these are
/// retryable; HTTP status classification happens in the engine.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Other(String),
}

#[derive(Debug, Clone)]
pub struct HttpResponseSummary {
    pub status: u16,
    pub body: String,
    pub elapsed: Duration,
}

/// Outbound HTTP port, consumed only by the webhook engine. Kept behind a
/// trait so delivery classification and retry behavior test without sockets.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &str,
        timeout: Duration,
    ) -> Result<HttpResponseSummary, TransportError>;
}

pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new(user_agent: &str) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .expect("failed to construct reqwest client for webhook delivery");
        Self { client }
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &str,
        timeout: Duration,
    ) -> Result<HttpResponseSummary, TransportError> {
        let started = Instant::now();

        let mut request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .timeout(timeout)
            .body(body.to_owned());
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|error| {
            if error.is_timeout() {
                TransportError::Timeout(error.to_string())
            } else if error.is_connect() {
                TransportError::Connect(error.to_string())
            } else {
                TransportError::Other(error.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        Ok(HttpResponseSummary {
            status,
            body,
            elapsed: started.elapsed(),
        })
    }
}
