//! HTTP exchange with a backend, with retries and exponential backoff

use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use reqwest::{Client, Response};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::errors::{AgentError, AgentResult, ConfigError, TransportError};
use crate::providers::configs::BackendConfig;
use crate::providers::sse::SseDecoder;
use crate::providers::stream::{StreamDecoder, StreamEvent};

/// Attempts per request, counting the first one
pub const MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RETRIES,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay after the zero-based `attempt` failed: base * 2^attempt
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .checked_mul(2u32.saturating_pow(attempt))
            .unwrap_or(Duration::MAX)
    }
}

enum Failure {
    Status { status: u16, body: String },
    Io(String),
}

impl Failure {
    fn into_error(self, attempts: u32) -> TransportError {
        match self {
            Failure::Status { status, body } => TransportError::Status {
                status,
                body,
                attempts,
            },
            Failure::Io(message) => TransportError::Io { message, attempts },
        }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Failure::Status { status, body } => write!(f, "status {}: {}", status, body),
            Failure::Io(message) => f.write_str(message),
        }
    }
}

/// Posts JSON to a backend, retrying any non-2xx status or I/O failure.
///
/// Each instance owns its HTTP client, so one conversation's backend client
/// is never shared with another's.
pub struct RetryingTransport {
    client: Client,
    policy: RetryPolicy,
}

impl RetryingTransport {
    pub fn new(config: &BackendConfig) -> AgentResult<Self> {
        // reqwest has no separate write timeout; a stalled upload is caught by
        // the per-read timeout instead.
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .read_timeout(config.read_timeout().max(config.write_timeout()))
            .build()
            .map_err(|e| ConfigError::Invalid {
                field: "http_client",
                reason: e.to_string(),
            })?;

        Ok(Self {
            client,
            policy: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Post and decode a complete JSON response. Reading the body counts as
    /// part of the attempt; a body that is not JSON is not retried.
    pub async fn post_json(
        &self,
        url: &str,
        headers: &HeaderMap,
        body: &Value,
        cancel: &CancellationToken,
    ) -> AgentResult<Value> {
        let text = self
            .execute(url, headers, body, cancel, |response| response.text())
            .await?;
        serde_json::from_str(&text)
            .map_err(|e| AgentError::parse(format!("response body is not JSON: {}", e)))
    }

    /// Post and return the open response for streaming. Only establishing the
    /// stream is retried; a stream that breaks later fails the request.
    pub async fn post_stream(
        &self,
        url: &str,
        headers: &HeaderMap,
        body: &Value,
        cancel: &CancellationToken,
    ) -> AgentResult<Response> {
        self.execute(url, headers, body, cancel, |response| {
            futures::future::ok::<_, reqwest::Error>(response)
        })
        .await
    }

    async fn execute<T, F, Fut>(
        &self,
        url: &str,
        headers: &HeaderMap,
        body: &Value,
        cancel: &CancellationToken,
        read: F,
    ) -> AgentResult<T>
    where
        F: Fn(Response) -> Fut,
        Fut: Future<Output = Result<T, reqwest::Error>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            debug!(url, attempt = attempt + 1, "sending request");
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                outcome = self.attempt(url, headers, body, &read) => outcome,
            };

            let failure = match outcome {
                Ok(value) => return Ok(value),
                Err(failure) => failure,
            };

            attempt += 1;
            if attempt >= max_attempts {
                error!(url, attempts = attempt, error = %failure, "giving up on request");
                return Err(failure.into_error(attempt).into());
            }

            let delay = self.policy.delay(attempt - 1);
            warn!(
                url,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "request failed, retrying"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                _ = sleep(delay) => {}
            }
        }
    }

    async fn attempt<T, F, Fut>(
        &self,
        url: &str,
        headers: &HeaderMap,
        body: &Value,
        read: &F,
    ) -> Result<T, Failure>
    where
        F: Fn(Response) -> Fut,
        Fut: Future<Output = Result<T, reqwest::Error>>,
    {
        let response = self
            .client
            .post(url)
            .headers(headers.clone())
            .json(body)
            .send()
            .await
            .map_err(|e| Failure::Io(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Failure::Status {
                status: status.as_u16(),
                body,
            });
        }

        read(response).await.map_err(|e| Failure::Io(e.to_string()))
    }
}

/// Decode a streaming response into backend-neutral events.
pub fn event_stream(
    response: Response,
    mut decoder: Box<dyn StreamDecoder>,
) -> BoxStream<'static, AgentResult<StreamEvent>> {
    Box::pin(async_stream::try_stream! {
        let mut bytes = response.bytes_stream();
        let mut sse = SseDecoder::new();

        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|e| {
                AgentError::from(TransportError::StreamInterrupted(e.to_string()))
            })?;
            for frame in sse.push(&chunk) {
                for event in decoder.decode(&frame)? {
                    yield event;
                }
            }
        }

        if let Some(frame) = sse.finish() {
            for event in decoder.decode(&frame)? {
                yield event;
            }
        }
    })
}
