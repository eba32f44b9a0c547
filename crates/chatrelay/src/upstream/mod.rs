//! Client for the OpenAI-compatible LLM gateway
//!
//! `open` starts a streamed completion and hands back the raw body as a stream
//! of byte chunks. Failures are split by when they happen:
//! - before any body bytes (connect failure, non-2xx status): `PreStream`
//! - while reading the body (reset, timeout): `MidStream`
//!
//! The HTTP connection lives inside the returned stream and is released as
//! soon as the stream is dropped, whichever way the consumer stops.

mod endpoint;

pub use endpoint::{
    CONTAINER_GATEWAY_URL, GatewayEndpoint, LOCAL_GATEWAY_URL, resolve_base_url,
    running_in_container,
};

use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::config::Config;
use crate::error::{ChatRelayError, Result};
use crate::message::ChatMessage;

/// Message shown to clients when the gateway cannot be reached at all
pub const START_FAILURE_MESSAGE: &str = "Failed to start stream with the provider.";

const FALLBACK_ERROR_MESSAGE: &str = "Upstream provider error";

/// Raw body chunks of a streamed completion; never yields empty chunks
pub type ChunkStream = BoxStream<'static, std::result::Result<Bytes, UpstreamError>>;

/// Errors talking to the gateway
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UpstreamError {
    /// Connection failure or error status before any body bytes arrived
    #[error("Upstream error before streaming: {message}")]
    PreStream {
        status: Option<u16>,
        message: String,
    },

    /// Transport fault after part of the body was delivered
    #[error("Upstream stream interrupted: {0}")]
    MidStream(String),

    /// A non-streaming response body could not be decoded
    #[error("Failed to decode upstream response: {0}")]
    Decode(String),
}

impl UpstreamError {
    /// Short tag for logs
    pub fn category(&self) -> &'static str {
        match self {
            UpstreamError::PreStream { .. } => "pre_stream",
            UpstreamError::MidStream(_) => "mid_stream",
            UpstreamError::Decode(_) => "decode",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StreamOptions {
    pub include_usage: bool,
}

/// Body of `POST /v1/chat/completions`
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
}

impl CompletionRequest {
    /// Streamed request that also asks for a trailing usage chunk
    pub fn streaming(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: Some(true),
            stream_options: Some(StreamOptions {
                include_usage: true,
            }),
        }
    }

    pub fn non_streaming(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: None,
            stream_options: None,
        }
    }
}

/// Where requests are sent
#[derive(Debug, Clone, PartialEq)]
enum Gateway {
    Fixed(Url),
    /// Selected again from the configured base URL and container state for
    /// every request
    Resolved { configured: Option<String> },
}

impl Gateway {
    fn url(&self, in_container: bool) -> Result<Url> {
        match self {
            Gateway::Fixed(url) => Ok(url.clone()),
            Gateway::Resolved { configured } => {
                let base = resolve_base_url(configured.as_deref(), in_container);
                Ok(GatewayEndpoint::from_base_url(&base)?.url)
            }
        }
    }
}

/// HTTP client for the LLM gateway
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    gateway: Gateway,
    api_key: Option<String>,
    error_preview_chars: usize,
}

impl UpstreamClient {
    /// Create a client for `endpoint`.
    ///
    /// Only the connect phase is bounded by a timeout; generation may run for
    /// as long as the gateway keeps the stream open.
    pub fn new(
        endpoint: GatewayEndpoint,
        api_key: Option<String>,
        connect_timeout: Duration,
        error_preview_chars: usize,
    ) -> Result<Self> {
        Self::with_gateway(
            Gateway::Fixed(endpoint.url),
            api_key,
            connect_timeout,
            error_preview_chars,
        )
    }

    fn with_gateway(
        gateway: Gateway,
        api_key: Option<String>,
        connect_timeout: Duration,
        error_preview_chars: usize,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ChatRelayError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            http,
            gateway,
            api_key,
            error_preview_chars,
        })
    }

    /// Build a client from configuration and the process environment.
    ///
    /// The gateway URL is selected again on every request; the URL in effect
    /// now is validated up front so a bad setting fails at startup.
    pub fn from_config(config: &Config) -> Result<Self> {
        let gateway = Gateway::Resolved {
            configured: config.upstream.base_url.clone(),
        };
        let url = gateway.url(running_in_container())?;
        tracing::info!("Using LLM gateway at {}", url);

        Self::with_gateway(
            gateway,
            config.api_key(|name| std::env::var(name).ok()),
            Duration::from_secs(config.upstream.connect_timeout_secs),
            config.relay.error_preview_chars,
        )
    }

    /// Chat completions URL the next request will use
    pub fn endpoint(&self) -> Result<Url> {
        self.gateway.url(running_in_container())
    }

    fn post(&self, url: Url, request: &CompletionRequest) -> reqwest::RequestBuilder {
        let builder = self
            .http
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .json(request);

        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Open a streamed completion
    pub async fn open(
        &self,
        request: &CompletionRequest,
    ) -> std::result::Result<ChunkStream, UpstreamError> {
        let url = self.endpoint().map_err(|e| {
            tracing::warn!(error_type = "config", error = %e, "Failed to resolve LLM gateway URL");
            UpstreamError::PreStream {
                status: None,
                message: START_FAILURE_MESSAGE.to_string(),
            }
        })?;

        let response = self.post(url, request).send().await.map_err(|e| {
            tracing::warn!(error_type = "connect", error = %e, "Failed to reach LLM gateway");
            UpstreamError::PreStream {
                status: None,
                message: START_FAILURE_MESSAGE.to_string(),
            }
        })?;

        let response = self.check_status(response).await?;

        let chunks = response
            .bytes_stream()
            .map_err(|e| UpstreamError::MidStream(e.to_string()))
            .try_filter(|chunk| futures::future::ready(!chunk.is_empty()))
            .boxed();

        Ok(chunks)
    }

    /// Run a non-streaming completion and return the decoded JSON body
    pub async fn complete(
        &self,
        request: &CompletionRequest,
        timeout: Option<Duration>,
    ) -> std::result::Result<Value, UpstreamError> {
        let url = self.endpoint().map_err(|e| UpstreamError::PreStream {
            status: None,
            message: e.to_string(),
        })?;

        let mut builder = self.post(url, request);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| UpstreamError::PreStream {
                status: None,
                message: e.to_string(),
            })?;

        let response = self.check_status(response).await?;

        response
            .json::<Value>()
            .await
            .map_err(|e| UpstreamError::Decode(e.to_string()))
    }

    async fn check_status(
        &self,
        response: reqwest::Response,
    ) -> std::result::Result<reqwest::Response, UpstreamError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = describe_error_body(&body, self.error_preview_chars);
        tracing::warn!(
            error_type = "upstream",
            status = status.as_u16(),
            body_length = body.len(),
            "LLM gateway returned an error status"
        );

        Err(UpstreamError::PreStream {
            status: Some(status.as_u16()),
            message,
        })
    }
}

/// Reduce an error response body to a human-readable reason.
///
/// Prefers `error.message`, then a string or other non-null `error` value,
/// then the raw body. The result is cut to `limit` characters.
pub fn describe_error_body(body: &str, limit: usize) -> String {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| value.get("error").and_then(error_message))
        .unwrap_or_else(|| body.trim().to_string());

    let message: String = message.chars().take(limit).collect();
    if message.is_empty() {
        FALLBACK_ERROR_MESSAGE.to_string()
    } else {
        message
    }
}

fn error_message(error: &Value) -> Option<String> {
    match error {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => Some(
            map.get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string()),
        ),
        other => Some(other.to_string()),
    }
}

/// Assistant text of a non-streaming completion body
pub fn completion_text(body: &Value) -> Option<String> {
    let choice = body.get("choices")?.get(0)?;
    choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .or_else(|| choice.get("text").and_then(Value::as_str))
        .map(str::to_string)
}
