//! LLM service provider abstraction.
//!
//! The runtime talks to an OpenAI-compatible HTTP service for chat and
//! embeddings. Everything above this module works against [`LlmProvider`],
//! so tests substitute deterministic fakes without touching the network.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::LlmConfig;

use super::retry::Transient;

/// A single chat message in provider wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Raw provider failure, classified for the retry stage.
#[derive(Debug, Error, Clone)]
pub enum ProviderError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("service returned status {status}")]
    Status { status: u16 },

    #[error("malformed response: {0}")]
    InvalidResponse(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl Transient for ProviderError {
    fn is_transient(&self) -> bool {
        match self {
            ProviderError::Timeout(_) | ProviderError::Connection(_) => true,
            ProviderError::Status { status } => *status >= 500,
            ProviderError::InvalidResponse(_) | ProviderError::InvalidRequest(_) => false,
        }
    }
}

/// Chat + embedding service used by the protected call pipeline.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// One chat completion. Returns the assistant message content.
    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        timeout: Duration,
    ) -> Result<String, ProviderError>;

    /// One embedding. Returns the raw (not yet normalized) vector.
    async fn embed(
        &self,
        model: &str,
        input: &str,
        timeout: Duration,
    ) -> Result<Vec<f32>, ProviderError>;

    /// Cheap reachability probe for startup validation and health checks.
    async fn ping(&self, timeout: Duration) -> Result<(), ProviderError>;
}

// ── Wire types ───────────────────────────────────────────────────────

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedData>,
}

#[derive(Deserialize)]
struct EmbedData {
    embedding: Vec<f32>,
}

/// OpenAI-compatible HTTP provider.
pub struct HttpLlmProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpLlmProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &LlmConfig) -> Self {
        Self::new(config.base_url.clone())
    }

    fn map_request_error(e: reqwest::Error, timeout: Duration) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout(timeout)
        } else if e.is_connect() {
            ProviderError::Connection(e.to_string())
        } else {
            ProviderError::Connection(e.to_string())
        }
    }
}

#[async_trait]
impl LlmProvider for HttpLlmProvider {
    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        timeout: Duration,
    ) -> Result<String, ProviderError> {
        if messages.is_empty() {
            return Err(ProviderError::InvalidRequest("no messages".to_string()));
        }
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(timeout)
            .json(&ChatRequest { model, messages })
            .send()
            .await
            .map_err(|e| Self::map_request_error(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Status {
                status: status.as_u16(),
            });
        }
        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        body.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ProviderError::InvalidResponse("empty choices".to_string()))
    }

    async fn embed(
        &self,
        model: &str,
        input: &str,
        timeout: Duration,
    ) -> Result<Vec<f32>, ProviderError> {
        if input.trim().is_empty() {
            return Err(ProviderError::InvalidRequest("empty input".to_string()));
        }
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .timeout(timeout)
            .json(&EmbedRequest { model, input })
            .send()
            .await
            .map_err(|e| Self::map_request_error(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Status {
                status: status.as_u16(),
            });
        }
        let body: EmbedResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        body.data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| ProviderError::InvalidResponse("empty data".to_string()))
    }

    async fn ping(&self, timeout: Duration) -> Result<(), ProviderError> {
        let response = self
            .client
            .get(format!("{}/models", self.base_url))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Self::map_request_error(e, timeout))?;
        if response.status().is_server_error() {
            return Err(ProviderError::Status {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}
