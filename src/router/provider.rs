// SPDX-License-Identifier: MIT
//! Provider abstraction.
//!
//! A model vendor integration is anything implementing [`ModelProvider`].
//! The router never sees vendor wire formats — only [`ChatRequest`],
//! [`ChatResponse`], classified [`ProviderError`]s, and chunk streams.

use async_trait::async_trait;
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::pin::Pin;

use crate::error::{ErrorKind, GatewayError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub model: String,
    pub content: String,
    #[serde(default)]
    pub usage: TokenUsage,
    /// Filled in by the router with the provider that actually served it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

/// One streamed fragment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub content: String,
    pub is_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Classified provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    RateLimited,
    Auth,
    Server,
    Timeout,
    Network,
    Validation,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::RateLimited, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, message)
    }

    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ProviderErrorKind::RateLimited
                | ProviderErrorKind::Server
                | ProviderErrorKind::Timeout
                | ProviderErrorKind::Network
        )
    }
}

impl From<ProviderError> for GatewayError {
    fn from(e: ProviderError) -> Self {
        let kind = match e.kind {
            ProviderErrorKind::RateLimited => ErrorKind::RateLimited,
            ProviderErrorKind::Timeout => ErrorKind::Timeout,
            ProviderErrorKind::Validation => ErrorKind::Validation,
            ProviderErrorKind::Auth
            | ProviderErrorKind::Server
            | ProviderErrorKind::Network => ErrorKind::ProviderUnavailable,
        };
        GatewayError::new(kind, e.message)
    }
}

// ─── Trait ───────────────────────────────────────────────────────────────────

#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Stable id, e.g. `"anthropic"`.
    fn id(&self) -> &str;
    /// Human-readable name.
    fn name(&self) -> &str;
    /// Model ids this provider serves.
    fn models(&self) -> Vec<String>;
    /// Probed once at registration; unavailable providers are skipped.
    async fn is_available(&self) -> bool;
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Streaming variant. The default adapter replays a non-streaming
    /// response as one content chunk plus a terminal chunk, so every
    /// provider streams uniformly.
    async fn chat_stream(&self, req: &ChatRequest) -> Result<ChunkStream, ProviderError> {
        let response = self.chat(req).await?;
        let chunks = vec![
            Ok(StreamChunk {
                content: response.content,
                is_complete: false,
                model: Some(response.model.clone()),
                token_count: Some(response.usage.output_tokens),
                metadata: None,
            }),
            Ok(StreamChunk {
                content: String::new(),
                is_complete: true,
                model: Some(response.model),
                token_count: None,
                metadata: None,
            }),
        ];
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }
}

/// Family of a model id: the prefix before the last `-` or `:` separator
/// (`sonnet-4-latest` → `sonnet-4`, `m1` → `m1`).
pub fn model_family(model: &str) -> &str {
    if let Some((family, _)) = model.rsplit_once([':', '-']) {
        family
    } else {
        model
    }
}

// ─── Loopback provider ───────────────────────────────────────────────────────

/// Deterministic in-process provider for development and tests: echoes the
/// last user message back. Always available.
pub struct EchoProvider {
    id: String,
    models: Vec<String>,
}

impl EchoProvider {
    pub fn new(id: &str, models: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            models: models.iter().map(|m| m.to_string()).collect(),
        }
    }
}

#[async_trait]
impl ModelProvider for EchoProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        "Echo (loopback)"
    }

    fn models(&self) -> Vec<String> {
        self.models.clone()
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let last_user = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or("");
        if last_user.is_empty() {
            return Err(ProviderError::new(
                ProviderErrorKind::Validation,
                "no user message in request",
            ));
        }
        let content = format!("echo: {last_user}");
        let output_tokens = content.split_whitespace().count() as u64;
        let input_tokens = req
            .messages
            .iter()
            .map(|m| m.content.split_whitespace().count() as u64)
            .sum();
        Ok(ChatResponse {
            model: req.model.clone(),
            content,
            usage: TokenUsage {
                input_tokens,
                output_tokens,
            },
            provider_id: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_strips_the_last_segment() {
        assert_eq!(model_family("sonnet-4-latest"), "sonnet-4");
        assert_eq!(model_family("gpt-4"), "gpt");
        assert_eq!(model_family("vendor:m1"), "vendor");
        assert_eq!(model_family("m1"), "m1");
    }

    #[test]
    fn retryability_classification() {
        for kind in [
            ProviderErrorKind::RateLimited,
            ProviderErrorKind::Server,
            ProviderErrorKind::Timeout,
            ProviderErrorKind::Network,
        ] {
            assert!(ProviderError::new(kind, "x").is_retryable());
        }
        assert!(!ProviderError::new(ProviderErrorKind::Auth, "x").is_retryable());
        assert!(!ProviderError::new(ProviderErrorKind::Validation, "x").is_retryable());
    }

    #[tokio::test]
    async fn echo_provider_replies_to_the_last_user_message() {
        let p = EchoProvider::new("echo", &["m1"]);
        let resp = p
            .chat(&ChatRequest {
                model: "m1".into(),
                messages: vec![
                    ChatMessage {
                        role: "system".into(),
                        content: "be brief".into(),
                    },
                    ChatMessage {
                        role: "user".into(),
                        content: "hi".into(),
                    },
                ],
                max_tokens: None,
                temperature: None,
                metadata: Map::new(),
            })
            .await
            .unwrap();
        assert_eq!(resp.content, "echo: hi");
        assert!(resp.usage.output_tokens > 0);
    }

    #[tokio::test]
    async fn default_stream_adapter_yields_content_then_terminal() {
        use futures_util::StreamExt as _;
        let p = EchoProvider::new("echo", &["m1"]);
        let mut stream = p
            .chat_stream(&ChatRequest {
                model: "m1".into(),
                messages: vec![ChatMessage {
                    role: "user".into(),
                    content: "stream me".into(),
                }],
                max_tokens: None,
                temperature: None,
                metadata: Map::new(),
            })
            .await
            .unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.is_complete);
        assert_eq!(first.content, "echo: stream me");
        let last = stream.next().await.unwrap().unwrap();
        assert!(last.is_complete);
        assert!(stream.next().await.is_none());
    }
}
