//! Provider abstraction.
//!
//! Every LLM backend sits behind the narrow [`Provider`] contract:
//! `complete(messages, config) -> response` plus an optional chunk stream.
//! Providers vary only by endpoint and cost; the tool-calling loop, retry
//! policy and cost accounting live above this trait in the provider
//! middleware.

mod mock;
mod openai;

pub use mock::{MockProvider, MockTurn};
pub use openai::{OpenAiCompatible, OpenAiConfig};

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::cost::Usage;
use crate::error::ProviderError;
use crate::message::Message;
use crate::stream::{StopReason, StreamChunk};
use crate::tools::ToolDefinition;

/// Stream of incremental provider output.
pub type ChunkStream =
    Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;

/// Sampling parameters forwarded to the provider.
///
/// Mirrors the `defaults` block of provider configuration; unset fields
/// fall back to the provider's own defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Nucleus sampling parameter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Maximum tokens to generate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Random seed for reproducibility.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    /// Frequency penalty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    /// Presence penalty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
}

/// A completion request: full message history plus sampling config and
/// the tool definitions offered to the model.
#[derive(Debug, Clone, Default)]
pub struct ProviderRequest {
    /// Model identifier. Empty selects the provider's default model.
    pub model: String,
    /// Conversation messages, system message first when present.
    pub messages: Vec<Message>,
    /// Sampling parameters.
    pub sampling: SamplingConfig,
    /// Tools the model may call.
    pub tools: Vec<ToolDefinition>,
}

impl ProviderRequest {
    /// Create a request for the given model.
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    /// Set the messages.
    #[must_use]
    pub fn messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }

    /// Set the sampling config.
    #[must_use]
    pub const fn sampling(mut self, sampling: SamplingConfig) -> Self {
        self.sampling = sampling;
        self
    }

    /// Set the offered tools.
    #[must_use]
    pub fn tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }
}

/// A terminal completion response.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    /// The assistant message, possibly carrying tool calls.
    pub message: Message,
    /// Why the model stopped.
    pub stop_reason: StopReason,
    /// Token usage for this call.
    pub usage: Usage,
    /// The model that served the call, when reported.
    pub model: Option<String>,
}

impl ProviderResponse {
    /// Create a plain text response.
    #[must_use]
    pub fn from_text(content: impl Into<String>) -> Self {
        Self {
            message: Message::assistant(content),
            stop_reason: StopReason::Stop,
            usage: Usage::default(),
            model: None,
        }
    }

    /// Set the usage.
    #[must_use]
    pub const fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    /// Whether the response requests tool calls.
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        self.message.has_tool_calls()
    }

    /// The response text.
    #[must_use]
    pub fn text(&self) -> String {
        self.message.text()
    }
}

/// The contract all LLM backends implement.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name, used in logs and error messages.
    fn name(&self) -> &str;

    /// The model used when a request does not name one.
    fn default_model(&self) -> &str;

    /// Complete the conversation and return the terminal response.
    async fn complete(&self, request: &ProviderRequest)
    -> Result<ProviderResponse, ProviderError>;

    /// Stream the completion as incremental chunks.
    ///
    /// The default implementation falls back to [`complete`](Self::complete)
    /// and emits the response as one text chunk, its usage, and `Done`.
    async fn stream(&self, request: &ProviderRequest) -> Result<ChunkStream, ProviderError> {
        let response = self.complete(request).await?;
        let chunks = vec![
            Ok(StreamChunk::Text(response.message.text())),
            Ok(StreamChunk::Usage(response.usage)),
            Ok(StreamChunk::Done {
                stop_reason: Some(response.stop_reason),
            }),
        ];
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    /// Whether the backend supports native streaming.
    fn supports_streaming(&self) -> bool {
        false
    }
}

/// Shared handle to a provider.
pub type SharedProvider = std::sync::Arc<dyn Provider>;

/// Retry policy for transient provider failures.
///
/// Delay for attempt `i` (0-based) is `base_delay * 2^i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// The backoff delay after the given 0-based failed attempt.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1_u32 << attempt.min(16))
    }

    /// Whether another attempt remains after `attempt` failures.
    #[must_use]
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
    }

    #[tokio::test]
    async fn default_stream_falls_back_to_complete() {
        use futures::StreamExt as _;

        let provider = MockProvider::new("m").respond_text("hi there");
        let request = ProviderRequest::new("m").messages(vec![Message::user("hi")]);
        let mut stream = provider.stream(&request).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.as_text(), Some("hi there"));
        let rest: Vec<_> = stream.collect().await;
        assert!(rest.last().unwrap().as_ref().unwrap().is_done());
    }
}
