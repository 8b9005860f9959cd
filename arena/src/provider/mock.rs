//! Scripted mock provider.
//!
//! Returns predefined turns in sequence, cycling when exhausted. Powers
//! unit and integration tests and the engine's `--mock-provider` flow
//! without making network calls.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::cost::Usage;
use crate::error::ProviderError;
use crate::message::{Message, ToolCall};
use crate::stream::StopReason;

use super::{Provider, ProviderRequest, ProviderResponse};

/// One scripted response.
#[derive(Debug, Clone)]
pub enum MockTurn {
    /// Plain assistant text.
    Text(String),
    /// Assistant tool calls with optional accompanying text.
    ToolCalls {
        /// Textual content, usually empty.
        content: String,
        /// The scripted tool calls.
        calls: Vec<ToolCall>,
    },
    /// A retryable failure (rate limit / 5xx).
    TransientError {
        /// HTTP status to report.
        status: u16,
        /// Error message.
        message: String,
    },
    /// A non-retryable failure.
    PermanentError {
        /// Error message.
        message: String,
    },
}

/// A scripted provider for tests and mock runs.
///
/// Turns are served in order and cycle when the script is exhausted. Every
/// received request is recorded for later inspection.
#[derive(Debug)]
pub struct MockProvider {
    name: String,
    model: String,
    turns: Vec<MockTurn>,
    next: AtomicUsize,
    usage: Usage,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl MockProvider {
    /// Create an empty-scripted mock. With no turns, every call answers
    /// with a fixed placeholder text.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: "mock-model".to_string(),
            turns: Vec::new(),
            next: AtomicUsize::new(0),
            usage: Usage::new(10, 5),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Override the model id.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Override the usage reported per call.
    #[must_use]
    pub const fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    /// Append a text turn.
    #[must_use]
    pub fn respond_text(mut self, text: impl Into<String>) -> Self {
        self.turns.push(MockTurn::Text(text.into()));
        self
    }

    /// Append a tool-call turn.
    #[must_use]
    pub fn respond_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.turns.push(MockTurn::ToolCalls {
            content: String::new(),
            calls,
        });
        self
    }

    /// Append a single tool call turn.
    #[must_use]
    pub fn respond_tool_call(
        self,
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        self.respond_tool_calls(vec![ToolCall::new(id, name, arguments)])
    }

    /// Append a transient (retryable) error turn.
    #[must_use]
    pub fn respond_transient_error(mut self, status: u16, message: impl Into<String>) -> Self {
        self.turns.push(MockTurn::TransientError {
            status,
            message: message.into(),
        });
        self
    }

    /// Append a permanent error turn.
    #[must_use]
    pub fn respond_permanent_error(mut self, message: impl Into<String>) -> Self {
        self.turns.push(MockTurn::PermanentError {
            message: message.into(),
        });
        self
    }

    /// Append an arbitrary scripted turn.
    #[must_use]
    pub fn respond(mut self, turn: MockTurn) -> Self {
        self.turns.push(turn);
        self
    }

    /// All requests received so far, in call order.
    #[must_use]
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Number of calls served.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.next.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        request: &ProviderRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }

        let index = self.next.fetch_add(1, Ordering::SeqCst);
        let turn = if self.turns.is_empty() {
            MockTurn::Text("mock response".to_string())
        } else {
            self.turns[index % self.turns.len()].clone()
        };

        match turn {
            MockTurn::Text(text) => Ok(ProviderResponse {
                message: Message::assistant(text),
                stop_reason: StopReason::Stop,
                usage: self.usage,
                model: Some(self.model.clone()),
            }),
            MockTurn::ToolCalls { content, calls } => {
                let mut message = Message::assistant_tool_calls(calls);
                message.content = content;
                Ok(ProviderResponse {
                    message,
                    stop_reason: StopReason::ToolCalls,
                    usage: self.usage,
                    model: Some(self.model.clone()),
                })
            }
            MockTurn::TransientError { status, message } => {
                Err(ProviderError::transient(status, message))
            }
            MockTurn::PermanentError { message } => Err(ProviderError::permanent(message)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cycles_through_scripted_turns() {
        let provider = MockProvider::new("mock")
            .respond_text("first")
            .respond_text("second");
        let request = ProviderRequest::new("mock-model");

        assert_eq!(provider.complete(&request).await.unwrap().text(), "first");
        assert_eq!(provider.complete(&request).await.unwrap().text(), "second");
        assert_eq!(provider.complete(&request).await.unwrap().text(), "first");
    }

    #[tokio::test]
    async fn empty_script_returns_placeholder() {
        let provider = MockProvider::new("mock");
        let response = provider
            .complete(&ProviderRequest::new("mock-model"))
            .await
            .unwrap();
        assert_eq!(response.text(), "mock response");
    }

    #[tokio::test]
    async fn tool_call_turn_sets_stop_reason() {
        let provider =
            MockProvider::new("mock").respond_tool_call("c1", "get_weather", r#"{"q":1}"#);
        let response = provider
            .complete(&ProviderRequest::new("mock-model"))
            .await
            .unwrap();
        assert!(response.has_tool_calls());
        assert_eq!(response.stop_reason, StopReason::ToolCalls);
        assert!(response.message.content.is_empty());
    }

    #[tokio::test]
    async fn error_turns_map_to_provider_errors() {
        let provider = MockProvider::new("mock")
            .respond_transient_error(429, "slow down")
            .respond_permanent_error("bad key");
        let request = ProviderRequest::new("mock-model");

        let err = provider.complete(&request).await.unwrap_err();
        assert!(err.is_transient());

        let err = provider.complete(&request).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn records_requests_in_order() {
        let provider = MockProvider::new("mock").respond_text("ok");
        let first = ProviderRequest::new("a").messages(vec![Message::user("one")]);
        let second = ProviderRequest::new("b").messages(vec![Message::user("two")]);

        provider.complete(&first).await.unwrap();
        provider.complete(&second).await.unwrap();

        let seen = provider.requests();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].model, "a");
        assert_eq!(seen[1].messages[0].content, "two");
        assert_eq!(provider.call_count(), 2);
    }
}
