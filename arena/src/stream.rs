//! Streaming response types.
//!
//! Streaming is a decorator on the unary path: providers that stream emit
//! [`StreamChunk`]s which the provider middleware broadcasts to the
//! pipeline's `stream_chunk` hooks, while a [`StreamAggregator`]
//! reconstructs the canonical terminal response once the stream ends.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cost::Usage;
use crate::message::{Message, ToolCall};
use crate::provider::ProviderResponse;

/// A chunk of streaming output from a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum StreamChunk {
    /// Incremental text content.
    Text(String),

    /// Start of a tool call.
    ToolCallStart {
        /// Index of this tool call within the response.
        index: usize,
        /// Unique identifier for the call.
        id: String,
        /// Name of the tool being called.
        name: String,
    },

    /// Partial JSON arguments for an in-progress tool call.
    ToolCallDelta {
        /// Index of the tool call being extended.
        index: usize,
        /// Partial JSON argument text.
        partial_json: String,
    },

    /// Token usage, usually delivered once near the end of the stream.
    Usage(Usage),

    /// The stream completed.
    Done {
        /// Stop reason reported by the provider.
        stop_reason: Option<StopReason>,
    },

    /// The provider reported an error mid-stream.
    Error {
        /// Error message.
        message: String,
    },
}

impl StreamChunk {
    /// Create a text chunk.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text(content.into())
    }

    /// The text content, if this is a text chunk.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Whether this is the terminal chunk.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum StopReason {
    /// Natural end of the response.
    #[default]
    Stop,
    /// Token limit reached.
    Length,
    /// The model requested tool calls.
    ToolCalls,
    /// Content was filtered.
    ContentFilter,
}

impl StopReason {
    /// Parse a provider-specific finish reason string.
    ///
    /// Accepts OpenAI (`stop`, `length`, `tool_calls`, `content_filter`)
    /// and Anthropic (`end_turn`, `max_tokens`, `tool_use`) spellings.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "length" | "max_tokens" => Self::Length,
            "tool_calls" | "tool_use" => Self::ToolCalls,
            "content_filter" => Self::ContentFilter,
            _ => Self::Stop,
        }
    }

    /// String representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ToolCalls => "tool_calls",
            Self::ContentFilter => "content_filter",
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default)]
struct ToolCallBuilder {
    id: String,
    name: String,
    arguments: String,
}

/// Rebuilds a complete [`ProviderResponse`] from stream chunks.
#[derive(Debug, Clone, Default)]
pub struct StreamAggregator {
    text: String,
    tool_calls: BTreeMap<usize, ToolCallBuilder>,
    usage: Option<Usage>,
    stop_reason: Option<StopReason>,
}

impl StreamAggregator {
    /// Create an empty aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one chunk.
    pub fn apply(&mut self, chunk: &StreamChunk) {
        match chunk {
            StreamChunk::Text(text) => self.text.push_str(text),
            StreamChunk::ToolCallStart { index, id, name } => {
                let entry = self.tool_calls.entry(*index).or_default();
                entry.id.clone_from(id);
                entry.name.clone_from(name);
            }
            StreamChunk::ToolCallDelta {
                index,
                partial_json,
            } => {
                self.tool_calls
                    .entry(*index)
                    .or_default()
                    .arguments
                    .push_str(partial_json);
            }
            StreamChunk::Usage(usage) => {
                self.usage = Some(self.usage.map_or(*usage, |u| u + *usage));
            }
            StreamChunk::Done { stop_reason } => self.stop_reason = *stop_reason,
            StreamChunk::Error { .. } => {}
        }
    }

    /// The text accumulated so far. Used to retain partial output when a
    /// stream is cut off by a timeout.
    #[must_use]
    pub fn partial_text(&self) -> &str {
        &self.text
    }

    /// Finish aggregation and build the terminal response.
    #[must_use]
    pub fn into_response(self) -> ProviderResponse {
        let tool_calls: Vec<ToolCall> = self
            .tool_calls
            .into_values()
            .map(|b| ToolCall::new(b.id, b.name, b.arguments))
            .collect();

        let message = if tool_calls.is_empty() {
            Message::assistant(self.text)
        } else {
            let mut msg = Message::assistant_tool_calls(tool_calls);
            msg.content = self.text;
            msg
        };

        let stop_reason = self.stop_reason.unwrap_or_else(|| {
            if message.has_tool_calls() {
                StopReason::ToolCalls
            } else {
                StopReason::Stop
            }
        });

        ProviderResponse {
            message,
            stop_reason,
            usage: self.usage.unwrap_or_default(),
            model: None,
        }
    }
}
