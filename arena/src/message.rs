//! Conversation message types.
//!
//! Messages follow chat-completion conventions: a role, textual content,
//! optional multimodal parts, and OpenAI-style tool calls. Each message
//! additionally carries a timestamp and the validation results that were
//! scored against it, so a persisted transcript is self-describing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::validators::ValidationResult;

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions. At most one per conversation, always first.
    System,
    /// End-user (or self-play persona) input.
    User,
    /// Model output.
    Assistant,
    /// Result of a tool call, referencing a prior assistant tool call.
    Tool,
}

impl Role {
    /// String representation of the role.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single piece of multimodal message content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text.
    Text {
        /// The text content.
        text: String,
    },
    /// An image referenced by URL.
    ImageUrl {
        /// The image URL.
        url: String,
    },
    /// Inline image bytes, already encoded for the provider.
    ImageData {
        /// MIME type, e.g. `image/png`.
        media_type: String,
        /// Base64-encoded payload.
        data: String,
    },
    /// Inline audio bytes, already encoded for the provider.
    AudioData {
        /// MIME type, e.g. `audio/wav`.
        media_type: String,
        /// Base64-encoded payload.
        data: String,
    },
    /// Arbitrary media referenced by URL.
    MediaUrl {
        /// MIME type of the referenced media.
        media_type: String,
        /// The media URL.
        url: String,
    },
}

impl ContentPart {
    /// Create a text part.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// The text content, if this is a text part.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// A tool call requested by the model.
///
/// Arguments are kept in their OpenAI wire form: a JSON-encoded string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier for this call, echoed by the tool result.
    pub id: String,
    /// Name of the tool being called.
    pub name: String,
    /// JSON-encoded argument object.
    pub arguments: String,
}

impl ToolCall {
    /// Create a new tool call.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// Parse the arguments as a JSON value.
    ///
    /// An empty argument string parses as an empty object.
    #[must_use]
    pub fn arguments_value(&self) -> Value {
        if self.arguments.trim().is_empty() {
            return Value::Object(serde_json::Map::new());
        }
        serde_json::from_str(&self.arguments).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
    }

    /// Deserialize the arguments into a typed value.
    pub fn parse_arguments<T: for<'de> Deserialize<'de>>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.arguments)
    }
}

/// A message in a conversation transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Role of the sender.
    pub role: Role,

    /// Textual content. Empty for assistant messages that only carry tool
    /// calls.
    #[serde(default)]
    pub content: String,

    /// Multimodal content parts, when the message is not plain text.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<ContentPart>,

    /// Tool calls requested by an assistant message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,

    /// For tool messages: the id of the assistant tool call this answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// For tool messages: whether the result is an error observation
    /// rather than a successful tool output.
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_error: bool,

    /// When the message was produced.
    pub timestamp: DateTime<Utc>,

    /// Validation results scored against this message. Turn-local: they
    /// belong to the message they were scored on and are never merged
    /// across turns.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validations: Vec<ValidationResult>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            parts: Vec::new(),
            tool_calls: None,
            tool_call_id: None,
            is_error: false,
            timestamp: Utc::now(),
            validations: Vec::new(),
        }
    }

    /// Create a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create an assistant message carrying tool calls and no text.
    #[must_use]
    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::new(Role::Assistant, "");
        msg.tool_calls = Some(tool_calls);
        msg
    }

    /// Create a tool-result message answering `tool_call_id`.
    #[must_use]
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::new(Role::Tool, content);
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    /// Create an error-marked tool-result message answering
    /// `tool_call_id`. The model still observes the content; the flag
    /// lets persisted transcripts tell failures from normal results.
    #[must_use]
    pub fn tool_error(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::tool(tool_call_id, content);
        msg.is_error = true;
        msg
    }

    /// Override the timestamp.
    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Append tool calls to this message.
    #[must_use]
    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = Some(tool_calls);
        self
    }

    /// Whether the message carries at least one tool call.
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|c| !c.is_empty())
    }

    /// The textual content: `content` plus any text parts.
    #[must_use]
    pub fn text(&self) -> String {
        if self.parts.is_empty() {
            return self.content.clone();
        }
        let mut out = self.content.clone();
        for part in &self.parts {
            if let Some(text) = part.as_text() {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        out
    }

    /// Attach a validation result to this message.
    pub fn attach_validation(&mut self, result: ValidationResult) {
        self.validations.push(result);
    }
}

/// Count the messages with the given role.
#[must_use]
pub fn count_role(messages: &[Message], role: Role) -> usize {
    messages.iter().filter(|m| m.role == role).count()
}
