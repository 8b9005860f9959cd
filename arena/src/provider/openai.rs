//! OpenAI-compatible Chat Completions provider.
//!
//! Speaks the `/chat/completions` wire format, which is also the dialect
//! exposed by most gateway and proxy deployments; point `base_url` at any
//! compatible endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::cost::Usage;
use crate::error::ProviderError;
use crate::message::{ContentPart, Message, Role, ToolCall};
use crate::stream::StopReason;

use super::{Provider, ProviderRequest, ProviderResponse};

/// Configuration for an OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// API key sent as a bearer token.
    pub api_key: String,
    /// Base URL, default `https://api.openai.com/v1`.
    pub base_url: String,
    /// Default model for requests that do not name one.
    pub model: String,
    /// Request timeout in seconds.
    pub timeout_secs: Option<u64>,
}

impl OpenAiConfig {
    /// Create a configuration for the given key and model.
    #[must_use]
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: model.into(),
            timeout_secs: None,
        }
    }

    /// Override the base URL.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set the request timeout.
    #[must_use]
    pub const fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// OpenAI-compatible Chat Completions client.
#[derive(Debug, Clone)]
pub struct OpenAiCompatible {
    name: String,
    config: OpenAiConfig,
    client: Client,
}

impl OpenAiCompatible {
    /// Create a client for the given endpoint configuration.
    pub fn new(
        name: impl Into<String>,
        config: OpenAiConfig,
    ) -> Result<Self, ProviderError> {
        if config.api_key.is_empty() {
            return Err(ProviderError::permanent("API key is required"));
        }

        let mut builder = Client::builder();
        if let Some(timeout) = config.timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout));
        }
        let client = builder.build().map_err(ProviderError::Http)?;

        Ok(Self {
            name: name.into(),
            config,
            client,
        })
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url)
    }

    fn build_body(&self, request: &ProviderRequest) -> WireRequest {
        let model = if request.model.is_empty() {
            self.config.model.clone()
        } else {
            request.model.clone()
        };

        WireRequest {
            model,
            messages: request.messages.iter().map(wire_message).collect(),
            temperature: request.sampling.temperature,
            top_p: request.sampling.top_p,
            max_tokens: request.sampling.max_tokens,
            seed: request.sampling.seed,
            frequency_penalty: request.sampling.frequency_penalty,
            presence_penalty: request.sampling.presence_penalty,
            tools: if request.tools.is_empty() {
                None
            } else {
                Some(
                    request
                        .tools
                        .iter()
                        .map(|t| WireTool {
                            kind: "function".to_string(),
                            function: WireFunction {
                                name: t.name.clone(),
                                description: t.description.clone(),
                                parameters: t.parameters.clone(),
                            },
                        })
                        .collect(),
                )
            },
        }
    }

    fn classify_status(status: u16, body: &str) -> ProviderError {
        let message = serde_json::from_str::<WireErrorResponse>(body)
            .map(|e| e.error.message)
            .unwrap_or_else(|_| body.chars().take(200).collect());

        if status == 429 || status >= 500 {
            ProviderError::transient(status, message)
        } else {
            ProviderError::permanent(format!("HTTP {status}: {message}"))
        }
    }

    fn parse_response(parsed: WireResponse) -> Result<ProviderResponse, ProviderError> {
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::permanent("response contained no choices"))?;

        let tool_calls: Option<Vec<ToolCall>> = choice.message.tool_calls.map(|calls| {
            calls
                .into_iter()
                .map(|tc| ToolCall::new(tc.id, tc.function.name, tc.function.arguments))
                .collect()
        });

        let content = choice.message.content.unwrap_or_default();
        let message = match tool_calls {
            Some(calls) if !calls.is_empty() => {
                let mut msg = Message::assistant_tool_calls(calls);
                msg.content = content;
                msg
            }
            _ => Message::assistant(content),
        };

        let usage = parsed.usage.map_or_else(Usage::default, |u| {
            Usage::new(u.prompt_tokens, u.completion_tokens).with_cached(
                u.prompt_tokens_details
                    .map_or(0, |d| d.cached_tokens),
            )
        });

        Ok(ProviderResponse {
            message,
            stop_reason: choice
                .finish_reason
                .as_deref()
                .map_or(StopReason::Stop, StopReason::parse),
            usage,
            model: parsed.model,
        })
    }
}

#[async_trait]
impl Provider for OpenAiCompatible {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> &str {
        &self.config.model
    }

    async fn complete(
        &self,
        request: &ProviderRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        let body = self.build_body(request);
        debug!(provider = %self.name, model = %body.model, messages = body.messages.len(), "chat request");

        let response = self
            .client
            .post(self.chat_url())
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status.as_u16(), &text));
        }

        let text = response.text().await?;
        let parsed: WireResponse = serde_json::from_str(&text)
            .map_err(|e| ProviderError::permanent(format!("unparseable response: {e}")))?;

        Self::parse_response(parsed)
    }
}

fn wire_message(msg: &Message) -> WireMessage {
    let content = if msg.parts.is_empty() {
        if msg.content.is_empty() && msg.has_tool_calls() {
            Value::Null
        } else {
            Value::String(msg.content.clone())
        }
    } else {
        // Multipart content uses the array encoding.
        let mut parts = Vec::new();
        if !msg.content.is_empty() {
            parts.push(json!({"type": "text", "text": msg.content}));
        }
        for part in &msg.parts {
            match part {
                ContentPart::Text { text } => {
                    parts.push(json!({"type": "text", "text": text}));
                }
                ContentPart::ImageUrl { url } => {
                    parts.push(json!({"type": "image_url", "image_url": {"url": url}}));
                }
                ContentPart::ImageData { media_type, data } => {
                    let url = format!("data:{media_type};base64,{data}");
                    parts.push(json!({"type": "image_url", "image_url": {"url": url}}));
                }
                ContentPart::AudioData { media_type, data } => {
                    let format = media_type.strip_prefix("audio/").unwrap_or(media_type);
                    parts.push(
                        json!({"type": "input_audio", "input_audio": {"data": data, "format": format}}),
                    );
                }
                ContentPart::MediaUrl { url, .. } => {
                    parts.push(json!({"type": "image_url", "image_url": {"url": url}}));
                }
            }
        }
        Value::Array(parts)
    };

    WireMessage {
        role: match msg.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
        .to_string(),
        content,
        tool_calls: msg.tool_calls.as_ref().map(|calls| {
            calls
                .iter()
                .map(|c| WireToolCall {
                    id: c.id.clone(),
                    kind: "function".to_string(),
                    function: WireFunctionCall {
                        name: c.name.clone(),
                        arguments: c.arguments.clone(),
                    },
                })
                .collect()
        }),
        tool_call_id: msg.tool_call_id.clone(),
    }
}

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: String,
    function: WireFunction,
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<WirePromptDetails>,
}

#[derive(Debug, Deserialize)]
struct WirePromptDetails {
    #[serde(default)]
    cached_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct WireErrorResponse {
    error: WireErrorBody,
}

#[derive(Debug, Deserialize)]
struct WireErrorBody {
    message: String,
}
