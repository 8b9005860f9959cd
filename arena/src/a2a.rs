//! A2A (Agent-to-Agent) bridge.
//!
//! Remote A2A agents become callable tools. Discovery runs once per
//! registration: the bridge fetches the agent card and exposes one tool
//! per advertised skill, named `a2a__<agent>__<skill>` (sanitized).
//! Calling a skill tool posts the message text to the remote agent and
//! collects the streamed response.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use ra2a::client::{A2AClient, A2AClientBuilder, Client, ClientEvent};
use ra2a::types::Message as A2aMessage;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::error::{Error, Result, ToolError};
use crate::tools::{ToolDescriptor, ToolMode};

/// Connection settings for one remote A2A agent.
#[derive(Debug, Clone)]
pub struct A2aAgentConfig {
    /// Local name for the agent, used in tool names.
    pub name: String,
    /// Base URL of the agent endpoint.
    pub url: String,
    /// Optional bearer token.
    pub bearer_token: Option<String>,
    /// Request timeout in seconds.
    pub timeout_secs: Option<u64>,
}

impl A2aAgentConfig {
    /// Create a config for the given agent.
    #[must_use]
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            bearer_token: None,
            timeout_secs: None,
        }
    }

    /// Set a bearer token.
    #[must_use]
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }
}

/// Lowercase and replace anything outside `[a-z0-9_]`.
#[must_use]
pub fn sanitize_name(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Compose the bridged tool name for an agent skill.
#[must_use]
pub fn skill_tool_name(agent: &str, skill: &str) -> String {
    format!("a2a__{}__{}", sanitize_name(agent), sanitize_name(skill))
}

struct SkillBinding {
    client: Arc<A2AClient>,
    agent: String,
    description: String,
}

/// Bridges remote A2A agents into the tool system.
#[derive(Default)]
pub struct A2aBridge {
    bindings: HashMap<String, SkillBinding>,
}

impl std::fmt::Debug for A2aBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("A2aBridge")
            .field("tools", &self.bindings.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl A2aBridge {
    /// Create an empty bridge.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to a remote agent and register its skills as tools.
    ///
    /// Returns the descriptors for the newly registered tools.
    pub async fn connect(&mut self, config: A2aAgentConfig) -> Result<Vec<ToolDescriptor>> {
        info!(agent = %config.name, url = %config.url, "connecting to A2A agent");

        let mut builder = A2AClientBuilder::new(&config.url);
        if let Some(token) = &config.bearer_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(secs) = config.timeout_secs {
            builder = builder.timeout(secs);
        }
        let client = builder
            .build()
            .map_err(|e| Error::A2a(format!("failed to build client for '{}': {e}", config.url)))?;

        let card = client
            .get_agent_card()
            .await
            .map_err(|e| Error::A2a(format!("failed to fetch agent card from '{}': {e}", config.url)))?;

        info!(agent = %config.name, skills = card.skills.len(), "A2A agent connected");

        let client = Arc::new(client);
        let mut descriptors = Vec::with_capacity(card.skills.len());
        for skill in &card.skills {
            let tool_name = skill_tool_name(&config.name, &skill.id);
            let description = format!("{}: {}", skill.name, skill.description);

            self.bindings.insert(
                tool_name.clone(),
                SkillBinding {
                    client: client.clone(),
                    agent: config.name.clone(),
                    description: description.clone(),
                },
            );
            descriptors.push(descriptor(tool_name, description));
        }

        Ok(descriptors)
    }

    /// Descriptors for every bridged tool.
    #[must_use]
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.bindings
            .iter()
            .map(|(name, binding)| descriptor(name.clone(), binding.description.clone()))
            .collect()
    }

    /// Invoke a bridged skill tool.
    ///
    /// The call's `message` argument is posted to the remote agent; the
    /// streamed reply text is collected and returned.
    pub async fn call(&self, tool_name: &str, args: &Value) -> std::result::Result<String, ToolError> {
        let binding = self
            .bindings
            .get(tool_name)
            .ok_or_else(|| ToolError::NotFound {
                name: tool_name.to_string(),
            })?;

        let text = args
            .get("message")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::invalid_args("missing required field 'message' (string)"))?;

        let message = A2aMessage::user_text(text);
        let mut stream = binding.client.send_message(message).await.map_err(|e| {
            ToolError::execution(format!("A2A agent '{}' send failed: {e}", binding.agent))
        })?;

        let mut output = String::new();
        let mut push = |text: &str| {
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str(text);
        };

        while let Some(result) = stream.next().await {
            let event = result.map_err(|e| {
                ToolError::execution(format!("A2A agent '{}' stream error: {e}", binding.agent))
            })?;
            match event {
                ClientEvent::Message(msg) => {
                    if let Some(text) = msg.text_content() {
                        push(&text);
                    }
                }
                ClientEvent::TaskUpdate { task, .. } => {
                    if let Some(ref msg) = task.status.message
                        && let Some(text) = msg.text_content()
                    {
                        push(&text);
                    }
                    if let Some(ref artifacts) = task.artifacts {
                        for artifact in artifacts {
                            for part in &artifact.parts {
                                if let Some(text) = part.as_text() {
                                    push(text);
                                }
                            }
                        }
                    }
                }
            }
        }

        debug!(tool = tool_name, agent = %binding.agent, len = output.len(), "A2A response received");
        Ok(output)
    }
}

fn descriptor(name: String, description: String) -> ToolDescriptor {
    ToolDescriptor::new(
        name,
        description,
        json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "The message to send to the remote agent"
                }
            },
            "required": ["message"]
        }),
        ToolMode::A2a,
    )
}
