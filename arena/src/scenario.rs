//! Scenario definitions.
//!
//! A scenario scripts a multi-turn conversation: user turns trigger
//! generation through the pipeline, assistant turns seed context without
//! a provider call. Turn-level assertions ride on their turn;
//! conversation-level assertions run once after the scenario completes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::assertions::Assertion;
use crate::registry::DEFAULT_PROVIDER_GROUP;
use crate::selfplay::SelfPlayConfig;

/// Role of a scripted turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    /// Sent as the user; triggers one pipeline execution.
    User,
    /// Seeded into context as a prior assistant message; no generation.
    Assistant,
}

/// One scripted turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnDef {
    /// Who speaks.
    pub role: TurnRole,

    /// The message content. May carry `{{var}}` placeholders resolved
    /// from the scenario context.
    pub content: String,

    /// Turn-level assertions, evaluated for user turns only.
    #[serde(default)]
    pub assertions: Vec<Assertion>,
}

impl TurnDef {
    /// Create a user turn.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
            assertions: Vec::new(),
        }
    }

    /// Create an assistant context-seed turn.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
            assertions: Vec::new(),
        }
    }

    /// Attach assertions to this turn.
    #[must_use]
    pub fn with_assertions(mut self, assertions: Vec<Assertion>) -> Self {
        self.assertions = assertions;
        self
    }
}

/// Budget limits for one scenario run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ScenarioConstraints {
    /// Maximum total turns (scripted plus self-play).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<usize>,

    /// Maximum accumulated cost in USD.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost_usd: Option<f64>,
}

/// A declarative test scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario identifier.
    pub id: String,

    /// Task type used to select the prompt pack.
    pub task_type: String,

    /// Scripted turns, in order.
    #[serde(default)]
    pub turns: Vec<TurnDef>,

    /// Assertions over the whole conversation.
    #[serde(default)]
    pub conversation_assertions: Vec<Assertion>,

    /// Budget limits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<ScenarioConstraints>,

    /// Self-play settings; when present, the driver generates user turns
    /// after the scripted ones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_play: Option<SelfPlayConfig>,

    /// Provider group used for the assistant role.
    #[serde(default = "default_group")]
    pub provider_group: String,

    /// Base template variables for this scenario.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

fn default_group() -> String {
    DEFAULT_PROVIDER_GROUP.to_string()
}

impl Scenario {
    /// Create a scenario with no turns.
    #[must_use]
    pub fn new(id: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            turns: Vec::new(),
            conversation_assertions: Vec::new(),
            constraints: None,
            self_play: None,
            provider_group: default_group(),
            context: BTreeMap::new(),
        }
    }

    /// Append a turn.
    #[must_use]
    pub fn with_turn(mut self, turn: TurnDef) -> Self {
        self.turns.push(turn);
        self
    }

    /// Set conversation-level assertions.
    #[must_use]
    pub fn with_conversation_assertions(mut self, assertions: Vec<Assertion>) -> Self {
        self.conversation_assertions = assertions;
        self
    }

    /// Enable self-play.
    #[must_use]
    pub fn with_self_play(mut self, config: SelfPlayConfig) -> Self {
        self.self_play = Some(config);
        self
    }

    /// Set a scenario context variable.
    #[must_use]
    pub fn with_context_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(name.into(), value.into());
        self
    }
}
