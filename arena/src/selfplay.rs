//! Self-play: persona-driven conversation generation.
//!
//! A self-play scenario alternates two pipelines over one conversation.
//! The user-generation chain renders the persona's prompt as its system
//! prompt and asks a provider for the next customer message; the
//! assistant chain is the standard pipeline. The driver merges the
//! transcripts (the user chain's output becomes a user message in the
//! assistant chain's input) and evaluates exit conditions after each
//! assistant turn. The two chains never overlap; they run serially on
//! the run's worker.

use std::sync::Arc;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::context::ExecutionContext;
use crate::cost::CostInfo;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::middleware::{Middleware, Next, Pipeline};
use crate::store::keys;

/// A self-play persona: who the generated user is and what they want.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    /// Persona identifier.
    pub id: String,

    /// Display name, available to the template as `{{ name }}`.
    pub name: String,

    /// Behavioral traits, available as `{{ traits }}`.
    #[serde(default)]
    pub traits: Vec<String>,

    /// What the persona is trying to achieve, available as `{{ goal }}`.
    #[serde(default)]
    pub goal: String,

    /// System prompt template for the user-generation chain.
    pub template: String,
}

impl Persona {
    /// Render the persona's system prompt.
    pub fn render_system_prompt(&self) -> Result<String> {
        let env = minijinja::Environment::new();
        let prompt = env.render_str(
            &self.template,
            minijinja::context! {
                name => self.name,
                traits => self.traits,
                goal => self.goal,
            },
        )?;
        Ok(prompt)
    }
}

/// Self-play settings on a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfPlayConfig {
    /// Persona id in the persona registry.
    pub persona: String,

    /// Hard cap on assistant turns.
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,

    /// Exit conditions, checked in order after each assistant turn.
    #[serde(default)]
    pub exit_conditions: Vec<ExitCondition>,
}

const fn default_max_turns() -> usize {
    10
}

impl SelfPlayConfig {
    /// Create a config for the given persona.
    #[must_use]
    pub fn new(persona: impl Into<String>) -> Self {
        Self {
            persona: persona.into(),
            max_turns: default_max_turns(),
            exit_conditions: Vec::new(),
        }
    }

    /// Set the turn cap.
    #[must_use]
    pub const fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    /// Add an exit condition.
    #[must_use]
    pub fn with_exit(mut self, condition: ExitCondition) -> Self {
        self.exit_conditions.push(condition);
        self
    }
}

/// When a self-play conversation ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExitCondition {
    /// The customer sounds satisfied.
    SatisfactionExpressed,
    /// The customer asks for a human or a manager.
    EscalationRequested,
    /// The assistant turn cap was reached.
    MaxTurnsReached,
    /// The latest user message matches a custom regex.
    Custom {
        /// The pattern.
        pattern: String,
    },
}

static SATISFACTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(thank(s| you)|that (resolved|solved|fixed|works|helps)|perfect|resolved it|all set)")
        .expect("valid regex")
});

static ESCALATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(manager|supervisor|escalate|human (agent|being)|real person)")
        .expect("valid regex")
});

/// How a self-play conversation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelfPlayOutcome {
    /// Satisfaction was expressed.
    Satisfied,
    /// Escalation was requested.
    Escalated,
    /// The turn cap fired.
    MaxTurnsReached,
    /// A custom pattern matched.
    CustomMatched,
}

impl SelfPlayOutcome {
    /// Whether this outcome counts as a successful conversation.
    ///
    /// Satisfaction and a matched custom goal succeed; escalation and
    /// running out of turns do not.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Satisfied | Self::CustomMatched)
    }
}

/// Result of one self-play conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfPlayResult {
    /// Why the conversation ended.
    pub outcome: SelfPlayOutcome,
    /// Generated user turns.
    pub user_turns: usize,
    /// Assistant turns.
    pub assistant_turns: usize,
    /// Cost of both chains combined.
    #[serde(default)]
    pub cost: CostInfo,
}

/// Sets the persona's rendered prompt as the system prompt of the
/// user-generation chain.
pub struct PersonaAssemblyMiddleware {
    persona: Arc<Persona>,
}

impl std::fmt::Debug for PersonaAssemblyMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersonaAssemblyMiddleware")
            .field("persona", &self.persona.id)
            .finish()
    }
}

impl PersonaAssemblyMiddleware {
    /// Create the middleware for a persona.
    #[must_use]
    pub fn new(persona: Arc<Persona>) -> Self {
        Self { persona }
    }
}

#[async_trait]
impl Middleware for PersonaAssemblyMiddleware {
    fn name(&self) -> &'static str {
        "persona_assembly"
    }

    async fn process(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<()> {
        ctx.system_prompt = self.persona.render_system_prompt()?;
        ctx.set_metadata(keys::ARENA_ROLE, json!("self_play_user"));
        next.run(ctx).await
    }
}

/// Drives a self-play conversation: alternate user generation and
/// assistant turns until an exit condition fires.
pub struct SelfPlayDriver {
    user_pipeline: Pipeline,
    assistant_pipeline: Pipeline,
    config: SelfPlayConfig,
}

impl std::fmt::Debug for SelfPlayDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfPlayDriver")
            .field("persona", &self.config.persona)
            .field("max_turns", &self.config.max_turns)
            .finish_non_exhaustive()
    }
}

impl SelfPlayDriver {
    /// Create a driver from the two chains.
    ///
    /// The user pipeline must contain the persona assembly and provider
    /// stages but no save stage: the driver merges its output into the
    /// assistant chain, which owns persistence.
    #[must_use]
    pub fn new(
        user_pipeline: Pipeline,
        assistant_pipeline: Pipeline,
        config: SelfPlayConfig,
    ) -> Self {
        Self {
            user_pipeline,
            assistant_pipeline,
            config,
        }
    }

    /// Run the conversation to an exit condition.
    pub async fn run(
        &self,
        conversation_id: &str,
        cancel: CancellationToken,
    ) -> Result<SelfPlayResult> {
        let mut user_turns = 0usize;
        let mut assistant_turns = 0usize;
        let mut cost = CostInfo::default();

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            // User-generation chain: the persona provider produces the
            // next user message.
            let mut user_ctx =
                ExecutionContext::new(conversation_id).with_cancellation(cancel.clone());
            user_ctx.set_metadata(keys::ARENA_ROLE, json!("self_play_user"));
            self.user_pipeline.execute(&mut user_ctx).await?;

            let user_text = user_ctx
                .response
                .as_ref()
                .map(Message::text)
                .unwrap_or_default();
            if user_text.is_empty() {
                return Err(Error::internal("self-play user chain produced no message"));
            }
            user_turns += 1;
            cost += user_ctx.cost;
            debug!(turn = user_turns, "self-play user message generated");

            // Assistant chain over the merged transcript.
            let mut assistant_ctx = ExecutionContext::new(conversation_id)
                .with_cancellation(cancel.clone())
                .with_message(Message::user(user_text.clone()));
            assistant_ctx.set_metadata(keys::ARENA_ROLE, json!("assistant"));
            self.assistant_pipeline.execute(&mut assistant_ctx).await?;
            assistant_turns += 1;
            cost += assistant_ctx.cost;

            let assistant_text = assistant_ctx
                .response
                .as_ref()
                .map(Message::text)
                .unwrap_or_default();

            if let Some(outcome) =
                self.check_exits(&user_text, &assistant_text, assistant_turns)
            {
                info!(
                    outcome = ?outcome,
                    user_turns,
                    assistant_turns,
                    "self-play conversation ended",
                );
                return Ok(SelfPlayResult {
                    outcome,
                    user_turns,
                    assistant_turns,
                    cost,
                });
            }
        }
    }

    /// Evaluate exit conditions after an assistant turn; first match
    /// wins. The turn cap always applies, listed or not.
    fn check_exits(
        &self,
        user_text: &str,
        assistant_text: &str,
        assistant_turns: usize,
    ) -> Option<SelfPlayOutcome> {
        for condition in &self.config.exit_conditions {
            match condition {
                ExitCondition::SatisfactionExpressed => {
                    if SATISFACTION.is_match(user_text) || SATISFACTION.is_match(assistant_text) {
                        return Some(SelfPlayOutcome::Satisfied);
                    }
                }
                ExitCondition::EscalationRequested => {
                    if ESCALATION.is_match(user_text) {
                        return Some(SelfPlayOutcome::Escalated);
                    }
                }
                ExitCondition::MaxTurnsReached => {
                    if assistant_turns >= self.config.max_turns {
                        return Some(SelfPlayOutcome::MaxTurnsReached);
                    }
                }
                ExitCondition::Custom { pattern } => {
                    if Regex::new(pattern).is_ok_and(|re| re.is_match(user_text)) {
                        return Some(SelfPlayOutcome::CustomMatched);
                    }
                }
            }
        }

        (assistant_turns >= self.config.max_turns).then_some(SelfPlayOutcome::MaxTurnsReached)
    }
}
