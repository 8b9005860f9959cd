//! Per-turn execution context.
//!
//! The context is the single mutable carrier that travels down the
//! middleware chain for one conversation turn: message history, template
//! variables, the assembled system prompt, metadata, the terminal
//! response, cost totals, and the stage trace. It is created by the run
//! executor, owned by exactly one turn, and discarded afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::assertions::{Assertion, AssertionOutcome, WorkflowTrace};
use crate::cost::CostInfo;
use crate::message::{Message, ToolCall};
use crate::middleware::Middleware;
use crate::trace::StageEvent;
use crate::validators::SharedValidator;

/// Mutable state for one pipeline execution.
pub struct ExecutionContext {
    /// Conversation this turn belongs to.
    pub conversation_id: String,

    /// Cancellation handle scoped to the run. Every provider, tool, and
    /// store call observes it.
    pub cancellation: CancellationToken,

    /// Message history (without the system message) plus this turn's
    /// input; the provider stage appends assistant and tool messages.
    pub messages: Vec<Message>,

    /// Template variables for `{{var}}` substitution.
    pub variables: BTreeMap<String, String>,

    /// Assembled system prompt.
    pub system_prompt: String,

    /// Conversation metadata, loaded from and saved back to the store.
    pub metadata: Map<String, Value>,

    /// Terminal assistant response of this turn.
    pub response: Option<Message>,

    /// Cost accumulated by this turn's provider calls.
    pub cost: CostInfo,

    /// Stage events recorded during this turn.
    pub trace: Vec<StageEvent>,

    /// Validators installed for this turn; the provider stage scores them
    /// against the terminal response.
    pub validators: Vec<SharedValidator>,

    /// Assertions to evaluate for this turn.
    pub turn_assertions: Vec<Assertion>,

    /// Outcomes of this turn's assertions.
    pub assertion_results: Vec<AssertionOutcome>,

    /// Tool calls issued during this turn, in dispatch order.
    pub turn_tool_calls: Vec<ToolCall>,

    /// Index into [`messages`](Self::messages) where this turn's new
    /// messages begin. Set by the state-load stage after prepending
    /// history.
    pub turn_start: usize,

    /// Optional workflow transition log consulted by workflow assertions.
    pub workflow: Option<Arc<dyn WorkflowTrace>>,

    stream_targets: Vec<Arc<dyn Middleware>>,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("conversation_id", &self.conversation_id)
            .field("messages", &self.messages.len())
            .field("system_prompt", &self.system_prompt.len())
            .field("cost", &self.cost)
            .finish_non_exhaustive()
    }
}

impl ExecutionContext {
    /// Create a context for the given conversation.
    #[must_use]
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            cancellation: CancellationToken::new(),
            messages: Vec::new(),
            variables: BTreeMap::new(),
            system_prompt: String::new(),
            metadata: Map::new(),
            response: None,
            cost: CostInfo::default(),
            trace: Vec::new(),
            validators: Vec::new(),
            turn_assertions: Vec::new(),
            assertion_results: Vec::new(),
            turn_tool_calls: Vec::new(),
            turn_start: 0,
            workflow: None,
            stream_targets: Vec::new(),
        }
    }

    /// Messages appended during this turn.
    #[must_use]
    pub fn turn_messages(&self) -> &[Message] {
        &self.messages[self.turn_start.min(self.messages.len())..]
    }

    /// Use the given cancellation handle instead of a fresh one.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Seed this turn's input message.
    #[must_use]
    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    /// Set a template variable.
    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(name.into(), value.into());
    }

    /// Set a metadata value.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }

    /// Read a metadata value as a string.
    #[must_use]
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Append a stage event to the trace.
    pub fn record_stage(&mut self, event: StageEvent) {
        self.trace.push(event);
    }

    /// The last assistant message in the transcript.
    #[must_use]
    pub fn last_assistant(&self) -> Option<&Message> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == crate::message::Role::Assistant)
    }

    /// Middlewares registered for stream-chunk broadcast.
    ///
    /// Installed by the pipeline at the start of execution; chunks are
    /// delivered in registration order, never through the onion.
    #[must_use]
    pub fn stream_targets(&self) -> Vec<Arc<dyn Middleware>> {
        self.stream_targets.clone()
    }

    pub(crate) fn set_stream_targets(&mut self, targets: Vec<Arc<dyn Middleware>>) {
        self.stream_targets = targets;
    }
}
