//! Conversation state store.
//!
//! Conversations persist as append-only message logs plus a metadata map;
//! the arena extension additionally keeps the per-turn stage trace and the
//! validation lists that ride on messages. The in-memory implementation
//! serves runs and tests; other backends plug in behind [`StateStore`].

mod memory;

pub use memory::InMemoryStateStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::message::{Message, Role, count_role};
use crate::trace::StageEvent;

/// Reserved conversation metadata keys.
pub mod keys {
    /// User turns completed so far.
    pub const ARENA_USER_COMPLETED_TURNS: &str = "arena_user_completed_turns";
    /// The next user turn number.
    pub const ARENA_USER_NEXT_TURN: &str = "arena_user_next_turn";
    /// Assistant turns completed so far.
    pub const ARENA_ASSISTANT_COMPLETED_TURNS: &str = "arena_assistant_completed_turns";
    /// The next assistant turn number.
    pub const ARENA_ASSISTANT_NEXT_TURN: &str = "arena_assistant_next_turn";
    /// Accumulated cost in USD across all turns.
    pub const TOTAL_COST_USD: &str = "total_cost_usd";
    /// Accumulated token count across all turns.
    pub const TOTAL_TOKENS: &str = "total_tokens";
    /// The system prompt used for this conversation (for reporting).
    pub const SYSTEM_PROMPT: &str = "system_prompt";
    /// Scenario id when running against a mock provider.
    pub const MOCK_SCENARIO_ID: &str = "mock_scenario_id";
    /// Turn number when running against a mock provider.
    pub const MOCK_TURN_NUMBER: &str = "mock_turn_number";
    /// Which chain produced this context: `assistant` or `self_play_user`.
    pub const ARENA_ROLE: &str = "arena_role";
}

/// A persisted conversation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationState {
    /// Conversation identifier.
    pub id: String,

    /// Owning user, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Messages in chronological order.
    #[serde(default)]
    pub messages: Vec<Message>,

    /// Conversation metadata; see [`keys`] for reserved entries.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ConversationState {
    /// Create an empty conversation.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Completed turns for `role`: the metadata counter when present,
    /// otherwise derived by counting role occurrences.
    #[must_use]
    pub fn completed_turns(&self, role: Role) -> u64 {
        let key = match role {
            Role::User => keys::ARENA_USER_COMPLETED_TURNS,
            Role::Assistant => keys::ARENA_ASSISTANT_COMPLETED_TURNS,
            Role::System | Role::Tool => return count_role(&self.messages, role) as u64,
        };
        self.metadata
            .get(key)
            .and_then(Value::as_u64)
            .unwrap_or_else(|| count_role(&self.messages, role) as u64)
    }
}

/// A conversation plus its accumulated stage trace, as used for reports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArenaState {
    /// The conversation, including per-message validation lists.
    #[serde(flatten)]
    pub state: ConversationState,

    /// Stage events from every turn, in order.
    #[serde(default)]
    pub trace: Vec<StageEvent>,
}

/// Conversation persistence operations.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load a conversation.
    async fn load(&self, conversation_id: &str) -> Result<ConversationState, StoreError>;

    /// Persist a conversation, overwriting any previous value. Atomic per
    /// key.
    async fn save(&self, state: &ConversationState) -> Result<(), StoreError>;

    /// Persist a conversation and append this turn's stage events to its
    /// trace.
    async fn save_with_trace(
        &self,
        state: &ConversationState,
        trace: &[StageEvent],
    ) -> Result<(), StoreError>;

    /// Deep-copy `src` under the id `dst`.
    async fn fork(&self, src: &str, dst: &str) -> Result<(), StoreError>;

    /// Load the extended state including the accumulated trace.
    async fn arena_state(&self, conversation_id: &str) -> Result<ArenaState, StoreError>;

    /// Remove a conversation.
    async fn delete(&self, conversation_id: &str) -> Result<(), StoreError>;
}

/// Shared handle to a state store.
pub type SharedStateStore = std::sync::Arc<dyn StateStore>;
