//! In-memory state store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::trace::StageEvent;

use super::{ArenaState, ConversationState, StateStore};

#[derive(Debug, Clone, Default)]
struct Entry {
    state: ConversationState,
    trace: Vec<StageEvent>,
}

/// Conversation store backed by a `tokio::sync::RwLock<HashMap>`.
///
/// Loads clone a snapshot under the read lock, so concurrent readers never
/// block each other; saves take the write lock, making each save atomic
/// per key. All data is lost when the value drops.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl InMemoryStateStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored conversations.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the store holds no conversations.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self, conversation_id: &str) -> Result<ConversationState, StoreError> {
        self.entries
            .read()
            .await
            .get(conversation_id)
            .map(|e| e.state.clone())
            .ok_or_else(|| StoreError::NotFound {
                id: conversation_id.to_string(),
            })
    }

    async fn save(&self, state: &ConversationState) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(state.id.clone()).or_default();
        entry.state = state.clone();
        Ok(())
    }

    async fn save_with_trace(
        &self,
        state: &ConversationState,
        trace: &[StageEvent],
    ) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(state.id.clone()).or_default();
        entry.state = state.clone();
        entry.trace.extend(trace.iter().cloned());
        Ok(())
    }

    async fn fork(&self, src: &str, dst: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        let mut copy = entries
            .get(src)
            .cloned()
            .ok_or_else(|| StoreError::ForkSourceMissing {
                id: src.to_string(),
            })?;
        copy.state.id = dst.to_string();
        entries.insert(dst.to_string(), copy);
        Ok(())
    }

    async fn arena_state(&self, conversation_id: &str) -> Result<ArenaState, StoreError> {
        self.entries
            .read()
            .await
            .get(conversation_id)
            .map(|e| ArenaState {
                state: e.state.clone(),
                trace: e.trace.clone(),
            })
            .ok_or_else(|| StoreError::NotFound {
                id: conversation_id.to_string(),
            })
    }

    async fn delete(&self, conversation_id: &str) -> Result<(), StoreError> {
        self.entries.write().await.remove(conversation_id);
        Ok(())
    }
}
