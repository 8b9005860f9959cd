//! State load and save middlewares.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use crate::context::ExecutionContext;
use crate::error::{Result, StoreError};
use crate::message::{Message, Role};
use crate::store::{ConversationState, SharedStateStore, keys};
use crate::trace::StageEvent;

use super::{Middleware, Next};

/// Loads the persisted conversation and prepends its history to the
/// turn's input message.
///
/// The stored system message, if any, is not carried into the context:
/// the prompt-assembly stage owns the system prompt, and the save stage
/// re-prepends it idempotently.
pub struct StateLoadMiddleware {
    store: SharedStateStore,
}

impl std::fmt::Debug for StateLoadMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateLoadMiddleware").finish_non_exhaustive()
    }
}

impl StateLoadMiddleware {
    /// Create a load middleware over the given store.
    #[must_use]
    pub fn new(store: SharedStateStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Middleware for StateLoadMiddleware {
    fn name(&self) -> &'static str {
        "state_load"
    }

    async fn process(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<()> {
        let span = StageEvent::begin(self.name());

        match self.store.load(&ctx.conversation_id).await {
            Ok(state) => {
                let mut history: Vec<Message> = state
                    .messages
                    .into_iter()
                    .filter(|m| m.role != Role::System)
                    .collect();
                ctx.turn_start = history.len();
                history.append(&mut ctx.messages);
                ctx.messages = history;

                // Loaded metadata seeds the context, but values already on
                // the context (set by the driver for this turn) win.
                let mut metadata = state.metadata;
                for (key, value) in std::mem::take(&mut ctx.metadata) {
                    metadata.insert(key, value);
                }
                ctx.metadata = metadata;

                ctx.record_stage(span.finish("loaded", json!({"messages": ctx.turn_start})));
            }
            Err(StoreError::NotFound { .. }) => {
                ctx.turn_start = 0;
                ctx.record_stage(span.finish("fresh", Value::Null));
            }
            Err(err) => return Err(err.into()),
        }

        next.run(ctx).await
    }
}

/// Commits conversation state after the rest of the chain ran.
///
/// The save happens even when an inner stage failed, so a failed run
/// still leaves an inspectable transcript; the inner error is returned
/// afterwards.
pub struct StateSaveMiddleware {
    store: SharedStateStore,
}

impl std::fmt::Debug for StateSaveMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSaveMiddleware").finish_non_exhaustive()
    }
}

impl StateSaveMiddleware {
    /// Create a save middleware over the given store.
    #[must_use]
    pub fn new(store: SharedStateStore) -> Self {
        Self { store }
    }

    fn build_state(ctx: &ExecutionContext) -> ConversationState {
        let mut messages = ctx.messages.clone();

        // Prepend the system prompt once. The synthetic message takes the
        // first message's timestamp so replays sort stably.
        if !ctx.system_prompt.is_empty()
            && messages.first().is_none_or(|m| m.role != Role::System)
        {
            let timestamp = messages
                .first()
                .map_or_else(chrono::Utc::now, |m| m.timestamp);
            messages.insert(
                0,
                Message::system(ctx.system_prompt.clone()).with_timestamp(timestamp),
            );
        }

        let mut metadata = ctx.metadata.clone();
        if ctx.cost.total_cost > 0.0 {
            let prior_cost = metadata
                .get(keys::TOTAL_COST_USD)
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            let prior_tokens = metadata
                .get(keys::TOTAL_TOKENS)
                .and_then(Value::as_u64)
                .unwrap_or(0);
            metadata.insert(
                keys::TOTAL_COST_USD.to_string(),
                json!(prior_cost + ctx.cost.total_cost),
            );
            metadata.insert(
                keys::TOTAL_TOKENS.to_string(),
                json!(prior_tokens + ctx.cost.total_tokens()),
            );
        }
        if !ctx.system_prompt.is_empty() {
            metadata.insert(
                keys::SYSTEM_PROMPT.to_string(),
                Value::String(ctx.system_prompt.clone()),
            );
        }

        ConversationState {
            id: ctx.conversation_id.clone(),
            user_id: None,
            messages,
            metadata,
        }
    }
}

#[async_trait]
impl Middleware for StateSaveMiddleware {
    fn name(&self) -> &'static str {
        "state_save"
    }

    async fn process(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<()> {
        let inner = next.run(ctx).await;

        let span = StageEvent::begin(self.name());
        let state = Self::build_state(ctx);
        let saved = self.store.save_with_trace(&state, &ctx.trace).await;
        debug!(
            conversation = %ctx.conversation_id,
            messages = state.messages.len(),
            on_error = inner.is_err(),
            "state saved",
        );
        ctx.record_stage(span.finish(
            "saved",
            json!({"messages": state.messages.len(), "on_error": inner.is_err()}),
        ));

        // The inner error outranks a save failure.
        match (inner, saved) {
            (Err(err), _) => Err(err),
            (Ok(()), Err(err)) => Err(err.into()),
            (Ok(()), Ok(())) => Ok(()),
        }
    }
}
