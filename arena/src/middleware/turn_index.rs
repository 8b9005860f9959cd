//! Turn counter middleware.

use async_trait::async_trait;
use serde_json::json;

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::message::{Role, count_role};
use crate::store::keys;

use super::{Middleware, Next};

/// Derives the turn counters from the message history and writes them to
/// metadata.
///
/// Messages never carry turn indices; the counters are a pure function of
/// role occurrences in the authoritative history, computed here and only
/// here. A user or assistant turn counts as completed once its message is
/// part of the history, so running this middleware any number of times on
/// the same context yields the same metadata. After the inner chain
/// appended this turn's messages the counters are refreshed, so the save
/// stage persists totals that match the final transcript.
#[derive(Debug, Clone, Copy, Default)]
pub struct TurnIndexMiddleware;

impl TurnIndexMiddleware {
    /// Create the middleware.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn write_counters(ctx: &mut ExecutionContext) {
        let user_turns = count_role(&ctx.messages, Role::User) as u64;
        let assistant_turns = count_role(&ctx.messages, Role::Assistant) as u64;

        ctx.set_metadata(keys::ARENA_USER_COMPLETED_TURNS, json!(user_turns));
        ctx.set_metadata(keys::ARENA_USER_NEXT_TURN, json!(user_turns + 1));
        ctx.set_metadata(
            keys::ARENA_ASSISTANT_COMPLETED_TURNS,
            json!(assistant_turns),
        );
        ctx.set_metadata(keys::ARENA_ASSISTANT_NEXT_TURN, json!(assistant_turns + 1));
    }
}

#[async_trait]
impl Middleware for TurnIndexMiddleware {
    fn name(&self) -> &'static str {
        "turn_index"
    }

    async fn process(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<()> {
        Self::write_counters(ctx);
        let result = next.run(ctx).await;
        if result.is_ok() {
            Self::write_counters(ctx);
        }
        result
    }
}
