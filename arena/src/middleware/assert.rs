//! Turn-level assertion middleware.

use async_trait::async_trait;
use serde_json::json;

use crate::assertions::{AssertionScope, evaluate_all};
use crate::context::ExecutionContext;
use crate::error::Result;
use crate::trace::StageEvent;

use super::{Middleware, Next};

/// Evaluates this turn's assertions after the provider stage populated
/// the response.
///
/// Outcomes land on the context for the executor to collect; a failing
/// assertion never fails the pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct TurnAssertionsMiddleware;

impl TurnAssertionsMiddleware {
    /// Create the middleware.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Middleware for TurnAssertionsMiddleware {
    fn name(&self) -> &'static str {
        "turn_assertions"
    }

    async fn process(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<()> {
        if !ctx.turn_assertions.is_empty() {
            let span = StageEvent::begin(self.name());
            let assertions = std::mem::take(&mut ctx.turn_assertions);

            let validations = ctx
                .response
                .as_ref()
                .map(|m| m.validations.clone())
                .unwrap_or_default();

            let scope = AssertionScope {
                messages: ctx.turn_messages(),
                tool_calls: &ctx.turn_tool_calls,
                validations: &validations,
                workflow: ctx.workflow.as_deref(),
            };
            let outcomes = evaluate_all(&assertions, &scope);

            let failed = outcomes.iter().filter(|o| !o.passed).count();
            ctx.record_stage(span.finish(
                "evaluated",
                json!({"assertions": outcomes.len(), "failed": failed}),
            ));
            ctx.assertion_results.extend(outcomes);
            ctx.turn_assertions = assertions;
        }

        next.run(ctx).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::assertions::Assertion;
    use crate::message::Message;
    use crate::middleware::Pipeline;

    #[tokio::test]
    async fn evaluates_assertions_against_turn_messages() {
        let pipeline = Pipeline::new(vec![Arc::new(TurnAssertionsMiddleware::new())]);

        let mut ctx = ExecutionContext::new("c");
        ctx.messages.push(Message::user("weather?"));
        ctx.messages.push(Message::assistant("It is sunny in Paris."));
        ctx.response = ctx.messages.last().cloned();
        ctx.turn_assertions = vec![Assertion::ContentIncludes {
            patterns: vec!["paris".into()],
        }];

        pipeline.execute(&mut ctx).await.unwrap();

        assert_eq!(ctx.assertion_results.len(), 1);
        assert!(ctx.assertion_results[0].passed);
    }

    #[tokio::test]
    async fn failing_assertion_does_not_fail_pipeline() {
        let pipeline = Pipeline::new(vec![Arc::new(TurnAssertionsMiddleware::new())]);

        let mut ctx = ExecutionContext::new("c");
        ctx.messages.push(Message::assistant("nothing relevant"));
        ctx.turn_assertions = vec![Assertion::ToolsCalled {
            tools: vec!["get_weather".into()],
        }];

        pipeline.execute(&mut ctx).await.unwrap();
        assert!(!ctx.assertion_results[0].passed);
    }

    #[tokio::test]
    async fn no_assertions_records_nothing() {
        let pipeline = Pipeline::new(vec![Arc::new(TurnAssertionsMiddleware::new())]);
        let mut ctx = ExecutionContext::new("c");
        pipeline.execute(&mut ctx).await.unwrap();
        assert!(ctx.assertion_results.is_empty());
        assert!(ctx.trace.is_empty());
    }
}
