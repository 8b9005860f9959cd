//! Provider middleware: the completion call and the tool-calling loop.
//!
//! Given the assembled system prompt and message history, this stage
//! calls the provider; while the model keeps requesting tools it
//! dispatches them (in parallel, results appended in the provider's call
//! order) and calls the provider again, bounded by `max_rounds`. The
//! terminal response is validated, written to the context, and the rest
//! of the chain runs.
//!
//! Failure rules: transient provider errors retry with exponential
//! backoff; tool failures never propagate, the model observes them as
//! `is_error` tool-result messages; cancellation and the per-turn
//! timeout cut the in-flight call, retaining partial streamed text.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tracing::{debug, info_span, warn};
use tracing::Instrument as _;

use crate::context::ExecutionContext;
use crate::error::{Error, Result, ToolError};
use crate::message::{Message, ToolCall};
use crate::middleware::broadcast_chunk;
use crate::pack::PromptPack;
use crate::provider::{ProviderRequest, ProviderResponse, RetryPolicy};
use crate::registry::ProviderEntry;
use crate::stream::StreamAggregator;
use crate::tools::ToolDispatcher;
use crate::trace::StageEvent;

use super::{Middleware, Next};

/// Tunables for the provider stage.
#[derive(Debug, Clone, Copy)]
pub struct ProviderMiddlewareConfig {
    /// Maximum tool-calling rounds before the turn fails.
    pub max_rounds: usize,
    /// Budget for each provider call, including stream consumption.
    pub turn_timeout: Duration,
    /// Retry policy for transient provider failures.
    pub retry: RetryPolicy,
    /// Prefer the provider's native streaming path when available.
    pub streaming: bool,
}

impl Default for ProviderMiddlewareConfig {
    fn default() -> Self {
        Self {
            max_rounds: 5,
            turn_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            streaming: true,
        }
    }
}

/// The provider stage.
pub struct ProviderMiddleware {
    entry: Arc<ProviderEntry>,
    pack: Arc<PromptPack>,
    dispatcher: Arc<ToolDispatcher>,
    config: ProviderMiddlewareConfig,
}

impl std::fmt::Debug for ProviderMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderMiddleware")
            .field("provider", &self.entry.id)
            .field("pack", &self.pack.id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ProviderMiddleware {
    /// Create the stage for one provider and pack.
    #[must_use]
    pub fn new(
        entry: Arc<ProviderEntry>,
        pack: Arc<PromptPack>,
        dispatcher: Arc<ToolDispatcher>,
    ) -> Self {
        Self {
            entry,
            pack,
            dispatcher,
            config: ProviderMiddlewareConfig::default(),
        }
    }

    /// Override the stage configuration.
    #[must_use]
    pub const fn with_config(mut self, config: ProviderMiddlewareConfig) -> Self {
        self.config = config;
        self
    }

    fn build_request(&self, ctx: &ExecutionContext) -> ProviderRequest {
        let mut messages = Vec::with_capacity(ctx.messages.len() + 1);
        if !ctx.system_prompt.is_empty() {
            messages.push(Message::system(ctx.system_prompt.clone()));
        }
        messages.extend(ctx.messages.iter().cloned());

        ProviderRequest::new("")
            .messages(messages)
            .sampling(self.entry.sampling)
            .tools(
                self.dispatcher
                    .registry()
                    .definitions_for(&self.pack.allowed_tools),
            )
    }

    /// One provider call under the turn timeout and cancellation handle.
    ///
    /// Streamed text also lands in `partial` so a timed-out turn keeps
    /// what already arrived.
    async fn call_once(
        &self,
        ctx: &ExecutionContext,
        request: &ProviderRequest,
        partial: &Mutex<String>,
    ) -> Result<ProviderResponse> {
        if ctx.cancellation.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let provider = &self.entry.provider;

        let fut = async {
            if self.config.streaming && provider.supports_streaming() {
                let mut stream = provider.stream(request).await.map_err(Error::Provider)?;
                let mut aggregator = StreamAggregator::new();
                while let Some(item) = stream.next().await {
                    let chunk = item.map_err(Error::Provider)?;
                    broadcast_chunk(ctx, &chunk).await;
                    if let Some(text) = chunk.as_text()
                        && let Ok(mut partial) = partial.lock()
                    {
                        partial.push_str(text);
                    }
                    aggregator.apply(&chunk);
                }
                Ok(aggregator.into_response())
            } else {
                provider.complete(request).await.map_err(Error::Provider)
            }
        };

        tokio::select! {
            () = ctx.cancellation.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(self.config.turn_timeout, fut) => match result {
                Err(_elapsed) => Err(Error::Timeout(self.config.turn_timeout)),
                Ok(inner) => inner,
            },
        }
    }

    async fn call_with_retry(
        &self,
        ctx: &ExecutionContext,
        request: &ProviderRequest,
        partial: &Mutex<String>,
    ) -> Result<ProviderResponse> {
        let mut attempt: u32 = 0;
        loop {
            match self.call_once(ctx, request, partial).await {
                Ok(response) => return Ok(response),
                Err(Error::Provider(err))
                    if err.is_transient() && self.config.retry.should_retry(attempt) =>
                {
                    let delay = self.config.retry.backoff(attempt);
                    warn!(
                        provider = %self.entry.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient provider error, retrying",
                    );
                    tokio::select! {
                        () = ctx.cancellation.cancelled() => return Err(Error::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Dispatch one round of tool calls in parallel and append results in
    /// the provider's call order.
    async fn run_tool_round(&self, ctx: &mut ExecutionContext, calls: &[ToolCall]) {
        let span = StageEvent::begin("tool_dispatch");

        let futures: Vec<_> = calls
            .iter()
            .map(|call| {
                let allowed = self.pack.is_tool_allowed(&call.name);
                let dispatcher = self.dispatcher.clone();
                let cancel = ctx.cancellation.clone();
                let call = call.clone();
                async move {
                    if !allowed {
                        return (
                            call.id.clone(),
                            Err(ToolError::NotAllowed {
                                name: call.name.clone(),
                            }),
                        );
                    }
                    let result = dispatcher.dispatch(&call, &cancel).await;
                    (call.id.clone(), result)
                }
            })
            .collect();

        // join_all keeps input order, so results append deterministically
        // regardless of completion order.
        let results = futures::future::join_all(futures).await;

        let mut errors = 0usize;
        for (call_id, result) in results {
            let message = match result {
                Ok(output) => {
                    if output.is_error {
                        errors += 1;
                        Message::tool_error(call_id, output.content)
                    } else {
                        Message::tool(call_id, output.content)
                    }
                }
                Err(ToolError::NotAllowed { .. }) => {
                    // Whitelist rejections have a fixed shape.
                    errors += 1;
                    Message::tool_error(call_id, "<error: tool not allowed>")
                }
                Err(err) => {
                    errors += 1;
                    Message::tool_error(call_id, format!("<error: {err}>"))
                }
            };
            ctx.messages.push(message);
        }

        ctx.turn_tool_calls.extend(calls.iter().cloned());
        ctx.record_stage(span.finish(
            "dispatched",
            json!({"calls": calls.len(), "errors": errors}),
        ));
    }

    /// Score the installed validators against the terminal message.
    async fn run_validators(&self, ctx: &mut ExecutionContext, terminal: &mut Message) {
        if ctx.validators.is_empty() {
            return;
        }
        let text = terminal.text();
        for validator in ctx.validators.clone() {
            let result = validator.validate(&text, &ctx.metadata).await;
            if !result.passed {
                debug!(validator = validator.label(), "validation failed");
            }
            terminal.attach_validation(result);
        }
    }
}

#[async_trait]
impl Middleware for ProviderMiddleware {
    fn name(&self) -> &'static str {
        "provider"
    }

    async fn process(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<()> {
        let span = info_span!(
            "provider",
            provider = %self.entry.id,
            conversation = %ctx.conversation_id,
        );

        async {
            let partial = Mutex::new(String::new());
            let mut round = 0usize;

            loop {
                let request = self.build_request(ctx);
                let stage = StageEvent::begin("provider");

                let response = match self.call_with_retry(ctx, &request, &partial).await {
                    Ok(response) => response,
                    Err(err) => {
                        // A timed-out stream keeps whatever text arrived.
                        if matches!(err, Error::Timeout(_))
                            && let Ok(mut partial) = partial.lock()
                            && !partial.is_empty()
                        {
                            let text = std::mem::take(&mut *partial);
                            ctx.messages.push(Message::assistant(text));
                        }
                        ctx.record_stage(stage.finish("error", json!({"error": err.to_string()})));
                        return Err(err);
                    }
                };

                ctx.cost.record(&response.usage, &self.entry.pricing);
                ctx.record_stage(stage.finish(
                    "completed",
                    json!({
                        "round": round,
                        "stop_reason": response.stop_reason.as_str(),
                        "input_tokens": response.usage.input_tokens,
                        "output_tokens": response.usage.output_tokens,
                    }),
                ));

                let message = response.message;
                let Some(calls) = message.tool_calls.clone().filter(|c| !c.is_empty()) else {
                    // Terminal response: validate, publish, descend.
                    let mut terminal = message;
                    self.run_validators(ctx, &mut terminal).await;
                    ctx.messages.push(terminal.clone());
                    ctx.response = Some(terminal);
                    return next.run(ctx).await;
                };

                // The model wants tools. The tool-call message is always
                // preserved, even when the round budget is exhausted.
                ctx.messages.push(message);
                if round >= self.config.max_rounds {
                    warn!(provider = %self.entry.id, round, "tool loop exceeded");
                    ctx.turn_tool_calls.extend(calls);
                    return Err(Error::ToolLoopExceeded {
                        max_rounds: self.config.max_rounds,
                    });
                }

                self.run_tool_round(ctx, &calls).await;
                round += 1;
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::middleware::Pipeline;
    use crate::provider::MockProvider;
    use crate::registry::ProviderEntry;
    use crate::tools::{ToolDescriptor, ToolDispatcher, ToolRegistry};
    use serde_json::json;

    fn weather_registry() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry.register(ToolDescriptor::mock(
            "get_weather",
            "Current weather",
            json!({"type": "object"}),
            json!("22C and sunny in Paris"),
        ));
        Arc::new(registry)
    }

    fn stage(provider: MockProvider, pack: PromptPack) -> ProviderMiddleware {
        let entry = Arc::new(ProviderEntry::new("mock", Arc::new(provider)));
        let dispatcher = Arc::new(ToolDispatcher::new(weather_registry()));
        ProviderMiddleware::new(entry, Arc::new(pack), dispatcher)
    }

    fn pipeline(middleware: ProviderMiddleware) -> Pipeline {
        Pipeline::new(vec![Arc::new(middleware)])
    }

    #[tokio::test]
    async fn plain_response_becomes_terminal_message() {
        let provider = MockProvider::new("mock").respond_text("Hello!");
        let pack = PromptPack::new("p", "support", "be nice");

        let mut ctx = ExecutionContext::new("c").with_message(Message::user("hi"));
        ctx.system_prompt = "be nice".to_string();
        pipeline(stage(provider, pack)).execute(&mut ctx).await.unwrap();

        assert_eq!(ctx.response.as_ref().unwrap().content, "Hello!");
        assert_eq!(ctx.messages.len(), 2);
        assert!(ctx.cost.total_tokens() > 0);
    }

    #[tokio::test]
    async fn tool_loop_dispatches_and_calls_again() {
        let provider = MockProvider::new("mock")
            .respond_tool_call("call_1", "get_weather", r#"{"location":"Paris"}"#)
            .respond_text("It is 22C and sunny in Paris.");
        let pack = PromptPack::new("p", "support", "x").allow_tool("get_weather");

        let mut ctx = ExecutionContext::new("c").with_message(Message::user("weather in Paris?"));
        pipeline(stage(provider, pack)).execute(&mut ctx).await.unwrap();

        // user, assistant(tool_calls), tool result, terminal assistant.
        assert_eq!(ctx.messages.len(), 4);
        assert!(ctx.messages[1].has_tool_calls());
        assert_eq!(ctx.messages[2].tool_call_id.as_deref(), Some("call_1"));
        assert!(ctx.messages[2].content.contains("sunny"));
        assert!(!ctx.messages[2].is_error);
        assert_eq!(ctx.turn_tool_calls.len(), 1);
        assert!(ctx.response.as_ref().unwrap().content.contains("Paris"));
    }

    #[tokio::test]
    async fn disallowed_tool_becomes_error_result() {
        let provider = MockProvider::new("mock")
            .respond_tool_call("call_1", "get_weather", "{}")
            .respond_text("done");
        // Pack allows nothing.
        let pack = PromptPack::new("p", "support", "x");

        let mut ctx = ExecutionContext::new("c").with_message(Message::user("q"));
        pipeline(stage(provider, pack)).execute(&mut ctx).await.unwrap();

        assert_eq!(ctx.messages[2].content, "<error: tool not allowed>");
        assert!(ctx.messages[2].is_error);
        assert_eq!(ctx.messages[2].tool_call_id.as_deref(), Some("call_1"));
    }

    #[tokio::test]
    async fn dispatch_failure_becomes_error_marked_result() {
        // Allowed but unregistered: the dispatcher reports not-found and
        // the loop turns it into an error tool result for the model.
        let provider = MockProvider::new("mock")
            .respond_tool_call("call_1", "get_forecast", "{}")
            .respond_text("done");
        let pack = PromptPack::new("p", "support", "x").allow_tool("get_forecast");

        let mut ctx = ExecutionContext::new("c").with_message(Message::user("q"));
        pipeline(stage(provider, pack)).execute(&mut ctx).await.unwrap();

        assert!(ctx.messages[2].is_error);
        assert!(ctx.messages[2].content.starts_with("<error: "));
        assert!(ctx.messages[2].content.contains("not found"));
    }

    #[tokio::test]
    async fn parallel_results_keep_provider_call_order() {
        let provider = MockProvider::new("mock")
            .respond(crate::provider::MockTurn::ToolCalls {
                content: String::new(),
                calls: vec![
                    ToolCall::new("call_a", "get_weather", r#"{"location":"Paris"}"#),
                    ToolCall::new("call_b", "get_weather", r#"{"location":"Oslo"}"#),
                    ToolCall::new("call_c", "get_weather", r#"{"location":"Lima"}"#),
                ],
            })
            .respond_text("done");
        let pack = PromptPack::new("p", "support", "x").allow_tool("get_weather");

        let mut ctx = ExecutionContext::new("c").with_message(Message::user("q"));
        pipeline(stage(provider, pack)).execute(&mut ctx).await.unwrap();

        let ids: Vec<&str> = ctx.messages[2..5]
            .iter()
            .map(|m| m.tool_call_id.as_deref().unwrap())
            .collect();
        assert_eq!(ids, vec!["call_a", "call_b", "call_c"]);
    }

    #[tokio::test]
    async fn max_rounds_zero_preserves_tool_call_message() {
        let provider = MockProvider::new("mock").respond_tool_call("c1", "get_weather", "{}");
        let pack = PromptPack::new("p", "support", "x").allow_tool("get_weather");
        let middleware = stage(provider, pack).with_config(ProviderMiddlewareConfig {
            max_rounds: 0,
            ..ProviderMiddlewareConfig::default()
        });

        let mut ctx = ExecutionContext::new("c").with_message(Message::user("q"));
        let err = pipeline(middleware).execute(&mut ctx).await.unwrap_err();

        assert!(matches!(err, Error::ToolLoopExceeded { max_rounds: 0 }));
        assert!(ctx.messages.last().unwrap().has_tool_calls());
    }

    #[tokio::test]
    async fn transient_errors_retry_until_success() {
        let provider = MockProvider::new("mock")
            .respond_transient_error(429, "slow down")
            .respond_transient_error(429, "slow down")
            .respond_text("recovered");
        let pack = PromptPack::new("p", "support", "x");
        let middleware = stage(provider, pack).with_config(ProviderMiddlewareConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
            },
            ..ProviderMiddlewareConfig::default()
        });

        let mut ctx = ExecutionContext::new("c").with_message(Message::user("q"));
        pipeline(middleware).execute(&mut ctx).await.unwrap();
        assert_eq!(ctx.response.as_ref().unwrap().content, "recovered");
    }

    #[tokio::test]
    async fn retry_exhaustion_surfaces_provider_error() {
        let provider = MockProvider::new("mock")
            .respond_transient_error(429, "slow down")
            .respond_transient_error(429, "slow down")
            .respond_transient_error(429, "slow down");
        let pack = PromptPack::new("p", "support", "x");
        let middleware = stage(provider, pack).with_config(ProviderMiddlewareConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
            },
            ..ProviderMiddlewareConfig::default()
        });

        let mut ctx = ExecutionContext::new("c").with_message(Message::user("q"));
        let err = pipeline(middleware).execute(&mut ctx).await.unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
    }

    #[tokio::test]
    async fn permanent_errors_do_not_retry() {
        let provider = MockProvider::new("mock")
            .respond_permanent_error("bad key")
            .respond_text("never reached");
        let pack = PromptPack::new("p", "support", "x");

        let entry_provider = Arc::new(provider);
        let entry = Arc::new(ProviderEntry::new("mock", entry_provider.clone()));
        let dispatcher = Arc::new(ToolDispatcher::new(weather_registry()));
        let middleware = ProviderMiddleware::new(entry, Arc::new(pack), dispatcher);

        let mut ctx = ExecutionContext::new("c").with_message(Message::user("q"));
        let err = pipeline(middleware).execute(&mut ctx).await.unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
        assert_eq!(entry_provider.call_count(), 1);
    }

    #[tokio::test]
    async fn validators_attach_to_terminal_message() {
        use crate::validators::{BannedWordsValidator, SharedValidator};

        let provider = MockProvider::new("mock").respond_text("We guarantee delivery");
        let pack = PromptPack::new("p", "support", "x");

        let mut ctx = ExecutionContext::new("c").with_message(Message::user("q"));
        let validator: SharedValidator =
            Arc::new(BannedWordsValidator::new(vec!["guarantee".into()]));
        ctx.validators = vec![validator];

        pipeline(stage(provider, pack)).execute(&mut ctx).await.unwrap();

        let terminal = ctx.response.as_ref().unwrap();
        assert_eq!(terminal.validations.len(), 1);
        assert!(!terminal.validations[0].passed);
        assert_eq!(
            terminal.validations[0].details["banned_word"],
            json!("guarantee")
        );
        // The message stored in the transcript carries the same results.
        assert_eq!(ctx.messages.last().unwrap().validations.len(), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_the_turn() {
        let provider = MockProvider::new("mock").respond_text("never");
        let pack = PromptPack::new("p", "support", "x");

        let mut ctx = ExecutionContext::new("c").with_message(Message::user("q"));
        ctx.cancellation.cancel();

        let err = pipeline(stage(provider, pack)).execute(&mut ctx).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
