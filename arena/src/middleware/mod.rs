//! Middleware kernel.
//!
//! A pipeline is an ordered onion of middlewares. `process` of the first
//! middleware runs first; calling [`Next::run`] descends into the rest of
//! the chain, and code after that call runs on the way back out. This is
//! what lets save-style middleware commit state after the provider stage
//! completed (or failed: errors returned by `next` must be returned
//! possibly wrapped, so every outer layer observes them).
//!
//! Stream chunks do not traverse the onion. The provider stage broadcasts
//! each incremental chunk to every middleware's `stream_chunk` hook in
//! registration order.

mod assert;
mod prompt;
mod provider;
mod state;
mod turn_index;
mod validate;

pub use assert::TurnAssertionsMiddleware;
pub use prompt::{PromptAssemblyMiddleware, TemplateMiddleware};
pub use provider::{ProviderMiddleware, ProviderMiddlewareConfig};
pub use state::{StateLoadMiddleware, StateSaveMiddleware};
pub use turn_index::TurnIndexMiddleware;
pub use validate::ValidatorsMiddleware;

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::stream::StreamChunk;

/// One stage of the execution pipeline.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Stage name used in traces and logs.
    fn name(&self) -> &'static str;

    /// Handle one turn. Implementations decide whether their work happens
    /// before or after `next.run(ctx)`.
    async fn process(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<()>;

    /// Observe one incremental provider chunk. Default: ignore.
    async fn stream_chunk(&self, ctx: &ExecutionContext, chunk: &StreamChunk) -> Result<()> {
        let _ = (ctx, chunk);
        Ok(())
    }
}

/// Continuation into the remainder of the chain.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
}

impl std::fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next")
            .field("remaining", &self.chain.len())
            .finish()
    }
}

impl Next<'_> {
    /// Run the rest of the chain. Past the last middleware this is a
    /// no-op.
    pub async fn run(self, ctx: &mut ExecutionContext) -> Result<()> {
        match self.chain.split_first() {
            Some((middleware, rest)) => middleware.process(ctx, Next { chain: rest }).await,
            None => Ok(()),
        }
    }
}

/// An ordered middleware chain, cheap to clone per run.
#[derive(Clone)]
pub struct Pipeline {
    middlewares: Arc<Vec<Arc<dyn Middleware>>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.middlewares.iter().map(|m| m.name()).collect();
        f.debug_struct("Pipeline").field("stages", &names).finish()
    }
}

impl Pipeline {
    /// Build a pipeline from middlewares in execution order.
    #[must_use]
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        Self {
            middlewares: Arc::new(middlewares),
        }
    }

    /// Drive one turn through the chain.
    pub async fn execute(&self, ctx: &mut ExecutionContext) -> Result<()> {
        ctx.set_stream_targets(self.middlewares.as_ref().clone());
        Next {
            chain: &self.middlewares,
        }
        .run(ctx)
        .await
    }
}

/// Broadcast a stream chunk to every registered middleware in order.
///
/// Hook errors are logged and swallowed: a broken dashboard must not kill
/// the turn that feeds it.
pub async fn broadcast_chunk(ctx: &ExecutionContext, chunk: &StreamChunk) {
    for target in ctx.stream_targets() {
        if let Err(err) = target.stream_chunk(ctx, chunk).await {
            tracing::warn!(middleware = target.name(), error = %err, "stream hook failed");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::Error;
    use serde_json::json;

    /// Records enter/exit order into a shared log.
    struct Recorder {
        tag: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl Middleware for Recorder {
        fn name(&self) -> &'static str {
            self.tag
        }

        async fn process(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<()> {
            self.log.lock().unwrap().push(format!("{}:enter", self.tag));
            if self.fail {
                return Err(Error::internal("boom"));
            }
            let result = next.run(ctx).await;
            self.log.lock().unwrap().push(format!("{}:exit", self.tag));
            result
        }

        async fn stream_chunk(&self, _ctx: &ExecutionContext, chunk: &StreamChunk) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:chunk:{}", self.tag, chunk.as_text().unwrap_or("")));
            Ok(())
        }
    }

    fn recorder(tag: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn Middleware> {
        Arc::new(Recorder {
            tag,
            log: log.clone(),
            fail: false,
        })
    }

    #[tokio::test]
    async fn onion_runs_post_next_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![recorder("a", &log), recorder("b", &log)]);

        let mut ctx = ExecutionContext::new("c");
        pipeline.execute(&mut ctx).await.unwrap();

        let entries = log.lock().unwrap().clone();
        assert_eq!(entries, vec!["a:enter", "b:enter", "b:exit", "a:exit"]);
    }

    #[tokio::test]
    async fn inner_error_propagates_and_skips_inner_exit() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let failing: Arc<dyn Middleware> = Arc::new(Recorder {
            tag: "b",
            log: log.clone(),
            fail: true,
        });
        let pipeline = Pipeline::new(vec![recorder("a", &log), failing]);

        let mut ctx = ExecutionContext::new("c");
        let err = pipeline.execute(&mut ctx).await.unwrap_err();
        assert!(err.to_string().contains("boom"));

        // The outer layer still observed the unwind (no a:exit because the
        // recorder propagates the error after logging enter only).
        let entries = log.lock().unwrap().clone();
        assert_eq!(entries, vec!["a:enter", "b:enter"]);
    }

    #[tokio::test]
    async fn chunks_broadcast_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![recorder("a", &log), recorder("b", &log)]);

        let mut ctx = ExecutionContext::new("c");
        pipeline.execute(&mut ctx).await.unwrap();
        log.lock().unwrap().clear();

        broadcast_chunk(&ctx, &StreamChunk::text("x")).await;
        let entries = log.lock().unwrap().clone();
        assert_eq!(entries, vec!["a:chunk:x", "b:chunk:x"]);
    }

    #[tokio::test]
    async fn empty_pipeline_is_a_noop() {
        let pipeline = Pipeline::new(Vec::new());
        let mut ctx = ExecutionContext::new("c");
        ctx.set_metadata("untouched", json!(true));
        pipeline.execute(&mut ctx).await.unwrap();
        assert_eq!(ctx.metadata["untouched"], json!(true));
    }
}
