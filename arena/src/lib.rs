//! Arena is a declarative test-execution engine for LLM-backed
//! applications.
//!
//! Given prompt packs, providers, tool catalogs, and multi-turn
//! scenarios, it plans the cartesian product of (region × scenario ×
//! provider) runs, drives each conversation turn through a middleware
//! pipeline (prompt assembly, template substitution, provider call with
//! a tool-calling loop, validation, state persistence), evaluates turn-
//! and conversation-level assertions, and hands structured results to a
//! sink.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use arena::prelude::*;
//!
//! let mut providers = ProviderRegistry::new();
//! providers.register(ProviderEntry::new(
//!     "mock",
//!     Arc::new(MockProvider::new("mock").respond_text("Hello!")),
//! ));
//!
//! let mut packs = PackRegistry::new();
//! packs.register(PromptPack::new("support", "support", "You are helpful."));
//!
//! let scenario = Scenario::new("smoke", "support").with_turn(TurnDef::user("Hi"));
//! let plan = generate_run_plan(
//!     &["us-east".into()],
//!     &[Arc::new(scenario.clone())],
//!     &providers,
//!     &RunFilter::all(),
//! )?;
//!
//! let sink = Arc::new(MemorySink::new());
//! let executor = Arc::new(RunExecutor::new(
//!     Arc::new(providers),
//!     Arc::new(packs),
//!     vec![Arc::new(scenario)],
//!     Arc::new(ToolDispatcher::new(Arc::new(ToolRegistry::new()))),
//!     Arc::new(InMemoryStateStore::new()),
//!     sink.clone(),
//! ));
//! let run_ids = executor.execute_runs(&plan, 4, CancellationToken::new()).await?;
//! ```

pub mod a2a;
pub mod assertions;
pub mod config;
pub mod context;
pub mod cost;
pub mod error;
pub mod executor;
pub mod mcp;
pub mod message;
pub mod middleware;
pub mod pack;
pub mod planner;
pub mod provider;
pub mod registry;
pub mod report;
pub mod scenario;
pub mod selfplay;
pub mod store;
pub mod stream;
pub mod tools;
pub mod trace;
pub mod validators;

pub use error::{Error, Result};

/// Commonly used types, re-exported.
pub mod prelude {
    pub use tokio_util::sync::CancellationToken;

    pub use crate::assertions::{Assertion, AssertionOutcome, WorkflowTrace};
    pub use crate::context::ExecutionContext;
    pub use crate::cost::{CostInfo, Pricing, Usage};
    pub use crate::error::{Error, ProviderError, Result, ToolError};
    pub use crate::executor::RunExecutor;
    pub use crate::mcp::{McpRegistry, McpServerConfig};
    pub use crate::message::{ContentPart, Message, Role, ToolCall};
    pub use crate::middleware::{Middleware, Next, Pipeline, ProviderMiddlewareConfig};
    pub use crate::pack::{Fragment, PromptPack};
    pub use crate::planner::{Combination, RunFilter, RunPlan, generate_run_plan};
    pub use crate::provider::{
        MockProvider, OpenAiCompatible, OpenAiConfig, Provider, ProviderRequest,
        ProviderResponse, RetryPolicy, SharedProvider,
    };
    pub use crate::registry::{
        JudgeRegistry, PackRegistry, PersonaRegistry, ProviderEntry, ProviderRegistry,
    };
    pub use crate::report::{
        FailCategory, FailOn, JsonlSink, MemorySink, ResultSink, RunResult, exit_code,
    };
    pub use crate::scenario::{Scenario, TurnDef, TurnRole};
    pub use crate::selfplay::{
        ExitCondition, Persona, SelfPlayConfig, SelfPlayDriver, SelfPlayOutcome,
    };
    pub use crate::store::{ConversationState, InMemoryStateStore, StateStore};
    pub use crate::stream::{StreamChunk, StreamAggregator};
    pub use crate::tools::{
        ToolDescriptor, ToolDefinition, ToolDispatcher, ToolMode, ToolOutput, ToolRegistry,
    };
    pub use crate::validators::{ValidationResult, Validator, ValidatorSpec};
}
