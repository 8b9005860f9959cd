//! End-to-end tests over the mock provider and in-process tools.
//!
//! Every test wires real registries, the in-memory state store, and the
//! full middleware pipeline; only the LLM and the tool backends are
//! scripted.

#![allow(clippy::unwrap_used, clippy::panic)]

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use arena::assertions::{ArgMatcher, Assertion};
use arena::cost::Pricing;
use arena::message::Role;
use arena::middleware::ProviderMiddlewareConfig;
use arena::pack::PromptPack;
use arena::planner::{Combination, RunPlan};
use arena::provider::{MockProvider, RetryPolicy};
use arena::registry::{PackRegistry, PersonaRegistry, ProviderEntry, ProviderRegistry};
use arena::report::{FailOn, MemorySink, RunErrorKind, exit_code};
use arena::scenario::{Scenario, TurnDef};
use arena::selfplay::{ExitCondition, Persona, SelfPlayConfig, SelfPlayOutcome};
use arena::store::{InMemoryStateStore, keys};
use arena::tools::{ToolDescriptor, ToolDispatcher, ToolRegistry};
use arena::validators::ValidatorSpec;
use arena::executor::RunExecutor;

struct Arena {
    executor: Arc<RunExecutor>,
    sink: Arc<MemorySink>,
}

struct ArenaBuilder {
    provider: MockProvider,
    pricing: Pricing,
    pack: PromptPack,
    scenario: Scenario,
    tools: Vec<ToolDescriptor>,
    personas: Vec<Persona>,
    provider_config: ProviderMiddlewareConfig,
}

impl ArenaBuilder {
    fn new(provider: MockProvider, pack: PromptPack, scenario: Scenario) -> Self {
        Self {
            provider,
            pricing: Pricing::new(1.0, 2.0, 0.5),
            pack,
            scenario,
            tools: Vec::new(),
            personas: Vec::new(),
            provider_config: ProviderMiddlewareConfig {
                retry: RetryPolicy {
                    max_attempts: 3,
                    base_delay: std::time::Duration::from_millis(1),
                },
                ..ProviderMiddlewareConfig::default()
            },
        }
    }

    fn tool(mut self, descriptor: ToolDescriptor) -> Self {
        self.tools.push(descriptor);
        self
    }

    fn persona(mut self, persona: Persona) -> Self {
        self.personas.push(persona);
        self
    }

    fn build(self) -> Arena {
        let mut providers = ProviderRegistry::new();
        providers.register(
            ProviderEntry::new("mock", Arc::new(self.provider)).with_pricing(self.pricing),
        );

        let mut packs = PackRegistry::new();
        packs.register(self.pack);

        let mut tool_registry = ToolRegistry::new();
        for descriptor in self.tools {
            tool_registry.register(descriptor);
        }

        let mut personas = PersonaRegistry::new();
        for persona in self.personas {
            personas.register(persona);
        }

        let sink = Arc::new(MemorySink::new());
        let executor = Arc::new(
            RunExecutor::new(
                Arc::new(providers),
                Arc::new(packs),
                vec![Arc::new(self.scenario)],
                Arc::new(ToolDispatcher::new(Arc::new(tool_registry))),
                Arc::new(InMemoryStateStore::new()),
                sink.clone(),
            )
            .with_personas(Arc::new(personas))
            .with_provider_config(self.provider_config),
        );

        Arena { executor, sink }
    }
}

fn single_run_plan(scenario_id: &str) -> RunPlan {
    RunPlan {
        combinations: vec![Combination {
            region: "us-east".into(),
            scenario_id: scenario_id.into(),
            provider_id: "mock".into(),
        }],
    }
}

fn weather_tool() -> ToolDescriptor {
    ToolDescriptor::mock_template(
        "get_weather",
        "Current weather for a location",
        json!({
            "type": "object",
            "properties": {"location": {"type": "string"}},
            "required": ["location"]
        }),
        "18C, clear skies in {{ location }}",
    )
}

/// Scenario: one user turn asks for the weather; the model calls the
/// weather tool once with `location="Paris"` and answers from its result.
#[tokio::test]
async fn weather_tool_run_passes_assertions() {
    let provider = MockProvider::new("mock")
        .respond_tool_call("call_1", "get_weather", r#"{"location":"Paris"}"#)
        .respond_text("It is 18C with clear skies in Paris right now.");

    let mut args = BTreeMap::new();
    args.insert(
        "location".to_string(),
        ArgMatcher {
            equals: Some(json!("Paris")),
            matches: None,
        },
    );
    let scenario = Scenario::new("weather", "support").with_turn(
        TurnDef::user("What's the weather in Paris?").with_assertions(vec![
            Assertion::ToolsCalled {
                tools: vec!["get_weather".into()],
            },
            Assertion::ToolCallsWithArgs {
                tool: "get_weather".into(),
                args,
            },
            Assertion::ContentIncludes {
                patterns: vec!["Paris".into()],
            },
        ]),
    );

    let arena = ArenaBuilder::new(
        provider,
        PromptPack::new("support", "support", "You are a helpful assistant.")
            .allow_tool("get_weather"),
        scenario,
    )
    .tool(weather_tool())
    .build();

    arena
        .executor
        .clone()
        .execute_runs(&single_run_plan("weather"), 1, CancellationToken::new())
        .await
        .unwrap();

    let results = arena.sink.results();
    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert!(result.passed(), "assertions: {:?}", result.assertion_results);
    assert_eq!(result.assertion_results.len(), 3);

    // Exactly one tool call, answered by exactly one tool result with the
    // matching id, before the terminal assistant message.
    let tool_call_msg = result
        .messages
        .iter()
        .find(|m| m.has_tool_calls())
        .expect("assistant tool-call message");
    let calls = tool_call_msg.tool_calls.as_ref().unwrap();
    assert_eq!(calls.len(), 1);
    let answers: Vec<_> = result
        .messages
        .iter()
        .filter(|m| m.role == Role::Tool && m.tool_call_id.as_deref() == Some(calls[0].id.as_str()))
        .collect();
    assert_eq!(answers.len(), 1);
    assert!(answers[0].content.contains("Paris"));
    assert!(!answers[0].is_error);
}

/// Scenario: the pack bans "guarantee"; the provider uses it anyway. The
/// failing validation rides on the terminal assistant message in the
/// persisted transcript, and the turn still completes.
#[tokio::test]
async fn banned_word_validation_attaches_to_saved_message() {
    let provider = MockProvider::new("mock").respond_text("We guarantee delivery by Monday.");
    let pack = PromptPack::new("support", "support", "Be careful with promises.")
        .with_validator(ValidatorSpec::BannedWords {
            words: vec!["guarantee".into()],
        });
    let scenario = Scenario::new("banned", "support").with_turn(
        TurnDef::user("When will my order arrive?").with_assertions(vec![
            Assertion::GuardrailTriggered {
                validator: "validators.BannedWordsValidator".into(),
                expected: true,
            },
        ]),
    );

    let arena = ArenaBuilder::new(provider, pack, scenario).build();
    arena
        .executor
        .clone()
        .execute_runs(&single_run_plan("banned"), 1, CancellationToken::new())
        .await
        .unwrap();

    let results = arena.sink.results();
    let result = &results[0];
    assert!(result.error.is_none());
    assert!(result.passed(), "{:?}", result.assertion_results);

    let terminal = result
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant)
        .unwrap();
    assert_eq!(terminal.validations.len(), 1);
    let validation = &terminal.validations[0];
    assert_eq!(validation.validator_type, "validators.BannedWordsValidator");
    assert!(!validation.passed);
    assert_eq!(validation.details["banned_word"], "guarantee");
    assert!(result.has_validation_failures());

    // Advisory by default, fatal when the policy says so.
    assert_eq!(exit_code(&results, &FailOn::default()), 0);
    assert_eq!(
        exit_code(
            &results,
            &FailOn::default().with(arena::report::FailCategory::ValidationError)
        ),
        5
    );
}

/// Scenario: self-play with a frustrated customer persona. The persona
/// expresses satisfaction on its second generated turn; the conversation
/// ends successfully after two turns on each side.
#[tokio::test]
async fn self_play_exits_on_satisfaction() {
    // One scripted provider serves both chains, alternating:
    // user-gen 1, assistant 1, user-gen 2, assistant 2.
    let provider = MockProvider::new("mock")
        .respond_text("My order #42 is three days late and nobody answers!")
        .respond_text("I am sorry about that. I have expedited order #42.")
        .respond_text("Thank you, that resolved it!")
        .respond_text("Happy to help!");

    let persona = Persona {
        id: "frustrated-customer".into(),
        name: "Sam".into(),
        traits: vec!["impatient".into()],
        goal: "get order #42 delivered".into(),
        template: "You are {{ name }}. Goal: {{ goal }}. Write the next customer message.".into(),
    };

    let scenario = Scenario::new("selfplay", "support").with_self_play(
        SelfPlayConfig::new("frustrated-customer")
            .with_max_turns(5)
            .with_exit(ExitCondition::SatisfactionExpressed),
    );

    let arena = ArenaBuilder::new(
        provider,
        PromptPack::new("support", "support", "You are a support agent."),
        scenario,
    )
    .persona(persona)
    .build();

    arena
        .executor
        .clone()
        .execute_runs(&single_run_plan("selfplay"), 1, CancellationToken::new())
        .await
        .unwrap();

    let results = arena.sink.results();
    let result = &results[0];
    assert!(result.error.is_none(), "error: {:?}", result.error);

    let self_play = result.self_play.as_ref().expect("self-play outcome");
    assert_eq!(self_play.outcome, SelfPlayOutcome::Satisfied);
    assert!(self_play.outcome.is_success());
    assert_eq!(self_play.user_turns, 2);
    assert_eq!(self_play.assistant_turns, 2);

    assert_eq!(
        result.metadata[keys::ARENA_USER_COMPLETED_TURNS].as_u64(),
        Some(2)
    );
    assert_eq!(
        result.metadata[keys::ARENA_ASSISTANT_COMPLETED_TURNS].as_u64(),
        Some(2)
    );

    // Merged transcript: system + (user, assistant) * 2.
    let roles: Vec<Role> = result.messages.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![
            Role::System,
            Role::User,
            Role::Assistant,
            Role::User,
            Role::Assistant
        ]
    );
}

/// Scenario: conversation-level assertion over an A2A-style agent tool.
/// The agent counts as invoked when any turn's assistant message carries
/// a tool call with the bridged name.
#[tokio::test]
async fn conversation_level_agent_assertion() {
    let agent_tool = "a2a__research_agent__search_papers";
    let provider = MockProvider::new("mock")
        .respond_text("Let me think about that.")
        .respond_tool_call("call_1", agent_tool, r#"{"message":"papers on RLHF"}"#)
        .respond_text("I found 3 relevant papers on RLHF.");

    let scenario = Scenario::new("agents", "research")
        .with_turn(TurnDef::user("Can you research RLHF?"))
        .with_turn(TurnDef::user("Please search for papers."))
        .with_conversation_assertions(vec![
            Assertion::AgentInvoked {
                agent_names: vec![agent_tool.into()],
                min_calls: 1,
            },
            Assertion::AgentResponseContains {
                agent_name: agent_tool.into(),
                pattern: "papers".into(),
            },
        ]);

    let arena = ArenaBuilder::new(
        provider,
        PromptPack::new("research", "research", "You are a research assistant.")
            .allow_tool(agent_tool),
        scenario,
    )
    .tool(ToolDescriptor::mock(
        agent_tool,
        "Remote research agent",
        json!({"type": "object", "properties": {"message": {"type": "string"}}}),
        json!("Found 3 papers about RLHF"),
    ))
    .build();

    arena
        .executor
        .clone()
        .execute_runs(&single_run_plan("agents"), 1, CancellationToken::new())
        .await
        .unwrap();

    let results = arena.sink.results();
    assert!(results[0].passed(), "{:?}", results[0].assertion_results);
}

/// Scenario: the provider rate-limits twice and then recovers; the
/// default retry policy absorbs the failures into one clean turn.
#[tokio::test]
async fn provider_retries_transient_failures() {
    let provider = MockProvider::new("mock")
        .respond_transient_error(429, "rate limited")
        .respond_transient_error(429, "rate limited")
        .respond_text("Recovered and answered.");

    let scenario = Scenario::new("retry", "support").with_turn(TurnDef::user("hello"));
    let arena = ArenaBuilder::new(
        provider,
        PromptPack::new("support", "support", "x"),
        scenario,
    )
    .build();

    arena
        .executor
        .clone()
        .execute_runs(&single_run_plan("retry"), 1, CancellationToken::new())
        .await
        .unwrap();

    let results = arena.sink.results();
    let result = &results[0];
    assert!(result.error.is_none());

    let assistant_messages: Vec<_> = result
        .messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .collect();
    assert_eq!(assistant_messages.len(), 1);
    assert_eq!(assistant_messages[0].content, "Recovered and answered.");
}

/// Scenario: the provider never recovers; after the retry budget the run
/// fails with a provider error and the execution maps to exit code 3.
#[tokio::test]
async fn provider_retry_exhaustion_fails_run() {
    let provider = MockProvider::new("mock")
        .respond_transient_error(429, "rate limited")
        .respond_transient_error(429, "rate limited")
        .respond_transient_error(429, "rate limited")
        .respond_transient_error(429, "rate limited");

    let scenario = Scenario::new("exhausted", "support").with_turn(TurnDef::user("hello"));
    let arena = ArenaBuilder::new(
        provider,
        PromptPack::new("support", "support", "x"),
        scenario,
    )
    .build();

    arena
        .executor
        .clone()
        .execute_runs(&single_run_plan("exhausted"), 1, CancellationToken::new())
        .await
        .unwrap();

    let results = arena.sink.results();
    assert_eq!(results[0].error_kind, Some(RunErrorKind::Provider));
    assert_eq!(exit_code(&results, &FailOn::default()), 3);
}

/// Scenario: a filesystem tool in the MCP position of the pipeline. The
/// model asks for a file, the tool result carries its text, and the
/// final assistant message cites it.
#[tokio::test]
async fn file_read_tool_round_trip() {
    let provider = MockProvider::new("mock")
        .respond_tool_call("call_1", "read_file", r#"{"path":"/data/hello.txt"}"#)
        .respond_text("The file says: hello from the data directory.");

    let mut args = BTreeMap::new();
    args.insert(
        "path".to_string(),
        ArgMatcher {
            equals: Some(json!("/data/hello.txt")),
            matches: None,
        },
    );
    let scenario = Scenario::new("files", "support").with_turn(
        TurnDef::user("Read /data/hello.txt").with_assertions(vec![
            Assertion::ToolsCalled {
                tools: vec!["read_file".into()],
            },
            Assertion::ToolCallsWithArgs {
                tool: "read_file".into(),
                args,
            },
            Assertion::ContentIncludes {
                patterns: vec!["hello from the data directory".into()],
            },
        ]),
    );

    let arena = ArenaBuilder::new(
        provider,
        PromptPack::new("support", "support", "x").allow_tool("read_file"),
        scenario,
    )
    .tool(ToolDescriptor::mock(
        "read_file",
        "Read a file",
        json!({"type": "object", "properties": {"path": {"type": "string"}}}),
        json!("hello from the data directory"),
    ))
    .build();

    arena
        .executor
        .clone()
        .execute_runs(&single_run_plan("files"), 1, CancellationToken::new())
        .await
        .unwrap();

    let results = arena.sink.results();
    let result = &results[0];
    assert!(result.passed(), "{:?}", result.assertion_results);

    let tool_result = result
        .messages
        .iter()
        .find(|m| m.role == Role::Tool)
        .unwrap();
    assert!(tool_result.content.contains("hello from the data directory"));
}

/// Invariant: the per-turn costs summed across a multi-turn run equal
/// the totals persisted in conversation metadata.
#[tokio::test]
async fn cost_totals_match_metadata() {
    let provider = MockProvider::new("mock")
        .respond_text("answer one")
        .respond_text("answer two");

    let scenario = Scenario::new("costly", "support")
        .with_turn(TurnDef::user("first"))
        .with_turn(TurnDef::user("second"));

    let arena = ArenaBuilder::new(
        provider,
        PromptPack::new("support", "support", "x"),
        scenario,
    )
    .build();

    arena
        .executor
        .clone()
        .execute_runs(&single_run_plan("costly"), 1, CancellationToken::new())
        .await
        .unwrap();

    let results = arena.sink.results();
    let result = &results[0];
    assert!(result.cost.total_cost > 0.0);

    let metadata_cost = result.metadata[keys::TOTAL_COST_USD].as_f64().unwrap();
    assert!((metadata_cost - result.cost.total_cost).abs() < 1e-6);
    let metadata_tokens = result.metadata[keys::TOTAL_TOKENS].as_u64().unwrap();
    assert_eq!(metadata_tokens, result.cost.total_tokens());
}

/// Invariant: multi-turn histories accumulate one system message and the
/// full chronological transcript.
#[tokio::test]
async fn multi_turn_history_accumulates() {
    let provider = MockProvider::new("mock")
        .respond_text("first answer")
        .respond_text("second answer");

    let scenario = Scenario::new("multi", "support")
        .with_turn(TurnDef::user("first question"))
        .with_turn(TurnDef::user("second question"));

    let arena = ArenaBuilder::new(
        provider,
        PromptPack::new("support", "support", "You are helpful."),
        scenario,
    )
    .build();

    arena
        .executor
        .clone()
        .execute_runs(&single_run_plan("multi"), 1, CancellationToken::new())
        .await
        .unwrap();

    let results = arena.sink.results();
    let roles: Vec<Role> = results[0].messages.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![
            Role::System,
            Role::User,
            Role::Assistant,
            Role::User,
            Role::Assistant
        ]
    );
    assert_eq!(
        results[0].messages[0].content,
        "You are helpful."
    );
}

/// Template variables from the scenario context flow into the scripted
/// turn content and the system prompt.
#[tokio::test]
async fn scenario_context_variables_substitute() {
    let provider = MockProvider::new("mock").respond_text("ok");
    let pack = PromptPack::new("support", "support", "You support {{brand}} customers.")
        .with_required_var("brand");
    let scenario = Scenario::new("vars", "support")
        .with_context_var("brand", "Acme")
        .with_turn(TurnDef::user("Tell me about {{brand}}"));

    let arena = ArenaBuilder::new(provider, pack, scenario).build();
    arena
        .executor
        .clone()
        .execute_runs(&single_run_plan("vars"), 1, CancellationToken::new())
        .await
        .unwrap();

    let results = arena.sink.results();
    let result = &results[0];
    assert!(result.error.is_none());
    assert_eq!(result.messages[0].content, "You support Acme customers.");
    assert_eq!(result.messages[1].content, "Tell me about Acme");
}
