//! Run executor.
//!
//! Takes a [`RunPlan`](crate::planner::RunPlan) and executes each
//! combination on a bounded worker pool. Every run builds its own
//! pipeline, drives the scenario's turns through it, evaluates
//! conversation-level assertions, and hands a
//! [`RunResult`](crate::report::RunResult) to the sink. Cancellation
//! aborts unstarted jobs and propagates into running pipelines through
//! the per-run cancellation handle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument as _, info, info_span, warn};
use uuid::Uuid;

use crate::assertions::{AssertionOutcome, AssertionScope, WorkflowTrace, evaluate_all};
use crate::context::ExecutionContext;
use crate::cost::CostInfo;
use crate::error::{Error, Result};
use crate::message::{Message, Role, ToolCall};
use crate::middleware::{
    Middleware, Pipeline, PromptAssemblyMiddleware, ProviderMiddleware,
    ProviderMiddlewareConfig, StateLoadMiddleware, StateSaveMiddleware, TemplateMiddleware,
    TurnAssertionsMiddleware, TurnIndexMiddleware, ValidatorsMiddleware,
};
use crate::pack::{PromptPack, substitute_placeholders};
use crate::planner::{Combination, RunPlan};
use crate::registry::{
    JudgeRegistry, PackRegistry, PersonaRegistry, ProviderEntry, ProviderRegistry,
};
use crate::report::{RunErrorKind, RunResult, SharedResultSink};
use crate::scenario::{Scenario, TurnRole};
use crate::selfplay::{PersonaAssemblyMiddleware, SelfPlayDriver, SelfPlayResult};
use crate::store::{ConversationState, SharedStateStore, keys};
use crate::tools::ToolDispatcher;
use crate::validators::ValidationResult;

/// Provider group consulted for the self-play user-generation chain.
/// Falls back to the run's own provider when the group is empty.
pub const SELF_PLAY_GROUP: &str = "selfplay";

/// Executes planned runs with bounded concurrency.
pub struct RunExecutor {
    providers: Arc<ProviderRegistry>,
    packs: Arc<PackRegistry>,
    judges: JudgeRegistry,
    personas: Arc<PersonaRegistry>,
    scenarios: HashMap<String, Arc<Scenario>>,
    dispatcher: Arc<ToolDispatcher>,
    store: SharedStateStore,
    sink: SharedResultSink,
    provider_config: ProviderMiddlewareConfig,
    workflow: Option<Arc<dyn WorkflowTrace>>,
}

impl std::fmt::Debug for RunExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunExecutor")
            .field("scenarios", &self.scenarios.keys().collect::<Vec<_>>())
            .field("provider_config", &self.provider_config)
            .finish_non_exhaustive()
    }
}

impl RunExecutor {
    /// Create an executor over the given registries and collaborators.
    #[must_use]
    pub fn new(
        providers: Arc<ProviderRegistry>,
        packs: Arc<PackRegistry>,
        scenarios: Vec<Arc<Scenario>>,
        dispatcher: Arc<ToolDispatcher>,
        store: SharedStateStore,
        sink: SharedResultSink,
    ) -> Self {
        Self {
            providers,
            packs,
            judges: JudgeRegistry::default(),
            personas: Arc::new(PersonaRegistry::default()),
            scenarios: scenarios
                .into_iter()
                .map(|s| (s.id.clone(), s))
                .collect(),
            dispatcher,
            store,
            sink,
            provider_config: ProviderMiddlewareConfig::default(),
            workflow: None,
        }
    }

    /// Attach judge providers for LLM-judge validators.
    #[must_use]
    pub fn with_judges(mut self, judges: JudgeRegistry) -> Self {
        self.judges = judges;
        self
    }

    /// Attach self-play personas.
    #[must_use]
    pub fn with_personas(mut self, personas: Arc<PersonaRegistry>) -> Self {
        self.personas = personas;
        self
    }

    /// Override the provider stage configuration.
    #[must_use]
    pub const fn with_provider_config(mut self, config: ProviderMiddlewareConfig) -> Self {
        self.provider_config = config;
        self
    }

    /// Attach a workflow trace collaborator for workflow assertions.
    #[must_use]
    pub fn with_workflow(mut self, workflow: Arc<dyn WorkflowTrace>) -> Self {
        self.workflow = Some(workflow);
        self
    }

    /// Execute every combination in the plan.
    ///
    /// At most `concurrency` runs execute at once. The returned run ids
    /// are in plan order; result delivery order across runs is not
    /// guaranteed.
    pub async fn execute_runs(
        self: Arc<Self>,
        plan: &RunPlan,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> Result<Vec<Uuid>> {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let run_ids: Vec<Uuid> = plan.combinations.iter().map(|_| Uuid::new_v4()).collect();

        let mut handles = Vec::with_capacity(plan.combinations.len());
        for (combination, run_id) in plan.combinations.iter().cloned().zip(run_ids.iter().copied())
        {
            let executor = self.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();

            handles.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                // Unstarted jobs are aborted on cancellation.
                if cancel.is_cancelled() {
                    return;
                }
                executor.run_one(combination, run_id, cancel).await;
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }

        Ok(run_ids)
    }

    async fn run_one(&self, combination: Combination, run_id: Uuid, cancel: CancellationToken) {
        let span = info_span!(
            "run",
            run.id = %run_id,
            run.scenario = %combination.scenario_id,
            run.provider = %combination.provider_id,
            run.region = %combination.region,
        );

        async {
            let started = Instant::now();
            let conversation_id = format!(
                "{}-{}-{}",
                combination.scenario_id, combination.provider_id, combination.region
            );

            let mut acc = RunAccumulator::default();
            if let Err(err) = self.drive(&combination, &conversation_id, &cancel, &mut acc).await
            {
                warn!(error = %err, "run failed");
                acc.error_kind = Some(RunErrorKind::from_error(&err));
                acc.error = Some(err.to_string());
            }

            // Final state, for the result and conversation assertions.
            let (messages, metadata) = self
                .store
                .load(&conversation_id)
                .await
                .map(|s| (s.messages, s.metadata))
                .unwrap_or_default();

            if acc.error.is_none() && acc.ran_turns {
                if let Some(scenario) = self.scenarios.get(&combination.scenario_id) {
                    acc.outcomes
                        .extend(self.conversation_assertions(scenario, &messages));
                }
            }

            let result = RunResult {
                run_id,
                provider_id: combination.provider_id.clone(),
                scenario_id: combination.scenario_id.clone(),
                region: combination.region.clone(),
                messages,
                metadata,
                cost: acc.cost,
                duration_ms: started.elapsed().as_millis() as u64,
                error: acc.error,
                error_kind: acc.error_kind,
                assertion_results: acc.outcomes,
                self_play: acc.self_play,
            };

            info!(
                passed = result.passed(),
                assertions = result.assertion_results.len(),
                cost_usd = result.cost.total_cost,
                "run finished",
            );

            // The conversation ends with the scenario; the result owns
            // the transcript now.
            let _ = self.store.delete(&conversation_id).await;

            if let Err(err) = self.sink.write(result).await {
                warn!(error = %err, "failed to write run result");
            }
        }
        .instrument(span)
        .await;
    }

    async fn drive(
        &self,
        combination: &Combination,
        conversation_id: &str,
        cancel: &CancellationToken,
        acc: &mut RunAccumulator,
    ) -> Result<()> {
        let scenario = self
            .scenarios
            .get(&combination.scenario_id)
            .ok_or_else(|| Error::config(format!("unknown scenario '{}'", combination.scenario_id)))?
            .clone();
        let entry = self
            .providers
            .get(&combination.provider_id)
            .ok_or_else(|| Error::config(format!("unknown provider '{}'", combination.provider_id)))?;
        let pack = self
            .packs
            .for_task_type(&scenario.task_type)
            .ok_or_else(|| {
                Error::config(format!(
                    "no prompt pack for task type '{}'",
                    scenario.task_type
                ))
            })?;

        // Zero scripted turns and no self-play: nothing to execute, no
        // provider calls, no assertions.
        if scenario.turns.is_empty() && scenario.self_play.is_none() {
            return Ok(());
        }
        acc.ran_turns = true;

        let pipeline =
            self.build_assistant_pipeline(&entry, &pack, &scenario, &combination.region)?;

        let mut user_turn = 0u64;
        for turn in &scenario.turns {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let (content, _) = substitute_placeholders(&turn.content, &scenario.context);
            match turn.role {
                TurnRole::Assistant => {
                    self.seed_assistant_message(conversation_id, content).await?;
                }
                TurnRole::User => {
                    user_turn += 1;
                    let mut ctx = ExecutionContext::new(conversation_id)
                        .with_cancellation(cancel.child_token())
                        .with_message(Message::user(content));
                    ctx.set_metadata(keys::ARENA_ROLE, json!("assistant"));
                    ctx.set_metadata(keys::MOCK_SCENARIO_ID, json!(scenario.id));
                    ctx.set_metadata(keys::MOCK_TURN_NUMBER, json!(user_turn));
                    ctx.turn_assertions = turn.assertions.clone();
                    ctx.workflow = self.workflow.clone();
                    for (k, v) in &scenario.context {
                        ctx.set_variable(k.clone(), v.clone());
                    }

                    let outcome = pipeline.execute(&mut ctx).await;
                    acc.cost += ctx.cost;
                    acc.outcomes.append(&mut ctx.assertion_results);
                    outcome?;
                }
            }
        }

        if scenario.self_play.is_some() {
            let result = self
                .run_self_play(&entry, &pack, &scenario, combination, conversation_id, cancel)
                .await?;
            acc.cost += result.cost;
            acc.self_play = Some(result);
        }

        Ok(())
    }

    async fn seed_assistant_message(&self, conversation_id: &str, content: String) -> Result<()> {
        let mut state = match self.store.load(conversation_id).await {
            Ok(state) => state,
            Err(_) => ConversationState::new(conversation_id),
        };
        state.messages.push(Message::assistant(content));
        self.store.save(&state).await?;
        Ok(())
    }

    fn build_assistant_pipeline(
        &self,
        entry: &Arc<ProviderEntry>,
        pack: &Arc<PromptPack>,
        scenario: &Scenario,
        region: &str,
    ) -> Result<Pipeline> {
        let validators = ValidatorsMiddleware::from_pack(pack, &self.judges)?;
        Ok(Pipeline::new(vec![
            Arc::new(StateLoadMiddleware::new(self.store.clone())),
            Arc::new(
                PromptAssemblyMiddleware::new(pack.clone(), region)
                    .with_base_vars(scenario.context.clone()),
            ),
            Arc::new(TemplateMiddleware::new(pack.clone())),
            Arc::new(StateSaveMiddleware::new(self.store.clone())),
            Arc::new(TurnIndexMiddleware::new()),
            Arc::new(validators),
            Arc::new(
                ProviderMiddleware::new(entry.clone(), pack.clone(), self.dispatcher.clone())
                    .with_config(self.provider_config),
            ),
            Arc::new(TurnAssertionsMiddleware::new()),
        ]))
    }

    async fn run_self_play(
        &self,
        entry: &Arc<ProviderEntry>,
        pack: &Arc<PromptPack>,
        scenario: &Scenario,
        combination: &Combination,
        conversation_id: &str,
        cancel: &CancellationToken,
    ) -> Result<SelfPlayResult> {
        let config = scenario
            .self_play
            .clone()
            .ok_or_else(|| Error::internal("self-play config vanished"))?;
        let persona = self
            .personas
            .get(&config.persona)
            .ok_or_else(|| Error::config(format!("unknown persona '{}'", config.persona)))?;

        // The user-generation chain prefers a dedicated provider group;
        // otherwise the run's own provider generates both sides.
        let user_entry = self
            .providers
            .in_group(SELF_PLAY_GROUP)
            .into_iter()
            .next()
            .unwrap_or_else(|| entry.clone());

        // The persona chain offers no tools and saves nothing: the
        // assistant chain owns persistence of the merged transcript.
        let persona_pack = Arc::new(PromptPack::new(
            format!("persona-{}", persona.id),
            "selfplay",
            "",
        ));
        let user_pipeline = Pipeline::new(vec![
            Arc::new(StateLoadMiddleware::new(self.store.clone())),
            Arc::new(TurnIndexMiddleware::new()),
            Arc::new(PersonaAssemblyMiddleware::new(persona)),
            Arc::new(
                ProviderMiddleware::new(user_entry, persona_pack, self.dispatcher.clone())
                    .with_config(self.provider_config),
            ) as Arc<dyn Middleware>,
        ]);

        let assistant_pipeline =
            self.build_assistant_pipeline(entry, pack, scenario, &combination.region)?;

        SelfPlayDriver::new(user_pipeline, assistant_pipeline, config)
            .run(conversation_id, cancel.clone())
            .await
    }

    fn conversation_assertions(
        &self,
        scenario: &Scenario,
        messages: &[Message],
    ) -> Vec<AssertionOutcome> {
        if scenario.conversation_assertions.is_empty() {
            return Vec::new();
        }

        let tool_calls: Vec<ToolCall> = messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .filter_map(|m| m.tool_calls.as_ref())
            .flatten()
            .cloned()
            .collect();
        let validations: Vec<ValidationResult> = messages
            .iter()
            .flat_map(|m| m.validations.iter().cloned())
            .collect();

        let scope = AssertionScope {
            messages,
            tool_calls: &tool_calls,
            validations: &validations,
            workflow: self.workflow.as_deref(),
        };
        evaluate_all(&scenario.conversation_assertions, &scope)
    }
}

#[derive(Debug, Default)]
struct RunAccumulator {
    cost: CostInfo,
    outcomes: Vec<AssertionOutcome>,
    self_play: Option<SelfPlayResult>,
    error: Option<String>,
    error_kind: Option<RunErrorKind>,
    ran_turns: bool,
}
