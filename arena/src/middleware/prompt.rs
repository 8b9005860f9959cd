//! Prompt assembly and template middlewares.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::pack::{PromptPack, substitute_placeholders};
use crate::trace::StageEvent;

use super::{Middleware, Next};

/// Assembles the system prompt from the pack.
///
/// `build_system_prompt` composes the pack's fragments for the run's
/// region and substitutes the variables known at assembly time. Variables
/// already present on the context (set by the driver or a persona) are
/// preserved over pack defaults.
pub struct PromptAssemblyMiddleware {
    pack: Arc<PromptPack>,
    region: String,
    base_vars: BTreeMap<String, String>,
}

impl std::fmt::Debug for PromptAssemblyMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptAssemblyMiddleware")
            .field("pack", &self.pack.id)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl PromptAssemblyMiddleware {
    /// Create an assembly middleware for the given pack and region.
    #[must_use]
    pub fn new(pack: Arc<PromptPack>, region: impl Into<String>) -> Self {
        Self {
            pack,
            region: region.into(),
            base_vars: BTreeMap::new(),
        }
    }

    /// Provide base variables for assembly.
    #[must_use]
    pub fn with_base_vars(mut self, base_vars: BTreeMap<String, String>) -> Self {
        self.base_vars = base_vars;
        self
    }
}

#[async_trait]
impl Middleware for PromptAssemblyMiddleware {
    fn name(&self) -> &'static str {
        "prompt_assembly"
    }

    async fn process(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<()> {
        let span = StageEvent::begin(self.name());

        let mut base = self.base_vars.clone();
        // Context variables outrank pack/base defaults.
        for (k, v) in &ctx.variables {
            base.insert(k.clone(), v.clone());
        }

        let (prompt, effective) = self.pack.build_system_prompt(&self.region, &base);
        ctx.system_prompt = prompt;
        ctx.variables = effective;

        debug!(pack = %self.pack.id, region = %self.region, "system prompt assembled");
        ctx.record_stage(span.finish(
            "assembled",
            json!({"pack": self.pack.id, "region": self.region}),
        ));

        next.run(ctx).await
    }
}

/// Substitutes remaining `{{var}}` placeholders from context variables.
///
/// Runs after assembly so that per-turn variables (persona traits,
/// scenario context) resolve placeholders the pack could not. A required
/// variable that is still missing fails the turn.
pub struct TemplateMiddleware {
    pack: Arc<PromptPack>,
}

impl std::fmt::Debug for TemplateMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateMiddleware")
            .field("pack", &self.pack.id)
            .finish()
    }
}

impl TemplateMiddleware {
    /// Create a template middleware checking the pack's required
    /// variables.
    #[must_use]
    pub fn new(pack: Arc<PromptPack>) -> Self {
        Self { pack }
    }
}

#[async_trait]
impl Middleware for TemplateMiddleware {
    fn name(&self) -> &'static str {
        "template"
    }

    async fn process(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<()> {
        if let Some(missing) = self.pack.missing_required(&ctx.variables).first() {
            return Err(Error::var_missing(missing.clone()));
        }

        let (rendered, unresolved) = substitute_placeholders(&ctx.system_prompt, &ctx.variables);
        ctx.system_prompt = rendered;

        if let Some(name) = unresolved
            .iter()
            .find(|name| self.pack.required_vars.iter().any(|r| r == *name))
        {
            return Err(Error::var_missing(name.clone()));
        }

        next.run(ctx).await
    }
}
