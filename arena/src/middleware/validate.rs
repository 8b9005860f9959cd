//! Validator installation middleware.

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::pack::PromptPack;
use crate::registry::JudgeRegistry;
use crate::validators::SharedValidator;

use super::{Middleware, Next};

/// Installs the pack's validators on the context.
///
/// The provider stage scores the installed validators against the
/// terminal assistant message before calling further into the chain, so
/// turn assertions and the save stage both see the results.
pub struct ValidatorsMiddleware {
    validators: Vec<SharedValidator>,
}

impl std::fmt::Debug for ValidatorsMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let labels: Vec<&str> = self.validators.iter().map(|v| v.label()).collect();
        f.debug_struct("ValidatorsMiddleware")
            .field("validators", &labels)
            .finish()
    }
}

impl ValidatorsMiddleware {
    /// Create a middleware installing the given validators.
    #[must_use]
    pub fn new(validators: Vec<SharedValidator>) -> Self {
        Self { validators }
    }

    /// Build the middleware from a pack's declared validator specs.
    pub fn from_pack(pack: &Arc<PromptPack>, judges: &JudgeRegistry) -> Result<Self> {
        let validators = pack
            .validators
            .iter()
            .map(|spec| spec.build(judges))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(validators))
    }
}

#[async_trait]
impl Middleware for ValidatorsMiddleware {
    fn name(&self) -> &'static str {
        "validators"
    }

    async fn process(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<()> {
        ctx.validators = self.validators.clone();
        next.run(ctx).await
    }
}
