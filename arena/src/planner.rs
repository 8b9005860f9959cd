//! Run planning.
//!
//! The planner materializes every (region × scenario × provider)
//! combination, restricted by optional filters and by provider-group
//! membership, and sorts the result lexicographically so identical
//! inputs always yield identical plans.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::registry::ProviderRegistry;
use crate::scenario::Scenario;

/// One planned run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Combination {
    /// Deployment region.
    pub region: String,
    /// Scenario id.
    pub scenario_id: String,
    /// Provider id.
    pub provider_id: String,
}

/// An ordered list of combinations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunPlan {
    /// Combinations in `(region, scenario, provider)` order.
    pub combinations: Vec<Combination>,
}

impl RunPlan {
    /// Number of planned runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.combinations.len()
    }

    /// Whether the plan is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.combinations.is_empty()
    }
}

/// Optional run filters. `None` selects everything.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    /// Regions to include.
    pub regions: Option<Vec<String>>,
    /// Provider ids to include.
    pub providers: Option<Vec<String>>,
    /// Scenario ids to include.
    pub scenarios: Option<Vec<String>>,
}

impl RunFilter {
    /// A filter selecting everything.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    fn keeps(filter: Option<&Vec<String>>, value: &str) -> bool {
        filter.is_none_or(|list| list.iter().any(|v| v == value))
    }
}

/// Generate the run plan.
///
/// Only providers in the scenario's `provider_group` are eligible for the
/// assistant role; judge and self-play provider groups never appear in a
/// plan unless a scenario explicitly selects them. An empty result is a
/// plan error.
pub fn generate_run_plan(
    regions: &[String],
    scenarios: &[Arc<Scenario>],
    providers: &ProviderRegistry,
    filter: &RunFilter,
) -> Result<RunPlan> {
    let mut combinations = Vec::new();

    for region in regions {
        if !RunFilter::keeps(filter.regions.as_ref(), region) {
            continue;
        }
        for scenario in scenarios {
            if !RunFilter::keeps(filter.scenarios.as_ref(), &scenario.id) {
                continue;
            }
            for entry in providers.in_group(&scenario.provider_group) {
                if !RunFilter::keeps(filter.providers.as_ref(), &entry.id) {
                    continue;
                }
                combinations.push(Combination {
                    region: region.clone(),
                    scenario_id: scenario.id.clone(),
                    provider_id: entry.id.clone(),
                });
            }
        }
    }

    if combinations.is_empty() {
        return Err(Error::plan(
            "no combinations match the configured regions, scenarios, and providers",
        ));
    }

    combinations.sort();
    combinations.dedup();
    Ok(RunPlan { combinations })
}
