//! Typed registries.
//!
//! Registries are built once at startup from configuration, wrapped in
//! `Arc`, and then only read: every lookup during execution is over an
//! immutable map shared across worker tasks.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cost::Pricing;
use crate::pack::PromptPack;
use crate::provider::{SamplingConfig, SharedProvider};
use crate::selfplay::Persona;

/// The provider group used when configuration names none.
pub const DEFAULT_PROVIDER_GROUP: &str = "default";

/// A registered provider with its billing and grouping metadata.
#[derive(Clone)]
pub struct ProviderEntry {
    /// Registry id of this provider.
    pub id: String,
    /// The provider client.
    pub provider: SharedProvider,
    /// Per-1k pricing used for cost accounting.
    pub pricing: Pricing,
    /// Group membership; scenarios select assistant providers by group.
    pub group: String,
    /// Default sampling configuration for this provider.
    pub sampling: SamplingConfig,
}

impl std::fmt::Debug for ProviderEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderEntry")
            .field("id", &self.id)
            .field("group", &self.group)
            .field("pricing", &self.pricing)
            .finish_non_exhaustive()
    }
}

impl ProviderEntry {
    /// Create an entry in the default group with zero pricing.
    #[must_use]
    pub fn new(id: impl Into<String>, provider: SharedProvider) -> Self {
        Self {
            id: id.into(),
            provider,
            pricing: Pricing::default(),
            group: DEFAULT_PROVIDER_GROUP.to_string(),
            sampling: SamplingConfig::default(),
        }
    }

    /// Set the pricing table.
    #[must_use]
    pub const fn with_pricing(mut self, pricing: Pricing) -> Self {
        self.pricing = pricing;
        self
    }

    /// Set the group.
    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    /// Set the default sampling configuration.
    #[must_use]
    pub const fn with_sampling(mut self, sampling: SamplingConfig) -> Self {
        self.sampling = sampling;
        self
    }
}

/// Providers by id. Iteration order is the id's lexicographic order, which
/// keeps downstream plans deterministic.
#[derive(Debug, Default, Clone)]
pub struct ProviderRegistry {
    entries: BTreeMap<String, Arc<ProviderEntry>>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider entry, replacing any existing id.
    pub fn register(&mut self, entry: ProviderEntry) {
        self.entries.insert(entry.id.clone(), Arc::new(entry));
    }

    /// Look up a provider by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<ProviderEntry>> {
        self.entries.get(id).cloned()
    }

    /// All provider ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Providers belonging to `group`, sorted by id.
    #[must_use]
    pub fn in_group(&self, group: &str) -> Vec<Arc<ProviderEntry>> {
        self.entries
            .values()
            .filter(|e| e.group == group)
            .cloned()
            .collect()
    }

    /// Number of registered providers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Prompt packs by id.
#[derive(Debug, Default, Clone)]
pub struct PackRegistry {
    packs: BTreeMap<String, Arc<PromptPack>>,
}

impl PackRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pack, replacing any existing id.
    pub fn register(&mut self, pack: PromptPack) {
        self.packs.insert(pack.id.clone(), Arc::new(pack));
    }

    /// Look up a pack by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<PromptPack>> {
        self.packs.get(id).cloned()
    }

    /// The first pack (by id order) serving `task_type`.
    #[must_use]
    pub fn for_task_type(&self, task_type: &str) -> Option<Arc<PromptPack>> {
        self.packs
            .values()
            .find(|p| p.task_type == task_type)
            .cloned()
    }
}

/// Self-play personas by id.
#[derive(Debug, Default, Clone)]
pub struct PersonaRegistry {
    personas: BTreeMap<String, Arc<Persona>>,
}

impl PersonaRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a persona, replacing any existing id.
    pub fn register(&mut self, persona: Persona) {
        self.personas.insert(persona.id.clone(), Arc::new(persona));
    }

    /// Look up a persona by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Persona>> {
        self.personas.get(id).cloned()
    }
}

/// Judge providers by id, consulted by the LLM-judge validator.
#[derive(Default, Clone)]
pub struct JudgeRegistry {
    judges: BTreeMap<String, SharedProvider>,
}

impl std::fmt::Debug for JudgeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JudgeRegistry")
            .field("judges", &self.judges.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl JudgeRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a judge provider.
    pub fn register(&mut self, id: impl Into<String>, provider: SharedProvider) {
        self.judges.insert(id.into(), provider);
    }

    /// Look up a judge by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<SharedProvider> {
        self.judges.get(id).cloned()
    }
}
