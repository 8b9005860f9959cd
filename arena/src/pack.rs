//! Prompt packs.
//!
//! A pack is a compiled, versioned prompt package: the system template,
//! optional region-scoped fragments, declared variables, the tool
//! whitelist, and the validators scored against responses.
//!
//! Rendering is two-phase. [`PromptPack::build_system_prompt`] composes
//! fragments and substitutes the variables known at assembly time,
//! leaving unknown `{{var}}` placeholders intact; the template middleware
//! later substitutes the remainder from the execution context and fails
//! with a missing-variable error when a required variable never arrived.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::validators::ValidatorSpec;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("valid regex"));

/// Substitute `{{var}}` placeholders from `vars`.
///
/// Returns the rendered text and the names of placeholders that had no
/// value, in order of first appearance.
#[must_use]
pub fn substitute_placeholders(
    template: &str,
    vars: &BTreeMap<String, String>,
) -> (String, Vec<String>) {
    let mut unresolved = Vec::new();
    let rendered = PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            match vars.get(name) {
                Some(value) => value.clone(),
                None => {
                    if !unresolved.iter().any(|u| u == name) {
                        unresolved.push(name.to_string());
                    }
                    caps[0].to_string()
                }
            }
        })
        .into_owned();
    (rendered, unresolved)
}

/// A named prompt fragment, optionally restricted to certain regions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fragment {
    /// Fragment name, for diagnostics.
    pub name: String,
    /// Fragment text, appended to the system template.
    pub content: String,
    /// Regions this fragment applies to. Empty applies everywhere.
    #[serde(default)]
    pub regions: Vec<String>,
}

impl Fragment {
    /// Create a fragment that applies in all regions.
    #[must_use]
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
            regions: Vec::new(),
        }
    }

    /// Restrict the fragment to the given regions.
    #[must_use]
    pub fn for_regions(mut self, regions: Vec<String>) -> Self {
        self.regions = regions;
        self
    }

    fn applies_to(&self, region: &str) -> bool {
        self.regions.is_empty() || self.regions.iter().any(|r| r == region)
    }
}

/// A compiled prompt package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptPack {
    /// Pack identifier.
    pub id: String,

    /// Task type this pack serves (`support`, `creative`, ...). Matched
    /// against the scenario's task type to select the right pack.
    pub task_type: String,

    /// System prompt template with `{{var}}` placeholders.
    pub template: String,

    /// Fragments composed after the template.
    #[serde(default)]
    pub fragments: Vec<Fragment>,

    /// Variables that must be resolved by the time the template
    /// middleware runs.
    #[serde(default)]
    pub required_vars: Vec<String>,

    /// Default variable values, overridable by scenario/persona vars.
    #[serde(default)]
    pub default_vars: BTreeMap<String, String>,

    /// Names of tools the model may call. Tools outside this list are
    /// rejected in the tool loop.
    #[serde(default)]
    pub allowed_tools: Vec<String>,

    /// Validators scored against every assistant response.
    #[serde(default)]
    pub validators: Vec<ValidatorSpec>,
}

impl PromptPack {
    /// Create a pack with the given template.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        task_type: impl Into<String>,
        template: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            template: template.into(),
            fragments: Vec::new(),
            required_vars: Vec::new(),
            default_vars: BTreeMap::new(),
            allowed_tools: Vec::new(),
            validators: Vec::new(),
        }
    }

    /// Append a fragment.
    #[must_use]
    pub fn with_fragment(mut self, fragment: Fragment) -> Self {
        self.fragments.push(fragment);
        self
    }

    /// Declare a required variable.
    #[must_use]
    pub fn with_required_var(mut self, name: impl Into<String>) -> Self {
        self.required_vars.push(name.into());
        self
    }

    /// Set a default variable value.
    #[must_use]
    pub fn with_default_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_vars.insert(name.into(), value.into());
        self
    }

    /// Whitelist a tool.
    #[must_use]
    pub fn allow_tool(mut self, name: impl Into<String>) -> Self {
        self.allowed_tools.push(name.into());
        self
    }

    /// Append a validator.
    #[must_use]
    pub fn with_validator(mut self, spec: ValidatorSpec) -> Self {
        self.validators.push(spec);
        self
    }

    /// Whether the pack permits calling the named tool.
    #[must_use]
    pub fn is_tool_allowed(&self, name: &str) -> bool {
        self.allowed_tools.iter().any(|t| t == name)
    }

    /// Compose the system prompt for `region` and substitute the
    /// variables known at assembly time.
    ///
    /// Returns the (possibly still placeholder-bearing) prompt and the
    /// effective variable map: defaults overlaid with `base_vars` and
    /// `region`.
    #[must_use]
    pub fn build_system_prompt(
        &self,
        region: &str,
        base_vars: &BTreeMap<String, String>,
    ) -> (String, BTreeMap<String, String>) {
        let mut vars = self.default_vars.clone();
        for (k, v) in base_vars {
            vars.insert(k.clone(), v.clone());
        }
        vars.insert("region".to_string(), region.to_string());

        let mut text = self.template.clone();
        for fragment in &self.fragments {
            if fragment.applies_to(region) {
                if !text.is_empty() {
                    text.push_str("\n\n");
                }
                text.push_str(&fragment.content);
            }
        }

        let (rendered, _unresolved) = substitute_placeholders(&text, &vars);
        (rendered, vars)
    }

    /// Required variables absent from `vars`.
    #[must_use]
    pub fn missing_required(&self, vars: &BTreeMap<String, String>) -> Vec<String> {
        self.required_vars
            .iter()
            .filter(|name| !vars.contains_key(*name))
            .cloned()
            .collect()
    }
}
