//! YAML configuration manifests.
//!
//! Every config file is a manifest envelope: `apiVersion`, `kind`,
//! `metadata`, `spec`. The kinds mirror the registries: `Arena` wires an
//! execution together; `Provider`, `PromptConfig`, `Scenario`, `Tool`,
//! and `Persona` declare the pieces. Schema validation of manifests is a
//! separate concern and not performed here; unknown fields are simply
//! ignored by serde.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cost::Pricing;
use crate::error::{Error, Result};
use crate::pack::{Fragment, PromptPack};
use crate::provider::SamplingConfig;
use crate::scenario::Scenario;
use crate::selfplay::Persona;
use crate::tools::{HttpToolConfig, ToolDescriptor, ToolMode};
use crate::validators::ValidatorSpec;

/// The API version all manifests carry.
pub const API_VERSION: &str = "promptkit.altairalabs.ai/v1alpha1";

/// Manifest object metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    /// Object name; becomes the registry id.
    pub name: String,

    /// Free-form labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Free-form annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// A parsed configuration manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Manifest {
    /// Top-level execution wiring.
    Arena {
        /// API version.
        #[serde(rename = "apiVersion")]
        api_version: String,
        /// Object metadata.
        metadata: Metadata,
        /// The spec.
        spec: ArenaSpec,
    },
    /// One LLM provider.
    Provider {
        /// API version.
        #[serde(rename = "apiVersion")]
        api_version: String,
        /// Object metadata.
        metadata: Metadata,
        /// The spec.
        spec: ProviderSpec,
    },
    /// One prompt pack.
    PromptConfig {
        /// API version.
        #[serde(rename = "apiVersion")]
        api_version: String,
        /// Object metadata.
        metadata: Metadata,
        /// The spec.
        spec: PromptSpec,
    },
    /// One scenario.
    Scenario {
        /// API version.
        #[serde(rename = "apiVersion")]
        api_version: String,
        /// Object metadata.
        metadata: Metadata,
        /// The spec.
        spec: ScenarioSpec,
    },
    /// One tool.
    Tool {
        /// API version.
        #[serde(rename = "apiVersion")]
        api_version: String,
        /// Object metadata.
        metadata: Metadata,
        /// The spec.
        spec: ToolSpec,
    },
    /// One self-play persona.
    Persona {
        /// API version.
        #[serde(rename = "apiVersion")]
        api_version: String,
        /// Object metadata.
        metadata: Metadata,
        /// The spec.
        spec: PersonaSpec,
    },
}

impl Manifest {
    /// The manifest's object name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Arena { metadata, .. }
            | Self::Provider { metadata, .. }
            | Self::PromptConfig { metadata, .. }
            | Self::Scenario { metadata, .. }
            | Self::Tool { metadata, .. }
            | Self::Persona { metadata, .. } => &metadata.name,
        }
    }

    /// The manifest's declared API version.
    #[must_use]
    pub fn api_version(&self) -> &str {
        match self {
            Self::Arena { api_version, .. }
            | Self::Provider { api_version, .. }
            | Self::PromptConfig { api_version, .. }
            | Self::Scenario { api_version, .. }
            | Self::Tool { api_version, .. }
            | Self::Persona { api_version, .. } => api_version,
        }
    }
}

/// The `Arena` kind: execution wiring and defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArenaSpec {
    /// Regions to plan over.
    #[serde(default)]
    pub regions: Vec<String>,

    /// Provider manifest names to include.
    #[serde(default)]
    pub providers: Vec<String>,

    /// Prompt manifest names to include.
    #[serde(default)]
    pub prompts: Vec<String>,

    /// Scenario manifest names to include.
    #[serde(default)]
    pub scenarios: Vec<String>,

    /// Tool manifest names to include.
    #[serde(default)]
    pub tools: Vec<String>,

    /// MCP servers to register.
    #[serde(default)]
    pub mcp_servers: Vec<McpServerSpec>,

    /// Provider manifest names used as judges.
    #[serde(default)]
    pub judges: Vec<String>,

    /// Execution defaults.
    #[serde(default)]
    pub defaults: DefaultsSpec,
}

/// One MCP server declaration inside an Arena spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerSpec {
    /// Server name.
    pub name: String,
    /// Command to spawn.
    pub command: String,
    /// Command arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables for the subprocess.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Request timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// The `defaults` block of an Arena spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefaultsSpec {
    /// Default sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Default nucleus sampling parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Default max tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Default seed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    /// Worker pool size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    /// Per-turn timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Retry attempts for transient provider failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Output formats (`json`, `junit`, `html`, `markdown`).
    #[serde(default)]
    pub output: Vec<String>,
    /// Whether to record transcripts.
    #[serde(default)]
    pub recording: bool,
    /// Fail-on categories.
    #[serde(default)]
    pub fail_on: Vec<String>,
    /// State backend selector (`memory` by default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

/// Provider backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// OpenAI or an OpenAI-compatible endpoint.
    Openai,
    /// Anthropic.
    Anthropic,
    /// Google Gemini.
    Gemini,
    /// The scripted mock provider.
    Mock,
}

/// Credential source for a provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialSpec {
    /// Inline API key. Prefer the env or file variants.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Path of a file holding the key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_file: Option<String>,
    /// Environment variable holding the key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_env: Option<String>,
}

impl CredentialSpec {
    /// Resolve the key: inline, then file, then environment.
    pub fn resolve(&self) -> Result<String> {
        if let Some(key) = &self.api_key {
            return Ok(key.clone());
        }
        if let Some(path) = &self.credential_file {
            return std::fs::read_to_string(path)
                .map(|s| s.trim().to_string())
                .map_err(|e| Error::config(format!("cannot read credential file {path}: {e}")));
        }
        if let Some(var) = &self.credential_env {
            return std::env::var(var)
                .map_err(|_| Error::config(format!("credential env var {var} is not set")));
        }
        Err(Error::config("provider has no credential configured"))
    }
}

/// Managed-platform settings for a provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformSpec {
    /// Platform type (`bedrock`, `vertex`, `azure`).
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub platform_type: Option<String>,
    /// Platform region.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Cloud project.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    /// Custom endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// The `Provider` kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSpec {
    /// Backend type.
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    /// Model identifier.
    pub model: String,
    /// Endpoint override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Credential source.
    #[serde(default)]
    pub credential: CredentialSpec,
    /// Managed-platform settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<PlatformSpec>,
    /// Default sampling parameters.
    #[serde(default)]
    pub defaults: SamplingConfig,
    /// Pricing table.
    #[serde(default)]
    pub pricing: Pricing,
    /// Provider group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

/// The `PromptConfig` kind; converts into a [`PromptPack`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptSpec {
    /// Task type this pack serves.
    pub task_type: String,
    /// System prompt template.
    pub template: String,
    /// Fragments composed after the template.
    #[serde(default)]
    pub fragments: Vec<Fragment>,
    /// Required variables.
    #[serde(default)]
    pub required_vars: Vec<String>,
    /// Default variable values.
    #[serde(default)]
    pub defaults: BTreeMap<String, String>,
    /// Tool whitelist.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Validators scored against responses.
    #[serde(default)]
    pub validators: Vec<ValidatorSpec>,
}

impl PromptSpec {
    /// Build the pack under the manifest's name.
    #[must_use]
    pub fn into_pack(self, name: &str) -> PromptPack {
        PromptPack {
            id: name.to_string(),
            task_type: self.task_type,
            template: self.template,
            fragments: self.fragments,
            required_vars: self.required_vars,
            default_vars: self.defaults,
            allowed_tools: self.allowed_tools,
            validators: self.validators,
        }
    }
}

/// The `Scenario` kind; the spec is the scenario minus its id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioSpec {
    /// Scenario fields.
    #[serde(flatten)]
    pub scenario: ScenarioBody,
}

/// Scenario fields without the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioBody {
    /// Task type used to select the pack.
    pub task_type: String,
    /// Scripted turns.
    #[serde(default)]
    pub turns: Vec<crate::scenario::TurnDef>,
    /// Conversation-level assertions.
    #[serde(default)]
    pub conversation_assertions: Vec<crate::assertions::Assertion>,
    /// Budget limits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<crate::scenario::ScenarioConstraints>,
    /// Self-play settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_play: Option<crate::selfplay::SelfPlayConfig>,
    /// Provider group for the assistant role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_group: Option<String>,
    /// Base template variables.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

impl ScenarioSpec {
    /// Build the scenario under the manifest's name.
    #[must_use]
    pub fn into_scenario(self, name: &str) -> Scenario {
        let body = self.scenario;
        let mut scenario = Scenario::new(name, body.task_type);
        scenario.turns = body.turns;
        scenario.conversation_assertions = body.conversation_assertions;
        scenario.constraints = body.constraints;
        scenario.self_play = body.self_play;
        if let Some(group) = body.provider_group {
            scenario.provider_group = group;
        }
        scenario.context = body.context;
        scenario
    }
}

/// The `Tool` kind; converts into a [`ToolDescriptor`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool description shown to the model.
    #[serde(default)]
    pub description: String,
    /// Input JSON Schema.
    #[serde(default)]
    pub input_schema: Value,
    /// Execution mode.
    pub mode: ToolMode,
    /// Per-call timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Canned result for mock tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mock_result: Option<Value>,
    /// Template for mock tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mock_template: Option<String>,
    /// HTTP settings for live tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpToolConfig>,
    /// MCP server name for MCP tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_server: Option<String>,
}

impl ToolSpec {
    /// Build the descriptor under the manifest's name.
    #[must_use]
    pub fn into_descriptor(self, name: &str) -> ToolDescriptor {
        let mut descriptor =
            ToolDescriptor::new(name, self.description, self.input_schema, self.mode);
        if let Some(timeout_ms) = self.timeout_ms {
            descriptor.timeout_ms = timeout_ms;
        }
        descriptor.mock_result = self.mock_result;
        descriptor.mock_template = self.mock_template;
        descriptor.http = self.http;
        descriptor.mcp_server = self.mcp_server;
        descriptor
    }
}

/// The `Persona` kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaSpec {
    /// Display name.
    pub name: String,
    /// Behavioral traits.
    #[serde(default)]
    pub traits: Vec<String>,
    /// What the persona wants.
    #[serde(default)]
    pub goal: String,
    /// System prompt template.
    pub template: String,
}

impl PersonaSpec {
    /// Build the persona under the manifest's name.
    #[must_use]
    pub fn into_persona(self, id: &str) -> Persona {
        Persona {
            id: id.to_string(),
            name: self.name,
            traits: self.traits,
            goal: self.goal,
            template: self.template,
        }
    }
}

/// Parse a single manifest document.
pub fn parse_manifest(yaml: &str) -> Result<Manifest> {
    let manifest: Manifest = serde_yaml::from_str(yaml)?;
    if manifest.api_version() != API_VERSION {
        return Err(Error::config(format!(
            "unsupported apiVersion '{}' (expected '{API_VERSION}')",
            manifest.api_version()
        )));
    }
    Ok(manifest)
}

/// Load every `*.yaml` / `*.yml` manifest under a directory.
pub fn load_dir(dir: impl AsRef<Path>) -> Result<Vec<Manifest>> {
    let dir = dir.as_ref();
    let entries = std::fs::read_dir(dir)
        .map_err(|e| Error::config(format!("cannot read {}: {e}", dir.display())))?;

    let mut paths: Vec<_> = entries
        .filter_map(std::result::Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == "yaml" || ext == "yml")
        })
        .collect();
    paths.sort();

    let mut manifests = Vec::new();
    for path in paths {
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))?;
        // One file may hold several documents.
        for doc in content.split("\n---") {
            if doc.trim().is_empty() {
                continue;
            }
            manifests.push(parse_manifest(doc).map_err(|e| {
                Error::config(format!("{}: {e}", path.display()))
            })?);
        }
    }
    Ok(manifests)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn provider_manifest_parses() {
        let yaml = r#"
apiVersion: promptkit.altairalabs.ai/v1alpha1
kind: Provider
metadata:
  name: openai-main
  labels:
    tier: premium
spec:
  type: openai
  model: gpt-4o
  credential:
    credential_env: OPENAI_API_KEY
  defaults:
    temperature: 0.2
    max_tokens: 1024
  pricing:
    input_per_1k: 0.0025
    output_per_1k: 0.01
    cached_per_1k: 0.00125
  group: default
"#;
        let manifest = parse_manifest(yaml).unwrap();
        assert_eq!(manifest.name(), "openai-main");
        match manifest {
            Manifest::Provider { spec, .. } => {
                assert_eq!(spec.provider_type, ProviderType::Openai);
                assert_eq!(spec.model, "gpt-4o");
                assert_eq!(spec.defaults.temperature, Some(0.2));
                assert!((spec.pricing.output_per_1k - 0.01).abs() < 1e-9);
            }
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn prompt_manifest_becomes_pack() {
        let yaml = r#"
apiVersion: promptkit.altairalabs.ai/v1alpha1
kind: PromptConfig
metadata:
  name: support-v1
spec:
  task_type: support
  template: "You help {{brand}} customers."
  required_vars: [brand]
  allowed_tools: [get_weather]
  validators:
    - type: banned_words
      words: [guarantee]
"#;
        let manifest = parse_manifest(yaml).unwrap();
        let Manifest::PromptConfig { spec, metadata, .. } = manifest else {
            panic!("wrong kind");
        };
        let pack = spec.into_pack(&metadata.name);
        assert_eq!(pack.id, "support-v1");
        assert_eq!(pack.task_type, "support");
        assert!(pack.is_tool_allowed("get_weather"));
        assert_eq!(pack.validators.len(), 1);
    }

    #[test]
    fn scenario_manifest_becomes_scenario() {
        let yaml = r#"
apiVersion: promptkit.altairalabs.ai/v1alpha1
kind: Scenario
metadata:
  name: weather-smoke
spec:
  task_type: support
  turns:
    - role: user
      content: "Weather in Paris?"
      assertions:
        - type: tools_called
          tools: [get_weather]
  provider_group: default
"#;
        let manifest = parse_manifest(yaml).unwrap();
        let Manifest::Scenario { spec, metadata, .. } = manifest else {
            panic!("wrong kind");
        };
        let scenario = spec.into_scenario(&metadata.name);
        assert_eq!(scenario.id, "weather-smoke");
        assert_eq!(scenario.turns.len(), 1);
        assert_eq!(scenario.provider_group, "default");
    }

    #[test]
    fn tool_manifest_becomes_descriptor() {
        let yaml = r#"
apiVersion: promptkit.altairalabs.ai/v1alpha1
kind: Tool
metadata:
  name: get_weather
spec:
  description: Current weather for a location
  mode: mock
  timeout_ms: 5000
  input_schema:
    type: object
    properties:
      location:
        type: string
  mock_template: "Sunny in {{ location }}"
"#;
        let manifest = parse_manifest(yaml).unwrap();
        let Manifest::Tool { spec, metadata, .. } = manifest else {
            panic!("wrong kind");
        };
        let descriptor = spec.into_descriptor(&metadata.name);
        assert_eq!(descriptor.name, "get_weather");
        assert_eq!(descriptor.mode, ToolMode::Mock);
        assert_eq!(descriptor.timeout_ms, 5000);
        assert!(descriptor.mock_template.is_some());
    }

    #[test]
    fn arena_manifest_carries_defaults_and_mcp_servers() {
        let yaml = r#"
apiVersion: promptkit.altairalabs.ai/v1alpha1
kind: Arena
metadata:
  name: nightly
spec:
  regions: [us-east, eu-west]
  providers: [openai-main]
  prompts: [support-v1]
  scenarios: [weather-smoke]
  tools: [get_weather]
  judges: [judge-gpt]
  mcp_servers:
    - name: filesystem
      command: mcp-server-filesystem
      args: ["/data"]
      timeout_secs: 20
  defaults:
    temperature: 0.1
    concurrency: 4
    timeout_secs: 30
    max_retries: 3
    fail_on: [assertion_failure, provider_error]
"#;
        let manifest = parse_manifest(yaml).unwrap();
        let Manifest::Arena { spec, .. } = manifest else {
            panic!("wrong kind");
        };
        assert_eq!(spec.regions.len(), 2);
        assert_eq!(spec.mcp_servers[0].name, "filesystem");
        assert_eq!(spec.mcp_servers[0].timeout_secs, Some(20));
        assert_eq!(spec.defaults.concurrency, Some(4));
        assert_eq!(spec.defaults.fail_on.len(), 2);
    }

    #[test]
    fn wrong_api_version_is_rejected() {
        let yaml = "
apiVersion: promptkit.altairalabs.ai/v2
kind: Persona
metadata:
  name: p
spec:
  name: Sam
  template: hi
";
        let err = parse_manifest(yaml).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn credential_resolution_order() {
        let inline = CredentialSpec {
            api_key: Some("sk-inline".into()),
            credential_file: None,
            credential_env: None,
        };
        assert_eq!(inline.resolve().unwrap(), "sk-inline");

        let missing = CredentialSpec::default();
        assert!(missing.resolve().is_err());
    }
}
