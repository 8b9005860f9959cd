//! Tool descriptors, registry, and dispatch.
//!
//! A tool call resolves in exactly one of four ways: a mock result, a
//! live HTTP request, an MCP server, or a bridged A2A agent. Dispatch is
//! a flat match on the descriptor's mode, no graph, no chaining. Every
//! dispatch runs on its own task so a panicking tool is isolated to its
//! call, is bounded by the descriptor's timeout, and observes the run's
//! cancellation handle.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::a2a::A2aBridge;
use crate::error::ToolError;
use crate::mcp::McpRegistry;
use crate::message::ToolCall;

/// A tool offered to the model: name, description, input schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name.
    pub name: String,
    /// Description shown to the model.
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: Value,
}

impl ToolDefinition {
    /// Create a definition.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// Derive the parameter schema from a Rust type.
    #[must_use]
    pub fn from_type<T: schemars::JsonSchema>(
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let root = schemars::schema_for!(T);
        let mut schema = serde_json::to_value(&root).unwrap_or_default();
        if let Value::Object(ref mut map) = schema {
            map.remove("$schema");
        }
        Self::new(name, description, schema)
    }
}

/// The outcome of one tool dispatch.
///
/// `is_error` marks results the backend itself flagged as failed (an MCP
/// `tools/call` with `is_error: true`); the content still goes back to
/// the model verbatim so it can observe the failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    /// Result content for the tool message.
    pub content: String,
    /// Whether the backend flagged the result as an error.
    pub is_error: bool,
}

impl ToolOutput {
    /// A successful result.
    #[must_use]
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    /// A backend-flagged error result.
    #[must_use]
    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// How a tool call is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolMode {
    /// Return a canned result or render a template over the arguments.
    Mock,
    /// Perform a live HTTP request.
    Live,
    /// Forward to an MCP server.
    Mcp,
    /// Forward to a bridged A2A agent.
    A2a,
}

/// HTTP settings for live tools.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpToolConfig {
    /// Request URL.
    pub url: String,
    /// HTTP method, `POST` by default.
    #[serde(default = "default_method")]
    pub method: String,
    /// Headers; values may reference environment variables as `${VAR}`.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Argument fields redacted from logs.
    #[serde(default)]
    pub redact_fields: Vec<String>,
}

fn default_method() -> String {
    "POST".to_string()
}

/// Default per-tool call timeout in milliseconds.
pub const DEFAULT_TOOL_TIMEOUT_MS: u64 = 30_000;

/// A registered tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool name.
    pub name: String,
    /// Description shown to the model.
    pub description: String,
    /// JSON Schema of the arguments object.
    pub input_schema: Value,
    /// Execution mode.
    pub mode: ToolMode,
    /// Per-call timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Canned result for mock tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mock_result: Option<Value>,
    /// Template rendered over the call arguments for mock tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mock_template: Option<String>,
    /// HTTP settings for live tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpToolConfig>,
    /// MCP server name for MCP tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_server: Option<String>,
}

const fn default_timeout_ms() -> u64 {
    DEFAULT_TOOL_TIMEOUT_MS
}

impl ToolDescriptor {
    /// Create a descriptor with the default timeout.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        mode: ToolMode,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            mode,
            timeout_ms: DEFAULT_TOOL_TIMEOUT_MS,
            mock_result: None,
            mock_template: None,
            http: None,
            mcp_server: None,
        }
    }

    /// Create a mock tool returning a canned value.
    #[must_use]
    pub fn mock(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        result: Value,
    ) -> Self {
        let mut d = Self::new(name, description, input_schema, ToolMode::Mock);
        d.mock_result = Some(result);
        d
    }

    /// Create a mock tool rendering a template over the call arguments.
    #[must_use]
    pub fn mock_template(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        template: impl Into<String>,
    ) -> Self {
        let mut d = Self::new(name, description, input_schema, ToolMode::Mock);
        d.mock_template = Some(template.into());
        d
    }

    /// Create a live HTTP tool.
    #[must_use]
    pub fn live(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        http: HttpToolConfig,
    ) -> Self {
        let mut d = Self::new(name, description, input_schema, ToolMode::Live);
        d.http = Some(http);
        d
    }

    /// Create an MCP tool served by the named server.
    #[must_use]
    pub fn mcp(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        server: impl Into<String>,
    ) -> Self {
        let mut d = Self::new(name, description, input_schema, ToolMode::Mcp);
        d.mcp_server = Some(server.into());
        d
    }

    /// Override the per-call timeout.
    #[must_use]
    pub const fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// The definition offered to the model.
    #[must_use]
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            self.name.clone(),
            self.description.clone(),
            self.input_schema.clone(),
        )
    }
}

/// Tools by name.
#[derive(Debug, Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<ToolDescriptor>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor, replacing any existing name.
    pub fn register(&mut self, descriptor: ToolDescriptor) {
        self.tools
            .insert(descriptor.name.clone(), Arc::new(descriptor));
    }

    /// Look up a descriptor.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<ToolDescriptor>> {
        self.tools.get(name).cloned()
    }

    /// All registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// Definitions for the named tools, in whitelist order; unknown names
    /// are skipped.
    #[must_use]
    pub fn definitions_for(&self, allowed: &[String]) -> Vec<ToolDefinition> {
        allowed
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|d| d.definition())
            .collect()
    }
}

/// Routes tool calls to their executors.
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    http_client: reqwest::Client,
    mcp: Option<Arc<McpRegistry>>,
    a2a: Option<Arc<A2aBridge>>,
}

impl std::fmt::Debug for ToolDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDispatcher")
            .field("tools", &self.registry.names())
            .finish_non_exhaustive()
    }
}

impl ToolDispatcher {
    /// Create a dispatcher over a tool registry.
    #[must_use]
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            http_client: reqwest::Client::new(),
            mcp: None,
            a2a: None,
        }
    }

    /// Attach the MCP registry for `mcp`-mode tools.
    #[must_use]
    pub fn with_mcp(mut self, mcp: Arc<McpRegistry>) -> Self {
        self.mcp = Some(mcp);
        self
    }

    /// Attach the A2A bridge for `a2a`-mode tools.
    #[must_use]
    pub fn with_a2a(mut self, a2a: Arc<A2aBridge>) -> Self {
        self.a2a = Some(a2a);
        self
    }

    /// The underlying registry.
    #[must_use]
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Execute one tool call.
    ///
    /// Runs on a dedicated task so a panic is contained, bounded by the
    /// descriptor's timeout, and cancelled cooperatively with the run.
    /// Backend-flagged failures come back as an error-marked
    /// [`ToolOutput`]; `Err` is reserved for dispatch-level failures
    /// (unknown tool, timeout, panic, transport).
    pub async fn dispatch(
        &self,
        call: &ToolCall,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, ToolError> {
        let descriptor = self
            .registry
            .get(&call.name)
            .ok_or_else(|| ToolError::NotFound {
                name: call.name.clone(),
            })?;

        let timeout = Duration::from_millis(descriptor.timeout_ms);
        let args = call.arguments_value();
        debug!(tool = %call.name, mode = ?descriptor.mode, "dispatching tool call");

        let fut = {
            let descriptor = descriptor.clone();
            let http_client = self.http_client.clone();
            let mcp = self.mcp.clone();
            let a2a = self.a2a.clone();
            async move { execute(&descriptor, http_client, mcp, a2a, args).await }
        };

        let mut handle = tokio::spawn(fut);
        let joined = tokio::select! {
            () = cancel.cancelled() => {
                handle.abort();
                return Err(ToolError::execution("run cancelled"));
            }
            joined = tokio::time::timeout(timeout, &mut handle) => joined,
        };

        match joined {
            Err(_elapsed) => {
                handle.abort();
                Err(ToolError::Timeout {
                    name: call.name.clone(),
                    timeout,
                })
            }
            Ok(Err(join_err)) => {
                warn!(tool = %call.name, error = %join_err, "tool task failed");
                Err(ToolError::Panicked {
                    name: call.name.clone(),
                })
            }
            Ok(Ok(result)) => result,
        }
    }
}

async fn execute(
    descriptor: &ToolDescriptor,
    http_client: reqwest::Client,
    mcp: Option<Arc<McpRegistry>>,
    a2a: Option<Arc<A2aBridge>>,
    args: Value,
) -> Result<ToolOutput, ToolError> {
    match descriptor.mode {
        ToolMode::Mock => execute_mock(descriptor, &args).map(ToolOutput::ok),
        ToolMode::Live => execute_live(descriptor, http_client, &args)
            .await
            .map(ToolOutput::ok),
        ToolMode::Mcp => {
            let registry = mcp.ok_or_else(|| {
                ToolError::execution("no MCP registry attached to the dispatcher")
            })?;
            let server = descriptor.mcp_server.as_deref().ok_or_else(|| {
                ToolError::execution("MCP tool has no server configured")
            })?;
            // A server-flagged error is still a result: the flag rides
            // along and the content reaches the model untouched.
            let (text, is_error) = registry
                .call(server, &descriptor.name, args)
                .await
                .map_err(|e| ToolError::execution(e.to_string()))?;
            Ok(ToolOutput {
                content: text,
                is_error,
            })
        }
        ToolMode::A2a => {
            let bridge = a2a
                .ok_or_else(|| ToolError::execution("no A2A bridge attached to the dispatcher"))?;
            bridge.call(&descriptor.name, &args).await.map(ToolOutput::ok)
        }
    }
}

fn execute_mock(descriptor: &ToolDescriptor, args: &Value) -> Result<String, ToolError> {
    if let Some(template) = &descriptor.mock_template {
        let env = minijinja::Environment::new();
        return env
            .render_str(template, minijinja::Value::from_serialize(args))
            .map_err(|e| ToolError::execution(format!("mock template error: {e}")));
    }

    match &descriptor.mock_result {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Ok(other.to_string()),
        None => Err(ToolError::execution(
            "mock tool has neither mock_result nor mock_template",
        )),
    }
}

async fn execute_live(
    descriptor: &ToolDescriptor,
    client: reqwest::Client,
    args: &Value,
) -> Result<String, ToolError> {
    let http = descriptor
        .http
        .as_ref()
        .ok_or_else(|| ToolError::execution("live tool has no HTTP configuration"))?;

    debug!(
        tool = %descriptor.name,
        url = %http.url,
        args = %redacted_args(args, &http.redact_fields),
        "live tool request",
    );

    let mut request = match http.method.to_uppercase().as_str() {
        "GET" => client.get(&http.url),
        "PUT" => client.put(&http.url).json(args),
        "DELETE" => client.delete(&http.url),
        _ => client.post(&http.url).json(args),
    };
    for (name, value) in &http.headers {
        request = request.header(name, expand_env(value));
    }

    let response = request
        .send()
        .await
        .map_err(|e| ToolError::execution(format!("request failed: {e}")))?;

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if status.is_success() {
        Ok(body)
    } else {
        Err(ToolError::execution(format!("HTTP {status}: {body}")))
    }
}

/// Expand `${VAR}` references from the process environment.
fn expand_env(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        match tail.find('}') {
            Some(end) => {
                let name = &tail[..end];
                out.push_str(&std::env::var(name).unwrap_or_default());
                rest = &tail[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn redacted_args(args: &Value, redact_fields: &[String]) -> String {
    if redact_fields.is_empty() {
        return args.to_string();
    }
    let mut clone = args.clone();
    if let Value::Object(map) = &mut clone {
        for field in redact_fields {
            if map.contains_key(field) {
                map.insert(field.clone(), Value::String("***".to_string()));
            }
        }
    }
    clone.to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dispatcher(descriptors: Vec<ToolDescriptor>) -> ToolDispatcher {
        let mut registry = ToolRegistry::new();
        for d in descriptors {
            registry.register(d);
        }
        ToolDispatcher::new(Arc::new(registry))
    }

    mod registry {
        use super::*;

        #[test]
        fn definitions_for_preserves_whitelist_order() {
            let mut registry = ToolRegistry::new();
            registry.register(ToolDescriptor::mock("b", "", json!({}), json!("x")));
            registry.register(ToolDescriptor::mock("a", "", json!({}), json!("y")));

            let defs =
                registry.definitions_for(&["b".to_string(), "a".to_string(), "ghost".to_string()]);
            let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
            assert_eq!(names, vec!["b", "a"]);
        }

        #[test]
        fn from_type_derives_schema() {
            #[derive(schemars::JsonSchema)]
            #[allow(dead_code)]
            struct WeatherArgs {
                location: String,
            }

            let def = ToolDefinition::from_type::<WeatherArgs>("get_weather", "weather");
            assert!(def.parameters["properties"]["location"].is_object());
            assert!(def.parameters.get("$schema").is_none());
        }
    }

    mod mock_execution {
        use super::*;

        #[tokio::test]
        async fn static_mock_result_string_is_raw() {
            let d = dispatcher(vec![ToolDescriptor::mock(
                "get_weather",
                "",
                json!({}),
                json!("22C and sunny"),
            )]);
            let call = ToolCall::new("c1", "get_weather", r#"{"location":"Paris"}"#);
            let out = d.dispatch(&call, &CancellationToken::new()).await.unwrap();
            assert_eq!(out, ToolOutput::ok("22C and sunny"));
        }

        #[tokio::test]
        async fn structured_mock_result_serializes() {
            let d = dispatcher(vec![ToolDescriptor::mock(
                "lookup",
                "",
                json!({}),
                json!({"temp": 22}),
            )]);
            let call = ToolCall::new("c1", "lookup", "{}");
            let out = d.dispatch(&call, &CancellationToken::new()).await.unwrap();
            assert_eq!(out.content, r#"{"temp":22}"#);
            assert!(!out.is_error);
        }

        #[tokio::test]
        async fn mock_template_renders_call_args() {
            let d = dispatcher(vec![ToolDescriptor::mock_template(
                "get_weather",
                "",
                json!({}),
                "Weather in {{ location }}: sunny",
            )]);
            let call = ToolCall::new("c1", "get_weather", r#"{"location":"Paris"}"#);
            let out = d.dispatch(&call, &CancellationToken::new()).await.unwrap();
            assert_eq!(out.content, "Weather in Paris: sunny");
        }
    }

    mod failure_isolation {
        use super::*;

        #[tokio::test]
        async fn unknown_tool_is_not_found() {
            let d = dispatcher(vec![]);
            let call = ToolCall::new("c1", "ghost", "{}");
            let err = d.dispatch(&call, &CancellationToken::new()).await.unwrap_err();
            assert!(matches!(err, ToolError::NotFound { .. }));
        }

        #[tokio::test]
        async fn timeout_bounds_slow_tools() {
            // An MCP-mode tool with no registry attached would error fast;
            // use a live tool pointed at a non-routable address instead and
            // give it a 50ms budget.
            let slow = ToolDescriptor::live(
                "slow",
                "",
                json!({}),
                HttpToolConfig {
                    url: "http://10.255.255.1:9".to_string(),
                    ..HttpToolConfig::default()
                },
            )
            .with_timeout_ms(50);
            let d = dispatcher(vec![slow]);

            let call = ToolCall::new("c1", "slow", "{}");
            let err = d.dispatch(&call, &CancellationToken::new()).await.unwrap_err();
            assert!(
                matches!(err, ToolError::Timeout { .. } | ToolError::Execution(_)),
                "expected timeout or connect failure, got {err}"
            );
        }

        #[tokio::test]
        async fn cancellation_aborts_dispatch() {
            let slow = ToolDescriptor::live(
                "slow",
                "",
                json!({}),
                HttpToolConfig {
                    url: "http://10.255.255.1:9".to_string(),
                    ..HttpToolConfig::default()
                },
            );
            let d = dispatcher(vec![slow]);

            let cancel = CancellationToken::new();
            cancel.cancel();
            let call = ToolCall::new("c1", "slow", "{}");
            let err = d.dispatch(&call, &cancel).await.unwrap_err();
            assert!(matches!(err, ToolError::Execution(_)));
        }
    }

    #[allow(unsafe_code)]
    mod env_expansion {
        use super::*;

        #[test]
        fn expands_known_variables() {
            // Safety: test-only env mutation, name is unique to this test.
            unsafe { std::env::set_var("ARENA_TEST_TOKEN", "secret123") };
            assert_eq!(expand_env("Bearer ${ARENA_TEST_TOKEN}"), "Bearer secret123");
        }

        #[test]
        fn unknown_variables_expand_empty() {
            assert_eq!(expand_env("x-${ARENA_TEST_MISSING_VAR}"), "x-");
        }

        #[test]
        fn unterminated_reference_is_literal() {
            assert_eq!(expand_env("abc${oops"), "abc${oops");
        }
    }

    #[test]
    fn redaction_masks_configured_fields() {
        let args = json!({"location": "Paris", "api_key": "sk-123"});
        let out = redacted_args(&args, &["api_key".to_string()]);
        assert!(out.contains("***"));
        assert!(!out.contains("sk-123"));
        assert!(out.contains("Paris"));
    }
}
