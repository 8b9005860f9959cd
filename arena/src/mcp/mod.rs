//! MCP (Model Context Protocol) server registry.
//!
//! Each configured server is a subprocess speaking JSON-RPC over stdio.
//! Connections are lazy: the first call to a server spawns it, performs
//! the `initialize` handshake, and caches the `tools/list` result.
//! Subprocesses live for the registry's lifetime; stdout carries JSON-RPC
//! and stderr is diagnostics. Requests to one server are serialized (one
//! in flight per server) and bounded by a client-side timeout.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use rmcp::{
    ServiceExt,
    model::{CallToolRequestParams, ClientCapabilities, Implementation, InitializeRequestParams},
    service::ServerSink,
    transport::child_process::TokioChildProcess,
};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::McpError;

/// Default client-side request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for one MCP server subprocess.
#[derive(Debug, Clone)]
pub struct McpServerConfig {
    /// Registry name of the server.
    pub name: String,
    /// Command to execute.
    pub command: String,
    /// Command arguments.
    pub args: Vec<String>,
    /// Extra environment variables for the subprocess.
    pub env: BTreeMap<String, String>,
    /// Client-side timeout per request.
    pub request_timeout: Duration,
}

impl McpServerConfig {
    /// Create a server config with the default request timeout.
    #[must_use]
    pub fn new(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args,
            env: BTreeMap::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Add an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Override the request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// A discovered MCP tool.
#[derive(Debug, Clone)]
pub struct McpToolInfo {
    /// Tool name as advertised by the server.
    pub name: String,
    /// Tool description.
    pub description: String,
    /// JSON Schema of the tool's input.
    pub input_schema: Value,
}

impl McpToolInfo {
    /// Build a registrable descriptor routing calls back to `server`.
    #[must_use]
    pub fn into_descriptor(self, server: &str) -> crate::tools::ToolDescriptor {
        crate::tools::ToolDescriptor::mcp(self.name, self.description, self.input_schema, server)
    }
}

struct Connection {
    sink: ServerSink,
    tools: Vec<McpToolInfo>,
    /// Serializes requests: one in flight per server.
    request_lock: Mutex<()>,
    service_handle: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.service_handle.abort();
    }
}

/// Registry of MCP servers with lazily-spawned connections.
pub struct McpRegistry {
    configs: HashMap<String, McpServerConfig>,
    live: Mutex<HashMap<String, Arc<Connection>>>,
}

impl std::fmt::Debug for McpRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpRegistry")
            .field("servers", &self.configs.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Default for McpRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl McpRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            configs: HashMap::new(),
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Register a server configuration.
    pub fn register(&mut self, config: McpServerConfig) {
        self.configs.insert(config.name.clone(), config);
    }

    /// Names of all configured servers.
    #[must_use]
    pub fn server_names(&self) -> Vec<&str> {
        self.configs.keys().map(String::as_str).collect()
    }

    /// The configured request timeout for a server, when registered.
    #[must_use]
    pub fn request_timeout(&self, server: &str) -> Option<Duration> {
        self.configs.get(server).map(|c| c.request_timeout)
    }

    async fn connection(&self, server: &str) -> Result<Arc<Connection>, McpError> {
        let mut live = self.live.lock().await;
        if let Some(conn) = live.get(server) {
            return Ok(conn.clone());
        }

        let config = self
            .configs
            .get(server)
            .ok_or_else(|| McpError::UnknownServer {
                name: server.to_string(),
            })?;

        info!(server = %config.name, command = %config.command, "spawning MCP server");

        let mut cmd = tokio::process::Command::new(&config.command);
        cmd.args(&config.args);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let transport = TokioChildProcess::new(cmd).map_err(|e| McpError::Spawn {
            command: config.command.clone(),
            message: e.to_string(),
        })?;

        let client_info = InitializeRequestParams {
            meta: None,
            protocol_version: Default::default(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: "arena".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
        };

        let service = client_info
            .serve(transport)
            .await
            .map_err(|e| McpError::Spawn {
                command: config.command.clone(),
                message: e.to_string(),
            })?;

        let sink = service.peer().clone();
        let tools = service
            .peer()
            .list_tools(Default::default())
            .await
            .map_err(|e| McpError::ListTools(e.to_string()))?
            .tools
            .into_iter()
            .map(|t| McpToolInfo {
                name: t.name.to_string(),
                description: t
                    .description
                    .as_deref()
                    .unwrap_or_default()
                    .to_string(),
                input_schema: serde_json::to_value(t.input_schema.as_ref())
                    .unwrap_or(Value::Null),
            })
            .collect::<Vec<_>>();

        debug!(server = %config.name, tools = tools.len(), "MCP server ready");

        // Keep the service alive in the background for the registry's
        // lifetime.
        let service_handle = tokio::spawn(async move {
            let _ = service.waiting().await;
        });

        let conn = Arc::new(Connection {
            sink,
            tools,
            request_lock: Mutex::new(()),
            service_handle,
        });
        live.insert(server.to_string(), conn.clone());
        Ok(conn)
    }

    /// The tools advertised by a server, connecting on first use.
    pub async fn list_tools(&self, server: &str) -> Result<Vec<McpToolInfo>, McpError> {
        Ok(self.connection(server).await?.tools.clone())
    }

    /// Invoke `tools/call` on a server.
    ///
    /// Returns the concatenated text content and whether the server
    /// flagged the result as an error.
    pub async fn call(
        &self,
        server: &str,
        tool: &str,
        args: Value,
    ) -> Result<(String, bool), McpError> {
        let timeout = self
            .request_timeout(server)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        let conn = self.connection(server).await?;

        let arguments = match args {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => {
                return Err(McpError::Call {
                    tool: tool.to_string(),
                    message: format!("arguments must be an object, got {other}"),
                });
            }
        };

        let params = CallToolRequestParams {
            meta: None,
            name: tool.to_string().into(),
            arguments,
            task: None,
        };

        // One request in flight per server.
        let _guard = conn.request_lock.lock().await;
        let result = tokio::time::timeout(timeout, conn.sink.call_tool(params))
            .await
            .map_err(|_| McpError::Timeout {
                server: server.to_string(),
                timeout,
            })?
            .map_err(|e| McpError::Call {
                tool: tool.to_string(),
                message: e.to_string(),
            })?;

        let text = result
            .content
            .iter()
            .filter_map(|c| c.as_text().map(|t| t.text.clone()))
            .collect::<Vec<_>>()
            .join("\n");
        let is_error = result.is_error.unwrap_or(false);

        debug!(server, tool, is_error, bytes = text.len(), "tools/call completed");
        Ok((text, is_error))
    }

    /// Drop all live connections, terminating their subprocesses.
    pub async fn shutdown(&self) {
        self.live.lock().await.clear();
    }
}
