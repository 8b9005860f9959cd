//! Error types for the arena engine.
//!
//! The taxonomy follows the engine's failure-propagation rules: provider
//! errors bubble up the middleware chain, tool errors are absorbed into the
//! transcript as `is_error` tool results, validation failures attach to
//! messages, and assertion failures are data rather than errors.

use std::time::Duration;

use thiserror::Error;

/// A type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for arena operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or inconsistent configuration. Fatal before planning.
    #[error("configuration error: {0}")]
    Config(String),

    /// The planner produced no combinations for the given filters.
    #[error("plan error: {0}")]
    Plan(String),

    /// A required template variable was not provided.
    #[error("missing template variable '{name}'")]
    VarMissing {
        /// Name of the missing variable.
        name: String,
    },

    /// Template rendering failed.
    #[error("template error: {0}")]
    Template(String),

    /// Error from an LLM provider.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The tool-calling loop exhausted its round budget while the model
    /// kept requesting tools.
    #[error("tool loop exceeded {max_rounds} rounds")]
    ToolLoopExceeded {
        /// The configured round limit.
        max_rounds: usize,
    },

    /// A turn exceeded its time budget. Partial streamed content, if any,
    /// is retained on the execution context.
    #[error("turn timed out after {0:?}")]
    Timeout(Duration),

    /// The run's cancellation handle fired.
    #[error("run was cancelled")]
    Cancelled,

    /// Error from the conversation state store.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Error from an MCP server connection.
    #[error(transparent)]
    Mcp(#[from] McpError),

    /// Error from an A2A remote agent.
    #[error("A2A error: {0}")]
    A2a(String),

    /// A validator failure escalated to fatal by the `fail_on` policy.
    #[error("validation failed: {0}")]
    Validation(String),

    /// JSON serialization or deserialization failure.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// YAML parse failure while loading configuration manifests.
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a plan error.
    #[must_use]
    pub fn plan(message: impl Into<String>) -> Self {
        Self::Plan(message.into())
    }

    /// Create a missing-variable error.
    #[must_use]
    pub fn var_missing(name: impl Into<String>) -> Self {
        Self::VarMissing { name: name.into() }
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl From<minijinja::Error> for Error {
    fn from(err: minijinja::Error) -> Self {
        Self::Template(err.to_string())
    }
}

/// Errors returned by LLM providers.
///
/// Transient errors (rate limits, 5xx) are retried per the configured
/// [`RetryPolicy`](crate::provider::RetryPolicy); permanent errors
/// (authentication, schema mismatch) surface immediately.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Retryable failure: rate limit or server-side error.
    #[error("provider returned {status}: {message}")]
    Transient {
        /// HTTP status code (429 or 5xx).
        status: u16,
        /// Server-provided error message.
        message: String,
    },

    /// Non-retryable failure: authentication, malformed request, or an
    /// unparseable response.
    #[error("provider error: {message}")]
    Permanent {
        /// Description of the failure.
        message: String,
    },

    /// Transport-level HTTP failure.
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl ProviderError {
    /// Create a transient (retryable) error.
    #[must_use]
    pub fn transient(status: u16, message: impl Into<String>) -> Self {
        Self::Transient {
            status,
            message: message.into(),
        }
    }

    /// Create a permanent (non-retryable) error.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    /// Whether the retry policy applies to this error.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient { .. } => true,
            Self::Permanent { .. } => false,
            Self::Http(err) => err.is_timeout() || err.is_connect(),
        }
    }
}

/// Errors from the conversation state store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No conversation exists under the requested id.
    #[error("conversation '{id}' not found")]
    NotFound {
        /// The requested conversation id.
        id: String,
    },

    /// The source conversation of a fork does not exist.
    #[error("fork source '{id}' not found")]
    ForkSourceMissing {
        /// The requested source id.
        id: String,
    },
}

/// Errors from MCP server connections.
#[derive(Debug, Error)]
pub enum McpError {
    /// No server is registered under the given name.
    #[error("unknown MCP server '{name}'")]
    UnknownServer {
        /// The requested server name.
        name: String,
    },

    /// The server subprocess could not be spawned.
    #[error("failed to spawn MCP server '{command}': {message}")]
    Spawn {
        /// The configured command.
        command: String,
        /// The underlying error.
        message: String,
    },

    /// The `tools/list` request failed.
    #[error("tools/list failed: {0}")]
    ListTools(String),

    /// A `tools/call` request failed.
    #[error("tools/call '{tool}' failed: {message}")]
    Call {
        /// The tool being invoked.
        tool: String,
        /// The underlying error.
        message: String,
    },

    /// A request exceeded the client-side timeout.
    #[error("MCP server '{server}' timed out after {timeout:?}")]
    Timeout {
        /// The server name.
        server: String,
        /// The configured request timeout.
        timeout: Duration,
    },
}

/// Errors produced while dispatching a single tool call.
///
/// These never propagate out of the tool loop: it renders them into
/// `is_error` tool-result messages so the model can observe failures.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The tool is not in the pack's `allowed_tools` whitelist.
    #[error("tool '{name}' is not allowed")]
    NotAllowed {
        /// The rejected tool name.
        name: String,
    },

    /// No descriptor is registered under the tool name.
    #[error("tool '{name}' not found")]
    NotFound {
        /// The unknown tool name.
        name: String,
    },

    /// The call arguments did not match the tool's expectations.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// The tool executed and failed.
    #[error("execution failed: {0}")]
    Execution(String),

    /// The call exceeded the tool's `timeout_ms`.
    #[error("tool '{name}' timed out after {timeout:?}")]
    Timeout {
        /// The tool name.
        name: String,
        /// The configured timeout.
        timeout: Duration,
    },

    /// The tool task panicked; isolated to this call.
    #[error("tool '{name}' panicked")]
    Panicked {
        /// The tool name.
        name: String,
    },
}

impl ToolError {
    /// Create an execution error.
    #[must_use]
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }

    /// Create an invalid-arguments error.
    #[must_use]
    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::InvalidArgs(message.into())
    }
}
