//! Run results, result sinks, and the fail-on policy.

use std::collections::BTreeSet;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::assertions::AssertionOutcome;
use crate::cost::CostInfo;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::selfplay::SelfPlayResult;

/// Classified failure of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunErrorKind {
    /// Provider failed permanently or exhausted retries.
    Provider,
    /// The turn or a tool call timed out.
    Timeout,
    /// The tool loop exceeded its round budget.
    ToolLoop,
    /// The run was cancelled.
    Cancelled,
    /// Anything else.
    Other,
}

impl RunErrorKind {
    /// Classify an engine error.
    #[must_use]
    pub const fn from_error(err: &Error) -> Self {
        match err {
            Error::Provider(_) => Self::Provider,
            Error::Timeout(_) => Self::Timeout,
            Error::ToolLoopExceeded { .. } => Self::ToolLoop,
            Error::Cancelled => Self::Cancelled,
            _ => Self::Other,
        }
    }
}

/// The outcome of one planned run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// Unique run id.
    pub run_id: Uuid,
    /// Provider the run used.
    pub provider_id: String,
    /// Scenario the run executed.
    pub scenario_id: String,
    /// Region of the run.
    pub region: String,
    /// Final conversation transcript.
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Final conversation metadata (turn counters, cost totals).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Accumulated cost.
    #[serde(default)]
    pub cost: CostInfo,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Error message, when the run failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Classified failure kind, when the run failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<RunErrorKind>,
    /// Turn- and conversation-level assertion outcomes.
    #[serde(default)]
    pub assertion_results: Vec<AssertionOutcome>,
    /// Self-play outcome, for self-play scenarios.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_play: Option<SelfPlayResult>,
}

impl RunResult {
    /// Whether the run completed without error and every assertion held.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.error.is_none() && self.assertion_results.iter().all(|a| a.passed)
    }

    /// Number of failed assertions.
    #[must_use]
    pub fn failed_assertions(&self) -> usize {
        self.assertion_results.iter().filter(|a| !a.passed).count()
    }

    /// Whether any message carries a failed validation.
    #[must_use]
    pub fn has_validation_failures(&self) -> bool {
        self.messages
            .iter()
            .any(|m| m.validations.iter().any(|v| !v.passed))
    }
}

/// Destination for run results.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Persist one run result.
    async fn write(&self, result: RunResult) -> Result<()>;
}

/// Shared handle to a result sink.
pub type SharedResultSink = std::sync::Arc<dyn ResultSink>;

/// Collects results in memory, for tests and programmatic consumers.
#[derive(Debug, Default)]
pub struct MemorySink {
    results: Mutex<Vec<RunResult>>,
}

impl MemorySink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All results written so far.
    #[must_use]
    pub fn results(&self) -> Vec<RunResult> {
        self.results.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn write(&self, result: RunResult) -> Result<()> {
        self.results
            .lock()
            .map_err(|_| Error::internal("memory sink poisoned"))?
            .push(result);
        Ok(())
    }
}

/// Appends one JSON document per run to a file.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl JsonlSink {
    /// Create or truncate the output file.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = std::fs::File::create(&path)
            .map_err(|e| Error::internal(format!("cannot create {}: {e}", path.display())))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// The output path.
    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl ResultSink for JsonlSink {
    async fn write(&self, result: RunResult) -> Result<()> {
        let line = serde_json::to_string(&result)?;
        let mut file = self
            .file
            .lock()
            .map_err(|_| Error::internal("jsonl sink poisoned"))?;
        writeln!(file, "{line}").map_err(|e| Error::internal(format!("write failed: {e}")))?;
        Ok(())
    }
}

/// Result categories that fail the whole execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailCategory {
    /// Any failed assertion.
    AssertionFailure,
    /// Any unrecovered provider or tool error.
    ProviderError,
    /// Any timeout.
    Timeout,
    /// Any failed validator.
    ValidationError,
}

/// The configured fail-on policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailOn {
    categories: BTreeSet<FailCategory>,
}

impl Default for FailOn {
    /// Assertions, provider errors, and timeouts fail the execution;
    /// validation failures are advisory unless opted in.
    fn default() -> Self {
        Self {
            categories: BTreeSet::from([
                FailCategory::AssertionFailure,
                FailCategory::ProviderError,
                FailCategory::Timeout,
            ]),
        }
    }
}

impl FailOn {
    /// A policy that fails on nothing.
    #[must_use]
    pub fn none() -> Self {
        Self {
            categories: BTreeSet::new(),
        }
    }

    /// Add a category.
    #[must_use]
    pub fn with(mut self, category: FailCategory) -> Self {
        self.categories.insert(category);
        self
    }

    /// Whether the policy includes a category.
    #[must_use]
    pub fn includes(&self, category: FailCategory) -> bool {
        self.categories.contains(&category)
    }

    /// Parse from config strings (`assertion_failure`, `provider_error`,
    /// `timeout`, `validation_error`); unknown names are ignored.
    #[must_use]
    pub fn from_names(names: &[String]) -> Self {
        let mut categories = BTreeSet::new();
        for name in names {
            match name.as_str() {
                "assertion_failure" | "assertion" => {
                    categories.insert(FailCategory::AssertionFailure);
                }
                "provider_error" | "provider" => {
                    categories.insert(FailCategory::ProviderError);
                }
                "timeout" => {
                    categories.insert(FailCategory::Timeout);
                }
                "validation_error" | "validation" => {
                    categories.insert(FailCategory::ValidationError);
                }
                _ => {}
            }
        }
        Self { categories }
    }
}

/// Map an execution's results to the process exit code.
///
/// `0` success; `2` assertion failures; `3` provider/tool errors; `4`
/// timeouts; `5` fatal validation failures. Configuration errors map to
/// `1` before any run starts and are the caller's concern. When several
/// categories apply, the most infrastructural one wins: provider errors,
/// then timeouts, then validation, then assertions.
#[must_use]
pub fn exit_code(results: &[RunResult], fail_on: &FailOn) -> i32 {
    let provider_failed = results.iter().any(|r| {
        matches!(
            r.error_kind,
            Some(RunErrorKind::Provider | RunErrorKind::ToolLoop | RunErrorKind::Other)
        )
    });
    if provider_failed && fail_on.includes(FailCategory::ProviderError) {
        return 3;
    }

    let timed_out = results
        .iter()
        .any(|r| matches!(r.error_kind, Some(RunErrorKind::Timeout)));
    if timed_out && fail_on.includes(FailCategory::Timeout) {
        return 4;
    }

    let validation_failed = results.iter().any(RunResult::has_validation_failures);
    if validation_failed && fail_on.includes(FailCategory::ValidationError) {
        return 5;
    }

    let assertion_failed = results.iter().any(|r| r.failed_assertions() > 0);
    if assertion_failed && fail_on.includes(FailCategory::AssertionFailure) {
        return 2;
    }

    0
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::validators::ValidationResult;
    use serde_json::json;

    fn result() -> RunResult {
        RunResult {
            run_id: Uuid::new_v4(),
            provider_id: "mock".into(),
            scenario_id: "s".into(),
            region: "us-east".into(),
            messages: Vec::new(),
            metadata: serde_json::Map::new(),
            cost: CostInfo::default(),
            duration_ms: 10,
            error: None,
            error_kind: None,
            assertion_results: Vec::new(),
            self_play: None,
        }
    }

    fn failed_assertion() -> AssertionOutcome {
        AssertionOutcome {
            kind: "content_includes".into(),
            passed: false,
            message: "missing".into(),
            details: serde_json::Value::Null,
        }
    }

    #[test]
    fn passed_requires_no_error_and_green_assertions() {
        let mut r = result();
        assert!(r.passed());
        r.assertion_results.push(failed_assertion());
        assert!(!r.passed());
        assert_eq!(r.failed_assertions(), 1);
    }

    #[test]
    fn exit_code_success() {
        assert_eq!(exit_code(&[result()], &FailOn::default()), 0);
    }

    #[test]
    fn exit_code_assertion_failure_is_2() {
        let mut r = result();
        r.assertion_results.push(failed_assertion());
        assert_eq!(exit_code(&[r], &FailOn::default()), 2);
    }

    #[test]
    fn exit_code_provider_error_is_3() {
        let mut r = result();
        r.error = Some("boom".into());
        r.error_kind = Some(RunErrorKind::Provider);
        assert_eq!(exit_code(&[r], &FailOn::default()), 3);
    }

    #[test]
    fn exit_code_timeout_is_4() {
        let mut r = result();
        r.error = Some("timeout".into());
        r.error_kind = Some(RunErrorKind::Timeout);
        assert_eq!(exit_code(&[r], &FailOn::default()), 4);
    }

    #[test]
    fn validation_failures_are_advisory_by_default() {
        let mut r = result();
        let mut msg = Message::assistant("We guarantee delivery");
        msg.attach_validation(ValidationResult::fail(
            "validators.BannedWordsValidator",
            json!({"banned_word": "guarantee"}),
        ));
        r.messages.push(msg);

        assert_eq!(exit_code(std::slice::from_ref(&r), &FailOn::default()), 0);
        let strict = FailOn::default().with(FailCategory::ValidationError);
        assert_eq!(exit_code(&[r], &strict), 5);
    }

    #[test]
    fn provider_error_outranks_assertions() {
        let mut r = result();
        r.error = Some("boom".into());
        r.error_kind = Some(RunErrorKind::Provider);
        r.assertion_results.push(failed_assertion());
        assert_eq!(exit_code(&[r], &FailOn::default()), 3);
    }

    #[test]
    fn fail_on_from_names_ignores_unknown() {
        let policy = FailOn::from_names(&[
            "assertion_failure".to_string(),
            "validation_error".to_string(),
            "bogus".to_string(),
        ]);
        assert!(policy.includes(FailCategory::AssertionFailure));
        assert!(policy.includes(FailCategory::ValidationError));
        assert!(!policy.includes(FailCategory::ProviderError));
    }

    #[tokio::test]
    async fn memory_sink_collects_results() {
        let sink = MemorySink::new();
        sink.write(result()).await.unwrap();
        sink.write(result()).await.unwrap();
        assert_eq!(sink.results().len(), 2);
    }

    #[tokio::test]
    async fn jsonl_sink_writes_one_line_per_result() {
        let dir = std::env::temp_dir().join(format!("arena-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("results.jsonl");

        let sink = JsonlSink::create(&path).unwrap();
        sink.write(result()).await.unwrap();
        sink.write(result()).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: RunResult = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.provider_id, "mock");

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
