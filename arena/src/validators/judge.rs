//! LLM-as-judge validator.

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::warn;

use crate::message::Message;
use crate::provider::{ProviderRequest, SharedProvider};

use super::{ValidationResult, Validator};

const JUDGE_SYSTEM_PROMPT: &str = "You are a strict evaluator. Judge whether the \
response satisfies the criteria. Answer with a single word on the first line: \
PASS or FAIL. Optionally add a short reason on the next line.";

/// Scores a response with a separate judge provider against declared
/// criteria.
pub struct LlmJudgeValidator {
    judge: SharedProvider,
    criteria: String,
}

impl std::fmt::Debug for LlmJudgeValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmJudgeValidator")
            .field("judge", &self.judge.name())
            .field("criteria", &self.criteria)
            .finish()
    }
}

impl LlmJudgeValidator {
    /// Create a judge validator.
    #[must_use]
    pub fn new(judge: SharedProvider, criteria: impl Into<String>) -> Self {
        Self {
            judge,
            criteria: criteria.into(),
        }
    }

    fn judge_prompt(&self, text: &str) -> String {
        format!(
            "Criteria:\n{}\n\nResponse to judge:\n{}\n\nDoes the response satisfy the criteria?",
            self.criteria, text
        )
    }
}

#[async_trait]
impl Validator for LlmJudgeValidator {
    fn label(&self) -> &str {
        "validators.LlmJudgeValidator"
    }

    async fn validate(&self, text: &str, _meta: &Map<String, Value>) -> ValidationResult {
        let request = ProviderRequest::new(self.judge.default_model()).messages(vec![
            Message::system(JUDGE_SYSTEM_PROMPT),
            Message::user(self.judge_prompt(text)),
        ]);

        match self.judge.complete(&request).await {
            Ok(response) => {
                let verdict = response.text();
                let first_line = verdict.lines().next().unwrap_or("").trim().to_uppercase();
                let passed = first_line.starts_with("PASS") || first_line.starts_with("YES");
                ValidationResult {
                    validator_type: self.label().to_string(),
                    passed,
                    details: json!({
                        "judge": self.judge.name(),
                        "criteria": self.criteria,
                        "verdict": verdict,
                    }),
                }
            }
            Err(err) => {
                // A broken judge must not pass bad output silently.
                warn!(judge = %self.judge.name(), error = %err, "judge call failed");
                ValidationResult::fail(
                    self.label(),
                    json!({
                        "judge": self.judge.name(),
                        "error": err.to_string(),
                    }),
                )
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::provider::MockProvider;

    #[tokio::test]
    async fn passes_on_affirmative_verdict() {
        let judge = Arc::new(MockProvider::new("judge").respond_text("PASS\npolite enough"));
        let validator = LlmJudgeValidator::new(judge, "is polite");

        let result = validator.validate("Thank you!", &Map::new()).await;
        assert!(result.passed);
        assert_eq!(result.details["judge"], "judge");
    }

    #[tokio::test]
    async fn fails_on_negative_verdict() {
        let judge = Arc::new(MockProvider::new("judge").respond_text("FAIL\nrude"));
        let validator = LlmJudgeValidator::new(judge, "is polite");

        let result = validator.validate("whatever.", &Map::new()).await;
        assert!(!result.passed);
        assert!(result.details["verdict"].as_str().unwrap().contains("FAIL"));
    }

    #[tokio::test]
    async fn judge_error_fails_closed() {
        let judge = Arc::new(MockProvider::new("judge").respond_permanent_error("no auth"));
        let validator = LlmJudgeValidator::new(judge, "is polite");

        let result = validator.validate("hello", &Map::new()).await;
        assert!(!result.passed);
        assert!(result.details["error"].as_str().is_some());
    }
}
