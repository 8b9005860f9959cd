//! Response validators (guardrails).
//!
//! Validators are declared on a prompt pack and scored against the final
//! assistant text of a turn. A failing validator never aborts the turn by
//! itself; it attaches a [`ValidationResult`] to the terminal assistant
//! message, and the run-level `fail_on` policy decides whether a failure
//! is fatal to the scenario.

mod builtin;
mod judge;

pub use builtin::{
    BannedWordsValidator, JsonSchemaValidator, JsonValidator, LanguageValidator,
    MaxLengthValidator, RegexValidator,
};
pub use judge::LlmJudgeValidator;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::registry::JudgeRegistry;

/// Outcome of one validator against one response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Label of the validator that produced this result, e.g.
    /// `validators.BannedWordsValidator`.
    pub validator_type: String,

    /// Whether the response passed the check.
    pub passed: bool,

    /// Structured details: what matched, what was missing, scores.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

impl ValidationResult {
    /// A passing result with no details.
    #[must_use]
    pub fn pass(validator_type: impl Into<String>) -> Self {
        Self {
            validator_type: validator_type.into(),
            passed: true,
            details: Value::Null,
        }
    }

    /// A failing result with details.
    #[must_use]
    pub fn fail(validator_type: impl Into<String>, details: Value) -> Self {
        Self {
            validator_type: validator_type.into(),
            passed: false,
            details,
        }
    }
}

/// A response validator.
///
/// Validation is a pure function of the response text and contextual
/// metadata, so re-running validators over a replayed transcript yields
/// the same results. The judge validator is the exception in latency, not
/// semantics: it consults a judge provider but still only reads the text.
#[async_trait]
pub trait Validator: Send + Sync {
    /// The label recorded as `validator_type` on results.
    fn label(&self) -> &str;

    /// Score the response text.
    async fn validate(&self, text: &str, meta: &Map<String, Value>) -> ValidationResult;
}

/// Shared handle to a validator.
pub type SharedValidator = std::sync::Arc<dyn Validator>;

/// Declarative validator configuration, as carried by a prompt pack.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValidatorSpec {
    /// Fail when the response contains any of the listed words.
    BannedWords {
        /// Words checked case-insensitively.
        words: Vec<String>,
    },
    /// Fail when the response exceeds any configured bound.
    MaxLength {
        /// Maximum characters.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_chars: Option<usize>,
        /// Maximum approximate tokens.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_tokens: Option<usize>,
        /// Maximum sentences.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_sentences: Option<usize>,
    },
    /// Fail when the response is not valid JSON.
    JsonValid,
    /// Fail when the response does not match the JSON Schema.
    JsonSchema {
        /// The schema to validate against.
        schema: Value,
    },
    /// Check the response against a regex.
    Regex {
        /// Pattern, case-sensitive unless it carries an inline `(?i)`.
        pattern: String,
        /// Whether a match is required (`true`) or forbidden (`false`).
        #[serde(default = "default_true")]
        should_match: bool,
    },
    /// Fail when the detected language differs from the expected one.
    Language {
        /// ISO 639-1 code, e.g. `en`.
        expected: String,
    },
    /// Ask a judge provider to score the response against criteria.
    LlmJudge {
        /// Judge id in the judge registry.
        judge: String,
        /// Criteria the judge scores against.
        criteria: String,
    },
}

const fn default_true() -> bool {
    true
}

impl ValidatorSpec {
    /// Build the runtime validator for this spec.
    ///
    /// `judges` is consulted only by the `llm_judge` kind; passing an
    /// empty registry is fine for packs that do not use judges.
    pub fn build(&self, judges: &JudgeRegistry) -> Result<SharedValidator> {
        match self {
            Self::BannedWords { words } => {
                Ok(std::sync::Arc::new(BannedWordsValidator::new(words.clone())))
            }
            Self::MaxLength {
                max_chars,
                max_tokens,
                max_sentences,
            } => Ok(std::sync::Arc::new(MaxLengthValidator::new(
                *max_chars,
                *max_tokens,
                *max_sentences,
            ))),
            Self::JsonValid => Ok(std::sync::Arc::new(JsonValidator)),
            Self::JsonSchema { schema } => Ok(std::sync::Arc::new(JsonSchemaValidator::new(
                schema.clone(),
            )?)),
            Self::Regex {
                pattern,
                should_match,
            } => Ok(std::sync::Arc::new(RegexValidator::new(
                pattern,
                *should_match,
            )?)),
            Self::Language { expected } => Ok(std::sync::Arc::new(LanguageValidator::new(
                expected.clone(),
            ))),
            Self::LlmJudge { judge, criteria } => {
                let provider = judges.get(judge).ok_or_else(|| {
                    Error::config(format!("unknown judge provider '{judge}'"))
                })?;
                Ok(std::sync::Arc::new(LlmJudgeValidator::new(
                    provider,
                    criteria.clone(),
                )))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn spec_deserializes_from_tagged_yaml() {
        let yaml = r"
type: banned_words
words: [guarantee, refund]
";
        let spec: ValidatorSpec = serde_yaml::from_str(yaml).unwrap();
        match spec {
            ValidatorSpec::BannedWords { words } => assert_eq!(words.len(), 2),
            other => panic!("unexpected spec: {other:?}"),
        }
    }

    #[test]
    fn regex_spec_defaults_to_should_match() {
        let yaml = "
type: regex
pattern: 'order #[0-9]+'
";
        let spec: ValidatorSpec = serde_yaml::from_str(yaml).unwrap();
        match spec {
            ValidatorSpec::Regex { should_match, .. } => assert!(should_match),
            other => panic!("unexpected spec: {other:?}"),
        }
    }

    #[test]
    fn build_fails_for_unknown_judge() {
        let spec = ValidatorSpec::LlmJudge {
            judge: "missing".into(),
            criteria: "is polite".into(),
        };
        let judges = JudgeRegistry::default();
        assert!(spec.build(&judges).is_err());
    }
}
