//! Built-in response validators.

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value, json};

use crate::error::{Error, Result};

use super::{ValidationResult, Validator};

/// Fails when the response contains any banned word (case-insensitive).
#[derive(Debug, Clone)]
pub struct BannedWordsValidator {
    words: Vec<String>,
}

impl BannedWordsValidator {
    /// Create a validator over the given word list.
    #[must_use]
    pub fn new(words: Vec<String>) -> Self {
        Self {
            words: words.into_iter().map(|w| w.to_lowercase()).collect(),
        }
    }
}

#[async_trait]
impl Validator for BannedWordsValidator {
    fn label(&self) -> &str {
        "validators.BannedWordsValidator"
    }

    async fn validate(&self, text: &str, _meta: &Map<String, Value>) -> ValidationResult {
        let lowered = text.to_lowercase();
        for word in &self.words {
            if lowered.contains(word.as_str()) {
                return ValidationResult::fail(self.label(), json!({ "banned_word": word }));
            }
        }
        ValidationResult::pass(self.label())
    }
}

/// Fails when the response exceeds any configured length bound.
///
/// Token counts are approximated as `chars / 4`; the bound is a budget
/// guard, not an exact tokenizer.
#[derive(Debug, Clone, Copy)]
pub struct MaxLengthValidator {
    max_chars: Option<usize>,
    max_tokens: Option<usize>,
    max_sentences: Option<usize>,
}

impl MaxLengthValidator {
    /// Create a validator with the given bounds. `None` disables a bound.
    #[must_use]
    pub const fn new(
        max_chars: Option<usize>,
        max_tokens: Option<usize>,
        max_sentences: Option<usize>,
    ) -> Self {
        Self {
            max_chars,
            max_tokens,
            max_sentences,
        }
    }
}

fn sentence_count(text: &str) -> usize {
    text.split(['.', '!', '?'])
        .filter(|s| !s.trim().is_empty())
        .count()
}

#[async_trait]
impl Validator for MaxLengthValidator {
    fn label(&self) -> &str {
        "validators.MaxLengthValidator"
    }

    async fn validate(&self, text: &str, _meta: &Map<String, Value>) -> ValidationResult {
        let chars = text.chars().count();
        let tokens = chars / 4;
        let sentences = sentence_count(text);

        let mut violations = Vec::new();
        if let Some(max) = self.max_chars
            && chars > max
        {
            violations.push(json!({"bound": "chars", "max": max, "actual": chars}));
        }
        if let Some(max) = self.max_tokens
            && tokens > max
        {
            violations.push(json!({"bound": "tokens", "max": max, "actual": tokens}));
        }
        if let Some(max) = self.max_sentences
            && sentences > max
        {
            violations.push(json!({"bound": "sentences", "max": max, "actual": sentences}));
        }

        if violations.is_empty() {
            ValidationResult::pass(self.label())
        } else {
            ValidationResult::fail(self.label(), json!({ "violations": violations }))
        }
    }
}

/// Fails when the response is not a single valid JSON document.
#[derive(Debug, Clone, Copy)]
pub struct JsonValidator;

#[async_trait]
impl Validator for JsonValidator {
    fn label(&self) -> &str {
        "validators.JsonValidator"
    }

    async fn validate(&self, text: &str, _meta: &Map<String, Value>) -> ValidationResult {
        match serde_json::from_str::<Value>(text) {
            Ok(_) => ValidationResult::pass(self.label()),
            Err(err) => ValidationResult::fail(self.label(), json!({ "error": err.to_string() })),
        }
    }
}

/// Fails when the response does not satisfy a JSON Schema.
pub struct JsonSchemaValidator {
    compiled: jsonschema::Validator,
}

impl std::fmt::Debug for JsonSchemaValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonSchemaValidator").finish_non_exhaustive()
    }
}

impl JsonSchemaValidator {
    /// Compile the schema. Returns a configuration error for invalid
    /// schemas.
    pub fn new(schema: Value) -> Result<Self> {
        let compiled = jsonschema::validator_for(&schema)
            .map_err(|e| Error::config(format!("invalid JSON schema: {e}")))?;
        Ok(Self { compiled })
    }
}

#[async_trait]
impl Validator for JsonSchemaValidator {
    fn label(&self) -> &str {
        "validators.JsonSchemaValidator"
    }

    async fn validate(&self, text: &str, _meta: &Map<String, Value>) -> ValidationResult {
        let instance: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(err) => {
                return ValidationResult::fail(
                    self.label(),
                    json!({ "error": format!("not valid JSON: {err}") }),
                );
            }
        };

        let errors: Vec<String> = self
            .compiled
            .iter_errors(&instance)
            .map(|e| e.to_string())
            .collect();

        if errors.is_empty() {
            ValidationResult::pass(self.label())
        } else {
            ValidationResult::fail(self.label(), json!({ "errors": errors }))
        }
    }
}

/// Checks the response against a regular expression.
///
/// Matching is case-sensitive unless the pattern carries an inline `(?i)`.
#[derive(Debug, Clone)]
pub struct RegexValidator {
    pattern: Regex,
    should_match: bool,
}

impl RegexValidator {
    /// Compile the pattern. `should_match = false` inverts the check.
    pub fn new(pattern: &str, should_match: bool) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| Error::config(format!("invalid validator regex: {e}")))?;
        Ok(Self {
            pattern,
            should_match,
        })
    }
}

#[async_trait]
impl Validator for RegexValidator {
    fn label(&self) -> &str {
        "validators.RegexValidator"
    }

    async fn validate(&self, text: &str, _meta: &Map<String, Value>) -> ValidationResult {
        let matched = self.pattern.is_match(text);
        if matched == self.should_match {
            ValidationResult::pass(self.label())
        } else {
            ValidationResult::fail(
                self.label(),
                json!({
                    "pattern": self.pattern.as_str(),
                    "matched": matched,
                    "should_match": self.should_match,
                }),
            )
        }
    }
}

/// Fails when the response does not look like the expected language.
///
/// Detection is a stopword-frequency heuristic over a handful of common
/// languages; none of the example corpora carry a language-detection
/// crate, and assertion-grade detection does not need one.
#[derive(Debug, Clone)]
pub struct LanguageValidator {
    expected: String,
}

const STOPWORDS: &[(&str, &[&str])] = &[
    (
        "en",
        &["the", "and", "is", "of", "to", "you", "that", "it", "for", "with"],
    ),
    (
        "es",
        &["el", "la", "de", "que", "y", "los", "es", "una", "para", "con"],
    ),
    (
        "fr",
        &["le", "la", "de", "et", "les", "des", "est", "vous", "pour", "une"],
    ),
    (
        "de",
        &["der", "die", "und", "das", "ist", "nicht", "mit", "ein", "für", "sie"],
    ),
];

fn detect_language(text: &str) -> Option<&'static str> {
    let words: Vec<String> = text
        .split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphabetic())
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect();
    if words.is_empty() {
        return None;
    }

    let mut best: Option<(&'static str, usize)> = None;
    for (lang, stopwords) in STOPWORDS {
        let hits = words
            .iter()
            .filter(|w| stopwords.contains(&w.as_str()))
            .count();
        if hits > 0 && best.is_none_or(|(_, b)| hits > b) {
            best = Some((lang, hits));
        }
    }
    best.map(|(lang, _)| lang)
}

impl LanguageValidator {
    /// Expect responses in the given ISO 639-1 language.
    #[must_use]
    pub fn new(expected: impl Into<String>) -> Self {
        Self {
            expected: expected.into().to_lowercase(),
        }
    }
}

#[async_trait]
impl Validator for LanguageValidator {
    fn label(&self) -> &str {
        "validators.LanguageValidator"
    }

    async fn validate(&self, text: &str, _meta: &Map<String, Value>) -> ValidationResult {
        match detect_language(text) {
            Some(detected) if detected == self.expected => ValidationResult::pass(self.label()),
            detected => ValidationResult::fail(
                self.label(),
                json!({
                    "expected": self.expected,
                    "detected": detected,
                }),
            ),
        }
    }
}
