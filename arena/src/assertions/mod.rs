//! Assertion engine.
//!
//! Assertions come in two scopes. Turn-level assertions run after the
//! provider stage of a user turn, against the terminal assistant message
//! and that turn's tool-call trace. Conversation-level assertions run
//! once after the scenario completes, against the full transcript and
//! accumulated trace. Assertion failures are recorded outcomes, never
//! engine errors.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::message::{Message, Role, ToolCall};
use crate::validators::ValidationResult;

/// A workflow transition log, supplied by embedders that drive stateful
/// workflows. Workflow assertions read this collaborator; without one
/// they fail with an explanatory message.
pub trait WorkflowTrace: Send + Sync {
    /// The workflow's current state, if any.
    fn current_state(&self) -> Option<String>;

    /// All `(from, to)` transitions taken, in order.
    fn transitions(&self) -> Vec<(String, String)>;

    /// Whether the workflow reached a terminal state.
    fn is_complete(&self) -> bool;
}

/// Matcher for one tool-call argument.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArgMatcher {
    /// Exact value the argument must equal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals: Option<Value>,

    /// Regex the argument's string form must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matches: Option<String>,
}

/// A declared assertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Assertion {
    /// Every pattern is a case-insensitive substring of the assistant
    /// text in scope.
    ContentIncludes {
        /// Required patterns.
        patterns: Vec<String>,
    },
    /// The assistant text matches the regex. Case-sensitive unless the
    /// pattern carries an inline `(?i)`.
    ContentMatches {
        /// The pattern.
        pattern: String,
    },
    /// Every listed tool was called at least once in scope.
    ToolsCalled {
        /// Required tool names.
        tools: Vec<String>,
    },
    /// None of the listed tools was called in scope.
    ToolsNotCalled {
        /// Forbidden tool names.
        tools: Vec<String>,
    },
    /// Some call of `tool` carries arguments satisfying every matcher.
    ToolCallsWithArgs {
        /// The tool name.
        tool: String,
        /// Matchers keyed by argument name.
        args: BTreeMap<String, ArgMatcher>,
    },
    /// A remote agent tool was invoked at least `min_calls` times.
    AgentInvoked {
        /// Agent tool names (e.g. `a2a__research_agent__search_papers`).
        agent_names: Vec<String>,
        /// Minimum total invocations. Defaults to 1.
        #[serde(default = "default_min_calls")]
        min_calls: usize,
    },
    /// No listed agent tool was invoked.
    AgentNotInvoked {
        /// Agent tool names.
        agent_names: Vec<String>,
    },
    /// The agent's tool result contains the pattern
    /// (case-insensitive).
    AgentResponseContains {
        /// The agent tool name.
        agent_name: String,
        /// Required substring.
        pattern: String,
    },
    /// The workflow is currently in the given state.
    StateIs {
        /// Expected state name.
        state: String,
    },
    /// The workflow transitioned into the given state at some point.
    TransitionedTo {
        /// Expected target state.
        state: String,
    },
    /// The workflow reached a terminal state.
    WorkflowComplete,
    /// A validator with the given label did (or did not) fail.
    GuardrailTriggered {
        /// Validator label, e.g. `validators.BannedWordsValidator`.
        validator: String,
        /// Whether a triggered guardrail is expected. Defaults to true.
        #[serde(default = "default_expected")]
        expected: bool,
    },
}

const fn default_min_calls() -> usize {
    1
}

const fn default_expected() -> bool {
    true
}

impl Assertion {
    /// The assertion's kind tag, as used in outcomes.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ContentIncludes { .. } => "content_includes",
            Self::ContentMatches { .. } => "content_matches",
            Self::ToolsCalled { .. } => "tools_called",
            Self::ToolsNotCalled { .. } => "tools_not_called",
            Self::ToolCallsWithArgs { .. } => "tool_calls_with_args",
            Self::AgentInvoked { .. } => "agent_invoked",
            Self::AgentNotInvoked { .. } => "agent_not_invoked",
            Self::AgentResponseContains { .. } => "agent_response_contains",
            Self::StateIs { .. } => "state_is",
            Self::TransitionedTo { .. } => "transitioned_to",
            Self::WorkflowComplete => "workflow_complete",
            Self::GuardrailTriggered { .. } => "guardrail_triggered",
        }
    }
}

/// Result of evaluating one assertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertionOutcome {
    /// The assertion kind tag.
    #[serde(rename = "type")]
    pub kind: String,

    /// Whether the assertion held.
    pub passed: bool,

    /// Human-readable explanation.
    pub message: String,

    /// Structured details (missing patterns, called tools, ...).
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

/// The inputs an assertion is evaluated against.
pub struct AssertionScope<'a> {
    /// Messages in scope: the turn's messages, or the full transcript.
    pub messages: &'a [Message],

    /// Tool calls in scope, in dispatch order.
    pub tool_calls: &'a [ToolCall],

    /// Validation results in scope.
    pub validations: &'a [ValidationResult],

    /// Workflow transition log, when configured.
    pub workflow: Option<&'a dyn WorkflowTrace>,
}

impl std::fmt::Debug for AssertionScope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssertionScope")
            .field("messages", &self.messages.len())
            .field("tool_calls", &self.tool_calls.len())
            .field("validations", &self.validations.len())
            .finish_non_exhaustive()
    }
}

impl AssertionScope<'_> {
    fn assistant_text(&self) -> String {
        self.messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .map(Message::text)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn called_tool_names(&self) -> Vec<String> {
        self.tool_calls.iter().map(|c| c.name.clone()).collect()
    }

    /// Tool result content for calls to `tool_name`.
    fn tool_results_for(&self, tool_name: &str) -> Vec<String> {
        let call_ids: Vec<&str> = self
            .tool_calls
            .iter()
            .filter(|c| c.name == tool_name)
            .map(|c| c.id.as_str())
            .collect();

        self.messages
            .iter()
            .filter(|m| {
                m.role == Role::Tool
                    && m.tool_call_id
                        .as_deref()
                        .is_some_and(|id| call_ids.contains(&id))
            })
            .map(|m| m.content.clone())
            .collect()
    }
}

/// Evaluate all assertions against a scope.
#[must_use]
pub fn evaluate_all(assertions: &[Assertion], scope: &AssertionScope<'_>) -> Vec<AssertionOutcome> {
    assertions.iter().map(|a| evaluate(a, scope)).collect()
}

/// Evaluate one assertion against a scope.
#[must_use]
pub fn evaluate(assertion: &Assertion, scope: &AssertionScope<'_>) -> AssertionOutcome {
    let kind = assertion.kind().to_string();
    match assertion {
        Assertion::ContentIncludes { patterns } => {
            let text = scope.assistant_text().to_lowercase();
            let missing: Vec<&String> = patterns
                .iter()
                .filter(|p| !text.contains(&p.to_lowercase()))
                .collect();
            AssertionOutcome {
                passed: missing.is_empty(),
                message: if missing.is_empty() {
                    "all patterns present".to_string()
                } else {
                    format!("{} pattern(s) missing", missing.len())
                },
                details: json!({ "missing_patterns": missing }),
                kind,
            }
        }

        Assertion::ContentMatches { pattern } => match Regex::new(pattern) {
            Ok(regex) => {
                let text = scope.assistant_text();
                let passed = regex.is_match(&text);
                AssertionOutcome {
                    passed,
                    message: if passed {
                        format!("matched /{pattern}/")
                    } else {
                        format!("no match for /{pattern}/")
                    },
                    details: Value::Null,
                    kind,
                }
            }
            Err(err) => AssertionOutcome {
                passed: false,
                message: format!("invalid pattern: {err}"),
                details: Value::Null,
                kind,
            },
        },

        Assertion::ToolsCalled { tools } => {
            let called = scope.called_tool_names();
            let missing: Vec<&String> = tools.iter().filter(|t| !called.contains(t)).collect();
            AssertionOutcome {
                passed: missing.is_empty(),
                message: if missing.is_empty() {
                    "all expected tools called".to_string()
                } else {
                    format!("{} tool(s) not called", missing.len())
                },
                details: json!({ "missing_tools": missing, "called_tools": called }),
                kind,
            }
        }

        Assertion::ToolsNotCalled { tools } => {
            let called = scope.called_tool_names();
            let offenders: Vec<&String> = tools.iter().filter(|t| called.contains(t)).collect();
            AssertionOutcome {
                passed: offenders.is_empty(),
                message: if offenders.is_empty() {
                    "no forbidden tool called".to_string()
                } else {
                    format!("forbidden tool(s) called: {offenders:?}")
                },
                details: json!({ "forbidden_called": offenders, "called_tools": called }),
                kind,
            }
        }

        Assertion::ToolCallsWithArgs { tool, args } => {
            let candidates: Vec<&ToolCall> = scope
                .tool_calls
                .iter()
                .filter(|c| &c.name == tool)
                .collect();
            let matched = candidates
                .iter()
                .any(|call| args_match(&call.arguments_value(), args));
            AssertionOutcome {
                passed: matched,
                message: if matched {
                    format!("'{tool}' called with matching arguments")
                } else if candidates.is_empty() {
                    format!("'{tool}' was never called")
                } else {
                    format!("'{tool}' called but no call matched the arguments")
                },
                details: json!({
                    "calls": candidates
                        .iter()
                        .map(|c| c.arguments_value())
                        .collect::<Vec<_>>(),
                }),
                kind,
            }
        }

        Assertion::AgentInvoked {
            agent_names,
            min_calls,
        } => {
            let count = scope
                .tool_calls
                .iter()
                .filter(|c| agent_names.contains(&c.name))
                .count();
            AssertionOutcome {
                passed: count >= *min_calls,
                message: format!("agent invoked {count} time(s), expected at least {min_calls}"),
                details: json!({ "invocations": count, "agent_names": agent_names }),
                kind,
            }
        }

        Assertion::AgentNotInvoked { agent_names } => {
            let count = scope
                .tool_calls
                .iter()
                .filter(|c| agent_names.contains(&c.name))
                .count();
            AssertionOutcome {
                passed: count == 0,
                message: format!("agent invoked {count} time(s), expected none"),
                details: json!({ "invocations": count }),
                kind,
            }
        }

        Assertion::AgentResponseContains {
            agent_name,
            pattern,
        } => {
            let results = scope.tool_results_for(agent_name);
            let needle = pattern.to_lowercase();
            let passed = results.iter().any(|r| r.to_lowercase().contains(&needle));
            AssertionOutcome {
                passed,
                message: if passed {
                    format!("'{agent_name}' response contains '{pattern}'")
                } else if results.is_empty() {
                    format!("'{agent_name}' produced no responses")
                } else {
                    format!("'{agent_name}' responses lack '{pattern}'")
                },
                details: json!({ "responses": results.len() }),
                kind,
            }
        }

        Assertion::StateIs { state } => match scope.workflow {
            Some(workflow) => {
                let current = workflow.current_state();
                AssertionOutcome {
                    passed: current.as_deref() == Some(state.as_str()),
                    message: format!("workflow state is {current:?}, expected '{state}'"),
                    details: json!({ "current": current }),
                    kind,
                }
            }
            None => no_workflow(kind),
        },

        Assertion::TransitionedTo { state } => match scope.workflow {
            Some(workflow) => {
                let transitions = workflow.transitions();
                let passed = transitions.iter().any(|(_, to)| to == state);
                AssertionOutcome {
                    passed,
                    message: if passed {
                        format!("workflow transitioned to '{state}'")
                    } else {
                        format!("workflow never reached '{state}'")
                    },
                    details: json!({ "transitions": transitions }),
                    kind,
                }
            }
            None => no_workflow(kind),
        },

        Assertion::WorkflowComplete => match scope.workflow {
            Some(workflow) => {
                let passed = workflow.is_complete();
                AssertionOutcome {
                    passed,
                    message: if passed {
                        "workflow complete".to_string()
                    } else {
                        "workflow not complete".to_string()
                    },
                    details: Value::Null,
                    kind,
                }
            }
            None => no_workflow(kind),
        },

        Assertion::GuardrailTriggered {
            validator,
            expected,
        } => {
            let triggered = scope
                .validations
                .iter()
                .any(|v| v.validator_type == *validator && !v.passed);
            AssertionOutcome {
                passed: triggered == *expected,
                message: format!("guardrail '{validator}' triggered={triggered}, expected={expected}"),
                details: json!({ "triggered": triggered }),
                kind,
            }
        }
    }
}

fn no_workflow(kind: String) -> AssertionOutcome {
    AssertionOutcome {
        kind,
        passed: false,
        message: "no workflow trace configured".to_string(),
        details: Value::Null,
    }
}

fn args_match(actual: &Value, matchers: &BTreeMap<String, ArgMatcher>) -> bool {
    matchers.iter().all(|(name, matcher)| {
        let Some(value) = actual.get(name) else {
            return false;
        };

        if let Some(expected) = &matcher.equals
            && value != expected
        {
            return false;
        }

        if let Some(pattern) = &matcher.matches {
            let string_form = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            match Regex::new(pattern) {
                Ok(regex) if regex.is_match(&string_form) => {}
                _ => return false,
            }
        }

        true
    })
}
