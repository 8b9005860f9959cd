//! Per-turn stage event trace.
//!
//! Each pipeline stage appends a [`StageEvent`] to the execution context;
//! the arena state store persists the accumulated trace next to the
//! conversation so reports can reconstruct what happened per turn.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One recorded pipeline stage occurrence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEvent {
    /// Stage name, e.g. `provider`, `tool_dispatch`, `state_save`.
    pub stage: String,

    /// When the stage started.
    pub started_at: DateTime<Utc>,

    /// When the stage finished.
    pub ended_at: DateTime<Utc>,

    /// Short event label, e.g. `completed`, `tool_call`, `timeout`.
    pub event: String,

    /// Structured event payload.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

impl StageEvent {
    /// Start timing a stage. Call [`StageSpan::finish`] to record it.
    #[must_use]
    pub fn begin(stage: impl Into<String>) -> StageSpan {
        StageSpan {
            stage: stage.into(),
            started_at: Utc::now(),
        }
    }

    /// Record an instantaneous event.
    #[must_use]
    pub fn instant(stage: impl Into<String>, event: impl Into<String>, details: Value) -> Self {
        let now = Utc::now();
        Self {
            stage: stage.into(),
            started_at: now,
            ended_at: now,
            event: event.into(),
            details,
        }
    }
}

/// An in-progress stage measurement.
#[derive(Debug, Clone)]
pub struct StageSpan {
    stage: String,
    started_at: DateTime<Utc>,
}

impl StageSpan {
    /// Finish the span into a [`StageEvent`].
    #[must_use]
    pub fn finish(self, event: impl Into<String>, details: Value) -> StageEvent {
        StageEvent {
            stage: self.stage,
            started_at: self.started_at,
            ended_at: Utc::now(),
            event: event.into(),
            details,
        }
    }
}
