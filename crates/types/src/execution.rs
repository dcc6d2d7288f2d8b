//! Per-step run bookkeeping.
//!
//! Inputs, outputs, and execution records are kept in maps keyed by step name, separate from the
//! canonical workflow definition, so that local edits and run artifacts can be cached without
//! touching the document that is reconciled with the server.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// Locally edited inputs keyed by step name.
pub type StepInputs = IndexMap<String, JsonValue>;
/// Unwrapped run outputs keyed by step name.
pub type StepOutputs = IndexMap<String, JsonValue>;
/// Execution records keyed by step name.
pub type StepExecutions = IndexMap<String, StepExecution>;

/// Uniform error shape recorded on a failed execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionError {
    pub name: String,
    pub message: String,
}

impl ExecutionError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// Timestamps and outcome of the latest run of a step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StepExecution {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
}

impl StepExecution {
    /// Derives the lifecycle status from the recorded fields.
    pub fn status(&self) -> ExecutionStatus {
        match (self.start, self.end) {
            (_, Some(_)) if self.error.is_some() || self.success == Some(false) => ExecutionStatus::Failed,
            (_, Some(_)) if self.success == Some(true) => ExecutionStatus::Completed,
            // An end without an outcome is treated as a failed run.
            (_, Some(_)) => ExecutionStatus::Failed,
            (Some(_), None) => ExecutionStatus::Running,
            (None, None) => ExecutionStatus::Pending,
        }
    }
}

/// Lifecycle status derived from a [`StepExecution`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// The only payload written to the local cache for a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PersistedStepState {
    #[serde(default)]
    pub step_inputs: StepInputs,
    #[serde(default)]
    pub step_outputs: StepOutputs,
    #[serde(default)]
    pub step_executions: StepExecutions,
}

impl PersistedStepState {
    /// Drops every entry recorded for the named step.
    pub fn forget_step(&mut self, step_name: &str) {
        self.step_inputs.shift_remove(step_name);
        self.step_outputs.shift_remove(step_name);
        self.step_executions.shift_remove(step_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_follows_recorded_fields() {
        let mut execution = StepExecution::default();
        assert_eq!(execution.status(), ExecutionStatus::Pending);

        execution.start = Some(Utc::now());
        assert_eq!(execution.status(), ExecutionStatus::Running);

        execution.end = Some(Utc::now());
        execution.success = Some(true);
        assert_eq!(execution.status(), ExecutionStatus::Completed);

        execution.success = Some(false);
        assert_eq!(execution.status(), ExecutionStatus::Failed);

        execution.success = Some(true);
        execution.error = Some(ExecutionError::new("ToolExecutionError", "boom"));
        assert_eq!(execution.status(), ExecutionStatus::Failed);
    }

    #[test]
    fn persisted_state_uses_camel_case_keys() {
        let mut state = PersistedStepState::default();
        state.step_inputs.insert("fetch".into(), json!({"id": 1}));
        let encoded = serde_json::to_value(&state).expect("encode");
        assert_eq!(encoded["stepInputs"]["fetch"]["id"], 1);
        assert!(encoded["stepOutputs"].as_object().is_some_and(|map| map.is_empty()));

        state.forget_step("fetch");
        assert!(state.step_inputs.is_empty());
    }
}
