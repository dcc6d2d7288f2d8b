//! Workflow document model shared by the store, the reconciler, and the executor.
//!
//! The canonical copy of a [`WorkflowDefinition`] lives on the remote service. The local editor
//! holds a replica, mutates it optimistically, and replaces it wholesale whenever a newer server
//! version is accepted. Field names follow the camelCase wire format used by the service.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;

/// Remote workflow document. `name` is the document identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// Workflow identity, unique per workspace.
    pub name: String,
    /// Free-form description shown in editors.
    #[serde(default)]
    pub description: String,
    /// Ordered steps. Step names are unique within a workflow.
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl WorkflowDefinition {
    /// Creates an empty workflow with the provided name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Looks up a step by its definition name.
    pub fn step(&self, step_name: &str) -> Option<&Step> {
        self.steps.iter().find(|step| step.def.name == step_name)
    }

    /// Looks up a step mutably by its definition name.
    pub fn step_mut(&mut self, step_name: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|step| step.def.name == step_name)
    }

    /// Position of the named step within the workflow.
    pub fn step_index(&self, step_name: &str) -> Option<usize> {
        self.steps.iter().position(|step| step.def.name == step_name)
    }

    /// Step names in execution order.
    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|step| step.def.name.clone()).collect()
    }

    /// The first step, whose input doubles as the workflow input.
    pub fn first_step(&self) -> Option<&Step> {
        self.steps.first()
    }
}

/// A single workflow step: its tool definition plus the last authored input/output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Tool definition executed for this step.
    pub def: StepDefinition,
    /// Authored input, possibly containing `@ref` tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<JsonValue>,
    /// Output captured by the last run that was saved into the definition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<JsonValue>,
    /// Retry and timeout configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<StepOptions>,
}

impl Step {
    /// Creates a step with a bare definition.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            def: StepDefinition {
                name: name.into(),
                ..StepDefinition::default()
            },
            ..Self::default()
        }
    }

    /// Builder-style helper used by tests and the CLI.
    pub fn with_input(mut self, input: JsonValue) -> Self {
        self.input = Some(input);
        self
    }

    /// Name of the step (identical to `def.name`).
    pub fn name(&self) -> &str {
        &self.def.name
    }

    /// Configured timeout, when present.
    pub fn timeout(&self) -> Option<Duration> {
        self.options.as_ref().and_then(|options| options.timeout).map(Duration::from_millis)
    }
}

/// Tool definition carried by a step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    /// Step name, unique within the workflow.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema describing the accepted input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<JsonValue>,
    /// JSON Schema describing the produced output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<JsonValue>,
    /// Source executed remotely by the step runner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute: Option<String>,
}

/// Per-step execution options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StepOptions {
    /// Retry policy applied by the remote executor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Timeout in milliseconds for a single run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// Retry policy. Modeled for the remote executor; no client-side loop consumes it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub limit: u32,
    /// Base delay in milliseconds.
    pub delay: u64,
    #[serde(default)]
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Delay before the given retry attempt (1-based). Attempts past `limit` yield `None`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.limit {
            return None;
        }
        let millis = match self.backoff {
            Backoff::Constant => self.delay,
            Backoff::Linear => self.delay.saturating_mul(u64::from(attempt)),
            Backoff::Exponential => {
                let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
                self.delay.saturating_mul(factor)
            }
        };
        Some(Duration::from_millis(millis))
    }
}

/// Backoff curve between retries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    #[default]
    Constant,
    Linear,
    Exponential,
}
