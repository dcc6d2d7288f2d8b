//! Reference candidates surfaced to editors when authoring step inputs.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Origin of a reference candidate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AtRefKind {
    /// Points into a prior step's output.
    Step,
    /// Points into the workflow input.
    Input,
}

/// A valid `@ref` for a given step. Computed on demand and never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AtRefOption {
    /// Reference token, for example `@fetch.customer`.
    pub value: String,
    /// Human readable label.
    pub label: String,
    #[serde(rename = "type")]
    pub kind: AtRefKind,
    /// Schema inferred from the runtime value behind the reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<JsonValue>,
}
