//! # `@ref` Resolution
//!
//! Step inputs may contain string leaves of the form `@input.path` or `@step.path`. Right before
//! a step runs, every such leaf is replaced by the value it points at:
//!
//! - `@input` / `@input.<path>` read from the workflow input (the first step's input)
//! - `@<step>.<path>` reads from `step_outputs[step]`; outputs are stored unwrapped, so a leading
//!   `output.` segment is accepted and ignored
//!
//! Paths are dot separated. Object hops are key lookups and array hops parse the segment as an
//! index. A missing hop produces a typed [`ReferenceError`], never a panic. Resolution is pure.
//!
//! ```rust
//! use flowsync_engine::resolve::resolve_at_refs_in_input;
//! use flowsync_types::StepOutputs;
//! use serde_json::json;
//!
//! let mut outputs = StepOutputs::new();
//! outputs.insert("fetch".into(), json!({"customer": {"id": 42}}));
//! let workflow_input = json!({"email": "ada@example.com"});
//!
//! let resolved = resolve_at_refs_in_input(
//!     &json!({"id": "@fetch.output.customer.id", "to": "@input.email"}),
//!     &outputs,
//!     Some(&workflow_input),
//! );
//! assert!(resolved.errors.is_empty());
//! assert_eq!(resolved.value, json!({"id": 42, "to": "ada@example.com"}));
//! ```

use flowsync_types::StepOutputs;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Marker that starts every reference token.
pub const AT_REF_PREFIX: char = '@';
/// Reference head that points at the workflow input.
pub const INPUT_REF_HEAD: &str = "input";
/// Optional segment accepted after a step name.
const OUTPUT_SEGMENT: &str = "output";

/// Failure to resolve a single reference.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReferenceError {
    #[error("Invalid reference: {reference}")]
    InvalidReference { reference: String },
    #[error("Input not available")]
    InputUnavailable,
    #[error("Input path not found: {path}")]
    InputPathNotFound { path: String },
    #[error("Step output not found: {step}")]
    StepOutputNotFound { step: String },
    #[error("Path not found in step {step}: {path}")]
    StepPathNotFound { step: String, path: String },
}

/// One failed reference inside an input document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefResolutionError {
    /// The token as authored, for example `@fetch.customer`.
    pub reference: String,
    pub message: String,
}

/// Result of resolving every reference in an input document.
///
/// Callers must inspect `errors` before using `value`; unresolved leaves keep their token.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedInput {
    pub value: Value,
    pub errors: Vec<RefResolutionError>,
}

impl ResolvedInput {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }

    /// Converts into the resolved value, or the aggregated errors when any reference failed.
    pub fn into_result(self) -> Result<Value, Vec<RefResolutionError>> {
        if self.errors.is_empty() { Ok(self.value) } else { Err(self.errors) }
    }
}

/// Returns `true` when the string is a reference token rather than a literal.
pub fn is_at_ref(candidate: &str) -> bool {
    candidate.len() > AT_REF_PREFIX.len_utf8() && candidate.starts_with(AT_REF_PREFIX)
}

/// Resolves a single `@ref` token.
///
/// # Arguments
///
/// * `reference` - Token such as `@input.customer.email` or `@fetch.items.0.id`
/// * `step_outputs` - Unwrapped outputs of previously executed steps
/// * `first_step_input` - Input of the workflow's first step, when known
///
/// # Errors
///
/// Returns a [`ReferenceError`] describing the first missing hop.
pub fn resolve_at_ref(reference: &str, step_outputs: &StepOutputs, first_step_input: Option<&Value>) -> Result<Value, ReferenceError> {
    let body = reference
        .strip_prefix(AT_REF_PREFIX)
        .filter(|body| !body.is_empty())
        .ok_or_else(|| ReferenceError::InvalidReference {
            reference: reference.to_string(),
        })?;

    let (head, path) = match body.split_once('.') {
        Some((head, path)) => (head, Some(path)),
        None => (body, None),
    };
    if head.is_empty() {
        return Err(ReferenceError::InvalidReference {
            reference: reference.to_string(),
        });
    }

    if head == INPUT_REF_HEAD {
        let input = first_step_input.ok_or(ReferenceError::InputUnavailable)?;
        return match path {
            None => Ok(input.clone()),
            Some(path) => navigate_path(input, path)
                .cloned()
                .ok_or_else(|| ReferenceError::InputPathNotFound { path: path.to_string() }),
        };
    }

    let output = step_outputs
        .get(head)
        .ok_or_else(|| ReferenceError::StepOutputNotFound { step: head.to_string() })?;
    let path = path.and_then(|path| match path.strip_prefix(OUTPUT_SEGMENT) {
        Some("") => None,
        Some(rest) => match rest.strip_prefix('.') {
            Some(stripped) => Some(stripped),
            // A key that merely starts with "output", e.g. "outputs".
            None => Some(path),
        },
        None => Some(path),
    });

    match path {
        None => Ok(output.clone()),
        Some(path) => navigate_path(output, path).cloned().ok_or_else(|| ReferenceError::StepPathNotFound {
            step: head.to_string(),
            path: path.to_string(),
        }),
    }
}

/// Recursively replaces every `@ref` string leaf in `input`, aggregating failures.
///
/// Values without references are returned unchanged, so the function is the identity on
/// literal documents.
pub fn resolve_at_refs_in_input(input: &Value, step_outputs: &StepOutputs, first_step_input: Option<&Value>) -> ResolvedInput {
    let mut errors = Vec::new();
    let value = resolve_value(input, step_outputs, first_step_input, &mut errors);
    ResolvedInput { value, errors }
}

fn resolve_value(
    value: &Value,
    step_outputs: &StepOutputs,
    first_step_input: Option<&Value>,
    errors: &mut Vec<RefResolutionError>,
) -> Value {
    match value {
        Value::String(text) if is_at_ref(text) => match resolve_at_ref(text, step_outputs, first_step_input) {
            Ok(resolved) => resolved,
            Err(error) => {
                errors.push(RefResolutionError {
                    reference: text.clone(),
                    message: error.to_string(),
                });
                value.clone()
            }
        },
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_value(item, step_outputs, first_step_input, errors))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), resolve_value(item, step_outputs, first_step_input, errors)))
                .collect(),
        ),
        _ => value.clone(),
    }
}

/// Lists every reference token contained in `input`, in document order.
pub fn collect_at_refs(input: &Value) -> Vec<String> {
    let mut references = Vec::new();
    collect_into(input, &mut references);
    references
}

fn collect_into(value: &Value, references: &mut Vec<String>) {
    match value {
        Value::String(text) if is_at_ref(text) => references.push(text.clone()),
        Value::Array(items) => items.iter().for_each(|item| collect_into(item, references)),
        Value::Object(map) => map.values().for_each(|item| collect_into(item, references)),
        _ => {}
    }
}

/// Walks a dot separated path. Object hops look up keys; array hops parse an index.
pub fn navigate_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}
