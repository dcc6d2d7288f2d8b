//! Available reference catalog.
//!
//! Builds the list of `@ref` candidates an editor may offer for a step. Candidates come from the
//! workflow input and from the outputs of steps that precede the current one; later steps never
//! appear, which keeps data dependencies acyclic by construction. Each candidate carries a
//! JSON-Schema shape inferred from the runtime value so that editors can filter by the target
//! field's schema. The filter is advisory: resolution errors remain the hard guarantee.

use std::collections::HashSet;

use flowsync_types::{AtRefKind, AtRefOption, StepOutputs};
use serde_json::{Map, Value, json};

use crate::resolve::{AT_REF_PREFIX, INPUT_REF_HEAD};
use crate::store::StoreState;

/// Maximum container nesting explored by [`infer_schema`].
pub const SCHEMA_INFERENCE_MAX_DEPTH: usize = 3;

/// Infers a JSON-Schema-like shape from a runtime value.
///
/// `null` maps to `{"type": "null"}`, arrays to `{"type": "array", "items": <first element>}`,
/// objects to `{"type": "object", "properties": {...}}`, and scalars to their primitive type.
/// Containers nested deeper than [`SCHEMA_INFERENCE_MAX_DEPTH`] infer the empty schema `{}`.
pub fn infer_schema(value: &Value) -> Value {
    let mut visited = HashSet::new();
    infer_schema_guarded(value, 0, &mut visited)
}

fn infer_schema_guarded(value: &Value, depth: usize, visited: &mut HashSet<*const Value>) -> Value {
    match value {
        Value::Null => json!({"type": "null"}),
        Value::Bool(_) => json!({"type": "boolean"}),
        Value::Number(_) => json!({"type": "number"}),
        Value::String(_) => json!({"type": "string"}),
        Value::Array(_) | Value::Object(_) if depth >= SCHEMA_INFERENCE_MAX_DEPTH => json!({}),
        Value::Array(_) | Value::Object(_) if !visited.insert(value as *const Value) => json!({}),
        Value::Array(items) => {
            let item_schema = items
                .first()
                .map(|first| infer_schema_guarded(first, depth + 1, visited))
                .unwrap_or_else(|| json!({}));
            json!({"type": "array", "items": item_schema})
        }
        Value::Object(map) => {
            let properties: Map<String, Value> = map
                .iter()
                .map(|(key, item)| (key.clone(), infer_schema_guarded(item, depth + 1, visited)))
                .collect();
            json!({"type": "object", "properties": properties})
        }
    }
}

/// Builds every reference candidate available to `step_name`.
///
/// # Arguments
///
/// * `step_name` - Step whose input is being authored
/// * `step_names` - All step names in workflow order
/// * `step_outputs` - Unwrapped outputs recorded so far
/// * `first_step_input` - The workflow input, when known
///
/// Workflow input keys are offered to every step after the first. For each key of a prior
/// step's object output two equivalent spellings are emitted, `@step.key` and
/// `@step.output.key`; non-object outputs are offered whole as `@step`. A step that is not part
/// of `step_names` yet is treated as appended at the end.
pub fn build_available_references(
    step_name: &str,
    step_names: &[String],
    step_outputs: &StepOutputs,
    first_step_input: Option<&Value>,
) -> Vec<AtRefOption> {
    let current_index = step_names
        .iter()
        .position(|candidate| candidate == step_name)
        .unwrap_or(step_names.len());
    let mut options = Vec::new();

    if current_index > 0
        && let Some(Value::Object(input)) = first_step_input
    {
        for (key, value) in input {
            options.push(AtRefOption {
                value: format!("{AT_REF_PREFIX}{INPUT_REF_HEAD}.{key}"),
                label: format!("{INPUT_REF_HEAD}.{key}"),
                kind: AtRefKind::Input,
                schema: Some(infer_schema(value)),
            });
        }
    }

    for prior_step in &step_names[..current_index] {
        let Some(output) = step_outputs.get(prior_step) else {
            continue;
        };
        match output {
            Value::Object(fields) => {
                for (key, value) in fields {
                    let schema = infer_schema(value);
                    for path in [format!("{prior_step}.{key}"), format!("{prior_step}.output.{key}")] {
                        options.push(AtRefOption {
                            value: format!("{AT_REF_PREFIX}{path}"),
                            label: path,
                            kind: AtRefKind::Step,
                            schema: Some(schema.clone()),
                        });
                    }
                }
            }
            other => options.push(AtRefOption {
                value: format!("{AT_REF_PREFIX}{prior_step}"),
                label: prior_step.clone(),
                kind: AtRefKind::Step,
                schema: Some(infer_schema(other)),
            }),
        }
    }

    options
}

/// Convenience wrapper deriving the catalog inputs from a store snapshot.
pub fn available_references_for(state: &StoreState, step_name: &str) -> Vec<AtRefOption> {
    build_available_references(
        step_name,
        &state.workflow.step_names(),
        &state.step_state.step_outputs,
        state.first_step_input(),
    )
}

/// Keeps the candidates whose schema fits `target_schema`. Candidates without a schema are kept.
pub fn compatible_options(options: &[AtRefOption], target_schema: &Value) -> Vec<AtRefOption> {
    options
        .iter()
        .filter(|option| {
            option
                .schema
                .as_ref()
                .is_none_or(|schema| is_schema_compatible(schema, target_schema))
        })
        .cloned()
        .collect()
}

/// Structural compatibility between a reference's schema and a target field's schema.
///
/// Schemas without a `type` are compatible with anything. Object targets accept any candidate
/// whose `properties` cover the target's `required` list. Arrays compare their `items`.
/// Primitive types must match, with `integer` and `number` treated as the same numeric type.
pub fn is_schema_compatible(reference_schema: &Value, target_schema: &Value) -> bool {
    let (Some(reference_types), Some(target_types)) = (schema_types(reference_schema), schema_types(target_schema)) else {
        return true;
    };

    let types_overlap = reference_types
        .iter()
        .any(|reference_type| target_types.iter().any(|target_type| types_match(reference_type, target_type)));
    if !types_overlap {
        return false;
    }

    let both = |kind: &str| reference_types.contains(&kind) && target_types.contains(&kind);

    if both("object") {
        let required = target_schema.get("required").and_then(Value::as_array);
        let properties = reference_schema.get("properties").and_then(Value::as_object);
        return required.is_none_or(|required| {
            required
                .iter()
                .filter_map(Value::as_str)
                .all(|property| properties.is_some_and(|properties| properties.contains_key(property)))
        });
    }

    if both("array") {
        return match (reference_schema.get("items"), target_schema.get("items")) {
            (Some(reference_items), Some(target_items)) => is_schema_compatible(reference_items, target_items),
            _ => true,
        };
    }

    true
}

fn schema_types(schema: &Value) -> Option<Vec<&str>> {
    match schema.get("type")? {
        Value::String(kind) => Some(vec![kind.as_str()]),
        Value::Array(kinds) => {
            let kinds: Vec<&str> = kinds.iter().filter_map(Value::as_str).collect();
            (!kinds.is_empty()).then_some(kinds)
        }
        _ => None,
    }
}

fn types_match(reference_type: &str, target_type: &str) -> bool {
    let numeric = |kind: &str| kind == "number" || kind == "integer";
    reference_type == target_type || (numeric(reference_type) && numeric(target_type))
}
