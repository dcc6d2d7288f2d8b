//! Turns raw tool responses into either an unwrapped step output or a uniform [`ExecutionError`].

use flowsync_types::ExecutionError;
use serde_json::Value;

use super::tool::ToolCallResult;

/// Error name for transport failures.
pub const TOOL_CALL_ERROR: &str = "ToolCallError";
/// Error name for tools that reported `isError`.
pub const TOOL_EXECUTION_ERROR: &str = "ToolExecutionError";
/// Error name for unresolved `@ref` tokens.
pub const REFERENCE_RESOLUTION_ERROR: &str = "ReferenceResolutionError";
/// Error name for runs that exceeded the step timeout.
pub const TIMEOUT_ERROR: &str = "TimeoutError";
/// Fallback name for nested `result.error` values without one.
const NESTED_ERROR: &str = "Error";

/// How many `result` envelopes are peeled off a successful payload.
const MAX_RESULT_LAYERS: usize = 2;

/// Normalizes a tool response.
///
/// `isError` responses become a [`TOOL_EXECUTION_ERROR`] carrying the first text item. Otherwise
/// the payload is taken from `structuredContent`, or from the JSON encoded in the first text item,
/// and up to two nested `result` layers are unwrapped. A non-null `error` inside any of those
/// layers fails the run with the nested error's name and message.
pub fn normalize_tool_result(result: &ToolCallResult) -> Result<Value, ExecutionError> {
    if result.is_error == Some(true) {
        let text = result.first_text().unwrap_or("unknown error");
        return Err(ExecutionError::new(TOOL_EXECUTION_ERROR, format!("Tool execution failed: {text}")));
    }

    let mut payload = match (&result.structured_content, result.first_text()) {
        (Some(structured), _) => structured.clone(),
        (None, Some(text)) => serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())),
        (None, None) => Value::Null,
    };

    for _ in 0..MAX_RESULT_LAYERS {
        let Some(inner) = payload.as_object_mut().and_then(|envelope| envelope.remove("result")) else {
            break;
        };
        if let Some(error) = nested_error(&inner) {
            return Err(error);
        }
        payload = inner;
    }

    Ok(payload)
}

fn nested_error(layer: &Value) -> Option<ExecutionError> {
    match layer.get("error")? {
        Value::Null => None,
        Value::String(message) => Some(ExecutionError::new(NESTED_ERROR, message.clone())),
        Value::Object(fields) => {
            let name = fields.get("name").and_then(Value::as_str).unwrap_or(NESTED_ERROR);
            let message = match fields.get("message") {
                Some(Value::String(message)) => message.clone(),
                Some(other) => other.to_string(),
                None => Value::Object(fields.clone()).to_string(),
            };
            Some(ExecutionError::new(name, message))
        }
        other => Some(ExecutionError::new(NESTED_ERROR, other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::tool::ToolContent;
    use serde_json::json;

    #[test]
    fn is_error_becomes_tool_execution_error() {
        let error = normalize_tool_result(&ToolCallResult::error_text("boom")).unwrap_err();
        assert_eq!(error.name, TOOL_EXECUTION_ERROR);
        assert_eq!(error.message, "Tool execution failed: boom");
    }

    #[test]
    fn structured_content_is_unwrapped_two_layers() {
        let result = ToolCallResult::structured(json!({"result": {"result": {"id": 7}}}));
        assert_eq!(normalize_tool_result(&result), Ok(json!({"id": 7})));

        let deeper = ToolCallResult::structured(json!({"result": {"result": {"result": 1}}}));
        assert_eq!(normalize_tool_result(&deeper), Ok(json!({"result": 1})));
    }

    #[test]
    fn text_content_is_parsed_as_json() {
        let result = ToolCallResult {
            content: vec![ToolContent::text(r#"{"result": [1, 2]}"#)],
            ..ToolCallResult::default()
        };
        assert_eq!(normalize_tool_result(&result), Ok(json!([1, 2])));

        let plain = ToolCallResult {
            content: vec![ToolContent::text("done")],
            ..ToolCallResult::default()
        };
        assert_eq!(normalize_tool_result(&plain), Ok(json!("done")));
        assert_eq!(normalize_tool_result(&ToolCallResult::default()), Ok(Value::Null));
    }

    #[test]
    fn nested_result_errors_are_normalized() {
        let object = ToolCallResult::structured(json!({"result": {"error": {"name": "ValidationError", "message": "bad email"}}}));
        assert_eq!(
            normalize_tool_result(&object),
            Err(ExecutionError::new("ValidationError", "bad email"))
        );

        let string = ToolCallResult::structured(json!({"result": {"result": {"error": "quota exceeded"}}}));
        assert_eq!(normalize_tool_result(&string), Err(ExecutionError::new("Error", "quota exceeded")));

        let null = ToolCallResult::structured(json!({"result": {"error": null, "result": 3}}));
        assert_eq!(normalize_tool_result(&null), Ok(json!(3)));
    }
}
