//! HTTP tool calls and the tool-backed workflow reader.
//!
//! Tools are invoked with a JSON-RPC `tools/call` request. Servers answer either with a plain
//! JSON body or with an SSE stream carrying the JSON-RPC response in a `data:` frame; both are
//! accepted.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use flowsync_engine::executor::normalize_tool_result;
use flowsync_engine::{ToolCallRequest, ToolCallResult, ToolCaller, ToolConnection, WorkflowReadApi};
use flowsync_types::WorkflowDefinition;
use reqwest::{Client, header};
use serde_json::{Value, json};
use tracing::debug;

use crate::sse::decode_sse_body;

/// Tool used by [`ToolWorkflowReader`] unless overridden.
pub const DEFAULT_READ_TOOL_NAME: &str = "WORKFLOW_READ";
/// Header scoping a tool call to a workspace.
pub const LOCATOR_HEADER: &str = "x-flowsync-locator";

/// [`ToolCaller`] over HTTP JSON-RPC.
#[derive(Debug)]
pub struct HttpToolCaller {
    http: Client,
    next_request_id: AtomicU64,
}

impl HttpToolCaller {
    pub fn new(http: Client) -> Self {
        Self {
            http,
            next_request_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl ToolCaller for HttpToolCaller {
    async fn call(&self, connection: &ToolConnection, request: ToolCallRequest, locator: Option<&str>) -> Result<ToolCallResult> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": {"name": request.name, "arguments": request.arguments},
        });
        debug!(url = %connection.url, tool = %request.name, id, "calling tool");

        let mut builder = self
            .http
            .post(&connection.url)
            .header(header::ACCEPT, "application/json, text/event-stream")
            .json(&body);
        if let Some(token) = &connection.token {
            builder = builder.bearer_auth(token);
        }
        for (name, value) in &connection.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(locator) = locator {
            builder = builder.header(LOCATOR_HEADER, locator);
        }

        let response = builder
            .send()
            .await
            .with_context(|| format!("tool call '{}' failed to reach {}", request.name, connection.url))?;
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let text = response.text().await.context("read tool call response")?;
        if !status.is_success() {
            bail!("tool call '{}' returned {status}: {}", request.name, text.trim());
        }

        decode_tool_response(&content_type, &text, id)
    }
}

/// Extracts the tool result from a JSON or SSE-framed JSON-RPC response body.
pub fn decode_tool_response(content_type: &str, body: &str, id: u64) -> Result<ToolCallResult> {
    let message = if content_type.starts_with("text/event-stream") {
        let messages: Vec<Value> = decode_sse_body(body)
            .into_iter()
            .filter_map(|frame| frame.data)
            .filter_map(|data| serde_json::from_str::<Value>(&data).ok())
            .collect();
        let matching = messages.iter().position(|message| message.get("id") == Some(&json!(id)));
        let fallback = messages.iter().rposition(|message| message.get("result").is_some() || message.get("error").is_some());
        let index = matching.or(fallback).ok_or_else(|| anyhow!("event stream carried no response for request {id}"))?;
        messages.into_iter().nth(index).unwrap_or_default()
    } else {
        serde_json::from_str(body).context("tool call response is not JSON")?
    };

    if let Some(error) = message.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or_default();
        let text = error.get("message").and_then(Value::as_str).unwrap_or("unknown error");
        bail!("tool call error {code}: {text}");
    }
    let result = message
        .get("result")
        .cloned()
        .ok_or_else(|| anyhow!("tool call response has neither result nor error"))?;
    serde_json::from_value(result).context("invalid tool call result")
}

/// [`WorkflowReadApi`] that reads workflows through a tool.
pub struct ToolWorkflowReader {
    caller: Arc<dyn ToolCaller>,
    connection: ToolConnection,
    locator: Option<String>,
    read_tool: String,
}

impl ToolWorkflowReader {
    pub fn new(caller: Arc<dyn ToolCaller>, connection: ToolConnection) -> Self {
        Self {
            caller,
            connection,
            locator: None,
            read_tool: DEFAULT_READ_TOOL_NAME.to_string(),
        }
    }

    pub fn with_locator(mut self, locator: impl Into<String>) -> Self {
        self.locator = Some(locator.into());
        self
    }

    pub fn with_read_tool(mut self, tool_name: impl Into<String>) -> Self {
        self.read_tool = tool_name.into();
        self
    }
}

#[async_trait]
impl WorkflowReadApi for ToolWorkflowReader {
    async fn read(&self, uri: &str) -> Result<WorkflowDefinition> {
        let request = ToolCallRequest {
            name: self.read_tool.clone(),
            arguments: json!({"uri": uri}),
        };
        let result = self.caller.call(&self.connection, request, self.locator.as_deref()).await?;
        let payload = normalize_tool_result(&result).map_err(|error| anyhow!("reading {uri} failed: {error}"))?;

        let document = ["item", "workflow", "data"]
            .iter()
            .find_map(|key| payload.get(*key).filter(|value| value.is_object()))
            .cloned()
            .unwrap_or(payload);
        serde_json::from_value(document).with_context(|| format!("{uri} is not a workflow definition"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowsync_engine::ToolContent;
    use std::sync::Mutex;

    #[test]
    fn decodes_plain_json_responses() {
        let body = r#"{"jsonrpc":"2.0","id":4,"result":{"structuredContent":{"ok":true},"content":[]}}"#;
        let result = decode_tool_response("application/json", body, 4).expect("result");
        assert_eq!(result.structured_content, Some(json!({"ok": true})));
    }

    #[test]
    fn decodes_event_stream_responses() {
        let body = concat!(
            "event: message\n",
            "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\n",
            "event: message\n",
            "data: {\"jsonrpc\":\"2.0\",\"id\":9,\"result\":{\"isError\":true,\"content\":[{\"type\":\"text\",\"text\":\"boom\"}]}}\n\n",
        );
        let result = decode_tool_response("text/event-stream; charset=utf-8", body, 9).expect("result");
        assert_eq!(result.is_error, Some(true));
        assert_eq!(result.first_text(), Some("boom"));
    }

    #[test]
    fn surfaces_rpc_errors() {
        let body = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"unknown tool"}}"#;
        let error = decode_tool_response("application/json", body, 1).unwrap_err();
        assert_eq!(error.to_string(), "tool call error -32601: unknown tool");

        assert!(decode_tool_response("text/event-stream", ": ping\n\n", 1).is_err());
    }

    struct CannedCaller {
        result: ToolCallResult,
        seen: Mutex<Vec<ToolCallRequest>>,
    }

    #[async_trait]
    impl ToolCaller for CannedCaller {
        async fn call(&self, _: &ToolConnection, request: ToolCallRequest, _: Option<&str>) -> Result<ToolCallResult> {
            self.seen.lock().unwrap().push(request);
            Ok(self.result.clone())
        }
    }

    #[tokio::test]
    async fn reader_unwraps_workflow_documents() {
        let caller = Arc::new(CannedCaller {
            result: ToolCallResult {
                content: vec![ToolContent::text(r#"{"item": {"name": "billing", "steps": [{"def": {"name": "charge"}}]}}"#)],
                ..ToolCallResult::default()
            },
            seen: Mutex::new(Vec::new()),
        });
        let reader = ToolWorkflowReader::new(caller.clone(), ToolConnection::default()).with_read_tool("READ_WORKFLOW");

        let workflow = reader.read("rsc://billing").await.expect("workflow");
        assert_eq!(workflow.name, "billing");
        assert_eq!(workflow.step_names(), vec!["charge"]);

        let seen = caller.seen.lock().unwrap();
        assert_eq!(seen[0].name, "READ_WORKFLOW");
        assert_eq!(seen[0].arguments, json!({"uri": "rsc://billing"}));
    }

    #[tokio::test]
    async fn reader_reports_tool_failures() {
        let caller = Arc::new(CannedCaller {
            result: ToolCallResult::error_text("not found"),
            seen: Mutex::new(Vec::new()),
        });
        let reader = ToolWorkflowReader::new(caller, ToolConnection::default());
        let error = reader.read("rsc://missing").await.unwrap_err();
        assert!(error.to_string().contains("Tool execution failed: not found"));
    }
}
