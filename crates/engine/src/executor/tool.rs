use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Invokes a named tool on the remote tool-invocation service.
///
/// Implementations own the transport. A returned `Err` is a transport failure; a tool that ran
/// and failed reports it through [`ToolCallResult::is_error`] or a nested `result.error`.
#[async_trait]
pub trait ToolCaller: Send + Sync {
    /// Calls `request.name` with `request.arguments` against `connection`.
    ///
    /// `locator` scopes the call to a workspace when the connection serves several.
    async fn call(&self, connection: &ToolConnection, request: ToolCallRequest, locator: Option<&str>) -> Result<ToolCallResult>;
}

/// Where and how to reach the tool-invocation service.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolConnection {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub headers: IndexMap<String, String>,
}

impl ToolConnection {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

impl fmt::Debug for ToolConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolConnection")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub name: String,
    pub arguments: Value,
}

/// Raw tool response as returned by the service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    #[serde(default)]
    pub content: Vec<ToolContent>,
}

impl ToolCallResult {
    /// Successful result carrying structured content.
    pub fn structured(value: Value) -> Self {
        Self {
            structured_content: Some(value),
            ..Self::default()
        }
    }

    /// Result flagged as a tool failure with a text explanation.
    pub fn error_text(text: impl Into<String>) -> Self {
        Self {
            is_error: Some(true),
            content: vec![ToolContent::text(text)],
            ..Self::default()
        }
    }

    /// Text of the first content item, when it has any.
    pub fn first_text(&self) -> Option<&str> {
        self.content.first().and_then(|item| item.text.as_deref())
    }
}

/// One content item of a tool response. Non-text items keep `text` empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolContent {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl ToolContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".into(),
            text: Some(text.into()),
        }
    }
}
