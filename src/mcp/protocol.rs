//! JSON-RPC 2.0 envelopes and MCP result types
//!
//! Covers the subset of the Model Context Protocol the server speaks:
//! `initialize`, `ping`, `tools/list` and `tools/call`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parse error
pub const PARSE_ERROR: i64 = -32700;
/// Not a valid request object
pub const INVALID_REQUEST: i64 = -32600;
/// Unknown method
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Bad method parameters
pub const INVALID_PARAMS: i64 = -32602;

/// Protocol revisions the server accepts, newest first
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// JSON-RPC request or notification
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    /// Must be `"2.0"`
    pub jsonrpc: String,
    /// Absent for notifications
    #[serde(default)]
    pub id: Option<Value>,
    /// Method name
    pub method: String,
    /// Method parameters
    #[serde(default)]
    pub params: Value,
}

impl JsonRpcRequest {
    /// Notifications carry no ID and get no response
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Always `"2.0"`
    pub jsonrpc: String,
    /// Request ID, `null` when it could not be read
    pub id: Value,
    /// Success payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Numeric error code
    pub code: i64,
    /// Description
    pub message: String,
}

impl JsonRpcResponse {
    /// Successful response
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id: id.unwrap_or(Value::Null),
            result: Some(result),
            error: None,
        }
    }

    /// Error response
    pub fn error(id: Option<Value>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id: id.unwrap_or(Value::Null),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Tool descriptor for `tools/list`
#[derive(Debug, Clone, Serialize)]
pub struct McpTool {
    /// Tool name
    pub name: String,
    /// What the tool does
    pub description: String,
    /// JSON schema of the arguments
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Result of a `tools/call`
///
/// The payload is sent both as structured content and as its JSON text for
/// clients that only read text content.
#[derive(Debug, Clone, Serialize)]
pub struct McpToolResult {
    /// Text rendering of the payload
    pub content: Vec<McpContent>,
    /// The payload itself
    #[serde(rename = "structuredContent")]
    pub structured_content: Value,
    /// Set for tool-level failures
    #[serde(rename = "isError", skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

/// One content block
#[derive(Debug, Clone, Serialize)]
pub struct McpContent {
    /// Always `"text"`
    #[serde(rename = "type")]
    pub content_type: String,
    /// Text body
    pub text: String,
}

impl McpToolResult {
    /// Successful result
    pub fn structured(payload: Value) -> Self {
        Self {
            content: vec![McpContent::text(&payload)],
            structured_content: payload,
            is_error: false,
        }
    }

    /// Failure result with `{"error": {"code", "message"}}`
    pub fn error(code: &str, message: &str) -> Self {
        let payload = serde_json::json!({
            "error": { "code": code, "message": message }
        });
        Self {
            content: vec![McpContent::text(&payload)],
            structured_content: payload,
            is_error: true,
        }
    }
}

impl McpContent {
    fn text(payload: &Value) -> Self {
        Self {
            content_type: "text".into(),
            text: payload.to_string(),
        }
    }
}

/// `initialize` capabilities
#[derive(Debug, Serialize)]
pub struct ServerCapabilities {
    /// Tool support
    pub tools: ToolCapability,
}

/// Tool capability flags
#[derive(Debug, Serialize)]
pub struct ToolCapability {
    /// The tool list never changes while running
    #[serde(rename = "listChanged")]
    pub list_changed: bool,
}

/// Server name and version
#[derive(Debug, Serialize)]
pub struct ServerInfo {
    /// Server name
    pub name: String,
    /// Crate version
    pub version: String,
}

/// `initialize` result
#[derive(Debug, Serialize)]
pub struct InitializeResult {
    /// Negotiated protocol revision
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    /// What the server supports
    pub capabilities: ServerCapabilities,
    /// Who the server is
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
}

/// Pick the revision to answer with
///
/// A supported requested revision is echoed; anything else gets the newest.
pub fn negotiate_protocol_version(requested: Option<&str>) -> &'static str {
    requested
        .and_then(|r| SUPPORTED_PROTOCOL_VERSIONS.iter().find(|v| **v == r))
        .copied()
        .unwrap_or(SUPPORTED_PROTOCOL_VERSIONS[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserialize_request() {
        let json = r#"{"jsonrpc":"2.0","id":1,"method":"tools/list","params":{}}"#;
        let req: JsonRpcRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.method, "tools/list");
        assert_eq!(req.id, Some(json!(1)));
        assert!(!req.is_notification());
    }

    #[test]
    fn notification_has_no_id() {
        let req: JsonRpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
                .unwrap();
        assert!(req.is_notification());
        assert_eq!(req.params, Value::Null);
    }

    #[test]
    fn serialize_responses() {
        let ok = serde_json::to_string(&JsonRpcResponse::success(Some(json!(1)), json!({}))).unwrap();
        assert!(ok.contains("\"result\""));
        assert!(!ok.contains("\"error\""));

        let err = serde_json::to_value(JsonRpcResponse::error(None, PARSE_ERROR, "bad")).unwrap();
        assert_eq!(err["id"], Value::Null);
        assert_eq!(err["error"]["code"], -32700);
        assert!(err.get("result").is_none());
    }

    #[test]
    fn tool_error_shape() {
        let result = serde_json::to_value(McpToolResult::error("invalid_ip", "nope")).unwrap();
        assert_eq!(result["isError"], true);
        assert_eq!(result["structuredContent"]["error"]["code"], "invalid_ip");
        let text: Value = serde_json::from_str(result["content"][0]["text"].as_str().unwrap()).unwrap();
        assert_eq!(text["error"]["message"], "nope");
    }

    #[test]
    fn success_omits_is_error() {
        let result = serde_json::to_value(McpToolResult::structured(json!({"count": 0}))).unwrap();
        assert!(result.get("isError").is_none());
        assert_eq!(result["structuredContent"]["count"], 0);
    }

    #[test]
    fn protocol_negotiation() {
        assert_eq!(negotiate_protocol_version(Some("2024-11-05")), "2024-11-05");
        assert_eq!(negotiate_protocol_version(Some("1999-01-01")), "2025-06-18");
        assert_eq!(negotiate_protocol_version(None), "2025-06-18");
    }
}
